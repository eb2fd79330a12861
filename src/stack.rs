// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Stack allocation for tasks.
//!
//! Every task runs on a dedicated stack obtained from a [`StackAllocator`].
//! The crate ships [`DefaultStack`], which carves anonymous memory with
//! `mmap` and protects the low end with a guard page so an overflow faults
//! instead of silently corrupting a neighbor. Custom allocators (pooled,
//! statically placed) only need to implement the two-method capability.

use crate::error::{Result, SpawnError};
use log::trace;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

lazy_static! {
    static ref PAGE_SIZE: usize = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|sz| sz as usize)
        .unwrap_or(4096);
}

/// A region of memory serving as a task's stack.
///
/// `base` is the lowest usable address and `len` the usable length; the
/// stack grows downward from `base + len`. Produced by
/// [`StackAllocator::allocate`] and returned verbatim to
/// [`StackAllocator::deallocate`] once the task that ran on it is gone.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    base: *mut u8,
    len: usize,
}

// SAFETY: a StackRegion is a dumb descriptor; the task lifecycle guarantees
// a single execution context touches the memory at any time.
unsafe impl Send for StackRegion {}

impl StackRegion {
    /// Creates a region descriptor from its lowest usable address and
    /// usable length in bytes.
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Lowest usable address of the region.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (a region that cannot run anything).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the highest usable address; the initial stack pointer lives
    /// just below this.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }
}

/// Capability to obtain and release task stacks.
///
/// `allocate` is called once per task before it is dispatched, `deallocate`
/// exactly once after the task has finished (or been forcibly unwound) and
/// its final switch back has occurred, never while the task could still
/// run on the region.
pub trait StackAllocator: Send + 'static {
    /// Obtains a region for a new task's stack.
    fn allocate(&mut self) -> Result<StackRegion>;

    /// Releases a region previously returned by [`allocate`].
    ///
    /// [`allocate`]: StackAllocator::allocate
    fn deallocate(&mut self, region: StackRegion);
}

/// Smallest stack [`DefaultStack`] will agree to allocate. Bodies that only
/// bounce through the rendezvous still need room for the entry frame, the
/// panic machinery and the caller's locals.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const _: () = assert!(MIN_STACK_SIZE >= crate::switch::MIN_STACK_WORDS * 8);

/// Default stack size: plenty for straight-line protocol logic, small
/// enough to spawn thousands of tasks.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// The platform-default stack allocator: anonymous `mmap` plus a `PROT_NONE`
/// guard page below the usable region.
#[derive(Debug, Clone, Copy)]
pub struct DefaultStack {
    size: usize,
}

impl DefaultStack {
    /// An allocator handing out stacks of `size` usable bytes, rounded up
    /// to whole pages.
    pub fn with_size(size: usize) -> Self {
        Self { size }
    }
}

impl Default for DefaultStack {
    fn default() -> Self {
        Self::with_size(DEFAULT_STACK_SIZE)
    }
}

fn round_up_to_page(len: usize) -> usize {
    let page = *PAGE_SIZE;
    (len + page - 1) & !(page - 1)
}

impl StackAllocator for DefaultStack {
    fn allocate(&mut self) -> Result<StackRegion> {
        if self.size < MIN_STACK_SIZE {
            return Err(SpawnError::StackTooSmall {
                requested: self.size,
                minimum: MIN_STACK_SIZE,
            });
        }
        let page = *PAGE_SIZE;
        let usable = round_up_to_page(self.size);
        let total = usable + page;

        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                total,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(SpawnError::StackAllocation)? as *mut u8;

        // Guard page at the low end, where a downward-growing overflow hits.
        if let Err(e) = unsafe { mprotect(base as *mut _, page, ProtFlags::PROT_NONE) } {
            // Return the mapping before surfacing the failure.
            if let Err(e2) = unsafe { munmap(base as *mut _, total) } {
                log::error!("munmap of task stack at {:p} failed: {}", base, e2);
            }
            return Err(SpawnError::StackAllocation(e));
        }

        trace!(
            "allocated {} byte stack at {:p} (guard page below)",
            usable,
            base
        );
        Ok(StackRegion::new(unsafe { base.add(page) }, usable))
    }

    fn deallocate(&mut self, region: StackRegion) {
        let page = *PAGE_SIZE;
        trace!(
            "releasing {} byte stack at {:p}",
            region.len(),
            region.base()
        );
        let mapping = unsafe { region.base().sub(page) };
        // Failure here means the descriptor was corrupted; there is no
        // caller to report to, so surface it loudly.
        if let Err(e) = unsafe { munmap(mapping as *mut _, region.len() + page) } {
            log::error!("munmap of task stack at {:p} failed: {}", mapping, e);
        }
    }
}

/// A region plus the boxed allocator that produced it; dropping one returns
/// the region to its allocator.
pub(crate) struct OwnedStack {
    region: StackRegion,
    alloc: Box<dyn StackAllocator>,
}

impl OwnedStack {
    pub(crate) fn allocate<A: StackAllocator>(mut alloc: A) -> Result<Self> {
        let region = alloc.allocate()?;
        Ok(Self {
            region,
            alloc: Box::new(alloc),
        })
    }

    pub(crate) fn top(&self) -> *mut u8 {
        self.region.top()
    }
}

impl Drop for OwnedStack {
    fn drop(&mut self) {
        self.alloc.deallocate(self.region);
    }
}

impl std::fmt::Debug for OwnedStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedStack")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn default_stack_allocates_and_releases() {
        let mut alloc = DefaultStack::default();
        let region = alloc.allocate().unwrap();
        assert!(region.len() >= DEFAULT_STACK_SIZE);
        assert_eq!(region.top() as usize - region.base() as usize, region.len());

        // The whole usable region must be writable.
        unsafe {
            region.base().write(0xAB);
            region.top().sub(1).write(0xCD);
        }
        alloc.deallocate(region);
    }

    #[test]
    fn undersized_request_is_rejected() {
        let mut alloc = DefaultStack::with_size(1024);
        match alloc.allocate() {
            Err(SpawnError::StackTooSmall { requested, minimum }) => {
                assert_eq!(requested, 1024);
                assert_eq!(minimum, MIN_STACK_SIZE);
            }
            other => panic!("expected StackTooSmall, got {:?}", other.map(|_| ())),
        }
    }

    /// Counts balance of allocate/deallocate; used again by the spawn tests.
    #[derive(Clone)]
    pub(crate) struct CountingStack {
        pub(crate) live: Arc<AtomicUsize>,
        pub(crate) total: Arc<AtomicUsize>,
        inner: DefaultStack,
    }

    impl CountingStack {
        pub(crate) fn new() -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                total: Arc::new(AtomicUsize::new(0)),
                inner: DefaultStack::default(),
            }
        }
    }

    impl StackAllocator for CountingStack {
        fn allocate(&mut self) -> Result<StackRegion> {
            let region = self.inner.allocate()?;
            self.live.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(region)
        }

        fn deallocate(&mut self, region: StackRegion) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.deallocate(region);
        }
    }

    #[test]
    fn owned_stack_returns_region_on_drop() {
        let counting = CountingStack::new();
        let live = counting.live.clone();
        let owned = OwnedStack::allocate(counting).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(owned);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
