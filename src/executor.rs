// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The scheduling context tasks are launched onto.
//!
//! The crate does not bring its own event loop; it consumes any scheduler
//! that can run a boxed unit of work exactly once, through the [`Executor`]
//! trait. [`EventLoop`] is a deliberately small implementation, a locked
//! queue with a condition variable, sufficient for tests, examples and
//! programs that just need *some* context to run tasks on.

use log::trace;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A unit of work posted to an executor.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A scheduling context: somewhere a unit of work can be submitted to run
/// exactly once, eventually, respecting whatever ordering or
/// mutual-exclusion guarantees the context makes.
///
/// Task launches go through `dispatch`; everything else in this crate
/// transfers control by switching stacks directly, so implementations never
/// see the suspend/resume traffic, only launches. An implementation may
/// run the work inline when the calling thread is already on the context.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Submits `work` to run on this context.
    fn dispatch(&self, work: Work);
}

struct Inner {
    queue: Mutex<VecDeque<Work>>,
    wake: Condvar,
    // Outstanding WorkGuards; run() only returns when this is zero and the
    // queue is empty.
    outstanding: AtomicUsize,
    dispatched: AtomicUsize,
    executed: AtomicUsize,
}

struct VecDequeLen<'a>(&'a Mutex<VecDeque<Work>>);

impl std::fmt::Debug for VecDequeLen<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} queued", self.0.lock().unwrap().len())
    }
}

/// A minimal single-queue event loop.
///
/// Work is executed by whoever calls [`run`]; completions delivered from
/// other threads resume tasks inline on those threads, so the loop itself
/// only ever sees launches and whatever work the program posts.
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    inner: Arc<Inner>,
}

/// Cloneable handle submitting work to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<Inner>,
}

/// Keeps [`EventLoop::run`] from returning while some external activity,
/// such as a thread that will post work later, is still outstanding.
pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                outstanding: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                executed: AtomicUsize::new(0),
            }),
        }
    }

    /// A handle for submitting work; implements [`Executor`].
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Marks external activity in flight; `run` keeps waiting for work
    /// until the guard is dropped.
    pub fn work(&self) -> WorkGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    /// Runs queued work until the queue is empty and no [`WorkGuard`] is
    /// outstanding. Returns the number of items executed by this call.
    ///
    /// A panic escaping a work item propagates to the caller; `run` may be
    /// called again afterwards to keep processing.
    pub fn run(&self) -> usize {
        let mut executed = 0;
        while let Some(job) = self.next_job() {
            defer! {
                self.inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            job();
            executed += 1;
        }
        trace!("event loop idle after {} items", executed);
        executed
    }

    /// Runs at most one queued item, without waiting. Returns whether one
    /// ran.
    pub fn run_one(&self) -> bool {
        let job = self.inner.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                defer! {
                    self.inner.executed.fetch_add(1, Ordering::Relaxed);
                }
                job();
                true
            }
            None => false,
        }
    }

    /// Total units of work ever submitted through any handle.
    pub fn dispatches(&self) -> usize {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Total units of work ever executed, panicking ones included.
    pub fn executed(&self) -> usize {
        self.inner.executed.load(Ordering::Relaxed)
    }

    fn next_job(&self) -> Option<Work> {
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return None;
            }
            queue = self.inner.wake.wait(queue).unwrap();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LoopHandle {
    fn dispatch(&self, work: Work) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().unwrap().push_back(work);
        self.inner.wake.notify_one();
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        // Taking the lock orders this wakeup against a runner that already
        // checked the counter and is about to wait.
        let _queue = self.inner.queue.lock().unwrap();
        self.inner.wake.notify_all();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("queue", &VecDequeLen(&self.inner.queue))
            .field(
                "outstanding",
                &self.inner.outstanding.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn runs_in_submission_order() {
        let ev = EventLoop::new();
        let handle = ev.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            handle.dispatch(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert_eq!(ev.run(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(ev.dispatches(), 5);
        assert_eq!(ev.executed(), 5);
    }

    #[test]
    fn work_guard_keeps_run_waiting() {
        let ev = EventLoop::new();
        let handle = ev.handle();
        let guard = ev.work();

        let poster = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            handle.dispatch(Box::new(|| {}));
            drop(guard);
        });

        // Without the guard this would return immediately with 0.
        assert_eq!(ev.run(), 1);
        poster.join().unwrap();
    }

    #[test]
    fn panicking_item_still_counts_as_executed() {
        let ev = EventLoop::new();
        let handle = ev.handle();
        handle.dispatch(Box::new(|| panic!("boom")));
        handle.dispatch(Box::new(|| {}));

        assert!(std::panic::catch_unwind(|| ev.run()).is_err());
        assert_eq!(ev.executed(), 1);
        // The loop stays usable.
        assert_eq!(ev.run(), 1);
        assert_eq!(ev.executed(), 2);
    }
}
