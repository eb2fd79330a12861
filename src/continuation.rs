// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The continuation pair linking a task's stack to whatever stack launched
//! or last resumed it.
//!
//! A [`Continuation`] owns the task's stack region and both saved stack
//! pointers of the relationship. Exactly one side executes at any instant;
//! control moves only through [`switch_stacks`], and each crossing leaves a
//! message for the destination in the handoff slot: "I parked on this
//! rendezvous" or "I finished". Panics never cross a switch alive: they are
//! parked in the exception carrier and re-raised on the side that regains
//! control.
//!
//! Strong references (`Arc`) are held by whoever may still need to resume
//! the task: the driver frame currently switched into it and every
//! outstanding completion token. When the last one goes away while the task
//! is still suspended, `Drop` resumes it one final time with the unwind flag
//! set; the suspension point re-raises [`ForcedUnwind`], destructors on the
//! task stack run, and only then is the stack region released.

use crate::rendezvous::Arrive;
use crate::stack::OwnedStack;
use crate::switch::{prepare_stack, switch_stacks, EntryFn, SavedSp};
use log::{debug, trace};
use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Panic payload used to tear down a suspended task's stack.
///
/// Not a user-visible error: task bodies that catch panics wholesale must
/// re-raise this one verbatim (`resume_unwind`) so the stack machinery can
/// finish destroying the stack.
#[derive(Debug)]
pub struct ForcedUnwind;

/// What the task did with the control it was given.
pub(crate) enum Switched {
    /// The task parked on a rendezvous. The receiving side must perform the
    /// task's arrival and resume again if it wins.
    Parked(Arc<dyn Arrive>),
    /// The body returned or its panic is in the carrier; the task will
    /// never run again.
    Finished,
}

/// One task's continuation pair, handoff channel and stack ownership.
pub(crate) struct Continuation {
    // Stack pointer of the side that last switched into the task; valid
    // while the task runs. Only the executing side touches it.
    caller: UnsafeCell<SavedSp>,
    // Stack pointer of the task while suspended. Written by the switch on
    // the task's thread; read by the resuming thread strictly after the
    // rendezvous arrival that authorized the resume.
    callee: UnsafeCell<SavedSp>,
    // Message to the side the task switches to. Written and read on the
    // same OS thread, immediately across one switch.
    handoff: UnsafeCell<Option<Switched>>,
    // Deferred panic from the task body, delivered to whoever regains
    // control after the final switch.
    carrier: UnsafeCell<Option<Box<dyn Any + Send>>>,
    unwinding: AtomicBool,
    finished: AtomicBool,
    started: AtomicBool,
    parks: AtomicUsize,
    // Present until the continuation is dropped; releasing it returns the
    // region to its allocator.
    _stack: OwnedStack,
}

// SAFETY: the cells are governed by the strict hand-off protocol described
// on each field; every cross-thread edge passes through the rendezvous
// counter's AcqRel arrivals or the Arc reference count.
unsafe impl Send for Continuation {}
unsafe impl Sync for Continuation {}

impl Continuation {
    /// Builds the pair around a freshly allocated stack, seeded so the
    /// first switch runs `entry(arg)` on it.
    pub(crate) fn new(stack: OwnedStack, entry: EntryFn, arg: *mut u8) -> Self {
        let initial = unsafe { prepare_stack(stack.top(), entry, arg) };
        Self {
            caller: UnsafeCell::new(std::ptr::null_mut()),
            callee: UnsafeCell::new(initial),
            handoff: UnsafeCell::new(None),
            carrier: UnsafeCell::new(None),
            unwinding: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            started: AtomicBool::new(false),
            parks: AtomicUsize::new(0),
            _stack: stack,
        }
    }

    /// Transfers control into the task and reports what it did with it.
    ///
    /// Callers must hold an `Arc` on `self` (or be its destructor) and must
    /// be authorized: either nothing has resumed the task yet, or this
    /// caller won the rendezvous the task last parked on.
    fn switch_into_task(&self) -> Switched {
        self.started.store(true, Ordering::Relaxed);
        unsafe {
            switch_stacks(self.caller.get(), *self.callee.get());
            (*self.handoff.get())
                .take()
                .expect("task switched out without leaving a handoff message")
        }
    }

    /// Suspends the task side until the rendezvous authorizes a resume.
    ///
    /// # Safety
    ///
    /// Must be called on the task's own stack. `this` must point to a
    /// continuation kept alive by the current driver frame's strong
    /// reference; the task itself holds none (it released its handle before
    /// parking, so a teardown path can take full ownership).
    pub(crate) unsafe fn park(this: *const Continuation, gate: Arc<dyn Arrive>) {
        let cont = &*this;
        *cont.handoff.get() = Some(Switched::Parked(gate));
        cont.parks.fetch_add(1, Ordering::Relaxed);
        switch_stacks(cont.callee.get(), *cont.caller.get());
        // Resumed: either the rendezvous delivered a result, or the last
        // owner went away and the stack is being torn down.
        if cont.unwinding.load(Ordering::Acquire) {
            resume_unwind(Box::new(ForcedUnwind));
        }
    }

    /// Records the task's terminal state. Called on the task stack, after
    /// the body (and handler, if any) returned or panicked, right before
    /// the final switch.
    pub(crate) fn finish(&self, panic: Option<Box<dyn Any + Send>>) {
        unsafe {
            *self.carrier.get() = panic;
            *self.handoff.get() = Some(Switched::Finished);
        }
        self.finished.store(true, Ordering::Release);
    }

    /// Leaves the task stack for good.
    ///
    /// # Safety
    ///
    /// Must be called on the task's own stack, after [`finish`], with no
    /// live borrows of task-stack data remaining. `this` must be kept alive
    /// by the driver frame's strong reference.
    ///
    /// [`finish`]: Continuation::finish
    pub(crate) unsafe fn final_switch(this: *const Continuation) -> ! {
        let cont = &*this;
        switch_stacks(cont.callee.get(), *cont.caller.get());
        // A finished task must never be switched into again.
        std::process::abort();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Number of times the task actually left its stack to wait. Used to
    /// observe the synchronous-completion short circuit.
    pub(crate) fn times_parked(&self) -> usize {
        self.parks.load(Ordering::Relaxed)
    }

    fn take_carrier(&self) -> Option<Box<dyn Any + Send>> {
        unsafe { (*self.carrier.get()).take() }
    }
}

/// Runs the task until it either parks on a rendezvous it did not win or
/// finishes. This is the one resume primitive: the launcher uses it for the
/// first entry, completion tokens use it when they win a rendezvous.
///
/// The returned payload, if any, is the panic that ended the body; the
/// caller re-raises it on its own side once the task stack has fully
/// unwound.
pub(crate) fn drive(cont: &Arc<Continuation>) -> Option<Box<dyn Any + Send>> {
    loop {
        match cont.switch_into_task() {
            Switched::Parked(gate) => {
                // The task's own arrival, performed here so its stack
                // pointer was published before anyone could race to it.
                if gate.arrive() {
                    trace!("operation completed during suspension, resuming task at once");
                    continue;
                }
                return None;
            }
            Switched::Finished => return cont.take_carrier(),
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if self.started.load(Ordering::Relaxed) && !self.is_finished() {
            debug!("tearing down a suspended task; forcing its stack to unwind");
            self.unwinding.store(true, Ordering::Release);
            while !self.is_finished() {
                match self.switch_into_task() {
                    Switched::Finished => break,
                    // A body that swallowed ForcedUnwind and parked again;
                    // its rendezvous is abandoned, resume until it gives up.
                    Switched::Parked(_) => continue,
                }
            }
            // A panic raised while the stack unwound has nowhere to go.
            if let Some(p) = self.take_carrier() {
                log::error!("task panicked during forced unwind: {:?}", p);
            }
        }
        // The stack region is released by `_stack` after this point; the
        // task is finished (or never started), so nothing runs on it.
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .field("parks", &self.parks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
