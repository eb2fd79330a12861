// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The token an asynchronous operation invokes with its outcome.

use crate::continuation::{drive, Continuation};
use crate::rendezvous::PendingOp;
use log::trace;
use std::io;
use std::panic::resume_unwind;
use std::sync::Arc;

/// Completion token for one asynchronous call made through
/// [`YieldContext::suspend`].
///
/// The operation must invoke [`complete`] exactly once, eventually, from
/// whatever thread it likes; `Ok` is the "no error" case, `Err` carries the
/// operation's failure. If the token wins the rendezvous against the
/// suspending task, the resume happens *inline*: task-body code keeps
/// running on the invoking thread until the task next suspends or returns.
/// The surrounding executor must tolerate that re-entrancy.
///
/// Dropping a token without invoking it abandons the operation; if that
/// drops the last reference to a suspended task, the task's stack is
/// forcibly unwound so nothing leaks.
///
/// [`YieldContext::suspend`]: crate::YieldContext::suspend
/// [`complete`]: Completion::complete
pub struct Completion<T> {
    op: Arc<PendingOp<T>>,
    cont: Arc<Continuation>,
}

impl<T: Send> Completion<T> {
    pub(crate) fn new(op: Arc<PendingOp<T>>, cont: Arc<Continuation>) -> Self {
        Self { op, cont }
    }

    /// Delivers the operation's outcome and, if this side wins the
    /// rendezvous, resumes the task on the current thread.
    pub fn complete(self, outcome: io::Result<T>) {
        // Slots first, arrival second: the ordering of `arrive` is what
        // makes the writes visible to the resumed task.
        self.op.fulfill(outcome);
        if self.op.gate_arrive() {
            trace!("completion won the rendezvous, resuming task inline");
            if let Some(panic) = drive(&self.cont) {
                // The body's panic unwound its whole stack; it continues on
                // the thread that delivered the final result.
                resume_unwind(panic);
            }
        }
    }

    /// Shorthand for `complete(Ok(value))`.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Shorthand for `complete(Err(error))`.
    pub fn fail(self, error: io::Error) {
        self.complete(Err(error));
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("op", &self.op)
            .field("cont", &self.cont)
            .finish()
    }
}
