// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The capability handed to a task body: suspend here, spawn siblings here.

use crate::completion::Completion;
use crate::continuation::{Continuation, ForcedUnwind};
use crate::error::Result;
use crate::executor::Executor;
use crate::rendezvous::PendingOp;
use crate::spawn::launch;
use crate::stack::{DefaultStack, StackAllocator};
use std::io;
use std::panic::resume_unwind;
use std::sync::{Arc, Weak};

/// Represents a running task's execution context.
///
/// A `YieldContext` is passed by the launcher to the task body and is only
/// meaningful during that body's invocation. Through it the body performs
/// asynchronous calls that look blocking ([`suspend`]) and spawns sibling
/// tasks that inherit its scheduling context ([`spawn`]).
///
/// It holds only a weak reference to the task's continuation, so smuggling
/// one into a long-lived structure cannot keep a finished task's stack
/// alive.
///
/// [`suspend`]: YieldContext::suspend
/// [`spawn`]: YieldContext::spawn
pub struct YieldContext<E: Executor> {
    cont: Weak<Continuation>,
    ex: E,
}

impl<E: Executor> YieldContext<E> {
    pub(crate) fn new(cont: Weak<Continuation>, ex: E) -> Self {
        Self { cont, ex }
    }

    /// The scheduling context this task was launched on.
    pub fn executor(&self) -> &E {
        &self.ex
    }

    /// Performs one asynchronous call as if it were blocking.
    ///
    /// `start` receives the [`Completion`] token and initiates the
    /// operation; the operation invokes the token exactly once, from any
    /// thread, with its outcome. `suspend` returns that outcome once it is
    /// available, without ever leaving the task's stack if the operation
    /// completed before the task reached its suspension point.
    ///
    /// ```no_run
    /// # use stackful::{spawn, EventLoop};
    /// # fn read_some(_buf: &mut [u8], _c: stackful::Completion<usize>) {}
    /// # let ev = EventLoop::new();
    /// spawn(&ev.handle(), |yield_ctx| {
    ///     let mut buf = [0u8; 128];
    ///     let n = yield_ctx.suspend(|c| read_some(&mut buf, c))?;
    ///     std::io::Result::Ok(n)
    /// }).unwrap();
    /// ```
    pub fn suspend<T, F>(&self, start: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>),
    {
        let cont = match self.cont.upgrade() {
            Some(cont) => cont,
            // The task is being torn down; keep the teardown signal moving.
            None => resume_unwind(Box::new(ForcedUnwind)),
        };

        let op = Arc::new(PendingOp::<T>::new());
        start(Completion::new(op.clone(), cont.clone()));

        // The task must not own its continuation while suspended; the
        // outstanding token and the driver frame keep it alive, and the
        // teardown path relies on being the sole owner.
        let cont_ptr = Arc::as_ptr(&cont);
        drop(cont);

        if !op.completed() {
            // SAFETY: the gate has not fired, so the completion token is
            // still outstanding and holds a strong reference; we are on the
            // task's own stack.
            unsafe { Continuation::park(cont_ptr, op.clone()) };
        }
        op.take()
    }

    /// Spawns a sibling task on this task's scheduling context, with the
    /// default stack. The sibling completes independently; nobody waits
    /// for it and no completion handler runs.
    pub fn spawn<F, R>(&self, body: F) -> Result<()>
    where
        F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_with_stack(DefaultStack::default(), body)
    }

    /// Like [`spawn`], with a caller-supplied stack allocator.
    ///
    /// [`spawn`]: YieldContext::spawn
    pub fn spawn_with_stack<A, F, R>(&self, alloc: A, body: F) -> Result<()>
    where
        A: StackAllocator,
        F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        launch(&self.ex, None::<fn(R)>, body, alloc)
    }

    /// Times this task has actually left its stack to wait. A call that was
    /// short-circuited by a synchronous completion does not count.
    pub(crate) fn times_parked(&self) -> usize {
        self.cont
            .upgrade()
            .map(|cont| cont.times_parked())
            .unwrap_or(0)
    }
}

impl<E: Executor> Clone for YieldContext<E> {
    fn clone(&self) -> Self {
        Self {
            cont: self.cont.clone(),
            ex: self.ex.clone(),
        }
    }
}

impl<E: Executor> std::fmt::Debug for YieldContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YieldContext")
            .field("live", &(self.cont.strong_count() > 0))
            .finish_non_exhaustive()
    }
}
