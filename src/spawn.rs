// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Launching tasks.
//!
//! A launch allocates the task's stack up front (so the caller sees
//! allocation failures synchronously), then dispatches the actual start
//! through the target executor. On the executor, the continuation pair is
//! built and control switches into the new stack; the body runs there with
//! its [`YieldContext`] until it first suspends or finishes.
//!
//! The entry frame on the new stack is the task's root: it catches any
//! panic from the body so nothing unwinds across the raw switch, invokes
//! the completion handler (when the launch mode has one) on the task's own
//! stack, releases the task's reference to its continuation, and only then
//! switches out for good.

use crate::continuation::{drive, Continuation, ForcedUnwind};
use crate::error::Result;
use crate::executor::Executor;
use crate::stack::{DefaultStack, OwnedStack, StackAllocator};
use crate::yield_context::YieldContext;
use log::{debug, trace};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Starts a new task running `body` on `ex`, with the default stack.
///
/// The body runs for its side effects; its return value is discarded and no
/// completion handler is invoked. A panic escaping the body is re-raised on
/// the thread that last resumed the task; for a task that never suspends,
/// that is inside `ex`'s dispatch of the launch.
pub fn spawn<E, F, R>(ex: &E, body: F) -> Result<()>
where
    E: Executor,
    F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
    R: Send + 'static,
{
    launch(ex, None::<fn(R)>, body, DefaultStack::default())
}

/// Starts a new task running `body` on `ex`, invoking `handler` with the
/// body's return value when it finishes cleanly.
///
/// The handler runs on the task's stack, immediately after the body, on
/// whichever thread delivered the final resume. It is not invoked when the
/// body panics or when the task is torn down by a forced unwind.
pub fn spawn_with_handler<E, F, R, H>(ex: &E, handler: H, body: F) -> Result<()>
where
    E: Executor,
    F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
    R: Send + 'static,
    H: FnOnce(R) + Send + 'static,
{
    launch(ex, Some(handler), body, DefaultStack::default())
}

/// Optional-argument surface for launching tasks: pick a stack size or a
/// whole allocator, then spawn.
///
/// ```no_run
/// # use stackful::{EventLoop, TaskBuilder};
/// # let ev = EventLoop::new();
/// TaskBuilder::new()
///     .stack_size(64 * 1024)
///     .spawn(&ev.handle(), |_yield_ctx| {})
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct TaskBuilder<A: StackAllocator = DefaultStack> {
    alloc: A,
}

impl TaskBuilder<DefaultStack> {
    /// A builder using the platform-default stack.
    pub fn new() -> Self {
        Self {
            alloc: DefaultStack::default(),
        }
    }

    /// Uses a default-style stack of the given size.
    pub fn stack_size(self, size: usize) -> Self {
        Self {
            alloc: DefaultStack::with_size(size),
        }
    }
}

impl Default for TaskBuilder<DefaultStack> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: StackAllocator> TaskBuilder<A> {
    /// Replaces the stack allocator.
    pub fn stack_allocator<B: StackAllocator>(self, alloc: B) -> TaskBuilder<B> {
        TaskBuilder { alloc }
    }

    /// See [`spawn`].
    pub fn spawn<E, F, R>(self, ex: &E, body: F) -> Result<()>
    where
        E: Executor,
        F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
        R: Send + 'static,
    {
        launch(ex, None::<fn(R)>, body, self.alloc)
    }

    /// See [`spawn_with_handler`].
    pub fn spawn_with_handler<E, F, R, H>(
        self,
        ex: &E,
        handler: H,
        body: F,
    ) -> Result<()>
    where
        E: Executor,
        F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
        R: Send + 'static,
        H: FnOnce(R) + Send + 'static,
    {
        launch(ex, Some(handler), body, self.alloc)
    }
}

/// What the task's entry frame needs; boxed so a single pointer seeds the
/// new stack.
struct EntryData<E: Executor, F, R, H> {
    cont: Weak<Continuation>,
    ex: E,
    body: F,
    handler: Option<H>,
    _r: std::marker::PhantomData<R>,
}

/// The one launch path behind every public variant.
pub(crate) fn launch<E, F, R, H, A>(
    ex: &E,
    handler: Option<H>,
    body: F,
    alloc: A,
) -> Result<()>
where
    E: Executor,
    F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
    R: Send + 'static,
    H: FnOnce(R) + Send + 'static,
    A: StackAllocator,
{
    let stack = OwnedStack::allocate(alloc)?;
    let ex_for_task = ex.clone();
    ex.dispatch(Box::new(move || {
        run_task(ex_for_task, handler, body, stack)
    }));
    Ok(())
}

/// Runs on the target executor: builds the continuation and performs the
/// first switch into the task.
fn run_task<E, F, R, H>(ex: E, handler: Option<H>, body: F, stack: OwnedStack)
where
    E: Executor,
    F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
    R: Send + 'static,
    H: FnOnce(R) + Send + 'static,
{
    let mut entry_data = Box::new(EntryData {
        cont: Weak::new(),
        ex,
        body,
        handler,
        _r: std::marker::PhantomData::<R>,
    });
    let arg = &mut *entry_data as *mut EntryData<E, F, R, H> as *mut u8;
    let cont = Arc::new(Continuation::new(stack, task_entry::<E, F, R, H>, arg));
    entry_data.cont = Arc::downgrade(&cont);
    // Reclaimed by task_entry on the new stack.
    Box::into_raw(entry_data);

    trace!("launching task {:?}", cont);
    if let Some(panic) = drive(&cont) {
        // The body's stack has fully unwound; continue the panic here, on
        // the launching side.
        drop(cont);
        resume_unwind(panic);
    }
}

/// Root frame of every task, running on the task's own stack.
extern "C" fn task_entry<E, F, R, H>(arg: *mut u8) -> !
where
    E: Executor,
    F: FnOnce(&YieldContext<E>) -> R + Send + 'static,
    R: Send + 'static,
    H: FnOnce(R) + Send + 'static,
{
    let data = unsafe { Box::from_raw(arg as *mut EntryData<E, F, R, H>) };
    let EntryData {
        cont,
        ex,
        body,
        handler,
        _r,
    } = *data;
    let cont_ptr = cont.as_ptr();
    let yield_ctx = YieldContext::new(cont, ex);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let output = body(&yield_ctx);
        if let Some(handler) = handler {
            handler(output);
        }
    }));
    let panic = match outcome {
        Ok(()) => None,
        Err(payload) if payload.is::<ForcedUnwind>() => {
            debug!("task stack unwound by teardown");
            None
        }
        Err(payload) => Some(payload),
    };

    // Nothing owned by the task may survive the final switch.
    drop(yield_ctx);
    unsafe {
        (*cont_ptr).finish(panic);
        Continuation::final_switch(cont_ptr)
    }
}
