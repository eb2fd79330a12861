// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # stackful
//!
//! Stackful tasks for callback-based executors: write sequential-looking
//! logic over APIs that deliver their results through completion callbacks.
//!
//! A task runs on its own dedicated stack. Inside the body, every
//! asynchronous call goes through [`YieldContext::suspend`]: the closure you
//! pass starts the operation and hands it a [`Completion`] token, and
//! `suspend` returns the operation's outcome as if the call had blocked.
//! Under the hood the task's stack is switched out while the operation is in
//! flight and switched back in by whichever thread delivers the result. No
//! thread ever blocks, and an operation that completes before the task
//! reaches its suspension point costs no switch at all.
//!
//! ```
//! use stackful::{spawn, EventLoop};
//!
//! let ev = EventLoop::new();
//! spawn(&ev.handle(), |yield_ctx| {
//!     // Looks blocking, isn't: the operation here completes inline, a
//!     // real one would invoke the token later from anywhere.
//!     let greeting: &str = yield_ctx.suspend(|c| c.succeed("hello")).unwrap();
//!     assert_eq!(greeting, "hello");
//! })
//! .unwrap();
//! ev.run();
//! ```
//!
//! Tasks are launched onto anything implementing [`Executor`]; the bundled
//! [`EventLoop`] is a minimal one for tests and small programs. Each task's
//! stack comes from a [`StackAllocator`]: [`DefaultStack`] guards against
//! overflow with a protected page, and [`TaskBuilder`] picks sizes or whole
//! allocators per task.
//!
//! If a task is abandoned while suspended (every [`Completion`] token for
//! its pending operation dropped un-invoked), its stack is unwound in place:
//! destructors run, the stack is released, and the completion handler is
//! never called.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[macro_use]
extern crate lazy_static;
#[macro_use(defer)]
extern crate scopeguard;

mod completion;
mod continuation;
mod error;
mod executor;
mod rendezvous;
mod spawn;
mod stack;
mod switch;
mod yield_context;

pub use crate::completion::Completion;
pub use crate::continuation::ForcedUnwind;
pub use crate::error::{Result, SpawnError};
pub use crate::executor::{EventLoop, Executor, LoopHandle, Work, WorkGuard};
pub use crate::spawn::{spawn, spawn_with_handler, TaskBuilder};
pub use crate::stack::{
    DefaultStack, StackAllocator, StackRegion, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};
pub use crate::yield_context::YieldContext;
