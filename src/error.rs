// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Errors produced by the crate itself.
//!
//! Failures of asynchronous operations travel as `std::io::Error` through
//! the value delivered to [`suspend`]; `SpawnError` only covers what can go
//! wrong before a task ever runs.
//!
//! [`suspend`]: crate::YieldContext::suspend

use thiserror::Error;

/// Result alias for the launch-side API.
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Errors reported when launching a task.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The stack allocator could not obtain memory for the task's stack.
    #[error("failed to allocate a task stack: {0}")]
    StackAllocation(#[from] nix::Error),

    /// The requested stack is too small to hold even the entry frame.
    #[error("requested a {requested} byte stack, minimum is {minimum}")]
    StackTooSmall {
        /// Size the caller asked for, in bytes.
        requested: usize,
        /// Smallest size the allocator accepts, in bytes.
        minimum: usize,
    },
}
