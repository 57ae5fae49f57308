// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors reported by task futures and by the thread manager.

use thiserror::Error;

/// Reasons why a [`TaskFuture`](crate::TaskFuture) can't produce a value.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskError {
    /// The task's closure panicked.
    #[error("the task panicked")]
    Panicked,
    /// The task was dropped without running, because the thread pool was
    /// destroyed while it was still queued.
    #[error("the task was dropped before it could run")]
    Abandoned,
    /// The value was already extracted, either by another call on a clone of
    /// this future or by joining the task group.
    #[error("the task result was already consumed")]
    Consumed,
}

/// Errors that can occur when constructing the
/// [`ThreadManager`](crate::ThreadManager).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManagerError {
    /// The process-wide thread manager was already constructed.
    #[error("an instance of the thread manager already exists (with {num_threads} thread(s))")]
    AlreadyExists {
        /// Number of worker threads in the existing instance.
        num_threads: usize,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}

    #[test]
    fn errors_display() {
        assert_error(&TaskError::Panicked);
        assert_eq!(TaskError::Panicked.to_string(), "the task panicked");
        assert_eq!(
            TaskError::Abandoned.to_string(),
            "the task was dropped before it could run"
        );

        let error = ManagerError::AlreadyExists { num_threads: 4 };
        assert_error(&error);
        assert_eq!(
            error.to_string(),
            "an instance of the thread manager already exists (with 4 thread(s))"
        );
    }
}
