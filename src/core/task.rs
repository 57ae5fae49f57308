// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Type-erased tasks, and the promise/future pair carrying their results.

use super::task_group::{GroupShared, TaskGroup};
use super::thread_pool::PoolShared;
use super::util::Status;
use crate::error::TaskError;
use std::fmt;
use std::sync::Arc;

/// A unit of work that can be submitted to a
/// [`ThreadPool`](crate::ThreadPool).
///
/// A task wraps a closure, and optionally a link to the [`TaskGroup`] that
/// waits for its completion. Running a task consumes it, so a task is invoked
/// at most once.
#[must_use = "a task does nothing unless it is submitted to a thread pool or invoked"]
pub struct Task {
    /// Closure to run.
    func: Box<dyn FnOnce() + Send + 'static>,
    /// Completion state of the group that this task belongs to, if any.
    group: Option<Arc<GroupShared>>,
    /// Whether the group's pending counter was incremented for this task.
    counted: bool,
}

impl Task {
    /// Creates a task belonging to the given group. The value returned by `f`
    /// is collected by [`TaskGroup::join()`].
    ///
    /// The task isn't counted as pending until it is submitted to a thread
    /// pool.
    pub fn new<R, T: Send + 'static>(
        group: &TaskGroup<R, T>,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        let (mut task, future) = Self::with_future(f);
        group.add(future);
        task.group = Some(group.shared().clone());
        task
    }

    /// Creates a fire-and-forget task, not attached to any group.
    pub fn detached(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            func: Box::new(f),
            group: None,
            counted: false,
        }
    }

    /// Creates a task not attached to any group, together with a future that
    /// receives the value returned by `f`.
    pub fn with_future<T: Send + 'static>(
        f: impl FnOnce() -> T + Send + 'static,
    ) -> (Self, TaskFuture<T>) {
        let future = TaskFuture::new();
        let promise = Promise {
            slot: future.slot.clone(),
            fulfilled: false,
        };
        let task = Self::detached(move || promise.fulfill(f()));
        (task, future)
    }

    /// Returns the identifier of the group this task belongs to, if any.
    pub fn group_id(&self) -> Option<usize> {
        self.group.as_ref().map(|group| group.id())
    }

    /// Returns the pool that this task's group is bound to, if any.
    pub(crate) fn group_pool(&self) -> Option<&Arc<PoolShared>> {
        self.group.as_ref().map(|group| group.pool())
    }

    /// Marks this task as pending in its group. This is done by the thread
    /// pool upon submission, and only has an effect the first time.
    pub(crate) fn increment(&mut self) {
        if self.counted {
            return;
        }
        if let Some(group) = &self.group {
            group.add_pending();
            self.counted = true;
        }
    }

    /// Runs this task on the current thread.
    ///
    /// If the task was submitted to a pool, its group is notified of the
    /// completion whether the closure returns or panics.
    pub fn invoke(self) {
        let Task {
            func,
            group,
            counted,
        } = self;
        let _guard = CompletionGuard {
            group: group.as_deref(),
            counted,
        };
        func();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("group_id", &self.group_id())
            .field("counted", &self.counted)
            .finish_non_exhaustive()
    }
}

/// Object whose destructor reports the completion of a task to its group.
///
/// The guard is dropped after the task's closure, whether the closure returned
/// or a panic is being unwound.
struct CompletionGuard<'a> {
    /// Completion state of the task's group.
    group: Option<&'a GroupShared>,
    /// Whether the task was counted as pending.
    counted: bool,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        if let Some(group) = self.group {
            if std::thread::panicking() {
                group.record_panic();
            }
            group.complete_one();
        }
    }
}

/// State of a task's result.
enum SlotState<T> {
    /// The task hasn't finished yet.
    Pending,
    /// The task returned this value.
    Ready(T),
    /// The task panicked.
    Panicked,
    /// The task was dropped without running.
    Abandoned,
    /// The value was already extracted.
    Consumed,
}

/// Write end of a [`TaskFuture`], moved into the task's closure.
struct Promise<T> {
    slot: Arc<Status<SlotState<T>>>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    fn fulfill(mut self, value: T) {
        self.slot.notify_all(SlotState::Ready(value));
        self.fulfilled = true;
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let state = if std::thread::panicking() {
            SlotState::Panicked
        } else {
            SlotState::Abandoned
        };
        self.slot.notify_all(state);
    }
}

/// Handle to the eventual result of a task.
///
/// Clones of a future share the same result, which can be extracted only once.
pub struct TaskFuture<T> {
    slot: Arc<Status<SlotState<T>>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> TaskFuture<T> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Status::new(SlotState::Pending)),
        }
    }

    /// Returns true once the task has finished (or can't finish anymore).
    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.lock(), SlotState::Pending)
    }

    /// Blocks until the task has finished, and extracts its result.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut guard = self
            .slot
            .wait_while(|state| matches!(state, SlotState::Pending));
        Self::extract(&mut guard)
    }

    /// Extracts the task's result if it has finished, without blocking.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        let mut guard = self.slot.lock();
        if matches!(*guard, SlotState::Pending) {
            return None;
        }
        Some(Self::extract(&mut guard))
    }

    fn extract(state: &mut SlotState<T>) -> Result<T, TaskError> {
        match std::mem::replace(state, SlotState::Consumed) {
            SlotState::Ready(value) => Ok(value),
            SlotState::Panicked => {
                *state = SlotState::Panicked;
                Err(TaskError::Panicked)
            }
            SlotState::Abandoned => {
                *state = SlotState::Abandoned;
                Err(TaskError::Abandoned)
            }
            SlotState::Consumed => Err(TaskError::Consumed),
            SlotState::Pending => unreachable!("extracting the result of a pending task"),
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.slot.lock() {
            SlotState::Pending => "pending",
            SlotState::Ready(_) => "ready",
            SlotState::Panicked => "panicked",
            SlotState::Abandoned => "abandoned",
            SlotState::Consumed => "consumed",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}
