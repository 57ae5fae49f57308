// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task groups, to wait for a cohort of tasks and reduce their results.

use super::counter::AtomicCounter;
use super::task::{Task, TaskFuture};
use super::thread_pool::{PoolShared, Submission, ThreadPool};
use super::util::Status;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source of group identifiers.
static GROUP_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Completion state of a group, shared with the group's tasks and (weakly)
/// with the thread pool.
pub(crate) struct GroupShared {
    /// Identifier of the group.
    id: usize,
    /// Number of submitted tasks that haven't completed yet.
    pending: AtomicCounter,
    /// Number of tasks that panicked since the last join.
    panicked: AtomicCounter,
    /// Lets joining threads sleep until the pending counter reaches zero.
    status: Status<()>,
    /// Pool that this group is bound to.
    pool: Arc<PoolShared>,
}

impl GroupShared {
    /// Returns the identifier of the group.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Returns the pool that this group is bound to.
    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    /// Counts one more pending task.
    pub(crate) fn add_pending(&self) {
        let _pending = self.pending.increment();
        log_trace!("[group {}] Added a task, {_pending} pending.", self.id);
    }

    /// Records that one task of this group panicked.
    pub(crate) fn record_panic(&self) {
        self.panicked.increment();
        log_error!("[group {}] Detected a panic in one task.", self.id);
    }

    /// Counts one completed task, waking up the joining threads if that was
    /// the last one.
    pub(crate) fn complete_one(&self) {
        let remaining = self.pending.decrement();
        log_trace!("[group {}] Completed a task, {remaining} pending.", self.id);
        if remaining == 0 {
            // Notifying under the lock, so that a joining thread can't miss
            // this wake-up between checking the counter and going to sleep.
            self.status.notify_all(());
        }
    }

    /// Wakes up the joining threads so that they re-check whether the pool was
    /// stopped.
    pub(crate) fn wake(&self) {
        self.status.notify_all(());
    }

    /// Blocks until all the tasks have completed or the pool was stopped, and
    /// returns the number of tasks that were pending at that point.
    ///
    /// The count is the one observed when the wait ended. A task submitted
    /// concurrently right after that isn't waited for, and is left to the next
    /// join.
    fn wait_for_tasks(&self) -> usize {
        let mut pending = 0;
        let _guard = self.status.wait_while(|_| {
            pending = self.pending.load();
            pending > 0 && !self.pool.is_stopped()
        });
        pending
    }
}

/// A group of tasks whose completion can be awaited, and whose results of type
/// `T` are reduced into a value of type `R`.
///
/// ```
/// # use tasklight::{CpuPinningPolicy, Task, TaskGroup, ThreadCount, ThreadPoolBuilder};
/// let thread_pool = ThreadPoolBuilder {
///     num_threads: ThreadCount::try_from(4).unwrap(),
///     cpu_pinning: CpuPinningPolicy::No,
/// }
/// .build();
///
/// let group = TaskGroup::new(&thread_pool, |acc: u64, x: u64| acc + x);
/// for i in 1..=10 {
///     thread_pool.add_task(Task::new(&group, move || i * i));
/// }
/// assert_eq!(group.join(0), 385);
/// ```
pub struct TaskGroup<R, T = R> {
    /// Completion state shared with the tasks.
    shared: Arc<GroupShared>,
    /// Futures of the tasks added to this group, in submission order.
    futures: Mutex<Vec<TaskFuture<T>>>,
    /// Function reducing the task results.
    join_fn: Box<dyn Fn(R, T) -> R + Send + Sync>,
    /// Number of joins between two clearings of the futures list (0 to never
    /// clear automatically).
    clear_frequency: AtomicUsize,
    /// Number of joins so far.
    join_count: AtomicUsize,
}

impl TaskGroup<(), ()> {
    /// Creates a group of tasks that don't return anything, bound to the given
    /// pool.
    pub fn void(pool: &ThreadPool) -> Self {
        Self::new(pool, |(), ()| ())
    }
}

impl<R, T> TaskGroup<R, T> {
    /// Creates a new group bound to the given pool, reducing the task results
    /// with `join_fn`.
    pub fn new(pool: &ThreadPool, join_fn: impl Fn(R, T) -> R + Send + Sync + 'static) -> Self {
        let shared = Arc::new(GroupShared {
            id: GROUP_COUNT.fetch_add(1, Ordering::Relaxed),
            pending: AtomicCounter::new(0),
            panicked: AtomicCounter::new(0),
            status: Status::new(()),
            pool: pool.shared().clone(),
        });
        pool.shared().register_group(&shared);
        log_debug!("[group {}] Created task group.", shared.id);

        Self {
            shared,
            futures: Mutex::new(Vec::new()),
            join_fn: Box::new(join_fn),
            clear_frequency: AtomicUsize::new(1),
            join_count: AtomicUsize::new(0),
        }
    }

    /// Replaces the function reducing the task results.
    pub fn set_join_function(&mut self, join_fn: impl Fn(R, T) -> R + Send + Sync + 'static) {
        self.join_fn = Box::new(join_fn);
    }

    /// Sets how many joins happen between two automatic clearings of the
    /// collected futures. The default is 1; 0 disables automatic clearing.
    pub fn set_clear_frequency(&self, frequency: usize) {
        self.clear_frequency.store(frequency, Ordering::Relaxed);
    }

    /// Returns the identifier of this group. Identifiers are unique within the
    /// process.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Returns the number of submitted tasks that haven't completed yet.
    pub fn pending(&self) -> usize {
        self.shared.pending.load()
    }

    /// Returns the number of futures collected by this group.
    pub fn len(&self) -> usize {
        self.lock_futures().len()
    }

    /// Returns true if no future was collected since the last clearing.
    pub fn is_empty(&self) -> bool {
        self.lock_futures().is_empty()
    }

    /// Forgets all the collected futures.
    pub fn clear(&self) {
        self.lock_futures().clear();
    }

    /// Registers the future of a task belonging to this group. Returns a clone
    /// of the future.
    ///
    /// Results are reduced in the order in which their futures were added.
    pub fn add(&self, future: TaskFuture<T>) -> TaskFuture<T> {
        self.lock_futures().push(future.clone());
        future
    }

    /// Checks that the given task belongs to this group and returns it, to
    /// chain with a submission.
    pub fn store(&self, task: Task) -> Task {
        assert_eq!(
            task.group_id(),
            Some(self.shared.id),
            "Stored a task into a group it doesn't belong to"
        );
        task
    }

    /// Blocks until all the tasks of this group have completed, discarding
    /// their results.
    ///
    /// This returns early if the thread pool is destroyed in the meantime; the
    /// tasks that didn't run are then still counted by
    /// [`pending()`](Self::pending).
    ///
    /// Panics if some of the tasks panicked.
    pub fn wait(&self) {
        self.wait_for_completion();
        drop(self.collect());
        self.check_panics();
    }

    /// Blocks until all the tasks of this group have completed, and reduces
    /// their results starting from `init`.
    ///
    /// Each result is extracted exactly once: a result reduced by a previous
    /// join isn't reduced again.
    ///
    /// This returns early if the thread pool is destroyed in the meantime,
    /// reducing only the results that are available.
    ///
    /// Tasks may be submitted to the group from other threads while a join is
    /// in progress. Those that haven't completed when the join returns are
    /// reduced by a later join.
    ///
    /// Panics if some of the tasks panicked.
    pub fn join(&self, init: R) -> R {
        self.wait_for_completion();
        let values = self.collect();
        self.check_panics();
        values
            .into_iter()
            .fold(init, |acc, value| (self.join_fn)(acc, value))
    }

    /// Returns the completion state shared with the tasks.
    pub(crate) fn shared(&self) -> &Arc<GroupShared> {
        &self.shared
    }

    fn lock_futures(&self) -> MutexGuard<'_, Vec<TaskFuture<T>>> {
        self.futures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_completion(&self) {
        let _id = self.shared.id;
        log_debug!(
            "[group {_id}] Joining {} task(s)...",
            self.shared.pending.load()
        );

        let pending = self.shared.wait_for_tasks();
        if pending != 0 {
            if self.shared.pool.is_stopped() {
                log_warn!(
                    "[group {_id}] The thread pool was stopped with {pending} task(s) still pending."
                );
            } else {
                log_error!("[group {_id}] Join operation failure! {pending} task(s) still running!");
                panic!("Join operation failure! {pending} task(s) still running!");
            }
        } else {
            log_debug!("[group {_id}] All tasks have completed.");
        }
    }

    /// Extracts the available results, and clears the futures list if it's
    /// time to.
    ///
    /// Clearing only forgets the futures that were resolved in this pass. A
    /// future that is still pending stays in the list, so that a task created
    /// before this join but submitted after it is reduced by a later join.
    fn collect(&self) -> Vec<T> {
        let frequency = self.clear_frequency.load(Ordering::Relaxed);
        let joins = self.join_count.fetch_add(1, Ordering::Relaxed) + 1;
        let clear = frequency != 0 && joins % frequency == 0;

        let mut values = Vec::new();
        self.lock_futures().retain(|future| match future.try_take() {
            None => true,
            Some(result) => {
                values.extend(result.ok());
                !clear
            }
        });
        values
    }

    fn check_panics(&self) {
        let panicked = self.shared.panicked.swap(0);
        if panicked != 0 {
            log_error!(
                "[group {}] {panicked} task(s) panicked!",
                self.shared.id
            );
            panic!("{panicked} task(s) panicked!");
        }
    }
}

impl<R, T: Send + 'static> TaskGroup<R, T> {
    /// Submits a task running `f` to the pool that this group is bound to.
    pub fn exec(&self, f: impl FnOnce() -> T + Send + 'static) -> Submission {
        self.shared.pool.add_task(Task::new(self, f))
    }
}

impl<R, T> Drop for TaskGroup<R, T> {
    fn drop(&mut self) {
        let _pending = self.shared.pending.load();
        if _pending != 0 && !self.shared.pool.is_stopped() {
            log_warn!(
                "[group {}] Dropped a task group with {_pending} task(s) still pending.",
                self.shared.id
            );
        }
    }
}

impl<R, T> fmt::Debug for TaskGroup<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.shared.id)
            .field("pending", &self.shared.pending.load())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
