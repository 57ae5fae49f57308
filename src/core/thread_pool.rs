// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A resizable thread pool executing tasks from a global queue and from
//! per-thread queues.

use super::registry::ThreadRegistry;
use super::task::{Task, TaskFuture};
use super::task_group::GroupShared;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{JoinHandle, ThreadId};

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use tasklight::{CpuPinningPolicy, PoolState, ThreadCount, ThreadPoolBuilder};
    /// let thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// assert_eq!(thread_pool.state(), PoolState::Started);
    /// let future = thread_pool.spawn(|| 6 * 7);
    /// assert_eq!(future.wait(), Ok(42));
    /// ```
    pub fn build(&self) -> ThreadPool {
        let thread_pool = self.build_uninitialized();
        thread_pool.initialize_threadpool(self.num_threads.count().get());
        thread_pool
    }

    /// Creates a thread pool without spawning any thread yet. Until
    /// [`ThreadPool::initialize_threadpool()`] is called, tasks run inline on
    /// the submitting thread.
    pub fn build_uninitialized(&self) -> ThreadPool {
        ThreadPool::new(self.cpu_pinning)
    }
}

/// Lifecycle state of a [`ThreadPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// No worker thread was spawned yet.
    NotInitialized,
    /// The worker threads are running.
    Started,
    /// The pool was destroyed. This state is terminal.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::NotInitialized => "not initialized",
            PoolState::Started => "started",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a submitted task was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// The task was queued, to be run by a worker thread.
    Queued,
    /// The pool had no running worker thread, so the task already ran on the
    /// submitting thread.
    Inline,
}

/// Queues and bookkeeping protected by the pool's mutex.
struct Queues {
    /// Lifecycle state of the pool.
    state: PoolState,
    /// Number of worker threads that haven't retired.
    num_workers: usize,
    /// Tasks that any worker thread can run.
    main_tasks: VecDeque<Task>,
    /// Tasks pinned to a specific worker thread.
    thread_tasks: HashMap<ThreadId, VecDeque<Task>>,
    /// Number of worker threads that were requested to stop.
    stop_requests: usize,
    /// Worker threads that stopped upon request, and must be joined.
    retired: Vec<ThreadId>,
}

impl Queues {
    /// Whether submitted tasks can be queued, i.e. whether some worker thread
    /// will eventually pick them up.
    fn accepts_tasks(&self) -> bool {
        self.state == PoolState::Started && self.num_workers > 0
    }

    /// Whether the given worker thread has anything to do.
    fn has_work(&self, id: ThreadId) -> bool {
        self.state == PoolState::Stopped
            || self.stop_requests > 0
            || !self.main_tasks.is_empty()
            || self
                .thread_tasks
                .get(&id)
                .is_some_and(|queue| !queue.is_empty())
    }

    fn pop_thread_task(&mut self, id: ThreadId) -> Option<Task> {
        self.thread_tasks.get_mut(&id)?.pop_front()
    }

    fn num_queued(&self) -> usize {
        self.main_tasks.len() + self.thread_tasks.values().map(VecDeque::len).sum::<usize>()
    }

    /// Removes all the queued tasks.
    fn drain(&mut self) -> Vec<Task> {
        let mut tasks = self.main_tasks.drain(..).collect::<Vec<_>>();
        for queue in self.thread_tasks.values_mut() {
            tasks.extend(queue.drain(..));
        }
        tasks
    }
}

/// State shared between the pool handle, the worker threads and the task
/// groups bound to the pool.
pub(crate) struct PoolShared {
    /// Queues and bookkeeping.
    queues: Mutex<Queues>,
    /// Signaled when a task is available or the pool state changes.
    task_cond: Condvar,
    /// Signaled when a worker thread retires.
    retire_cond: Condvar,
    /// Mirror of `state == Stopped`, readable without locking.
    stopped: AtomicBool,
    /// Number of worker threads.
    size: AtomicUsize,
    /// Groups bound to this pool, to wake up when the pool is destroyed.
    groups: Mutex<Vec<Weak<GroupShared>>>,
    /// Dense indices of the worker threads.
    registry: ThreadRegistry,
    /// Policy to pin worker threads to CPUs.
    cpu_pinning: CpuPinningPolicy,
}

impl PoolShared {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true once the pool was destroyed.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Keeps track of a group bound to this pool.
    pub(crate) fn register_group(&self, group: &Arc<GroupShared>) {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.retain(|group| group.strong_count() > 0);
        groups.push(Arc::downgrade(group));
    }

    /// Wakes up all the threads joining a group bound to this pool.
    fn wake_groups(&self) {
        let groups = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();
        log_debug!("[main thread] Waking up {} task group(s).", groups.len());
        for group in groups {
            group.wake();
        }
    }

    /// Returns the pool that the task's group is bound to, if that isn't this
    /// pool.
    fn foreign_pool(&self, task: &Task) -> Option<Arc<PoolShared>> {
        task.group_pool()
            .filter(|pool| !std::ptr::eq(Arc::as_ptr(pool), self))
            .cloned()
    }

    /// Submits a task to the global queue, or runs it inline if no worker
    /// thread is running.
    ///
    /// A task whose group is bound to another pool is submitted to that pool,
    /// whose destruction is what wakes up the group's joiners.
    pub(crate) fn add_task(&self, mut task: Task) -> Submission {
        if let Some(pool) = self.foreign_pool(&task) {
            log_warn!(
                "[main thread] Task of group {:?} submitted to another thread pool, rerouting it to its group's pool.",
                task.group_id()
            );
            return pool.add_task(task);
        }

        let mut queues = self.lock_queues();
        if !queues.accepts_tasks() {
            drop(queues);
            return run_inline(task);
        }

        task.increment();
        queues.main_tasks.push_back(task);
        // Wake up one thread that is waiting for a task to be available.
        self.task_cond.notify_one();
        Submission::Queued
    }

    /// Transitions to the stopped state. Returns false if the pool wasn't
    /// started.
    fn stop(&self) -> bool {
        let mut queues = self.lock_queues();
        if queues.state != PoolState::Started {
            return false;
        }
        queues.state = PoolState::Stopped;
        self.stopped.store(true, Ordering::SeqCst);
        self.task_cond.notify_all();
        self.retire_cond.notify_all();
        true
    }
}

/// Runs a task on the current thread, catching any panic.
fn execute(task: Task) {
    if catch_unwind(AssertUnwindSafe(move || task.invoke())).is_err() {
        log_error!("Detected panic in a task, the worker thread keeps running.");
    }
}

/// Runs a submitted task on the current thread, counting it as pending in its
/// group beforehand.
fn run_inline(mut task: Task) -> Submission {
    log_trace!("Running a task inline.");
    task.increment();
    execute(task);
    Submission::Inline
}

/// A pool of worker threads executing [`Task`]s.
///
/// The pool follows the lifecycle described by [`PoolState`]. While it isn't
/// started (or once all its threads have been stopped), submitted tasks run
/// synchronously on the submitting thread.
pub struct ThreadPool {
    /// State shared with the worker threads.
    shared: Arc<PoolShared>,
    /// Handles to all the worker threads in the pool.
    threads: Mutex<Vec<WorkerThreadHandle>>,
    /// Indices of the worker threads that fail to spawn.
    #[cfg(test)]
    failing_spawns: Mutex<Vec<usize>>,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Identifier of the thread.
    id: ThreadId,
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool, without spawning any thread.
    fn new(cpu_pinning: CpuPinningPolicy) -> Self {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        Self {
            shared: Arc::new(PoolShared {
                queues: Mutex::new(Queues {
                    state: PoolState::NotInitialized,
                    num_workers: 0,
                    main_tasks: VecDeque::new(),
                    thread_tasks: HashMap::new(),
                    stop_requests: 0,
                    retired: Vec::new(),
                }),
                task_cond: Condvar::new(),
                retire_cond: Condvar::new(),
                stopped: AtomicBool::new(false),
                size: AtomicUsize::new(0),
                groups: Mutex::new(Vec::new()),
                registry: ThreadRegistry::default(),
                cpu_pinning,
            }),
            threads: Mutex::new(Vec::new()),
            #[cfg(test)]
            failing_spawns: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<WorkerThreadHandle>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of worker threads in this pool.
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Returns the lifecycle state of this pool.
    pub fn state(&self) -> PoolState {
        self.shared.lock_queues().state
    }

    /// Returns true if submitted tasks are queued for the worker threads, false
    /// if they run inline.
    pub fn is_alive(&self) -> bool {
        self.shared.lock_queues().accepts_tasks()
    }

    /// Returns the policy to pin worker threads to CPUs.
    pub fn cpu_pinning(&self) -> CpuPinningPolicy {
        self.shared.cpu_pinning
    }

    /// Returns the number of tasks waiting in the queues.
    pub fn queued_tasks(&self) -> usize {
        self.shared.lock_queues().num_queued()
    }

    /// Returns the identifiers of the worker threads, in spawning order.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.lock_threads().iter().map(|t| t.id).collect()
    }

    /// Returns the dense index of the given worker thread, or [`None`] if it
    /// isn't a worker thread of this pool.
    pub fn thread_index(&self, id: ThreadId) -> Option<usize> {
        self.shared.registry.get(id)
    }

    /// Returns the dense index of the current thread, or [`None`] if it isn't a
    /// worker thread of this pool.
    pub fn current_thread_index(&self) -> Option<usize> {
        self.thread_index(std::thread::current().id())
    }

    /// Spawns worker threads until the pool has `num_threads` of them, or stops
    /// worker threads if it has more. Returns the resulting number of worker
    /// threads.
    ///
    /// Threads that fail to spawn are skipped, so the pool may end up smaller
    /// than requested. A stopped pool can't be initialized again.
    pub fn initialize_threadpool(&self, num_threads: usize) -> usize {
        let mut threads = self.lock_threads();

        match self.state() {
            PoolState::Stopped => {
                log_warn!("[main thread] Cannot initialize a thread pool that was destroyed.");
                return 0;
            }
            PoolState::Started => {
                if threads.len() > num_threads {
                    while threads.len() > num_threads {
                        if !self.stop_one(&mut threads) {
                            break;
                        }
                    }
                    return threads.len();
                } else if threads.len() == num_threads {
                    return num_threads;
                }
            }
            PoolState::NotInitialized => {
                if num_threads == 0 {
                    return 0;
                }
            }
        }

        // The state must be set before spawning, so that new threads wait for
        // tasks rather than observing an uninitialized pool.
        {
            let mut queues = self.shared.lock_queues();
            if queues.state == PoolState::Stopped {
                return 0;
            }
            queues.state = PoolState::Started;
        }

        for id in threads.len()..num_threads {
            match self.spawn_worker(id) {
                Ok(handle) => {
                    let thread_id = handle.thread().id();
                    self.shared.registry.register(thread_id);
                    let mut queues = self.shared.lock_queues();
                    queues.thread_tasks.insert(thread_id, VecDeque::new());
                    queues.num_workers += 1;
                    drop(queues);
                    threads.push(WorkerThreadHandle {
                        id: thread_id,
                        handle,
                    });
                }
                Err(_e) => {
                    log_error!("[main thread] Failed to spawn worker thread #{id}: {_e}");
                }
            }
        }

        self.shared.size.store(threads.len(), Ordering::SeqCst);
        log_debug!(
            "[main thread] {} thread(s) running in the thread pool.",
            threads.len()
        );
        threads.len()
    }

    /// Spawns the worker thread with the given index.
    fn spawn_worker(&self, id: usize) -> std::io::Result<JoinHandle<()>> {
        #[cfg(test)]
        if self
            .failing_spawns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
        {
            return Err(std::io::Error::other(format!("cannot spawn thread #{id}")));
        }

        let context = ThreadContext {
            id,
            shared: self.shared.clone(),
        };
        let cpu_pinning = self.shared.cpu_pinning;
        std::thread::Builder::new()
            .name(format!("tasklight-worker-{id}"))
            .spawn(move || {
                pin_to_cpu(id, cpu_pinning);
                context.run()
            })
    }

    /// Changes the number of worker threads. This is a no-op if the pool
    /// already has `num_threads` threads.
    pub fn resize(&self, num_threads: usize) -> usize {
        if num_threads == self.size() {
            return num_threads;
        }
        self.initialize_threadpool(num_threads)
    }

    /// Stops one worker thread, once it is done with its current task. Returns
    /// the resulting number of worker threads.
    ///
    /// Tasks pinned to the stopped thread are moved to the global queue. When
    /// the last worker thread is stopped, the tasks left in the queue run on the
    /// calling thread.
    pub fn stop_thread(&self) -> usize {
        let mut threads = self.lock_threads();
        self.stop_one(&mut threads);
        threads.len()
    }

    fn stop_one(&self, threads: &mut Vec<WorkerThreadHandle>) -> bool {
        if threads.is_empty() {
            return false;
        }
        let current = std::thread::current().id();
        if threads.len() == 1 && threads[0].id == current {
            log_warn!("[main thread] The last worker thread cannot stop itself.");
            return false;
        }

        let mut queues = self.shared.lock_queues();
        if queues.state != PoolState::Started {
            return false;
        }
        queues.stop_requests += 1;
        self.shared.task_cond.notify_one();

        let mut queues = self
            .shared
            .retire_cond
            .wait_while(queues, |queues| {
                queues.retired.is_empty() && queues.state == PoolState::Started
            })
            .unwrap_or_else(PoisonError::into_inner);
        let Some(retired) = queues.retired.pop() else {
            return false;
        };
        let orphans = if queues.num_workers == 0 {
            queues.drain()
        } else {
            Vec::new()
        };
        drop(queues);

        if let Some(position) = threads.iter().position(|t| t.id == retired) {
            let t = threads.remove(position);
            let _result = t.handle.join();
            match _result {
                Ok(_) => log_debug!("[main thread] Stopped thread {retired:?}."),
                Err(_) => log_error!("[main thread] Thread {retired:?} joined with result: {_result:?}"),
            }
        }
        self.shared.registry.unregister(retired);
        self.shared.size.store(threads.len(), Ordering::SeqCst);

        if !orphans.is_empty() {
            log_warn!(
                "[main thread] Running {} task(s) left after stopping the last thread.",
                orphans.len()
            );
            for task in orphans {
                execute(task);
            }
        }
        true
    }

    /// Stops all the worker threads and waits for them to exit. Tasks still in
    /// the queues are dropped without running.
    ///
    /// Threads joining a [`TaskGroup`](crate::TaskGroup) bound to this pool are
    /// woken up. Calling this again, or on a pool that wasn't started, is a
    /// no-op.
    pub fn destroy_threadpool(&self) -> usize {
        if !self.shared.stop() {
            return 0;
        }
        log_debug!("[main thread] Notified threads to finish.");
        self.shared.wake_groups();

        let threads = std::mem::take(&mut *self.lock_threads());
        let current = std::thread::current().id();

        log_debug!("[main thread] Joining threads in the pool...");
        for t in threads {
            self.shared.registry.unregister(t.id);
            if t.id == current {
                // Destroying from a worker thread, which exits once it returns
                // from the current task.
                log_debug!("[main thread] Not joining the current thread {current:?}.");
                continue;
            }
            let _result = t.handle.join();
            match _result {
                Ok(_) => log_debug!("[main thread] Thread {:?} joined with result: {_result:?}", t.id),
                Err(_) => log_error!("[main thread] Thread {:?} joined with result: {_result:?}", t.id),
            }
        }
        log_debug!("[main thread] Joined threads.");
        self.shared.size.store(0, Ordering::SeqCst);

        let leftovers = self.shared.lock_queues().drain();
        if !leftovers.is_empty() {
            log_warn!(
                "[main thread] Dropping {} task(s) that never ran.",
                leftovers.len()
            );
        }
        drop(leftovers);
        0
    }

    /// Submits a task to the global queue, waking up one worker thread. If the
    /// pool has no running worker thread, the task runs on the current thread
    /// before this function returns.
    pub fn add_task(&self, task: Task) -> Submission {
        self.shared.add_task(task)
    }

    /// Submits a batch of tasks to the global queue. Returns the number of
    /// queued tasks (0 if they ran inline).
    ///
    /// Tasks whose group is bound to another pool are submitted to that pool,
    /// as with [`add_task()`](Self::add_task).
    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let (tasks, foreign): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| self.shared.foreign_pool(task).is_none());
        let rerouted = foreign
            .into_iter()
            .map(|task| self.shared.add_task(task))
            .filter(|submission| *submission == Submission::Queued)
            .count();

        let mut queues = self.shared.lock_queues();
        if !queues.accepts_tasks() {
            drop(queues);
            for task in tasks {
                run_inline(task);
            }
            return rerouted;
        }

        let count = tasks.len();
        for mut task in tasks {
            task.increment();
            queues.main_tasks.push_back(task);
        }
        if count < queues.num_workers {
            for _ in 0..count {
                self.shared.task_cond.notify_one();
            }
        } else {
            self.shared.task_cond.notify_all();
        }
        count + rerouted
    }

    /// Submits a task to the queue of a specific worker thread. Tasks submitted
    /// to the same thread run in submission order.
    ///
    /// If `thread_id` isn't a worker thread of this pool, the task is submitted
    /// to the global queue instead. A task whose group is bound to another pool
    /// is submitted to the global queue of that pool.
    pub fn add_thread_task(&self, thread_id: ThreadId, mut task: Task) -> Submission {
        if self.shared.foreign_pool(&task).is_some() {
            return self.shared.add_task(task);
        }

        let mut queues = self.shared.lock_queues();
        if !queues.accepts_tasks() {
            drop(queues);
            return run_inline(task);
        }

        task.increment();
        match queues.thread_tasks.get_mut(&thread_id) {
            Some(queue) => queue.push_back(task),
            None => {
                log_warn!("[main thread] Thread {thread_id:?} isn't a worker thread of this pool, using the global queue.");
                queues.main_tasks.push_back(task);
            }
        }
        // Only the target thread can pick this task up, so all threads must
        // check.
        self.shared.task_cond.notify_all();
        Submission::Queued
    }

    /// Submits a task not attached to any group, returning a future for its
    /// result.
    pub fn spawn<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> TaskFuture<T> {
        let (task, future) = Task::with_future(f);
        self.add_task(task);
        future
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    fn drop(&mut self) {
        self.destroy_threadpool();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size())
            .field("state", &self.state())
            .field("cpu_pinning", &self.shared.cpu_pinning)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(
    any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ),
    allow(unused_variables)
)]
fn pin_to_cpu(id: usize, cpu_pinning: CpuPinningPolicy) {
    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index, in spawning order.
    #[cfg_attr(not(feature = "log"), allow(dead_code))]
    id: usize,
    /// State shared with the pool.
    shared: Arc<PoolShared>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&self) {
        let me = std::thread::current().id();
        log_debug!("[thread {}] Started", self.id);

        let mut queues = self.shared.lock_queues();
        loop {
            // A condvar can wake up spuriously, and another thread can grab the
            // task we were notified about, so the predicate must be re-checked.
            queues = self
                .shared
                .task_cond
                .wait_while(queues, |queues| !queues.has_work(me))
                .unwrap_or_else(PoisonError::into_inner);

            if queues.state == PoolState::Stopped {
                log_debug!("[thread {}] Received finish signal", self.id);
                break;
            }

            if queues.stop_requests > 0 {
                queues.stop_requests -= 1;
                queues.num_workers -= 1;
                queues.retired.push(me);
                if let Some(orphans) = queues.thread_tasks.remove(&me) {
                    queues.main_tasks.extend(orphans);
                }
                // This thread may have consumed the wake-up meant for a queued
                // task.
                if !queues.main_tasks.is_empty() {
                    self.shared.task_cond.notify_all();
                }
                self.shared.retire_cond.notify_all();
                log_debug!("[thread {}] Received stop request", self.id);
                break;
            }

            // Tasks pinned to this thread come first.
            while let Some(task) = queues.pop_thread_task(me) {
                drop(queues);
                log_trace!("[thread {}] Running a pinned task", self.id);
                execute(task);
                queues = self.shared.lock_queues();
                if queues.state == PoolState::Stopped {
                    break;
                }
            }

            if queues.state != PoolState::Stopped {
                if let Some(task) = queues.main_tasks.pop_front() {
                    drop(queues);
                    log_trace!("[thread {}] Running a task", self.id);
                    execute(task);
                    queues = self.shared.lock_queues();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::task_group::TaskGroup;
    use crate::error::TaskError;
    use std::sync::atomic::AtomicU8;
    use std::time::Duration;

    fn build_pool(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_build_thread_pool_available_parallelism() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();

        assert_eq!(
            thread_pool.size(),
            std::thread::available_parallelism().unwrap().get()
        );
        assert_eq!(thread_pool.spawn(|| 5 * 11).wait(), Ok(55));
    }

    #[test]
    fn test_build_thread_pool_fixed_thread_count() {
        let thread_pool = build_pool(4);
        assert_eq!(thread_pool.size(), 4);
        assert_eq!(thread_pool.thread_ids().len(), 4);
        assert_eq!(thread_pool.spawn(|| 5 * 11).wait(), Ok(55));
    }

    #[test]
    fn test_build_thread_pool_cpu_pinning_if_supported() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();

        assert_eq!(thread_pool.cpu_pinning(), CpuPinningPolicy::IfSupported);
        assert_eq!(thread_pool.spawn(|| 5 * 11).wait(), Ok(55));
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_build_thread_pool_cpu_pinning_always_not_supported() {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
    }

    #[test]
    fn test_state_machine() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();
        assert_eq!(thread_pool.state(), PoolState::NotInitialized);
        assert!(!thread_pool.is_alive());
        assert_eq!(thread_pool.size(), 0);

        // Nothing to spawn.
        assert_eq!(thread_pool.initialize_threadpool(0), 0);
        assert_eq!(thread_pool.state(), PoolState::NotInitialized);

        assert_eq!(thread_pool.initialize_threadpool(2), 2);
        assert_eq!(thread_pool.state(), PoolState::Started);
        assert!(thread_pool.is_alive());

        assert_eq!(thread_pool.destroy_threadpool(), 0);
        assert_eq!(thread_pool.state(), PoolState::Stopped);
        assert!(!thread_pool.is_alive());
        assert_eq!(thread_pool.size(), 0);

        // Destroying again is a no-op, and the stopped state is terminal.
        assert_eq!(thread_pool.destroy_threadpool(), 0);
        assert_eq!(thread_pool.initialize_threadpool(2), 0);
        assert_eq!(thread_pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PoolState::NotInitialized.to_string(), "not initialized");
        assert_eq!(PoolState::Started.to_string(), "started");
        assert_eq!(PoolState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_uninitialized_pool_runs_inline() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();

        let caller = std::thread::current().id();
        let (task, future) = Task::with_future(move || std::thread::current().id() == caller);
        assert_eq!(thread_pool.add_task(task), Submission::Inline);
        // The result is available without waiting.
        assert_eq!(future.try_take(), Some(Ok(true)));

        let (task, future) = Task::with_future(|| 42);
        assert_eq!(
            thread_pool.add_thread_task(caller, task),
            Submission::Inline
        );
        assert_eq!(future.try_take(), Some(Ok(42)));

        assert_eq!(thread_pool.add_tasks([Task::detached(|| ())]), 0);
    }

    #[test]
    fn test_stopped_pool_runs_inline() {
        let thread_pool = build_pool(2);
        thread_pool.destroy_threadpool();
        let (task, future) = Task::with_future(|| 1);
        assert_eq!(thread_pool.add_task(task), Submission::Inline);
        assert_eq!(future.try_take(), Some(Ok(1)));
    }

    #[test]
    fn test_inline_panic_is_caught() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(1).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();
        let future = thread_pool.spawn(|| -> u32 { panic!("inline panic") });
        assert_eq!(future.try_take(), Some(Err(TaskError::Panicked)));
    }

    #[test]
    fn test_each_task_runs_exactly_once() {
        const NUM_TASKS: usize = 10_000;

        let thread_pool = build_pool(4);
        let counters = Arc::new((0..NUM_TASKS).map(|_| AtomicU8::new(0)).collect::<Vec<_>>());

        let futures = (0..NUM_TASKS)
            .map(|i| {
                let counters = counters.clone();
                thread_pool.spawn(move || {
                    counters[i].fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for future in futures {
            assert_eq!(future.wait(), Ok(()));
        }

        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(thread_pool.queued_tasks(), 0);
    }

    #[test]
    fn test_add_tasks_batch() {
        let thread_pool = build_pool(4);
        let (tasks, futures): (Vec<_>, Vec<_>) =
            (0..100u64).map(|i| Task::with_future(move || i * 2)).unzip();

        assert_eq!(thread_pool.add_tasks(tasks), 100);
        let sum = futures.iter().map(|f| f.wait().unwrap()).sum::<u64>();
        assert_eq!(sum, 9900);
    }

    #[test]
    fn test_resize_is_idempotent() {
        let thread_pool = build_pool(4);
        let ids = thread_pool.thread_ids();
        assert_eq!(thread_pool.resize(4), 4);
        assert_eq!(thread_pool.thread_ids(), ids);
        assert_eq!(thread_pool.initialize_threadpool(4), 4);
        assert_eq!(thread_pool.thread_ids(), ids);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let thread_pool = build_pool(2);
        let ids = thread_pool.thread_ids();

        assert_eq!(thread_pool.resize(6), 6);
        assert_eq!(thread_pool.size(), 6);
        // Existing threads are kept.
        assert_eq!(thread_pool.thread_ids()[..2], ids[..]);
        assert_eq!(thread_pool.spawn(|| 1).wait(), Ok(1));

        assert_eq!(thread_pool.resize(3), 3);
        assert_eq!(thread_pool.size(), 3);
        assert_eq!(thread_pool.thread_ids().len(), 3);
        assert_eq!(thread_pool.spawn(|| 2).wait(), Ok(2));
    }

    #[test]
    fn test_stop_thread_until_one_left() {
        let thread_pool = build_pool(4);
        let mut size = thread_pool.size();
        while size > 1 {
            let new_size = thread_pool.stop_thread();
            assert_eq!(new_size, size - 1);
            size = new_size;

            // The pool remains functional.
            let futures = (0..10).map(|i| thread_pool.spawn(move || i)).collect::<Vec<_>>();
            let sum = futures.iter().map(|f| f.wait().unwrap()).sum::<i32>();
            assert_eq!(sum, 45);
        }
        assert_eq!(thread_pool.size(), 1);
        assert!(thread_pool.is_alive());
        assert_eq!(thread_pool.destroy_threadpool(), 0);
    }

    #[test]
    fn test_stop_all_threads_runs_inline() {
        let thread_pool = build_pool(2);
        assert_eq!(thread_pool.stop_thread(), 1);
        assert_eq!(thread_pool.stop_thread(), 0);
        // Nothing left to stop.
        assert_eq!(thread_pool.stop_thread(), 0);

        assert_eq!(thread_pool.state(), PoolState::Started);
        assert!(!thread_pool.is_alive());
        let (task, future) = Task::with_future(|| 3);
        assert_eq!(thread_pool.add_task(task), Submission::Inline);
        assert_eq!(future.try_take(), Some(Ok(3)));

        // The pool can grow again.
        assert_eq!(thread_pool.resize(2), 2);
        assert!(thread_pool.is_alive());
        assert_eq!(thread_pool.spawn(|| 4).wait(), Ok(4));
    }

    #[test]
    fn test_thread_tasks_are_pinned_and_ordered() {
        const NUM_TASKS: usize = 50;

        let thread_pool = build_pool(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        let ids = thread_pool.thread_ids();
        for &id in &ids {
            for i in 0..NUM_TASKS {
                let log = log.clone();
                let submission = thread_pool.add_thread_task(
                    id,
                    Task::detached(move || {
                        log.lock().unwrap().push((id, std::thread::current().id(), i));
                    }),
                );
                assert_eq!(submission, Submission::Queued);
            }
        }

        // Wait for all the pinned tasks.
        while log.lock().unwrap().len() < ids.len() * NUM_TASKS {
            std::thread::sleep(Duration::from_millis(1));
        }

        let log = log.lock().unwrap();
        for &id in &ids {
            let runs = log
                .iter()
                .filter(|(target, _, _)| *target == id)
                .collect::<Vec<_>>();
            assert!(runs.iter().all(|(_, runner, _)| *runner == id));
            let order = runs.iter().map(|(_, _, i)| *i).collect::<Vec<_>>();
            assert_eq!(order, (0..NUM_TASKS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_thread_task_to_unknown_thread() {
        let thread_pool = build_pool(2);
        let stranger = std::thread::current().id();
        let (task, future) = Task::with_future(|| 7);
        assert_eq!(
            thread_pool.add_thread_task(stranger, task),
            Submission::Queued
        );
        assert_eq!(future.wait(), Ok(7));
    }

    #[test]
    fn test_pinned_tasks_survive_thread_stop() {
        let thread_pool = build_pool(2);
        let release = Arc::new(AtomicBool::new(false));
        let ids = thread_pool.thread_ids();

        // Keep both workers busy, so that tasks pile up in the pinned queue.
        let blockers = ids
            .iter()
            .map(|&id| {
                let (task, future) = Task::with_future({
                    let release = release.clone();
                    move || {
                        while !release.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                });
                thread_pool.add_thread_task(id, task);
                future
            })
            .collect::<Vec<_>>();
        let pinned = (0..10)
            .map(|i| {
                let (task, future) = Task::with_future(move || i);
                thread_pool.add_thread_task(ids[0], task);
                future
            })
            .collect::<Vec<_>>();

        std::thread::scope(|scope| {
            let stopper = scope.spawn(|| thread_pool.stop_thread());
            release.store(true, Ordering::SeqCst);
            assert_eq!(stopper.join().unwrap(), 1);
        });

        for future in blockers {
            assert_eq!(future.wait(), Ok(()));
        }
        let sum = pinned.iter().map(|f| f.wait().unwrap()).sum::<i32>();
        assert_eq!(sum, 45);
    }

    #[test]
    fn test_thread_indices_are_dense() {
        let thread_pool = Arc::new(build_pool(4));

        let mut indices = thread_pool
            .thread_ids()
            .into_iter()
            .map(|id| thread_pool.thread_index(id).unwrap())
            .collect::<Vec<_>>();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(thread_pool.current_thread_index(), None);

        let pool = thread_pool.clone();
        let index = thread_pool
            .spawn(move || pool.current_thread_index())
            .wait()
            .unwrap();
        assert!(index.is_some_and(|i| i < 4));
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let thread_pool = build_pool(1);
        let future = thread_pool.spawn(|| -> u32 { panic!("worker panic") });
        assert_eq!(future.wait(), Err(TaskError::Panicked));
        assert_eq!(thread_pool.size(), 1);
        assert_eq!(thread_pool.spawn(|| 10).wait(), Ok(10));
    }

    #[test]
    fn test_destroy_abandons_queued_tasks() {
        let thread_pool = build_pool(1);
        let release = Arc::new(AtomicBool::new(false));

        let blocker = thread_pool.spawn({
            let release = release.clone();
            move || {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                1
            }
        });
        let queued = thread_pool.spawn(|| 2);

        std::thread::scope(|scope| {
            let destroyer = scope.spawn(|| thread_pool.destroy_threadpool());
            while thread_pool.state() != PoolState::Stopped {
                std::thread::sleep(Duration::from_millis(1));
            }
            release.store(true, Ordering::SeqCst);
            assert_eq!(destroyer.join().unwrap(), 0);
        });

        assert_eq!(blocker.wait(), Ok(1));
        assert_eq!(queued.wait(), Err(TaskError::Abandoned));
        assert_eq!(thread_pool.queued_tasks(), 0);
    }

    #[test]
    fn test_destroy_from_worker_thread() {
        let thread_pool = Arc::new(build_pool(2));
        let pool = thread_pool.clone();
        let future = thread_pool.spawn(move || pool.destroy_threadpool());
        assert_eq!(future.wait(), Ok(0));
        assert_eq!(thread_pool.state(), PoolState::Stopped);
        assert_eq!(thread_pool.size(), 0);
    }

    #[test]
    fn test_spawn_failure_truncates_size() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();
        thread_pool.failing_spawns.lock().unwrap().push(1);

        assert_eq!(thread_pool.initialize_threadpool(4), 3);
        assert_eq!(thread_pool.size(), 3);
        assert_eq!(thread_pool.thread_ids().len(), 3);
        assert_eq!(thread_pool.state(), PoolState::Started);
        assert!(thread_pool.is_alive());

        // The threads that did spawn are usable, with dense indices.
        let mut indices = thread_pool
            .thread_ids()
            .into_iter()
            .map(|id| thread_pool.thread_index(id).unwrap())
            .collect::<Vec<_>>();
        indices.sort_unstable();
        assert_eq!(indices, [0, 1, 2]);

        let futures = (0..100)
            .map(|i| thread_pool.spawn(move || i))
            .collect::<Vec<_>>();
        let sum = futures.into_iter().map(|f| f.wait().unwrap()).sum::<usize>();
        assert_eq!(sum, 4950);
    }

    #[test]
    fn test_spawn_failure_of_all_threads() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();
        thread_pool.failing_spawns.lock().unwrap().extend([0, 1]);

        assert_eq!(thread_pool.initialize_threadpool(2), 0);
        assert_eq!(thread_pool.size(), 0);
        assert!(thread_pool.thread_ids().is_empty());
        assert!(!thread_pool.is_alive());

        // Without any worker thread, tasks run on the caller.
        let (task, future) = Task::with_future(|| 7);
        assert_eq!(thread_pool.add_task(task), Submission::Inline);
        assert_eq!(future.try_take(), Some(Ok(7)));

        // Spawning works again once the failure is gone.
        thread_pool.failing_spawns.lock().unwrap().clear();
        assert_eq!(thread_pool.initialize_threadpool(2), 2);
        assert!(thread_pool.is_alive());
        assert_eq!(thread_pool.spawn(|| 5 * 11).wait(), Ok(55));
    }

    #[test]
    fn test_task_of_another_pool_is_rerouted() {
        let pool_a = build_pool(2);
        let pool_b = build_pool(2);
        let group = TaskGroup::new(&pool_a, |mut acc: Vec<ThreadId>, x: ThreadId| {
            acc.push(x);
            acc
        });
        let current = || std::thread::current().id();

        assert_eq!(pool_b.add_task(Task::new(&group, current)), Submission::Queued);
        let thread_b = pool_b.thread_ids()[0];
        assert_eq!(
            pool_b.add_thread_task(thread_b, Task::new(&group, current)),
            Submission::Queued
        );
        assert_eq!(
            pool_b.add_tasks([Task::new(&group, current), Task::new(&group, current)]),
            2
        );

        // Destroying the other pool doesn't strand any task of the group.
        pool_b.destroy_threadpool();
        assert_eq!(pool_b.queued_tasks(), 0);

        let threads = group.join(Vec::new());
        assert_eq!(threads.len(), 4);
        let threads_a = pool_a.thread_ids();
        assert!(threads.iter().all(|id| threads_a.contains(id)));
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_task_of_another_pool_runs_inline_once_that_pool_stopped() {
        let pool_a = build_pool(1);
        let pool_b = build_pool(1);
        let group = TaskGroup::new(&pool_a, |acc: u32, x: u32| acc + x);
        pool_a.destroy_threadpool();

        // The group's pool decides, even though the other pool is alive.
        let caller = std::thread::current().id();
        let task = Task::new(&group, move || u32::from(std::thread::current().id() == caller));
        assert_eq!(pool_b.add_task(task), Submission::Inline);
        assert_eq!(group.join(0), 1);
    }

    #[test]
    fn test_debug() {
        let thread_pool = build_pool(2);
        assert_eq!(
            format!("{thread_pool:?}"),
            "ThreadPool { size: 2, state: Started, cpu_pinning: No, .. }"
        );
    }
}
