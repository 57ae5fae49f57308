// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide facade owning one [`ThreadPool`], with convenience APIs to
//! submit tasks and parallel loops.

use crate::core::{
    CpuPinningPolicy, Submission, Task, TaskFuture, TaskGroup, ThreadCount, ThreadPool,
    ThreadPoolBuilder,
};
use crate::error::{ManagerError, TaskError};
use crate::macros::{log_debug, log_info};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

/// Environment variable overriding the number of worker threads.
pub const NUM_THREADS_ENV: &str = "MAD_NUM_THREADS";
/// Legacy environment variable overriding the number of worker threads, read
/// if [`NUM_THREADS_ENV`] isn't set.
pub const LEGACY_NUM_THREADS_ENV: &str = "FORCE_NUM_THREADS";

/// The process-wide instance.
static INSTANCE: OnceLock<ThreadManager> = OnceLock::new();

/// A handle to a thread pool, with convenience APIs to submit work to it.
///
/// A process-wide instance is available via [`ThreadManager::instance()`].
/// Independent managers can also be created with
/// [`ThreadManager::from_pool()`].
///
/// ```
/// # use tasklight::{TaskGroup, ThreadManager};
/// let manager = ThreadManager::instance();
/// let group = TaskGroup::new(manager.thread_pool(), |acc: u64, x: u64| acc + x);
/// manager.run_loop(&group, |range| range.map(|i| i as u64).sum(), 0..100, None);
/// assert_eq!(group.join(0), 4950);
/// ```
#[derive(Clone, Debug)]
pub struct ThreadManager {
    thread_pool: Arc<ThreadPool>,
}

impl ThreadManager {
    /// Returns the process-wide instance, creating it on the first call.
    ///
    /// The pool of a new instance has [`get_env_num_threads()`] worker
    /// threads, defaulting to the available parallelism.
    pub fn instance() -> &'static ThreadManager {
        INSTANCE.get_or_init(|| {
            let default = ThreadCount::AvailableParallelism.count().get();
            Self::allocate(get_env_num_threads(default))
        })
    }

    /// Returns the process-wide instance, if it was created.
    pub fn get() -> Option<&'static ThreadManager> {
        INSTANCE.get()
    }

    /// Creates the process-wide instance with the given number of worker
    /// threads.
    ///
    /// Fails if the instance already exists.
    pub fn new(num_threads: usize) -> Result<&'static ThreadManager, ManagerError> {
        let mut created = false;
        let manager = INSTANCE.get_or_init(|| {
            created = true;
            Self::allocate(num_threads)
        });
        if created {
            Ok(manager)
        } else {
            Err(ManagerError::AlreadyExists {
                num_threads: manager.size(),
            })
        }
    }

    /// Returns the process-wide instance, creating it with `num_threads`
    /// worker threads if needed. An existing instance is resized to
    /// `num_threads`.
    pub fn get_thread_manager(num_threads: usize) -> &'static ThreadManager {
        let mut created = false;
        let manager = INSTANCE.get_or_init(|| {
            created = true;
            Self::allocate(num_threads)
        });
        if !created {
            manager.thread_pool.resize(num_threads);
        }
        manager
    }

    /// Creates a manager for the given pool, independent of the process-wide
    /// instance.
    pub fn from_pool(thread_pool: ThreadPool) -> Self {
        Self {
            thread_pool: Arc::new(thread_pool),
        }
    }

    fn allocate(num_threads: usize) -> Self {
        log_info!("[main thread] Allocating {num_threads} thread(s)...");
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build_uninitialized();
        thread_pool.initialize_threadpool(num_threads);
        Self::from_pool(thread_pool)
    }

    /// Returns the pool owned by this manager.
    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.thread_pool
    }

    /// Returns the number of worker threads.
    pub fn size(&self) -> usize {
        self.thread_pool.size()
    }

    /// Destroys the pool. Tasks submitted afterwards run inline.
    pub fn finalize(&self) {
        log_debug!("[main thread] Finalizing the thread manager.");
        self.thread_pool.destroy_threadpool();
    }

    /// Submits a task belonging to `group`.
    pub fn exec<R, T: Send + 'static>(
        &self,
        group: &TaskGroup<R, T>,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Submission {
        self.thread_pool.add_task(Task::new(group, f))
    }

    /// Submits a task belonging to `group`, to run on the given worker thread.
    pub fn exec_on<R, T: Send + 'static>(
        &self,
        group: &TaskGroup<R, T>,
        thread_id: ThreadId,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Submission {
        self.thread_pool.add_thread_task(thread_id, Task::new(group, f))
    }

    /// Submits a task not attached to any group, returning a future for its
    /// result.
    pub fn spawn<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> TaskFuture<T> {
        self.thread_pool.spawn(f)
    }

    /// Submits one task per worker thread (at least one), each calling `f`,
    /// in a single batch. Returns the number of submitted tasks.
    pub fn run<R, T, F>(&self, group: &TaskGroup<R, T>, f: F) -> usize
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let count = self.size().max(1);
        let tasks = (0..count)
            .map(|_| {
                let f = f.clone();
                Task::new(group, move || f())
            })
            .collect::<Vec<_>>();
        self.thread_pool.add_tasks(tasks);
        count
    }

    /// Splits `range` into `chunks` contiguous sub-ranges (by default, one
    /// per worker thread) and submits one task per non-empty sub-range,
    /// calling `f` on it. Returns the number of submitted tasks.
    ///
    /// The partial results are reduced by joining `group`.
    pub fn run_loop<R, T, F>(
        &self,
        group: &TaskGroup<R, T>,
        f: F,
        range: Range<usize>,
        chunks: Option<NonZeroUsize>,
    ) -> usize
    where
        T: Send + 'static,
        F: Fn(Range<usize>) -> T + Send + Sync + 'static,
    {
        let chunks = chunks.map_or_else(|| self.size().max(1), NonZeroUsize::get);
        let f = Arc::new(f);
        let mut count = 0;
        for chunk in split_range(range, chunks) {
            let f = f.clone();
            self.exec(group, move || f(chunk));
            count += 1;
        }
        count
    }

    /// Computes `f` on `chunks` contiguous sub-ranges of `range` (by default,
    /// one per worker thread) and reduces the partial results with `op`
    /// through a tree of tasks, returning `op(identity, total)`.
    ///
    /// Each level of the tree combines adjacent partial results pairwise, so
    /// `op` needs to be associative but not commutative. An empty range
    /// returns `identity`.
    ///
    /// Fails if one of the tasks panicked, or if the pool was destroyed before
    /// running them. This blocks the calling thread, so it must not be called
    /// from a worker thread of a pool with a single thread.
    pub fn run_loop_reduce<R, F, Op>(
        &self,
        f: F,
        range: Range<usize>,
        chunks: Option<NonZeroUsize>,
        op: Op,
        identity: R,
    ) -> Result<R, TaskError>
    where
        R: Send + 'static,
        F: Fn(Range<usize>) -> R + Send + Sync + 'static,
        Op: Fn(R, R) -> R + Send + Sync + 'static,
    {
        let chunks = chunks.map_or_else(|| self.size().max(1), NonZeroUsize::get);
        let f = Arc::new(f);
        let op = Arc::new(op);

        let mut level = split_range(range, chunks)
            .map(|chunk| {
                let f = f.clone();
                self.spawn(move || f(chunk))
            })
            .collect::<Vec<_>>();
        log_debug!("[main thread] Reducing {} partial result(s).", level.len());

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut futures = level.into_iter();
            while let Some(left) = futures.next() {
                let Some(right) = futures.next() else {
                    next.push(left);
                    break;
                };
                let (left, right) = (left.wait()?, right.wait()?);
                let op = op.clone();
                next.push(self.spawn(move || op(left, right)));
            }
            level = next;
        }

        match level.pop() {
            Some(root) => Ok(op(identity, root.wait()?)),
            None => Ok(identity),
        }
    }

    /// Submits one task per index in `range`, calling `f` on it. Returns the
    /// number of submitted tasks.
    pub fn run_loop_each<R, T, F>(&self, group: &TaskGroup<R, T>, f: F, range: Range<usize>) -> usize
    where
        T: Send + 'static,
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let count = range.len();
        for i in range {
            let f = f.clone();
            self.exec(group, move || f(i));
        }
        count
    }

    /// Returns the dense index of the given worker thread, or [`None`] if it
    /// isn't a worker thread of this manager's pool.
    pub fn id(&self, thread_id: ThreadId) -> Option<usize> {
        self.thread_pool.thread_index(thread_id)
    }

    /// Formats the index of the given worker thread as a log prefix, such as
    /// `"[0004] "`. Returns an empty string for other threads.
    pub fn sid(&self, thread_id: ThreadId) -> String {
        match self.id(thread_id) {
            Some(id) => format!("[{id:04}] "),
            None => String::new(),
        }
    }

    /// Formats the index of the given worker thread, zero-padded to the
    /// number of digits of the largest index (at most 4). Returns an empty
    /// string for other threads.
    pub fn id_string(&self, thread_id: ThreadId) -> String {
        match self.id(thread_id) {
            Some(id) => {
                let width = num_digits(self.size().saturating_sub(1)).min(4);
                format!("{id:0width$}")
            }
            None => String::new(),
        }
    }
}

/// Returns the number of worker threads requested by the environment, or
/// `default` if neither [`NUM_THREADS_ENV`] nor [`LEGACY_NUM_THREADS_ENV`]
/// holds a valid number.
pub fn get_env_num_threads(default: usize) -> usize {
    let preferred = std::env::var(NUM_THREADS_ENV).ok();
    let legacy = std::env::var(LEGACY_NUM_THREADS_ENV).ok();
    parse_num_threads(preferred.as_deref(), legacy.as_deref(), default)
}

fn parse_num_threads(preferred: Option<&str>, legacy: Option<&str>, default: usize) -> usize {
    [preferred, legacy]
        .into_iter()
        .flatten()
        .find_map(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Splits a range into `chunks` balanced contiguous sub-ranges, skipping the
/// empty ones.
fn split_range(range: Range<usize>, chunks: usize) -> impl Iterator<Item = Range<usize>> {
    let start = range.start;
    let len = range.len() as u128;
    let chunks = chunks as u128;
    let bound = move |i: u128| start + (i * len / chunks) as usize;
    (0..chunks)
        .map(move |i| bound(i)..bound(i + 1))
        .filter(|chunk| !chunk.is_empty())
}

fn num_digits(mut x: usize) -> usize {
    let mut digits = 1;
    while x >= 10 {
        x /= 10;
        digits += 1;
    }
    digits
}
