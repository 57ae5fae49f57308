// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, tasks, task groups and synchronization
//! primitives.

mod counter;
mod registry;
mod task;
mod task_group;
mod thread_pool;
mod util;

pub use task::{Task, TaskFuture};
pub use task_group::TaskGroup;
pub use thread_pool::{
    CpuPinningPolicy, PoolState, Submission, ThreadCount, ThreadPool, ThreadPoolBuilder,
};
