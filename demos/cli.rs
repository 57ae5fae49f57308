// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of task groups. Build with `--features log` and set
//! `RUST_LOG=debug` to follow the lifecycle of the thread pool.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tasklight::{
    get_env_num_threads, CpuPinningPolicy, TaskGroup, ThreadCount, ThreadManager,
    ThreadPoolBuilder,
};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let num_threads = match cli.num_threads {
        Some(num_threads) => num_threads.get(),
        None => get_env_num_threads(ThreadCount::AvailableParallelism.count().get()),
    };
    let thread_pool = ThreadPoolBuilder {
        num_threads: ThreadCount::AvailableParallelism,
        cpu_pinning: if cli.pin_threads {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
    }
    .build_uninitialized();
    thread_pool.initialize_threadpool(num_threads);
    let manager = ThreadManager::from_pool(thread_pool);
    println!("running on {} thread(s)", manager.size());

    let start = Instant::now();
    match cli.scenario {
        Scenario::Sum => {
            let input_size = cli.input_size;
            let group = TaskGroup::new(manager.thread_pool(), |acc: u64, x: u64| acc + x);
            let tasks = manager.run_loop(
                &group,
                |range| black_box(range).map(|i| i as u64).sum(),
                0..input_size,
                cli.chunks,
            );
            let sum = group.join(0);
            println!("sum = {sum} ({tasks} task(s))");
        }
        Scenario::Reduce => {
            let input_size = cli.input_size;
            match manager.run_loop_reduce(
                |range| black_box(range).map(|i| i as u64).sum::<u64>(),
                0..input_size,
                cli.chunks,
                |a, b| a + b,
                0,
            ) {
                Ok(sum) => println!("sum = {sum}"),
                Err(e) => println!("reduction failed: {e}"),
            }
        }
        Scenario::Tasks => {
            let mut rng = ChaCha12Rng::seed_from_u64(42);
            let group = TaskGroup::new(manager.thread_pool(), |acc: u64, x: u64| acc + x);
            for _ in 0..cli.input_size {
                let micros = rng.random_range(0..=cli.max_task_micros);
                manager.exec(&group, move || {
                    std::thread::sleep(Duration::from_micros(micros));
                    micros
                });
            }
            let total = group.join(0);
            println!(
                "ran {} task(s) totalling {:?} of work",
                cli.input_size,
                Duration::from_micros(total)
            );
        }
        Scenario::Affinity => {
            let group = TaskGroup::new(manager.thread_pool(), |mut acc: Vec<String>, x| {
                acc.push(x);
                acc
            });
            for thread_id in manager.thread_pool().thread_ids() {
                let handle = manager.clone();
                manager.exec_on(&group, thread_id, move || {
                    let current = std::thread::current().id();
                    format!("{}task pinned to {thread_id:?} ran on {current:?}", handle.sid(current))
                });
            }
            for line in group.join(Vec::new()) {
                println!("{line}");
            }
        }
        Scenario::Resize => {
            let group = TaskGroup::new(manager.thread_pool(), |acc: usize, x: usize| acc + x);
            let thread_pool = manager.thread_pool();
            for size in [num_threads * 2, num_threads, 1] {
                thread_pool.resize(size);
                manager.run_loop_each(&group, |i| black_box(i), 0..cli.input_size);
                let sum = group.join(0);
                println!("{} thread(s): sum = {sum}", thread_pool.size());
            }
        }
    }
    println!("elapsed: {:?}", start.elapsed());

    manager.finalize();
}

/// CLI tool to run examples of task groups.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the MAD_NUM_THREADS environment
    /// variable, or to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_threads: bool,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items (or tasks) in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: usize,

    /// Number of chunks to split the input into. Used only for the sum and
    /// reduce scenarios. Default to the number of threads.
    #[arg(long)]
    chunks: Option<NonZeroUsize>,

    /// Maximal duration of each task, in microseconds. Used only for the tasks
    /// scenario.
    #[arg(long, default_value_t = 100)]
    max_task_micros: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a range of numbers with a parallel loop.
    Sum,
    /// Sum a range of numbers through a tree of reduction tasks.
    Reduce,
    /// Run tasks of random durations.
    Tasks,
    /// Run one task pinned to each worker thread.
    Affinity,
    /// Resize the pool between parallel loops.
    Resize,
}
