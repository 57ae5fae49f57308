// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Atomic counters shared between the submitting threads and the worker
//! threads.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A counter that can be incremented and decremented concurrently.
///
/// The counter lives on its own cache line, as it is hammered by every task
/// submission and completion.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: CachePadded<AtomicUsize>,
}

impl AtomicCounter {
    /// Creates a new counter with the given initial value.
    pub fn new(value: usize) -> Self {
        Self {
            value: CachePadded::new(AtomicUsize::new(value)),
        }
    }

    /// Reads the current value.
    pub fn load(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Replaces the current value, returning the previous one.
    pub fn swap(&self, value: usize) -> usize {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// Increments the counter and returns the new value.
    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the counter and returns the new value.
    ///
    /// Panics if the counter was already zero, as that means a completion was
    /// reported without a matching submission.
    pub fn decrement(&self) -> usize {
        let previous = self.value.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "Decremented a counter that was already zero");
        previous - 1
    }
}
