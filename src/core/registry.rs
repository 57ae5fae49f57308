// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Registry mapping worker thread identifiers to small dense indices.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

/// Assigns each registered thread the smallest index that isn't in use.
#[derive(Default)]
pub struct ThreadRegistry {
    indices: Mutex<HashMap<ThreadId, usize>>,
}

impl ThreadRegistry {
    /// Registers the given thread, returning its index. Registering a thread
    /// twice returns the same index.
    pub fn register(&self, id: ThreadId) -> usize {
        let mut indices = self.lock();
        if let Some(&index) = indices.get(&id) {
            return index;
        }
        let mut used = indices.values().copied().collect::<Vec<_>>();
        used.sort_unstable();
        let index = used
            .iter()
            .enumerate()
            .find(|&(i, &index)| i != index)
            .map_or(used.len(), |(i, _)| i);
        indices.insert(id, index);
        index
    }

    /// Removes the given thread, freeing its index.
    pub fn unregister(&self, id: ThreadId) -> Option<usize> {
        self.lock().remove(&id)
    }

    /// Returns the index of the given thread, if registered.
    pub fn get(&self, id: ThreadId) -> Option<usize> {
        self.lock().get(&id).copied()
    }

    /// Returns the number of registered threads.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
