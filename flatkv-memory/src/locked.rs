// Copyright 2025 flatkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    hash::BuildHasher,
    sync::{atomic::Ordering, Arc},
};

use ahash::RandomState;
use flatkv_common::storage::Storage;
use parking_lot::Mutex;

use crate::{
    state::LruState,
    stats::{Stats, StatsSnapshot},
};

/// LRU cache serialized by a single mutex.
///
/// Operations are applied one at a time in lock acquisition order, so there is no batching and no same-batch
/// conflict resolution. Kept as the baseline to compare the flat-combining backend against.
pub struct GlobalLockCache<S = RandomState> {
    state: Mutex<LruState<S>>,
    capacity: usize,
    stats: Arc<Stats>,
}

impl<S> Debug for GlobalLockCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLockCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<S> GlobalLockCache<S>
where
    S: BuildHasher + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` bytes of keys and values.
    pub fn new(capacity: usize, hash_builder: S) -> Self {
        let stats = Arc::<Stats>::default();
        Self {
            state: Mutex::new(LruState::new(capacity, hash_builder, stats.clone())),
            capacity,
            stats,
        }
    }

    /// Capacity in bytes of keys and values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of keys and values stored, as of the last completed mutation.
    pub fn usage(&self) -> usize {
        self.stats.usage.load(Ordering::Relaxed)
    }

    /// Number of records, as of the last completed mutation.
    pub fn len(&self) -> usize {
        self.stats.entries.load(Ordering::Relaxed)
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters of the cache.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `f` with the cache state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LruState<S>) -> R) -> R {
        f(&mut self.state.lock())
    }
}

impl<S> Storage for GlobalLockCache<S>
where
    S: BuildHasher + Send + Sync + 'static,
{
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.state.lock().put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.state.lock().put_if_absent(key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.state.lock().set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.state.lock().delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().get(key)
    }
}
