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

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters of a cache instance.
///
/// Counters are updated by whichever thread holds exclusive access to the cache state and can be read at any time.
#[derive(Debug, Default)]
pub struct Stats {
    /// successful inserts of absent keys
    pub insert: AtomicU64,
    /// successful value replacements of present keys
    pub replace: AtomicU64,
    /// get hits
    pub hit: AtomicU64,
    /// get misses
    pub miss: AtomicU64,
    /// successful deletes
    pub remove: AtomicU64,
    /// records evicted to stay within capacity
    pub evict: AtomicU64,
    /// writes refused because the entry alone exceeds the capacity
    pub reject: AtomicU64,

    /// current sum of key and value bytes
    pub usage: AtomicUsize,
    /// current record count
    pub entries: AtomicUsize,
}

impl Stats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            insert: self.insert.load(Ordering::Relaxed),
            replace: self.replace.load(Ordering::Relaxed),
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            remove: self.remove.load(Ordering::Relaxed),
            evict: self.evict.load(Ordering::Relaxed),
            reject: self.reject.load(Ordering::Relaxed),
            combine_pass: 0,
            combine_op: 0,
            slot_unlink: 0,
            usage: self.usage.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsSnapshot {
    /// See [`Stats::insert`].
    pub insert: u64,
    /// See [`Stats::replace`].
    pub replace: u64,
    /// See [`Stats::hit`].
    pub hit: u64,
    /// See [`Stats::miss`].
    pub miss: u64,
    /// See [`Stats::remove`].
    pub remove: u64,
    /// See [`Stats::evict`].
    pub evict: u64,
    /// See [`Stats::reject`].
    pub reject: u64,
    /// Combine passes executed, zero for the global lock backend.
    pub combine_pass: u64,
    /// Operations applied by combine passes.
    pub combine_op: u64,
    /// Pending operation slots unlinked from the combine queue.
    pub slot_unlink: u64,
    /// See [`Stats::usage`].
    pub usage: usize,
    /// See [`Stats::entries`].
    pub entries: usize,
}

impl StatsSnapshot {
    /// Average number of operations applied per combine pass.
    pub fn avg_batch(&self) -> f64 {
        if self.combine_pass == 0 {
            return 0.0;
        }
        self.combine_op as f64 / self.combine_pass as f64
    }
}
