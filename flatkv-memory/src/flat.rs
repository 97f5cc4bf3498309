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

use std::{fmt::Debug, hash::BuildHasher, sync::Arc};

use ahash::RandomState;
use flatkv_common::storage::Storage;

use crate::{
    combiner::FlatCombiner,
    resolver::{Op, OpKind},
    state::LruState,
    stats::{Stats, StatsSnapshot},
};

/// LRU cache whose operations are applied in batches by a [`FlatCombiner`].
pub struct FlatCombineCache<S = RandomState>
where
    S: BuildHasher + Send + 'static,
{
    combiner: FlatCombiner<LruState<S>>,
    hash_builder: S,
    capacity: usize,
    stats: Arc<Stats>,
}

impl<S> Debug for FlatCombineCache<S>
where
    S: BuildHasher + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatCombineCache")
            .field("capacity", &self.capacity)
            .field("max_batch", &self.combiner.max_batch())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<S> FlatCombineCache<S>
where
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` bytes of keys and values.
    ///
    /// # Panics
    ///
    /// Panics if `max_batch` is zero. Use [`crate::CacheBuilder`] for a checked constructor.
    pub fn new(capacity: usize, max_batch: usize, hash_builder: S) -> Self {
        let stats = Arc::<Stats>::default();
        let state = LruState::new(capacity, hash_builder.clone(), stats.clone());
        Self {
            combiner: FlatCombiner::new(state, max_batch),
            hash_builder,
            capacity,
            stats,
        }
    }

    fn submit(&self, kind: OpKind, key: &[u8], value: &[u8]) -> Op {
        let hash = self.hash_builder.hash_one(key);
        self.combiner
            .submit(Op::new(kind, hash, key.to_vec(), value.to_vec()))
    }

    /// Release the calling thread's pending operation slot.
    ///
    /// Threads release their slots on exit anyway. Long-lived threads that stop using the cache may call this to
    /// give the slot back earlier.
    pub fn detach(&self) {
        self.combiner.detach();
    }

    /// Capacity in bytes of keys and values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of keys and values stored, as of the last completed mutation.
    pub fn usage(&self) -> usize {
        self.stats.usage.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of records, as of the last completed mutation.
    pub fn len(&self) -> usize {
        self.stats.entries.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum operations applied per combine pass.
    pub fn max_batch(&self) -> usize {
        self.combiner.max_batch()
    }

    /// Counters of the cache.
    pub fn stats(&self) -> StatsSnapshot {
        let (combine_pass, combine_op, slot_unlink) = self.combiner.counters();
        StatsSnapshot {
            combine_pass,
            combine_op,
            slot_unlink,
            ..self.stats.snapshot()
        }
    }

    /// Run `f` with exclusive access to the cache state, between combine passes.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LruState<S>) -> R) -> R {
        self.combiner.exclusive(f)
    }
}

impl<S> Storage for FlatCombineCache<S>
where
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.submit(OpKind::Put, key, value).result
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.submit(OpKind::PutIfAbsent, key, value).result
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.submit(OpKind::Set, key, value).result
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.submit(OpKind::Delete, key, &[]).result
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let op = self.submit(OpKind::Get, key, &[]);
        op.result.then_some(op.value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::combiner::DEFAULT_MAX_BATCH;

    fn cache(capacity: usize) -> FlatCombineCache {
        FlatCombineCache::new(capacity, DEFAULT_MAX_BATCH, RandomState::default())
    }

    #[test]
    fn test_basic() {
        let cache = cache(1024);
        assert!(cache.put(b"k", b"v1"));
        assert_eq!(cache.get(b"k").unwrap(), b"v1");
        assert!(cache.set(b"k", b"v2"));
        assert!(!cache.put_if_absent(b"k", b"v3"));
        assert_eq!(cache.get(b"k").unwrap(), b"v2");
        assert!(cache.delete(b"k"));
        assert!(cache.get(b"k").is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.combine_op, 7);
        assert_eq!(stats.hit, 2);
        assert_eq!(stats.miss, 1);
    }

    #[test_log::test]
    fn test_concurrent_random_ops_keep_invariants() {
        const THREADS: usize = 8;
        const OPS: usize = 5000;

        let cache = Arc::new(cache(256));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles = (0..THREADS)
            .map(|t| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    barrier.wait();
                    for _ in 0..OPS {
                        let key = format!("key-{}", rng.random_range(0..64));
                        let value = vec![b'x'; rng.random_range(0..16)];
                        match rng.random_range(0..5) {
                            0 => {
                                cache.put(key.as_bytes(), &value);
                            }
                            1 => {
                                cache.put_if_absent(key.as_bytes(), &value);
                            }
                            2 => {
                                cache.set(key.as_bytes(), &value);
                            }
                            3 => {
                                cache.delete(key.as_bytes());
                            }
                            _ => {
                                if let Some(v) = cache.get(key.as_bytes()) {
                                    assert!(v.iter().all(|b| *b == b'x'));
                                }
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.with_state(|state| state.check());
        assert!(cache.usage() <= 256);
        let stats = cache.stats();
        assert_eq!(stats.combine_op, (THREADS * OPS) as u64);
        tracing::info!("average batch: {:.2}", stats.avg_batch());
    }

    #[test]
    fn test_panic_in_with_state_does_not_wedge() {
        let cache = Arc::new(cache(1024));
        assert!(cache.put(b"k", b"v1"));

        let other = cache.clone();
        let res = std::thread::spawn(move || other.with_state(|_| panic!("invariant check failed"))).join();
        assert!(res.is_err());

        let (tx, rx) = std::sync::mpsc::channel();
        let other = cache.clone();
        std::thread::spawn(move || {
            tx.send(other.put(b"k", b"v2")).unwrap();
        });
        assert!(rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap());
        assert_eq!(cache.get(b"k").unwrap(), b"v2");
    }
}
