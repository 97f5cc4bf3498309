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
    hash::BuildHasher,
    sync::{atomic::Ordering, Arc},
};

use flatkv_common::{strict_assert, strict_assert_eq};

use crate::{indexer::Indexer, list::LruList, record::Record, slab::Token, stats::Stats};

/// Capacity-bounded LRU key-value state.
///
/// Every record lives in the recency list and in the index exactly once. `usage()` is the sum of the sizes of all
/// records and never exceeds `capacity()` once a public method returns.
///
/// [`LruState`] performs no synchronization. Both cache backends wrap it: [`crate::GlobalLockCache`] behind a mutex
/// and [`crate::FlatCombineCache`] behind the flat combiner.
pub struct LruState<S> {
    list: LruList<Record>,
    indexer: Indexer,

    usage: usize,
    capacity: usize,

    hash_builder: S,
    stats: Arc<Stats>,
}

impl<S> LruState<S>
where
    S: BuildHasher,
{
    /// Create an empty state holding at most `capacity` bytes of keys and values.
    pub fn new(capacity: usize, hash_builder: S, stats: Arc<Stats>) -> Self {
        Self {
            list: LruList::new(),
            indexer: Indexer::default(),
            usage: 0,
            capacity,
            hash_builder,
            stats,
        }
    }

    /// Hash `key` with the state's hash builder.
    pub fn hash(&self, key: &[u8]) -> u64 {
        self.hash_builder.hash_one(key)
    }

    /// Bytes of keys and values currently stored.
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Maximum bytes of keys and values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters shared with the owning cache.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether there are no records.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Check whether an entry of the given sizes could ever be stored. Counts a rejection if not.
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        let fits = key_len.saturating_add(value_len) <= self.capacity;
        if !fits {
            Stats::incr(&self.stats.reject);
        }
        fits
    }

    /// Find the record of `key`.
    pub fn lookup(&self, hash: u64, key: &[u8]) -> Option<Token> {
        self.indexer.get(hash, key, &self.list)
    }

    /// Value of a present record.
    pub fn value(&self, token: Token) -> &[u8] {
        self.record(token).value()
    }

    /// Insert an absent key as the most recently used record, then trim.
    pub fn insert(&mut self, hash: u64, key: Box<[u8]>, value: Vec<u8>) -> Token {
        strict_assert!(self.lookup(hash, &key).is_none());

        let record = Record::new(hash, key, value);
        let size = record.size();
        let token = self.list.push_front(record);
        self.indexer.insert(hash, token);
        self.usage += size;
        Stats::incr(&self.stats.insert);

        self.trim();
        strict_assert!(self.list.get(token).is_some());
        token
    }

    /// Replace the value of a present record, promote it, then trim.
    pub fn update(&mut self, token: Token, value: Vec<u8>) {
        let record = self.record_mut(token);
        let old = record.size();
        record.replace(value);
        let new = record.size();
        self.usage = self.usage - old + new;
        self.list.move_to_front(token);
        Stats::incr(&self.stats.replace);

        self.trim();
        strict_assert!(self.list.get(token).is_some());
    }

    /// Promote a record to the most recently used position.
    pub fn touch(&mut self, token: Token) {
        self.list.move_to_front(token);
    }

    /// Remove a record from both the list and the index.
    pub fn remove(&mut self, token: Token) -> Record {
        let record = self.list.remove(token);
        if !self.indexer.remove(record.hash(), token) {
            panic!("record {record:?} is linked in the lru list but missing from the index");
        }
        self.usage -= record.size();
        record
    }

    /// Evict least recently used records until the usage fits the capacity.
    pub fn trim(&mut self) {
        while self.usage > self.capacity {
            let victim = match self.list.tail() {
                Some(victim) => victim,
                None => unreachable!("usage {} with an empty lru list", self.usage),
            };
            let record = self.remove(victim);
            Stats::incr(&self.stats.evict);
            tracing::trace!("[lru]: evict record (hash: {}, size: {})", record.hash(), record.size());
        }
        self.publish();
    }

    /// Insert or overwrite.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if !self.fits(key.len(), value.len()) {
            return false;
        }
        let hash = self.hash(key);
        match self.lookup(hash, key) {
            Some(token) => self.update(token, value.to_vec()),
            None => {
                self.insert(hash, key.into(), value.to_vec());
            }
        }
        true
    }

    /// Insert only if `key` is absent.
    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
        if !self.fits(key.len(), value.len()) {
            return false;
        }
        let hash = self.hash(key);
        if self.lookup(hash, key).is_some() {
            return false;
        }
        self.insert(hash, key.into(), value.to_vec());
        true
    }

    /// Overwrite only if `key` is present.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        if !self.fits(key.len(), value.len()) {
            return false;
        }
        let hash = self.hash(key);
        match self.lookup(hash, key) {
            Some(token) => {
                self.update(token, value.to_vec());
                true
            }
            None => false,
        }
    }

    /// Remove `key`, returns `true` if it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let hash = self.hash(key);
        match self.lookup(hash, key) {
            Some(token) => {
                self.remove(token);
                Stats::incr(&self.stats.remove);
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Copy the value of `key` and promote it.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = self.hash(key);
        match self.lookup(hash, key) {
            Some(token) => {
                self.touch(token);
                Stats::incr(&self.stats.hit);
                Some(self.value(token).to_vec())
            }
            None => {
                Stats::incr(&self.stats.miss);
                None
            }
        }
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.list.clear();
        self.indexer.clear();
        self.usage = 0;
        self.publish();
    }

    /// Keys from the most recently used to the least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.list.iter().map(|(_, record)| record.key())
    }

    /// Verify the list, the index and the usage agree with each other.
    ///
    /// # Panics
    ///
    /// Panics on any disagreement.
    pub fn check(&self) {
        assert_eq!(self.list.len(), self.indexer.len());
        let mut usage = 0;
        for (token, record) in self.list.iter() {
            assert_eq!(self.lookup(record.hash(), record.key()), Some(token));
            usage += record.size();
        }
        assert_eq!(usage, self.usage);
        assert!(self.usage <= self.capacity);
    }

    /// Refresh the usage gauges readable without exclusive access.
    pub(crate) fn publish(&self) {
        strict_assert_eq!(self.list.len(), self.indexer.len());
        self.stats.usage.store(self.usage, Ordering::Relaxed);
        self.stats.entries.store(self.list.len(), Ordering::Relaxed);
    }

    fn record(&self, token: Token) -> &Record {
        match self.list.get(token) {
            Some(record) => record,
            None => panic!("index points to a missing lru record: {token:?}"),
        }
    }

    fn record_mut(&mut self, token: Token) -> &mut Record {
        match self.list.get_mut(token) {
            Some(record) => record,
            None => panic!("index points to a missing lru record: {token:?}"),
        }
    }
}
