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

use std::{fmt::Display, hash::BuildHasher, str::FromStr, sync::Arc};

use ahash::RandomState;
use flatkv_common::storage::Storage;

use crate::{
    combiner::DEFAULT_MAX_BATCH,
    error::{Error, Result},
    flat::FlatCombineCache,
    locked::GlobalLockCache,
    stats::StatsSnapshot,
};

/// Default cache capacity in bytes of keys and values.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Synchronization strategy of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Backend {
    /// Batch operations with a flat combiner.
    #[default]
    FlatCombine,
    /// Serialize operations with one mutex.
    GlobalLock,
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::FlatCombine => write!(f, "flat_combine"),
            Backend::GlobalLock => write!(f, "global_lock"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "flat_combine" | "flat" => Ok(Backend::FlatCombine),
            "global_lock" | "lock" => Ok(Backend::GlobalLock),
            _ => Err(Error::ConfigError(format!("unknown backend: {s}"))),
        }
    }
}

/// Builder of a [`Cache`].
#[derive(Debug)]
pub struct CacheBuilder<S = RandomState> {
    capacity: usize,
    backend: Backend,
    max_batch: usize,
    hash_builder: S,
}

impl CacheBuilder {
    /// Create a builder of a cache holding at most `capacity` bytes of keys and values.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            backend: Backend::default(),
            max_batch: DEFAULT_MAX_BATCH,
            hash_builder: RandomState::default(),
        }
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<S> CacheBuilder<S>
where
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Set the synchronization backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the maximum number of operations per combine pass. Ignored by the global lock backend.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Set the key hasher.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> CacheBuilder<OS>
    where
        OS: BuildHasher + Clone + Send + Sync + 'static,
    {
        CacheBuilder {
            capacity: self.capacity,
            backend: self.backend,
            max_batch: self.max_batch,
            hash_builder,
        }
    }

    /// Build the cache.
    pub fn build(self) -> Result<Cache<S>> {
        if self.max_batch == 0 {
            return Err(Error::ConfigError("max batch must be positive".to_string()));
        }

        tracing::debug!(
            "[cache]: build {} cache, capacity: {}, max batch: {}",
            self.backend,
            self.capacity,
            self.max_batch
        );

        let cache = match self.backend {
            Backend::FlatCombine => Cache::FlatCombine(Arc::new(FlatCombineCache::new(
                self.capacity,
                self.max_batch,
                self.hash_builder,
            ))),
            Backend::GlobalLock => Cache::GlobalLock(Arc::new(GlobalLockCache::new(self.capacity, self.hash_builder))),
        };
        Ok(cache)
    }
}

/// In-memory LRU cache with a selectable synchronization backend.
#[derive(Debug)]
pub enum Cache<S = RandomState>
where
    S: BuildHasher + Send + 'static,
{
    /// Flat-combining cache.
    FlatCombine(Arc<FlatCombineCache<S>>),
    /// Global lock cache.
    GlobalLock(Arc<GlobalLockCache<S>>),
}

impl<S> Clone for Cache<S>
where
    S: BuildHasher + Send + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::FlatCombine(cache) => Self::FlatCombine(cache.clone()),
            Self::GlobalLock(cache) => Self::GlobalLock(cache.clone()),
        }
    }
}

impl<S> Cache<S>
where
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Backend of the cache.
    pub fn backend(&self) -> Backend {
        match self {
            Cache::FlatCombine(_) => Backend::FlatCombine,
            Cache::GlobalLock(_) => Backend::GlobalLock,
        }
    }

    /// Capacity in bytes of keys and values.
    pub fn capacity(&self) -> usize {
        match self {
            Cache::FlatCombine(cache) => cache.capacity(),
            Cache::GlobalLock(cache) => cache.capacity(),
        }
    }

    /// Bytes of keys and values currently stored, as of the last completed mutation.
    pub fn usage(&self) -> usize {
        match self {
            Cache::FlatCombine(cache) => cache.usage(),
            Cache::GlobalLock(cache) => cache.usage(),
        }
    }

    /// Number of records, as of the last completed mutation.
    pub fn len(&self) -> usize {
        match self {
            Cache::FlatCombine(cache) => cache.len(),
            Cache::GlobalLock(cache) => cache.len(),
        }
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters of the cache.
    pub fn stats(&self) -> StatsSnapshot {
        match self {
            Cache::FlatCombine(cache) => cache.stats(),
            Cache::GlobalLock(cache) => cache.stats(),
        }
    }

    /// Drop every record.
    pub fn clear(&self) {
        match self {
            Cache::FlatCombine(cache) => cache.with_state(|state| state.clear()),
            Cache::GlobalLock(cache) => cache.with_state(|state| state.clear()),
        }
    }

    /// Release the calling thread's resources held by the cache, if any.
    pub fn detach(&self) {
        if let Cache::FlatCombine(cache) = self {
            cache.detach();
        }
    }

    /// Verify the internal invariants of the cache.
    ///
    /// # Panics
    ///
    /// Panics if the recency list, the index and the usage disagree, or if the usage exceeds the capacity.
    pub fn check(&self) {
        match self {
            Cache::FlatCombine(cache) => cache.with_state(|state| state.check()),
            Cache::GlobalLock(cache) => cache.with_state(|state| state.check()),
        }
    }
}

impl<S> Storage for Cache<S>
where
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        match self {
            Cache::FlatCombine(cache) => cache.put(key, value),
            Cache::GlobalLock(cache) => cache.put(key, value),
        }
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        match self {
            Cache::FlatCombine(cache) => cache.put_if_absent(key, value),
            Cache::GlobalLock(cache) => cache.put_if_absent(key, value),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        match self {
            Cache::FlatCombine(cache) => cache.set(key, value),
            Cache::GlobalLock(cache) => cache.set(key, value),
        }
    }

    fn delete(&self, key: &[u8]) -> bool {
        match self {
            Cache::FlatCombine(cache) => cache.delete(key),
            Cache::GlobalLock(cache) => cache.delete(key),
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            Cache::FlatCombine(cache) => cache.get(key),
            Cache::GlobalLock(cache) => cache.get(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build() {
        let cache = CacheBuilder::default().build().unwrap();
        assert_eq!(cache.backend(), Backend::FlatCombine);
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);

        let cache = CacheBuilder::new(16)
            .with_backend(Backend::GlobalLock)
            .with_hash_builder(std::hash::RandomState::new())
            .build()
            .unwrap();
        assert_eq!(cache.backend(), Backend::GlobalLock);
        assert!(cache.put(b"k", b"v"));
        assert_eq!(cache.len(), 1);
        cache.check();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(b"k").is_none());
    }

    #[test]
    fn test_zero_max_batch() {
        let res = CacheBuilder::new(16).with_max_batch(0).build();
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("flat-combine".parse::<Backend>().unwrap(), Backend::FlatCombine);
        assert_eq!("GLOBAL_LOCK".parse::<Backend>().unwrap(), Backend::GlobalLock);
        assert!("mutex".parse::<Backend>().is_err());
        assert_eq!(Backend::GlobalLock.to_string().parse::<Backend>().unwrap(), Backend::GlobalLock);
    }
}
