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

//! A bounded in-memory LRU key-value cache synchronized by flat combining.
//!
//! Concurrent callers publish their operations in per-thread slots. One elected thread applies a whole batch of
//! them at once, resolving operations that collide on a key by a fixed kind priority. A mutex-based backend with the
//! same interface is provided for comparison.
//!
//! ```
//! use flatkv_memory::prelude::*;
//!
//! let cache = CacheBuilder::new(1024).build().unwrap();
//! assert!(cache.put(b"key", b"value"));
//! assert_eq!(cache.get(b"key").unwrap(), b"value");
//! ```

mod cache;
mod combiner;
mod error;
mod flat;
mod indexer;
mod list;
mod locked;
mod record;
mod resolver;
mod slab;
mod state;
mod stats;

pub use crate::{
    cache::{Backend, Cache, CacheBuilder, DEFAULT_CAPACITY},
    combiner::{Combine, FlatCombiner, DEFAULT_MAX_BATCH},
    error::{Error, Result},
    flat::FlatCombineCache,
    locked::GlobalLockCache,
    record::Record,
    resolver::{Op, OpKind},
    slab::Token,
    state::LruState,
    stats::{Stats, StatsSnapshot},
};

/// Commonly used types and the [`Storage`](flatkv_common::storage::Storage) trait.
pub mod prelude;
