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

use std::fmt::Debug;

/// A cached key-value pair.
///
/// The key is immutable for the lifetime of the record, the value may be replaced in place.
pub struct Record {
    key: Box<[u8]>,
    value: Vec<u8>,
    hash: u64,
}

impl Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("hash", &self.hash)
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.len())
            .finish()
    }
}

impl Record {
    /// Create a record of `key` with the precomputed `hash`.
    pub fn new(hash: u64, key: Box<[u8]>, value: Vec<u8>) -> Self {
        Self { key, value, hash }
    }

    /// Key of the record.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Current value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Hash of the key.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Replace the value and return the old one.
    pub fn replace(&mut self, value: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.value, value)
    }

    /// Bytes charged against the cache capacity.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
