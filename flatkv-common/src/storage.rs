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

use std::sync::Arc;

/// Byte-oriented key-value storage consumed by the network transports.
///
/// All outcomes are plain results: a missing key, a conflicting
/// [`Storage::put_if_absent`] or an entry larger than the whole storage capacity are expected and are reported as
/// `false` / `None`, never as an error.
///
/// Implementations must be safe to call concurrently from any number of threads.
pub trait Storage: Send + Sync + 'static {
    /// Insert or overwrite `key` with `value`.
    ///
    /// Returns `false` only if `key.len() + value.len()` exceeds the storage capacity.
    fn put(&self, key: &[u8], value: &[u8]) -> bool;

    /// Insert `key` with `value` only if `key` is absent.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool;

    /// Overwrite the value of an existing `key`.
    ///
    /// Returns `false` if `key` is absent or the new entry would not fit.
    fn set(&self, key: &[u8], value: &[u8]) -> bool;

    /// Remove `key`. Returns `true` if it was present.
    fn delete(&self, key: &[u8]) -> bool;

    /// Fetch a copy of the value of `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.as_ref().put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.as_ref().put_if_absent(key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.as_ref().set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.as_ref().delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.as_ref().get(key)
    }
}
