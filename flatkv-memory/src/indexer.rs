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

use hashbrown::hash_table::{Entry as HashTableEntry, HashTable};

use crate::{list::LruList, record::Record, slab::Token};

/// Key index over the records of an [`LruList`].
///
/// The table stores only the precomputed hash and the list token of each record. Key comparison goes through the
/// list, so the index never holds a second copy of a key.
#[derive(Debug, Default)]
pub struct Indexer {
    table: HashTable<(u64, Token)>,
}

impl Indexer {
    pub fn get(&self, hash: u64, key: &[u8], list: &LruList<Record>) -> Option<Token> {
        self.table
            .find(hash, |&(h, token)| h == hash && list.get(token).is_some_and(|r| r.key() == key))
            .map(|&(_, token)| token)
    }

    /// Index `token` under `hash`.
    ///
    /// The caller guarantees the key is not indexed yet.
    pub fn insert(&mut self, hash: u64, token: Token) {
        self.table.insert_unique(hash, (hash, token), |&(h, _)| h);
    }

    /// Drop the index entry of `token`. Returns `false` if it was not indexed.
    pub fn remove(&mut self, hash: u64, token: Token) -> bool {
        match self.table.entry(hash, |&(_, t)| t == token, |&(h, _)| h) {
            HashTableEntry::Occupied(o) => {
                o.remove();
                true
            }
            HashTableEntry::Vacant(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexer_collision() {
        let mut list = LruList::new();
        let mut indexer = Indexer::default();

        // Two different keys forced onto the same hash.
        let t1 = list.push_front(Record::new(42, b"k1".to_vec().into(), b"v1".to_vec()));
        let t2 = list.push_front(Record::new(42, b"k2".to_vec().into(), b"v2".to_vec()));
        indexer.insert(42, t1);
        indexer.insert(42, t2);
        assert_eq!(indexer.len(), 2);

        assert_eq!(indexer.get(42, b"k1", &list), Some(t1));
        assert_eq!(indexer.get(42, b"k2", &list), Some(t2));
        assert_eq!(indexer.get(42, b"k3", &list), None);
        assert_eq!(indexer.get(7, b"k1", &list), None);

        assert!(indexer.remove(42, t1));
        assert!(!indexer.remove(42, t1));
        assert_eq!(indexer.get(42, b"k1", &list), None);
        assert_eq!(indexer.get(42, b"k2", &list), Some(t2));
    }
}
