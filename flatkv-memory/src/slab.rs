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
    num::NonZeroUsize,
    ops::{Index, IndexMut},
};

/// Stable handle of a value stored in a [`Slab`].
///
/// A token stays valid until the value it points to is removed. Using a stale token is a programming error and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroUsize);

impl Token {
    fn new(index: usize) -> Self {
        match NonZeroUsize::new(index.wrapping_add(1)) {
            Some(v) => Self(v),
            None => unreachable!("slab index overflow"),
        }
    }

    /// Position of the value in the slab.
    pub fn index(&self) -> usize {
        self.0.get() - 1
    }
}

#[derive(Debug)]
enum Entry<T> {
    Vacant(usize),
    Occupied(T),
}

/// Vector-backed arena with free-list reuse of vacant positions.
#[derive(Debug)]
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    len: usize,
    next: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            len: 0,
            next: 0,
        }
    }

    pub fn insert(&mut self, val: T) -> Token {
        let index = self.next;
        self.len += 1;

        if index == self.entries.len() {
            self.entries.push(Entry::Occupied(val));
            self.next = index + 1;
        } else {
            self.next = match self.entries[index] {
                Entry::Vacant(next) => next,
                Entry::Occupied(_) => unreachable!("slab free list points to an occupied entry"),
            };
            self.entries[index] = Entry::Occupied(val);
        }

        Token::new(index)
    }

    /// Remove the value of `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not point to an occupied entry.
    pub fn remove(&mut self, token: Token) -> T {
        let index = token.index();
        let entry = match self.entries.get_mut(index) {
            Some(entry) if matches!(entry, Entry::Occupied(_)) => entry,
            _ => panic!("remove with an invalid slab token: {token:?}"),
        };

        match std::mem::replace(entry, Entry::Vacant(self.next)) {
            Entry::Occupied(val) => {
                self.len -= 1;
                self.next = index;
                val
            }
            Entry::Vacant(_) => unreachable!(),
        }
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        match self.entries.get(token.index()) {
            Some(Entry::Occupied(val)) => Some(val),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        match self.entries.get_mut(token.index()) {
            Some(Entry::Occupied(val)) => Some(val),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
        self.next = 0;
    }
}

impl<T> Index<Token> for Slab<T> {
    type Output = T;

    fn index(&self, token: Token) -> &Self::Output {
        match self.get(token) {
            Some(val) => val,
            None => panic!("access with an invalid slab token: {token:?}"),
        }
    }
}

impl<T> IndexMut<Token> for Slab<T> {
    fn index_mut(&mut self, token: Token) -> &mut Self::Output {
        match self.get_mut(token) {
            Some(val) => val,
            None => panic!("access with an invalid slab token: {token:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_reuse_vacant() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        let c = slab.insert("c");
        assert_eq!(slab.len(), 3);

        assert_eq!(slab.remove(b), "b");
        assert!(slab.get(b).is_none());
        assert_eq!(slab.len(), 2);

        // The freed position is handed out again before the slab grows.
        let d = slab.insert("d");
        assert_eq!(d.index(), b.index());
        assert_eq!(slab[a], "a");
        assert_eq!(slab[c], "c");
        assert_eq!(slab[d], "d");

        assert_eq!(slab.remove(a), "a");
        assert_eq!(slab.remove(c), "c");
        let e = slab.insert("e");
        let f = slab.insert("f");
        assert_eq!(e.index(), c.index());
        assert_eq!(f.index(), a.index());
        assert_eq!(slab.len(), 3);
    }

    #[test]
    #[should_panic]
    fn test_slab_double_remove() {
        let mut slab = Slab::new();
        let a = slab.insert(1u64);
        slab.remove(a);
        slab.remove(a);
    }

    #[test]
    fn test_option_token_niche() {
        assert_eq!(std::mem::size_of::<Option<Token>>(), std::mem::size_of::<Token>());
    }
}
