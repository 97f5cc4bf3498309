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

//! Recency-ordered doubly-linked list stored in a [`Slab`].
//!
//! The front is the most recently used value, the back ([`LruList::tail`]) is the eviction victim. Links are slab
//! [`Token`]s instead of pointers, so the list owns every node and a removed node can never be reached again.
//!
//! The list has no internal synchronization. The owner is expected to hold exclusive access, which for the cache is
//! the combine lock or the global mutex.

use crate::slab::{Slab, Token};

#[derive(Debug)]
struct Node<T> {
    val: T,
    prev: Option<Token>,
    next: Option<Token>,
}

/// Doubly-linked list with O(1) push, promotion and removal by token.
#[derive(Debug)]
pub struct LruList<T> {
    slab: Slab<Node<T>>,
    head: Option<Token>,
    tail: Option<Token>,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    pub const fn new() -> Self {
        Self {
            slab: Slab::new(),
            head: None,
            tail: None,
        }
    }

    /// Insert `val` as the most recently used value.
    pub fn push_front(&mut self, val: T) -> Token {
        let token = self.slab.insert(Node {
            val,
            prev: None,
            next: None,
        });
        self.link_front(token);
        token
    }

    /// Promote the value of `token` to the most recently used position.
    pub fn move_to_front(&mut self, token: Token) {
        if self.head == Some(token) {
            return;
        }
        self.unlink(token);
        self.link_front(token);
    }

    /// Unlink and return the value of `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` is not in the list.
    pub fn remove(&mut self, token: Token) -> T {
        self.unlink(token);
        self.slab.remove(token).val
    }

    /// The least recently used value, if any.
    pub fn tail(&self) -> Option<Token> {
        self.tail
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        self.slab.get(token).map(|node| &node.val)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slab.get_mut(token).map(|node| &mut node.val)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn clear(&mut self) {
        self.slab.clear();
        self.head = None;
        self.tail = None;
    }

    /// Iterate from the most recently used value to the least recently used one.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            token: self.head,
        }
    }

    fn link_front(&mut self, token: Token) {
        let old = self.head;
        {
            let node = &mut self.slab[token];
            node.prev = None;
            node.next = old;
        }
        match old {
            Some(old) => self.slab[old].prev = Some(token),
            None => self.tail = Some(token),
        }
        self.head = Some(token);
    }

    fn unlink(&mut self, token: Token) {
        let (prev, next) = {
            let node = &mut self.slab[token];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.slab[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slab[next].prev = prev,
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    token: Option<Token>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Token, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.token?;
        let node = &self.list.slab[token];
        self.token = node.next;
        Some((token, &node.val))
    }
}
