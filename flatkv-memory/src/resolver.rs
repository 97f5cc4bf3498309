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

//! Per-key batch resolution for the flat-combining backend.
//!
//! A batch is sorted by `(hash, key, priority)` and applied one key group at a time. Within a group the kinds are
//! resolved in the fixed order Delete, Put, PutIfAbsent, Set, Get. Each kind takes effect at most once per group and
//! later kinds observe the effects of earlier ones. The results of a group always match some sequential ordering of
//! its operations:
//!
//! - Delete removes the key if it was present and reports whether it did.
//! - The first fitting Put stores its value. Further Puts report success and are ordered before it.
//! - PutIfAbsent inserts only if the key was absent at batch start and nothing inserted it earlier in the group.
//! - Set updates only if the key was present at batch start and no Delete ran. Further Sets are ordered before it.
//! - Get reads the state left by everything above.

use std::hash::BuildHasher;

use bitflags::bitflags;
use flatkv_common::strict_assert;

use crate::{combiner::Combine, slab::Token, state::LruState, stats::Stats};

/// Kind of a pending cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Remove a key.
    Delete,
    /// Insert or overwrite.
    Put,
    /// Insert only if absent.
    PutIfAbsent,
    /// Overwrite only if present.
    Set,
    /// Read a key.
    Get,
}

impl OpKind {
    /// Resolution order inside a key group, lower first.
    pub const fn priority(self) -> u8 {
        match self {
            OpKind::Delete => 0,
            OpKind::Put => 1,
            OpKind::PutIfAbsent => 2,
            OpKind::Set => 3,
            OpKind::Get => 4,
        }
    }
}

/// A pending cache operation and its result.
///
/// For [`OpKind::Get`] a successful resolution leaves the read value in `value`. Insertions may move `key` and
/// `value` into the cache, so only `result` (and `value` for gets) is meaningful after resolution.
#[derive(Debug)]
pub struct Op {
    /// Operation kind.
    pub kind: OpKind,
    /// Key hash, computed by the submitting thread.
    pub hash: u64,
    /// Key.
    pub key: Vec<u8>,
    /// Value to write, or the value read.
    pub value: Vec<u8>,
    /// Outcome.
    pub result: bool,
}

impl Op {
    /// Create an unresolved operation.
    pub fn new(kind: OpKind, hash: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind,
            hash,
            key,
            value,
            result: false,
        }
    }
}

bitflags! {
    /// Kinds whose effect already happened in the current key group.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    struct Applied: u8 {
        const DELETE = 0b0001;
        const PUT = 0b0010;
        const PUT_IF_ABSENT = 0b0100;
        const SET = 0b1000;
    }
}

/// Per-key resolution state for one group.
#[derive(Debug)]
struct KeyContext {
    /// The key was present before the group was applied.
    existed: bool,
    /// Current location of the record, if present.
    token: Option<Token>,
    applied: Applied,
}

impl<S> Combine for LruState<S>
where
    S: BuildHasher + Send + 'static,
{
    type Op = Op;

    fn combine(&mut self, batch: &mut [&mut Op]) {
        batch.sort_unstable_by(|a, b| {
            (a.hash, &a.key, a.kind.priority()).cmp(&(b.hash, &b.key, b.kind.priority()))
        });

        for group in batch.chunk_by_mut(|a, b| a.hash == b.hash && a.key == b.key) {
            self.resolve(group);
        }

        self.publish();
    }
}

impl<S> LruState<S>
where
    S: BuildHasher,
{
    /// Resolve a priority-sorted group of operations on the same key.
    fn resolve(&mut self, group: &mut [&mut Op]) {
        let token = self.lookup(group[0].hash, &group[0].key);
        let mut ctx = KeyContext {
            existed: token.is_some(),
            token,
            applied: Applied::empty(),
        };

        for op in group.iter_mut() {
            op.result = match op.kind {
                OpKind::Delete => self.resolve_delete(&mut ctx),
                OpKind::Put => self.resolve_put(&mut ctx, op),
                OpKind::PutIfAbsent => self.resolve_put_if_absent(&mut ctx, op),
                OpKind::Set => self.resolve_set(&mut ctx, op),
                OpKind::Get => self.resolve_get(&ctx, op),
            };
        }
    }

    fn resolve_delete(&mut self, ctx: &mut KeyContext) -> bool {
        if ctx.applied.contains(Applied::DELETE) {
            return false;
        }
        ctx.applied |= Applied::DELETE;
        match ctx.token.take() {
            Some(token) => {
                self.remove(token);
                Stats::incr(&self.stats().remove);
                true
            }
            None => false,
        }
    }

    fn resolve_put(&mut self, ctx: &mut KeyContext, op: &mut Op) -> bool {
        if !self.fits(op.key.len(), op.value.len()) {
            return false;
        }
        if ctx.applied.contains(Applied::PUT) {
            return true;
        }
        ctx.applied |= Applied::PUT;
        let value = std::mem::take(&mut op.value);
        match ctx.token {
            Some(token) => self.update(token, value),
            None => {
                let key = std::mem::take(&mut op.key).into_boxed_slice();
                ctx.token = Some(self.insert(op.hash, key, value));
            }
        }
        true
    }

    fn resolve_put_if_absent(&mut self, ctx: &mut KeyContext, op: &mut Op) -> bool {
        if !self.fits(op.key.len(), op.value.len()) || ctx.existed || ctx.token.is_some() {
            return false;
        }
        // A successful insert leaves the key present, so no second one can pass the check above.
        strict_assert!(!ctx.applied.contains(Applied::PUT_IF_ABSENT));
        ctx.applied |= Applied::PUT_IF_ABSENT;
        let key = std::mem::take(&mut op.key).into_boxed_slice();
        let value = std::mem::take(&mut op.value);
        ctx.token = Some(self.insert(op.hash, key, value));
        true
    }

    fn resolve_set(&mut self, ctx: &mut KeyContext, op: &mut Op) -> bool {
        if !self.fits(op.key.len(), op.value.len())
            || !ctx.existed
            || ctx.applied.contains(Applied::DELETE)
        {
            return false;
        }
        if ctx.applied.contains(Applied::SET) {
            return true;
        }
        ctx.applied |= Applied::SET;
        let Some(token) = ctx.token else {
            unreachable!("key present at batch start and not deleted, but not indexed");
        };
        self.update(token, std::mem::take(&mut op.value));
        true
    }

    fn resolve_get(&mut self, ctx: &KeyContext, op: &mut Op) -> bool {
        match ctx.token {
            Some(token) => {
                self.touch(token);
                op.value.clear();
                op.value.extend_from_slice(self.value(token));
                Stats::incr(&self.stats().hit);
                true
            }
            None => {
                op.value.clear();
                Stats::incr(&self.stats().miss);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ahash::RandomState;

    use super::*;

    struct Batch {
        state: LruState<RandomState>,
    }

    impl Batch {
        fn new(capacity: usize) -> Self {
            Self {
                state: LruState::new(capacity, RandomState::default(), Arc::default()),
            }
        }

        fn op(&self, kind: OpKind, key: &str, value: &str) -> Op {
            Op::new(
                kind,
                self.state.hash(key.as_bytes()),
                key.as_bytes().to_vec(),
                value.as_bytes().to_vec(),
            )
        }

        /// Resolve `ops` as one batch and return them in submission order.
        fn run(&mut self, mut ops: Vec<Op>) -> Vec<Op> {
            let mut batch = ops.iter_mut().collect::<Vec<_>>();
            self.state.combine(&mut batch);
            drop(batch);
            self.state.check();
            ops
        }

        fn get(&mut self, key: &str) -> Option<String> {
            self.state
                .get(key.as_bytes())
                .map(|v| String::from_utf8(v).unwrap())
        }
    }

    fn results(ops: &[Op]) -> Vec<bool> {
        ops.iter().map(|op| op.result).collect()
    }

    #[test]
    fn test_priority_order() {
        assert!(OpKind::Delete.priority() < OpKind::Put.priority());
        assert!(OpKind::Put.priority() < OpKind::PutIfAbsent.priority());
        assert!(OpKind::PutIfAbsent.priority() < OpKind::Set.priority());
        assert!(OpKind::Set.priority() < OpKind::Get.priority());
    }

    #[test]
    fn test_distinct_keys() {
        let mut b = Batch::new(1024);
        let ops = vec![
            b.op(OpKind::Put, "a", "1"),
            b.op(OpKind::PutIfAbsent, "b", "2"),
            b.op(OpKind::Set, "c", "3"),
            b.op(OpKind::Delete, "d", ""),
            b.op(OpKind::Get, "e", ""),
        ];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![true, true, false, false, false]);
        assert_eq!(b.get("a").as_deref(), Some("1"));
        assert_eq!(b.get("b").as_deref(), Some("2"));
        assert!(b.get("c").is_none());
    }

    #[test]
    fn test_delete_then_put_wins() {
        let mut b = Batch::new(1024);
        assert!(b.state.put(b"k", b"old"));

        // Submission order does not matter, kinds are resolved by priority.
        let ops = vec![
            b.op(OpKind::Get, "k", ""),
            b.op(OpKind::Put, "k", "new"),
            b.op(OpKind::Delete, "k", ""),
        ];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![true, true, true]);
        assert_eq!(ops[0].value, b"new");
        assert_eq!(b.get("k").as_deref(), Some("new"));
    }

    #[test]
    fn test_deletes_apply_once() {
        let mut b = Batch::new(1024);
        assert!(b.state.put(b"k", b"v"));
        let ops = vec![b.op(OpKind::Delete, "k", ""), b.op(OpKind::Delete, "k", "")];
        let ops = b.run(ops);
        assert_eq!(results(&ops).iter().filter(|r| **r).count(), 1);
        assert!(b.state.is_empty());
    }

    #[test]
    fn test_put_if_absent_conflicts() {
        let mut b = Batch::new(1024);

        // Only one of several inserts of an absent key succeeds.
        let ops = vec![
            b.op(OpKind::PutIfAbsent, "k", "1"),
            b.op(OpKind::PutIfAbsent, "k", "2"),
            b.op(OpKind::Get, "k", ""),
        ];
        let ops = b.run(ops);
        assert_eq!(results(&ops).iter().filter(|r| **r).count(), 2);
        let winner = if ops[0].result { "1" } else { "2" };
        assert_eq!(ops[2].value, winner.as_bytes());

        // A put in the same batch goes first and takes the key.
        let ops = vec![b.op(OpKind::PutIfAbsent, "x", "1"), b.op(OpKind::Put, "x", "2")];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![false, true]);
        assert_eq!(b.get("x").as_deref(), Some("2"));

        // So does a delete, but the key existed at batch start.
        let ops = vec![b.op(OpKind::PutIfAbsent, "x", "3"), b.op(OpKind::Delete, "x", "")];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![false, true]);
        assert!(b.get("x").is_none());
    }

    #[test]
    fn test_set_conflicts() {
        let mut b = Batch::new(1024);

        // Absent at batch start: the put inserts, the set fails.
        let ops = vec![b.op(OpKind::Set, "k", "s"), b.op(OpKind::Put, "k", "p")];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![false, true]);
        assert_eq!(b.get("k").as_deref(), Some("p"));

        // Present at batch start: the set lands after the put.
        let ops = vec![b.op(OpKind::Set, "k", "s"), b.op(OpKind::Put, "k", "p2")];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![true, true]);
        assert_eq!(b.get("k").as_deref(), Some("s"));

        // A delete beats the set.
        let ops = vec![b.op(OpKind::Set, "k", "s2"), b.op(OpKind::Delete, "k", "")];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![false, true]);
        assert!(b.get("k").is_none());
    }

    #[test]
    fn test_repeated_writes_absorbed() {
        let mut b = Batch::new(1024);
        assert!(b.state.put(b"k", b"v"));
        let ops = vec![
            b.op(OpKind::Put, "k", "p1"),
            b.op(OpKind::Put, "k", "p2"),
            b.op(OpKind::Set, "k", "s1"),
            b.op(OpKind::Set, "k", "s2"),
        ];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![true, true, true, true]);
        let value = b.get("k").unwrap();
        assert!(value == "s1" || value == "s2");
        assert_eq!(b.state.len(), 1);
    }

    #[test]
    fn test_oversized_rejected_in_batch() {
        let mut b = Batch::new(4);
        let ops = vec![
            b.op(OpKind::Put, "key", "vv"),
            b.op(OpKind::PutIfAbsent, "key", "vv"),
            b.op(OpKind::Put, "k", "v"),
        ];
        let ops = b.run(ops);
        assert_eq!(results(&ops), vec![false, false, true]);
        assert_eq!(b.state.len(), 1);
    }

    #[test]
    fn test_batch_eviction_keeps_capacity() {
        // Room for two 2-byte records.
        let mut b = Batch::new(4);
        let ops = vec![
            b.op(OpKind::Put, "a", "1"),
            b.op(OpKind::Put, "b", "2"),
            b.op(OpKind::Put, "c", "3"),
            b.op(OpKind::Get, "a", ""),
        ];
        let ops = b.run(ops);
        assert!(ops[..3].iter().all(|op| op.result));
        assert_eq!(b.state.len(), 2);
        assert!(b.state.usage() <= 4);
    }
}
