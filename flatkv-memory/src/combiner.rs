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

//! Flat-combining synchronization.
//!
//! Threads publish their pending operation in a per-thread [`Slot`] that is linked into a shared lock-free queue.
//! Whichever thread wins the combine lock becomes the executor: it collects up to `max_batch` pending slots, applies
//! them to the protected state in a single [`Combine::combine`] call, marks them done and garbage-collects slots that
//! have been idle for more than [`STALE_GENERATIONS`] passes. Losers yield and retry until their own slot is done.
//!
//! The election is a busy-wait and is not starvation-free. A pass is bounded by `max_batch`, which bounds the wait.
//!
//! A panic inside [`Combine::combine`] aborts the process. A panic inside [`FlatCombiner::exclusive`] releases the lock.
//!
//! # Slot reclamation
//!
//! A slot has two owners, the thread that submits through it and the queue. Each owner is one bit of
//! [`Owners`]; the owner that clears the last bit frees the slot.
//!
//! - The thread bit is released when the thread exits (the thread-local registry drops its handle) or calls
//!   [`FlatCombiner::detach`].
//! - The queue bit is released when the executor unlinks a stale slot or when the combiner is dropped.
//!
//! Only the executor unlinks, and it never unlinks the first slot it observes, because concurrent submitters only
//! ever compare-and-swap the queue head.

use std::{
    cell::{RefCell, UnsafeCell},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering},
};

use bitflags::bitflags;
use flatkv_common::{strict_assert, strict_assert_eq};
use hashbrown::HashMap;

/// Default maximum number of operations applied by a single combine pass.
pub const DEFAULT_MAX_BATCH: usize = 64;

/// Slots not used for more than this many passes are unlinked from the queue.
pub(crate) const STALE_GENERATIONS: u64 = 5;

const LOCKED: u64 = 1 << 63;
const GENERATION_MASK: u64 = !LOCKED;

/// State protected by a [`FlatCombiner`].
pub trait Combine: Send + 'static {
    /// Pending operation descriptor, carries both the request and its result.
    type Op: Send + 'static;

    /// Apply a batch of pending operations.
    ///
    /// The implementation may reorder the batch freely. Every operation must have its result recorded when this
    /// returns; failures are results, not panics.
    fn combine(&mut self, batch: &mut [&mut Self::Op]);
}

bitflags! {
    /// Owners still referencing a [`Slot`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Owners: u8 {
        /// The submitting thread.
        const THREAD = 0b01;
        /// The pending queue.
        const QUEUE = 0b10;
    }
}

/// Pending operation slot of one thread.
pub(crate) struct Slot<O> {
    op: UnsafeCell<Option<O>>,
    done: AtomicBool,
    /// Generation of the last pass that collected this slot.
    generation: AtomicU64,
    next: AtomicPtr<Slot<O>>,
    owners: AtomicU8,
}

impl<O> Slot<O> {
    /// Allocate a slot owned by the calling thread only.
    fn alloc() -> NonNull<Self> {
        let slot = Box::new(Self {
            op: UnsafeCell::new(None),
            done: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
            owners: AtomicU8::new(Owners::THREAD.bits()),
        });
        NonNull::from(Box::leak(slot))
    }

    fn is_queued(&self) -> bool {
        Owners::from_bits_retain(self.owners.load(Ordering::Acquire)).contains(Owners::QUEUE)
    }

    /// Drop `owner`'s reference and free the slot if it was the last one. Returns `true` if freed.
    ///
    /// # Safety
    ///
    /// `slot` must be live and `owner` must currently hold a reference to it.
    unsafe fn release(slot: NonNull<Self>, owner: Owners) -> bool {
        let prev = Owners::from_bits_retain(unsafe { slot.as_ref() }.owners.fetch_and(!owner.bits(), Ordering::AcqRel));
        assert!(prev.contains(owner), "slot released twice by {owner:?}, owners: {prev:?}");
        if prev == owner {
            drop(unsafe { Box::from_raw(slot.as_ptr()) });
            tracing::trace!("[combiner]: slot freed by {:?}", owner);
            return true;
        }
        false
    }
}

/// Type-erased thread-side reference to a slot, keyed by combiner id in the thread-local registry.
struct LocalSlot {
    slot: NonNull<()>,
    release: unsafe fn(NonNull<()>),
}

impl LocalSlot {
    fn new<O: 'static>() -> Self {
        unsafe fn release<O>(slot: NonNull<()>) {
            unsafe { Slot::<O>::release(slot.cast(), Owners::THREAD) };
        }
        Self {
            slot: Slot::<O>::alloc().cast(),
            release: release::<O>,
        }
    }
}

impl Drop for LocalSlot {
    fn drop(&mut self) {
        unsafe { (self.release)(self.slot) };
    }
}

thread_local! {
    static LOCAL_SLOTS: RefCell<HashMap<u64, LocalSlot>> = RefCell::new(HashMap::new());
}

static NEXT_COMBINER_ID: AtomicU64 = AtomicU64::new(0);

/// Flat-combining wrapper that serializes access to `C`.
pub struct FlatCombiner<C>
where
    C: Combine,
{
    id: u64,
    /// Busy bit and pass generation.
    lock: AtomicU64,
    head: AtomicPtr<Slot<C::Op>>,
    max_batch: usize,

    state: UnsafeCell<C>,
    /// Slots collected by the running pass. Only touched under the lock.
    scratch: UnsafeCell<Vec<NonNull<Slot<C::Op>>>>,

    passes: AtomicU64,
    ops: AtomicU64,
    unlinks: AtomicU64,
}

unsafe impl<C> Send for FlatCombiner<C> where C: Combine {}
unsafe impl<C> Sync for FlatCombiner<C> where C: Combine {}

impl<C> FlatCombiner<C>
where
    C: Combine,
{
    /// Protect `state` with a combiner that applies at most `max_batch` operations per pass.
    ///
    /// # Panics
    ///
    /// Panics if `max_batch` is zero.
    pub fn new(state: C, max_batch: usize) -> Self {
        assert!(max_batch > 0, "max_batch must be positive");
        Self {
            id: NEXT_COMBINER_ID.fetch_add(1, Ordering::Relaxed),
            lock: AtomicU64::new(0),
            head: AtomicPtr::new(std::ptr::null_mut()),
            max_batch,
            state: UnsafeCell::new(state),
            scratch: UnsafeCell::new(Vec::with_capacity(max_batch)),
            passes: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            unlinks: AtomicU64::new(0),
        }
    }

    /// Maximum number of operations applied by one pass.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Number of completed combine passes.
    pub fn generation(&self) -> u64 {
        self.lock.load(Ordering::Acquire) & GENERATION_MASK
    }

    /// Return `(passes, ops, unlinks)` counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.passes.load(Ordering::Relaxed),
            self.ops.load(Ordering::Relaxed),
            self.unlinks.load(Ordering::Relaxed),
        )
    }

    /// Submit `op` and block until a combine pass has applied it. Returns the completed operation.
    pub fn submit(&self, op: C::Op) -> C::Op {
        match self.acquire_slot() {
            Some(slot) => self.apply(slot, op),
            None => {
                // The thread-local registry is gone (the thread is exiting), use a one-shot slot.
                let slot = Slot::alloc();
                let op = self.apply(slot, op);
                unsafe { Slot::release(slot, Owners::THREAD) };
                op
            }
        }
    }

    /// Release the calling thread's slot. The next submit from this thread allocates a new one.
    pub fn detach(&self) {
        let local = LOCAL_SLOTS
            .try_with(|slots| slots.borrow_mut().remove(&self.id))
            .ok()
            .flatten();
        drop(local);
    }

    /// Run `f` with exclusive access to the protected state, outside of any batch.
    ///
    /// The combine lock is released even if `f` panics.
    pub fn exclusive<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let _guard = loop {
            match self.try_lock() {
                Some(guard) => break guard,
                None => std::thread::yield_now(),
            }
        };
        f(unsafe { &mut *self.state.get() })
    }

    /// Get the calling thread's slot, allocating it on first use.
    fn acquire_slot(&self) -> Option<NonNull<Slot<C::Op>>> {
        LOCAL_SLOTS
            .try_with(|slots| {
                slots
                    .borrow_mut()
                    .entry(self.id)
                    .or_insert_with(LocalSlot::new::<C::Op>)
                    .slot
                    .cast()
            })
            .ok()
    }

    fn apply(&self, slot: NonNull<Slot<C::Op>>, op: C::Op) -> C::Op {
        let s = unsafe { slot.as_ref() };
        strict_assert!(s.done.load(Ordering::Acquire));

        // The slot is done, so no executor reads the op cell until `done` is cleared below.
        unsafe { *s.op.get() = Some(op) };
        s.done.store(false, Ordering::Release);

        while !s.done.load(Ordering::Acquire) {
            if !s.is_queued() {
                self.enqueue(slot);
            }

            match self.try_lock() {
                Some(guard) => {
                    // A pass interrupted halfway leaves collected ops neither applied nor retryable.
                    let abort = AbortOnUnwind;
                    self.combine(guard.generation);
                    std::mem::forget(abort);
                }
                None => std::thread::yield_now(),
            }
        }

        match unsafe { (*s.op.get()).take() } {
            Some(op) => op,
            None => unreachable!("completed slot without an operation"),
        }
    }

    /// Link `slot` at the queue head.
    fn enqueue(&self, slot: NonNull<Slot<C::Op>>) {
        let s = unsafe { slot.as_ref() };
        let prev = Owners::from_bits_retain(s.owners.fetch_or(Owners::QUEUE.bits(), Ordering::AcqRel));
        strict_assert!(!prev.contains(Owners::QUEUE));

        // A fresh link counts as a use, so the slot is not unlinked before its first pass.
        s.generation.store(self.generation(), Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            s.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, slot.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        tracing::trace!("[combiner {}]: slot linked", self.id);
    }

    /// Acquire the combine lock. The guard releases it when dropped.
    fn try_lock(&self) -> Option<CombineLockGuard<'_, C>> {
        let current = self.lock.load(Ordering::Relaxed);
        if current & LOCKED != 0 {
            return None;
        }
        self.lock
            .compare_exchange(current, current | LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| CombineLockGuard {
                combiner: self,
                generation: current,
            })
    }

    /// Release the combine lock and start the next generation.
    fn unlock(&self, generation: u64) {
        let prev = self
            .lock
            .swap(generation.wrapping_add(1) & GENERATION_MASK, Ordering::Release);
        strict_assert_eq!(prev, generation | LOCKED);
    }

    /// Run one combine pass. Must be called with the lock held.
    fn combine(&self, generation: u64) {
        let scratch = unsafe { &mut *self.scratch.get() };
        scratch.clear();

        let mut current = self.head.load(Ordering::Acquire);
        while let Some(slot) = NonNull::new(current) {
            let s = unsafe { slot.as_ref() };
            if scratch.len() < self.max_batch && !s.done.load(Ordering::Acquire) {
                s.generation.store(generation, Ordering::Relaxed);
                scratch.push(slot);
            }
            current = s.next.load(Ordering::Acquire);
        }

        if !scratch.is_empty() {
            let mut batch = scratch
                .iter()
                .map(|slot| match unsafe { (*slot.as_ref().op.get()).as_mut() } {
                    Some(op) => op,
                    None => unreachable!("pending slot without an operation"),
                })
                .collect::<Vec<_>>();
            unsafe { &mut *self.state.get() }.combine(&mut batch);
            drop(batch);

            for slot in scratch.iter() {
                unsafe { slot.as_ref() }.done.store(true, Ordering::Release);
            }

            self.passes.fetch_add(1, Ordering::Relaxed);
            self.ops.fetch_add(scratch.len() as u64, Ordering::Relaxed);
            tracing::trace!(
                "[combiner {}]: generation {} combined {} ops",
                self.id,
                generation,
                scratch.len()
            );
        }
        scratch.clear();

        self.unlink_stale(generation);
    }

    /// Unlink slots idle for more than [`STALE_GENERATIONS`] passes. Must be called with the lock held.
    fn unlink_stale(&self, generation: u64) {
        let Some(mut parent) = NonNull::new(self.head.load(Ordering::Acquire)) else {
            return;
        };
        let mut current = unsafe { parent.as_ref() }.next.load(Ordering::Acquire);

        while let Some(slot) = NonNull::new(current) {
            let s = unsafe { slot.as_ref() };
            let next = s.next.load(Ordering::Acquire);
            let idle = generation.saturating_sub(s.generation.load(Ordering::Relaxed));

            if idle > STALE_GENERATIONS && s.done.load(Ordering::Acquire) {
                unsafe { parent.as_ref() }.next.store(next, Ordering::Release);
                s.next.store(std::ptr::null_mut(), Ordering::Relaxed);
                self.unlinks.fetch_add(1, Ordering::Relaxed);
                // The owner thread, if any, observes the cleared bit and links the slot again on its next submit.
                unsafe { Slot::release(slot, Owners::QUEUE) };
            } else {
                parent = slot;
            }
            current = next;
        }
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.exclusive(|_| ());
        let mut len = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while let Some(slot) = NonNull::new(current) {
            len += 1;
            current = unsafe { slot.as_ref() }.next.load(Ordering::Acquire);
        }
        len
    }
}

/// Held combine lock of a [`FlatCombiner`], tagged with the generation it was acquired at.
struct CombineLockGuard<'a, C>
where
    C: Combine,
{
    combiner: &'a FlatCombiner<C>,
    generation: u64,
}

impl<C> Drop for CombineLockGuard<'_, C>
where
    C: Combine,
{
    fn drop(&mut self) {
        self.combiner.unlock(self.generation);
    }
}

/// Aborts the process if dropped, i.e. if a combine pass unwinds. Forgotten on success.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        tracing::error!("[combiner]: combine pass panicked, aborting");
        std::process::abort();
    }
}

impl<C> Drop for FlatCombiner<C>
where
    C: Combine,
{
    fn drop(&mut self) {
        self.detach();

        let mut current = *self.head.get_mut();
        while let Some(slot) = NonNull::new(current) {
            current = unsafe { slot.as_ref() }.next.load(Ordering::Acquire);
            unsafe { Slot::release(slot, Owners::QUEUE) };
        }
        *self.head.get_mut() = std::ptr::null_mut();
    }
}
