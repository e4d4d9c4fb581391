// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Completion tokens and their slot arena
//!
//! A token is one in-flight device operation: its marker, the stream the
//! marker was armed on, and (once bound) the task whose event counter its
//! completion must decrement. Tokens live in an arena addressed by stable
//! `u32` indices, so the ingress ring and the pending set only ever move
//! plain ids around.
//!
//! The arena starts with a fixed number of slots and grows in chunks when
//! they are all taken, each chunk twice the size of the previous one.
//! Chunks are never freed or moved, so an index always names the same slot.
//! Allocation therefore never waits for the poller.
//!
//! # Ownership
//!
//! A slot has exactly one owner at a time, tracked by its [`TokenState`]:
//!
//! - `Armed`: the producer that allocated it (or the caller holding the
//!   [`CompletionToken`])
//! - `Submitted`: in transit through the ingress ring
//! - `Pending`: the poller
//!
//! Ownership moves through the ingress ring's release/acquire pair and the
//! free list, which is what makes the unsynchronized slot bodies sound.
//! Every access to a body first checks the slot state; a mismatch is
//! reported to the caller instead of touching the body.

use crate::bridge::TaskHandle;
use crate::device::Device;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::debug;
use vigil_common::TokenState;

/// Upper bound on the number of chunks; indices must fit in a `u32`
const MAX_CHUNKS: usize = 32;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Stable index of a token slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u32);

impl TokenId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// An armed token that has not been bound to a task
///
/// Returned by `generate_request` when the caller asked to decide later
/// whether to track it. Hand it back through `process_request` or
/// `process_requests` of the same engine; dropping it leaks the slot and
/// its marker.
#[must_use = "an unprocessed token leaks its slot and device marker"]
#[derive(Debug, PartialEq, Eq)]
pub struct CompletionToken {
    id: TokenId,
    arena: u64,
}

impl CompletionToken {
    pub(crate) fn new(id: TokenId, arena: u64) -> Self {
        Self { id, arena }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Identity of the arena that issued the token
    pub(crate) fn arena(&self) -> u64 {
        self.arena
    }

    pub(crate) fn into_id(self) -> TokenId {
        self.id
    }
}

/// Contents of a live slot
pub(crate) struct TokenBody<D: Device> {
    pub marker: D::Marker,
    pub stream: D::Stream,
    pub bound: Option<TaskHandle>,
}

struct Slot<D: Device> {
    state: AtomicU32,
    body: UnsafeCell<Option<TokenBody<D>>>,
}

impl<D: Device> Slot<D> {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(TokenState::Free as u32),
            body: UnsafeCell::new(None),
        }
    }
}

/// Growable pool of token slots
///
/// Allocation is safe from any thread (lock-free free list, growth under a
/// lock); recycling is done by the poller.
pub struct TokenArena<D: Device> {
    id: u64,
    /// Size of chunk 0; chunk `k` holds `base << k` slots
    base: usize,
    chunks: Box<[OnceLock<Box<[Slot<D>]>>]>,
    /// Slots in all published chunks
    capacity: AtomicUsize,
    free: SegQueue<u32>,
    grow: Mutex<()>,
}

// Slot bodies are only touched by the slot's current owner, see module docs
unsafe impl<D: Device> Sync for TokenArena<D> {}

impl<D: Device> TokenArena<D> {
    /// Create an arena starting with `capacity` slots
    ///
    /// # Panics
    /// Panics if `capacity` is zero or does not fit in a `u32`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "token arena needs at least one slot");
        assert!(capacity <= u32::MAX as usize, "token arena too large");

        let arena = Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            base: capacity,
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            capacity: AtomicUsize::new(0),
            free: SegQueue::new(),
            grow: Mutex::new(()),
        };
        arena.add_chunk(0);
        arena
    }

    /// Identity of this arena, carried by the tokens it issues
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Slots currently available without growing
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Slots currently backing live tokens
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.free.len())
    }

    /// Current state of a slot
    pub fn state(&self, id: TokenId) -> TokenState {
        self.slot(id)
            .and_then(|slot| TokenState::try_from(slot.state.load(Ordering::Acquire)).ok())
            .unwrap_or(TokenState::Free)
    }

    /// Claim a free slot, growing the arena if none is left, and fill it
    ///
    /// Only fails, handing the body back, once the index space is used up.
    pub(crate) fn allocate(&self, body: TokenBody<D>) -> Result<TokenId, TokenBody<D>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => match self.grow_and_pop() {
                Some(index) => index,
                None => return Err(body),
            },
        };
        let id = TokenId(index);
        let Some(slot) = self.slot(id) else {
            return Err(body);
        };
        if !self.transition(id, TokenState::Free, TokenState::Armed) {
            return Err(body);
        }

        // SAFETY: the slot came off the free list and is now Armed by us
        unsafe { *slot.body.get() = Some(body) };
        Ok(id)
    }

    /// Record the task a token signals on completion
    ///
    /// Returns `false` without touching the slot unless it is `Armed` and
    /// not yet bound.
    pub(crate) fn bind(&self, id: TokenId, task: TaskHandle) -> bool {
        if self.state(id) != TokenState::Armed {
            return false;
        }
        let Some(slot) = self.slot(id) else {
            return false;
        };
        // SAFETY: an Armed slot is owned by the holder of its token, the caller
        match unsafe { (*slot.body.get()).as_mut() } {
            Some(body) if body.bound.is_none() => {
                body.bound = Some(task);
                true
            }
            _ => false,
        }
    }

    /// Access the body of a pending token
    ///
    /// Must be called by the poller; `None` unless the token is `Pending`.
    pub(crate) fn pending_body(&self, id: TokenId) -> Option<&TokenBody<D>> {
        if self.state(id) != TokenState::Pending {
            return None;
        }
        let slot = self.slot(id)?;
        // SAFETY: a Pending slot is owned by the poller, which is the caller
        unsafe { (*slot.body.get()).as_ref() }
    }

    /// Move the body out of a pending token, leaving the slot reserved
    pub(crate) fn take(&self, id: TokenId) -> Option<TokenBody<D>> {
        if self.state(id) != TokenState::Pending {
            return None;
        }
        let slot = self.slot(id)?;
        // SAFETY: a Pending slot is owned by the poller, which is the caller
        unsafe { (*slot.body.get()).take() }
    }

    /// Return an emptied slot to the free list
    ///
    /// Returns `false` if the slot was not pending, i.e. a double free.
    pub(crate) fn recycle(&self, id: TokenId) -> bool {
        if !self.transition(id, TokenState::Pending, TokenState::Free) {
            return false;
        }
        self.free.push(id.0);
        true
    }

    /// Move a slot between states, failing if it is not in `from`
    pub(crate) fn transition(&self, id: TokenId, from: TokenState, to: TokenState) -> bool {
        match self.slot(id) {
            Some(slot) => slot
                .state
                .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Chunk number and offset of a slot index
    #[inline]
    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as u64;
        let base = self.base as u64;
        let n = index / base + 1;
        let chunk = (63 - n.leading_zeros()) as usize;
        let start = base * ((1u64 << chunk) - 1);
        (chunk, (index - start) as usize)
    }

    #[inline]
    fn slot(&self, id: TokenId) -> Option<&Slot<D>> {
        let (chunk, offset) = self.locate(id.0);
        self.chunks.get(chunk)?.get()?.get(offset)
    }

    /// Add the next chunk unless another producer already did
    fn grow_and_pop(&self) -> Option<u32> {
        let _guard = self.grow.lock();
        // Someone may have grown the arena, or the poller recycled, meanwhile
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        let next = self.chunks.iter().position(|c| c.get().is_none())?;
        if !self.add_chunk(next) {
            return None;
        }
        debug!("token arena {} grew to {} slots", self.id, self.capacity());
        self.free.pop()
    }

    /// Publish chunk `k` and put its slots on the free list
    fn add_chunk(&self, k: usize) -> bool {
        let len = (self.base as u64) << k;
        let start = self.base as u64 * ((1u64 << k) - 1);
        if start + len > u32::MAX as u64 + 1 {
            return false;
        }
        let slots: Box<[Slot<D>]> = (0..len).map(|_| Slot::new()).collect();
        if self.chunks[k].set(slots).is_err() {
            return false;
        }
        self.capacity.fetch_add(len as usize, Ordering::AcqRel);
        for i in start..start + len {
            self.free.push(i as u32);
        }
        true
    }
}
