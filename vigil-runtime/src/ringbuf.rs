// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Bounded single-producer/single-consumer ring
//!
//! The producer and consumer halves are separate owned values, so the
//! single-producer and single-consumer rules are enforced by `&mut self`.
//! Multi-producer use goes through [`crate::ingress`], which serializes
//! producers on a spinlock.
//!
//! Indices grow monotonically and wrap; slot `i % capacity` holds entry `i`.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared<T> {
    /// Next entry the consumer will read
    head: CachePadded<AtomicUsize>,
    /// Next entry the producer will write
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots in [head, tail) are owned by the consumer, the rest by the producer
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

/// Create a ring holding up to `capacity` entries
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn ring<T: Copy + Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        slots,
    });
    (
        Producer {
            shared: shared.clone(),
            cached_head: 0,
        },
        Consumer { shared },
    )
}

/// Writing half of the ring
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    /// Last observed consumer position, refreshed only when the ring looks full
    cached_head: usize,
}

impl<T: Copy + Send> Producer<T> {
    /// Append one entry, handing it back if the ring is full
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.free_slots() == 0 {
            return Err(value);
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        self.write(tail, value);
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Append as many entries from `values` as fit, returning how many did
    pub fn push_slice(&mut self, values: &[T]) -> usize {
        let n = self.free_slots().min(values.len());
        if n == 0 {
            return 0;
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        for (i, value) in values[..n].iter().enumerate() {
            self.write(tail.wrapping_add(i), *value);
        }
        self.shared.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Entries written but not yet consumed
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_slots(&mut self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let cap = self.shared.capacity();
        if tail.wrapping_sub(self.cached_head) >= cap {
            self.cached_head = self.shared.head.load(Ordering::Acquire);
        }
        cap - tail.wrapping_sub(self.cached_head)
    }

    #[inline]
    fn write(&self, index: usize, value: T) {
        let slot = &self.shared.slots[index % self.shared.capacity()];
        // SAFETY: the slot lies outside [head, tail), so the consumer does
        // not read it until we publish the new tail
        unsafe { (*slot.get()).write(value) };
    }
}

/// Reading half of the ring
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Send> Consumer<T> {
    /// Remove the oldest entry
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.read(head);
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Hand every entry published so far to `f`, in order
    ///
    /// Returns the number of entries consumed. Entries published while this
    /// runs are left for the next call.
    pub fn consume_all<F: FnMut(T)>(&mut self, mut f: F) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        let n = tail.wrapping_sub(head);
        for i in 0..n {
            f(self.read(head.wrapping_add(i)));
        }
        self.shared.head.store(tail, Ordering::Release);
        n
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn read(&self, index: usize) -> T {
        let slot = &self.shared.slots[index % self.shared.capacity()];
        // SAFETY: the slot lies inside [head, tail) and was initialized by
        // the producer before it published the tail we acquired
        unsafe { (*slot.get()).assume_init() }
    }
}
