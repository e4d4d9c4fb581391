// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Ticket array spinlock
//!
//! Producers serialize on this lock before touching the ingress ring. Each
//! waiter spins on its own cache-padded slot, so a release only disturbs the
//! next ticket holder instead of the whole herd, and tickets are served in
//! the order they were taken.
//!
//! Waiting never suspends to the task scheduler; after a short spin the
//! waiter only yields its OS thread. The number of slots must exceed
//! the number of CPUs that can contend at once; beyond that, waiters share
//! slots and spin on the same line, which is still correct but no longer
//! contention free.

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use vigil_common::config::MAX_SYSTEM_CPUS;

/// Fair spinlock protecting a value of type `T`
pub struct SpinLock<T> {
    /// Per-slot sequence numbers; slot `t % len` reads `t` when ticket `t` may enter
    slots: Box<[CachePadded<AtomicUsize>]>,
    /// Next ticket to hand out
    head: CachePadded<AtomicUsize>,
    /// Ticket currently served; only written by the holder
    next: CachePadded<AtomicUsize>,
    data: UnsafeCell<T>,
}

// The lock hands out exclusive access to `T`
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a lock sized for `MAX_SYSTEM_CPUS` contenders
    pub fn new(data: T) -> Self {
        Self::with_slots(data, MAX_SYSTEM_CPUS)
    }

    /// Create a lock with an explicit number of ticket slots
    ///
    /// # Panics
    /// Panics if `slots` is zero.
    pub fn with_slots(data: T, slots: usize) -> Self {
        assert!(slots > 0, "spinlock needs at least one slot");
        let slots = (0..slots)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            next: CachePadded::new(AtomicUsize::new(0)),
            data: UnsafeCell::new(data),
        }
    }

    /// Number of ticket slots
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Acquire the lock, spinning until our ticket is served
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let ticket = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[ticket % self.slots.len()];
        let backoff = Backoff::new();
        while slot.load(Ordering::Acquire) != ticket {
            backoff.snooze();
        }
        SpinGuard { lock: self, ticket }
    }

    /// Acquire the lock only if nobody holds or waits for it
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        let ticket = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[ticket % self.slots.len()];
        if slot.load(Ordering::Acquire) != ticket {
            return None;
        }
        self.head
            .compare_exchange(ticket, ticket.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self, ticket })
    }

    /// Consume the lock and return the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Access the value through a unique reference, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    fn unlock(&self) {
        let next = self.next.load(Ordering::Relaxed).wrapping_add(1);
        self.next.store(next, Ordering::Relaxed);
        self.slots[next % self.slots.len()].store(next, Ordering::Release);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; the lock passes to the next ticket when dropped
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ticket: usize,
}

impl<T> SpinGuard<'_, T> {
    /// The ticket this guard was served under
    #[inline]
    pub fn ticket(&self) -> usize {
        self.ticket
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means our ticket is being served
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means our ticket is being served
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
