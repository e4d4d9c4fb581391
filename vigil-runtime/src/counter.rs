// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Per-task event counters for the in-tree bridges
//!
//! A task may only complete once its counter is back at baseline (zero).
//! Bridges backed by a foreign runtime keep their own counters; the thread
//! and Tokio bridges use these.

use crate::bridge::TaskHandle;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outstanding-event count of one task
#[derive(Debug, Default)]
pub struct EventCounter {
    pending: Mutex<u64>,
    drained: Condvar,
    /// Lifetime totals, for accounting
    increased: AtomicU64,
    decreased: AtomicU64,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&self, n: u64) {
        *self.pending.lock() += n;
        self.increased.fetch_add(n, Ordering::Relaxed);
    }

    /// Retire `n` events; fails without change if that would go below zero
    pub fn decrease(&self, n: u64) -> Result<u64, u64> {
        let mut pending = self.pending.lock();
        let Some(left) = pending.checked_sub(n) else {
            return Err(*pending);
        };
        *pending = left;
        self.decreased.fetch_add(n, Ordering::Relaxed);
        if left == 0 {
            self.drained.notify_all();
        }
        Ok(left)
    }

    /// Events not yet retired
    pub fn pending(&self) -> u64 {
        *self.pending.lock()
    }

    pub fn is_drained(&self) -> bool {
        self.pending() == 0
    }

    /// Total events ever added
    pub fn total_increased(&self) -> u64 {
        self.increased.load(Ordering::Relaxed)
    }

    /// Total events ever retired
    pub fn total_decreased(&self) -> u64 {
        self.decreased.load(Ordering::Relaxed)
    }

    /// Block the calling thread until the counter is at baseline
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        let result = self
            .drained
            .wait_while_for(&mut pending, |p| *p > 0, timeout);
        !result.timed_out() || *pending == 0
    }
}

/// Map from task handles to their counters
#[derive(Debug)]
pub struct CounterRegistry {
    counters: RwLock<HashMap<TaskHandle, Arc<EventCounter>>>,
    next_id: AtomicU64,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a counter for a new task
    pub fn register(&self) -> (TaskHandle, Arc<EventCounter>) {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = match TaskHandle::from_raw(raw) {
            Some(handle) => handle,
            None => unreachable!("task ids start at one"),
        };
        let counter = Arc::new(EventCounter::new());
        self.counters.write().insert(handle, counter.clone());
        (handle, counter)
    }

    pub fn get(&self, handle: TaskHandle) -> Option<Arc<EventCounter>> {
        self.counters.read().get(&handle).cloned()
    }

    pub fn unregister(&self, handle: TaskHandle) -> Option<Arc<EventCounter>> {
        self.counters.write().remove(&handle)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
