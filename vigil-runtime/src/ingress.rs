// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Multi-producer ingress into the poller
//!
//! Producers on any worker append token ids; the poller drains them. The
//! underlying ring is single-producer, so every push runs under the ticket
//! spinlock. The drain side needs no lock: there is exactly one
//! [`IngressDrain`] and it is driven through `&mut self`.
//!
//! A full ring is backpressure, not an error: the pushing producer keeps
//! the lock and retries until the poller makes room.

use crate::ringbuf::{self, Consumer, Producer};
use crate::spinlock::SpinLock;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Statistics for the ingress channel
#[derive(Debug, Default)]
pub struct IngressStats {
    /// Entries accepted
    pub pushed: AtomicU64,
    /// Entries handed to the poller
    pub drained: AtomicU64,
    /// Retries caused by a full ring
    pub full_retries: AtomicU64,
}

/// Create an ingress channel with room for `capacity` entries
pub fn channel<T: Copy + Send>(capacity: usize) -> (IngressChannel<T>, IngressDrain<T>) {
    let (producer, consumer) = ringbuf::ring(capacity);
    let stats = Arc::new(IngressStats::default());
    (
        IngressChannel {
            producer: SpinLock::new(producer),
            stats: stats.clone(),
            saturated: AtomicBool::new(false),
        },
        IngressDrain { consumer, stats },
    )
}

/// Producer side, shared by every worker
pub struct IngressChannel<T> {
    producer: SpinLock<Producer<T>>,
    stats: Arc<IngressStats>,
    /// Set while a producer is waiting on a full ring, for one warning per episode
    saturated: AtomicBool,
}

impl<T: Copy + Send> IngressChannel<T> {
    /// Append one entry, spinning while the ring is full
    pub fn push(&self, value: T) {
        let mut producer = self.producer.lock();
        let backoff = Backoff::new();
        let mut retries = 0u64;
        while producer.push(value).is_err() {
            if retries == 0 {
                self.enter_saturation(producer.capacity());
            }
            retries += 1;
            backoff.snooze();
        }
        drop(producer);

        self.finish(1, retries);
    }

    /// Append every entry of `values` as one batch
    ///
    /// The whole batch is appended under one lock acquisition, so batches
    /// from different producers never interleave.
    pub fn push_batch(&self, values: &[T]) {
        if values.is_empty() {
            return;
        }
        let mut producer = self.producer.lock();
        let backoff = Backoff::new();
        let mut added = 0;
        let mut retries = 0u64;
        loop {
            added += producer.push_slice(&values[added..]);
            if added == values.len() {
                break;
            }
            if retries == 0 {
                self.enter_saturation(producer.capacity());
            }
            retries += 1;
            backoff.snooze();
        }
        drop(producer);

        self.finish(values.len() as u64, retries);
    }

    /// Shared statistics
    pub fn stats(&self) -> &Arc<IngressStats> {
        &self.stats
    }

    fn enter_saturation(&self, capacity: usize) {
        if !self.saturated.swap(true, Ordering::Relaxed) {
            warn!("ingress channel full ({} entries), producers spinning", capacity);
        }
    }

    fn finish(&self, pushed: u64, retries: u64) {
        self.stats.pushed.fetch_add(pushed, Ordering::Relaxed);
        if retries > 0 {
            self.stats.full_retries.fetch_add(retries, Ordering::Relaxed);
            if self.saturated.swap(false, Ordering::Relaxed) {
                debug!("ingress channel drained after {} retries", retries);
            }
        }
    }
}

/// Consumer side, owned by the poller
pub struct IngressDrain<T> {
    consumer: Consumer<T>,
    stats: Arc<IngressStats>,
}

impl<T: Copy + Send> IngressDrain<T> {
    /// Hand every available entry to `f`; returns how many were drained
    pub fn drain<F: FnMut(T)>(&mut self, f: F) -> usize {
        if self.consumer.is_empty() {
            return 0;
        }
        let n = self.consumer.consume_all(f);
        self.stats.drained.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Entries waiting to be drained
    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn stats(&self) -> &Arc<IngressStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_and_drain() {
        let (tx, mut rx) = channel::<u32>(8);
        tx.push(1);
        tx.push_batch(&[2, 3, 4]);
        tx.push_batch(&[]);

        let mut seen = Vec::new();
        assert_eq!(rx.drain(|v| seen.push(v)), 4);
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(rx.drain(|_| unreachable!()), 0);
        assert_eq!(tx.stats().pushed.load(Ordering::Relaxed), 4);
        assert_eq!(rx.stats().drained.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_backpressure_then_progress() {
        // Batch larger than the ring: the producer must wait for the drain
        let (tx, mut rx) = channel::<u32>(4);
        let tx = Arc::new(tx);
        let batch: Vec<u32> = (0..64).collect();

        let producer = {
            let tx = tx.clone();
            thread::spawn(move || tx.push_batch(&batch))
        };

        let mut seen = Vec::new();
        while seen.len() < 64 {
            rx.drain(|v| seen.push(v));
            thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..64).collect::<Vec<_>>());
        assert!(tx.stats().full_retries.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_conservation_many_producers() {
        let (tx, mut rx) = channel::<u64>(128);
        let tx = Arc::new(tx);
        let producers = 4u64;
        let per_producer = 5_000u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let v = p * per_producer + i;
                        if i % 3 == 0 {
                            tx.push_batch(&[v]);
                        } else {
                            tx.push(v);
                        }
                    }
                })
            })
            .collect();

        let total = (producers * per_producer) as usize;
        let mut seen = vec![false; total];
        let mut count = 0;
        while count < total {
            rx.drain(|v| {
                assert!(!seen[v as usize], "entry {} drained twice", v);
                seen[v as usize] = true;
                count += 1;
            });
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(tx.stats().pushed.load(Ordering::Relaxed), total as u64);
    }
}
