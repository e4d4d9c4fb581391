// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Prometheus metrics for the completion engine
//!
//! Rendered in Prometheus text format by [`EngineMetrics::render`].
//!
//! ## Metrics Exported
//!
//! - `vigil_tokens_generated_total` - Tokens created
//! - `vigil_tokens_submitted_total` - Tokens bound and submitted
//! - `vigil_tokens_retired_total` - Tokens whose completion was observed
//! - `vigil_tokens_pending` - Tokens awaiting completion
//! - `vigil_tokens_in_use` - Arena slots backing live tokens
//! - `vigil_token_capacity` - Arena slots allocated so far
//! - `vigil_ingress_full_retries_total` - Producer retries on a full ingress ring
//! - `vigil_poll_cycles_total` - Completion checks performed
//! - `vigil_poll_cycle_seconds` - Duration of one completion check

use crate::ingress::IngressStats;
use crate::tracker::TrackerStats;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::Ordering;

/// Latency samples kept for the cycle histogram
const MAX_SAMPLES: usize = 1000;

/// Histogram buckets, in seconds
const BUCKETS: [f64; 7] = [0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001];

/// Metrics collector for one engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Most recent completion check durations (in nanoseconds)
    cycle_samples: Mutex<VecDeque<u64>>,
}

/// Point-in-time gauges passed to [`EngineMetrics::render`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub tokens_in_use: usize,
    pub token_capacity: usize,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the duration of one completion check
    pub fn record_cycle(&self, latency_ns: u64) {
        let mut samples = self.cycle_samples.lock();
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency_ns);
    }

    /// Number of latency samples currently held
    pub fn samples(&self) -> usize {
        self.cycle_samples.lock().len()
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self, tracker: &TrackerStats, ingress: &IngressStats, gauges: Gauges) -> String {
        let mut out = String::new();

        counter(
            &mut out,
            "vigil_tokens_generated_total",
            "Completion tokens created",
            tracker.generated.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "vigil_tokens_submitted_total",
            "Completion tokens bound to a task and submitted",
            tracker.submitted.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "vigil_tokens_retired_total",
            "Completion tokens retired after their work finished",
            tracker.retired.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "vigil_tokens_pending",
            "Completion tokens awaiting completion",
            tracker.pending.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "vigil_tokens_in_use",
            "Token slots backing live tokens",
            gauges.tokens_in_use as u64,
        );
        gauge(
            &mut out,
            "vigil_token_capacity",
            "Token slots allocated, including free ones",
            gauges.token_capacity as u64,
        );
        counter(
            &mut out,
            "vigil_ingress_full_retries_total",
            "Producer retries because the ingress ring was full",
            ingress.full_retries.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "vigil_poll_cycles_total",
            "Completion checks performed",
            tracker.cycles.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "# HELP vigil_poll_cycle_seconds Duration of one completion check"
        );
        let _ = writeln!(out, "# TYPE vigil_poll_cycle_seconds histogram");
        let samples = self.cycle_samples.lock();
        let mut bucket_counts = [0u64; BUCKETS.len()];
        let mut sum_ns: u64 = 0;
        for &sample_ns in samples.iter() {
            sum_ns = sum_ns.saturating_add(sample_ns);
            let sample_s = sample_ns as f64 / 1_000_000_000.0;
            for (i, &bucket) in BUCKETS.iter().enumerate() {
                if sample_s <= bucket {
                    bucket_counts[i] += 1;
                }
            }
        }
        for (bucket, count) in BUCKETS.iter().zip(bucket_counts) {
            let _ = writeln!(out, "vigil_poll_cycle_seconds_bucket{{le=\"{}\"}} {}", bucket, count);
        }
        let _ = writeln!(
            out,
            "vigil_poll_cycle_seconds_bucket{{le=\"+Inf\"}} {}",
            samples.len()
        );
        let _ = writeln!(
            out,
            "vigil_poll_cycle_seconds_sum {}",
            sum_ns as f64 / 1_000_000_000.0
        );
        let _ = writeln!(out, "vigil_poll_cycle_seconds_count {}", samples.len());

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}
