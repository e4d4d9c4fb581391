// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Latency benchmark
//!
//! Measures the time from a task submitting a token until its counter is
//! back at baseline, i.e. how long a finished device operation keeps its
//! task waiting. Dominated by the polling frequency.

use clap::Parser;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vigil_runtime::sim::SimDevice;
use vigil_runtime::{Builder, StreamPool, ThreadBridge};

/// Completion latency benchmark
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration to run the benchmark (seconds)
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Number of producer threads
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Polling frequency (microseconds); overrides VIGIL_POLLING_FREQUENCY
    #[arg(short, long)]
    polling_us: Option<u64>,

    /// Tokens submitted per round before waiting
    #[arg(short, long, default_value_t = 1)]
    batch: usize,
}

struct LatencyHistogram {
    buckets: [AtomicU64; 32],
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, latency_us: u64) {
        // Bucket index: log2(latency_us + 1), clamped to 31
        let bucket = (64 - (latency_us + 1).leading_zeros()).min(31) as usize;
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, p: f64) -> u64 {
        let total = self.total();
        let target = (total as f64 * p / 100.0) as u64;
        let mut count = 0u64;

        for (i, bucket) in self.buckets.iter().enumerate() {
            count += bucket.load(Ordering::Relaxed);
            if count >= target {
                return 1u64 << i;
            }
        }

        1 << 31
    }

    fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut builder = match Builder::from_env() {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };
    if let Some(us) = args.polling_us {
        builder = builder.polling_frequency(Duration::from_micros(us));
    }

    tracing::info!("Latency benchmark");
    tracing::info!("  Duration: {}s", args.duration);
    tracing::info!("  Workers: {}", args.workers);
    tracing::info!("  Polling frequency: {:?}", builder.config().polling_frequency);
    tracing::info!("  Batch: {}", args.batch);

    let device = Arc::new(SimDevice::new());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = match builder.build(device.clone(), bridge.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("failed to start engine: {}", e);
            std::process::exit(2);
        }
    };
    let pool = match StreamPool::new(device.clone(), args.workers.max(1)) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!("failed to create streams: {}", e);
            std::process::exit(2);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let histogram = Arc::new(LatencyHistogram::new());
    let mut worker_handles = Vec::new();

    for i in 0..args.workers {
        let stop_clone = stop.clone();
        let hist_clone = histogram.clone();
        let engine = engine.clone();
        let bridge = bridge.clone();
        let device = device.clone();
        let pool = pool.clone();
        let batch = args.batch.max(1);

        let handle = thread::Builder::new()
            .name(format!("producer-{}", i))
            .spawn(move || {
                let scope = bridge.enter_task();
                let Ok(stream) = pool.get(i) else {
                    return;
                };

                while !stop_clone.load(Ordering::Relaxed) {
                    let start = Instant::now();
                    for _ in 0..batch {
                        engine.tracker().submit(stream);
                    }
                    // The simulated work finishes immediately
                    device.complete(stream, batch as u64);

                    while !scope.wait_events(Duration::from_secs(1)) {
                        tracing::warn!("producer-{} still waiting", i);
                    }
                    hist_clone.record(start.elapsed().as_micros() as u64);
                }
            })
            .expect("failed to spawn producer");

        worker_handles.push(handle);
    }

    tracing::info!("Running for {} seconds...", args.duration);
    thread::sleep(Duration::from_secs(args.duration));
    stop.store(true, Ordering::Release);

    for handle in worker_handles {
        if handle.join().is_err() {
            tracing::error!("producer panicked");
        }
    }
    engine.shutdown();

    let total = histogram.total();
    tracing::info!("=== Results ===");
    tracing::info!("Rounds: {}", total);
    tracing::info!("Rounds/second: {:.0}", total as f64 / args.duration as f64);
    tracing::info!("Completion latency:");
    tracing::info!("  p50:  {} µs", histogram.percentile(50.0));
    tracing::info!("  p95:  {} µs", histogram.percentile(95.0));
    tracing::info!("  p99:  {} µs", histogram.percentile(99.0));
    tracing::info!("  p99.9: {} µs", histogram.percentile(99.9));

    let polling_us = engine.config().polling_frequency.as_micros() as u64;
    if histogram.percentile(99.0) > 4 * polling_us.max(1) {
        tracing::warn!("p99 latency well above the polling frequency");
    }
}
