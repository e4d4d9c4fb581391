// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Stress test
//!
//! Many producers hammer one engine with a mix of bound submissions,
//! deferred tokens and batches (with empty slots). At the end every
//! submitted token must have been retired exactly once.

use clap::Parser;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vigil_common::env_vars;
use vigil_runtime::sim::SimDevice;
use vigil_runtime::{Builder, CompletionToken, FatalPolicy, ThreadBridge};

/// Completion engine stress test
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of producer threads
    #[arg(short = 'w', long, default_value_t = 8)]
    workers: usize,

    /// Rounds per producer
    #[arg(short, long, default_value_t = 10_000)]
    rounds: usize,

    /// Batch size for deferred tokens
    #[arg(short, long, default_value_t = 8)]
    batch: usize,

    /// Ingress capacity; small values exercise backpressure
    #[arg(long, default_value_t = 256)]
    ingress: usize,

    /// Initial token slots; small values exercise arena growth
    #[arg(long, default_value_t = 1024)]
    tokens: usize,

    /// Print metrics in Prometheus format when done
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Default)]
struct ProducerReport {
    submitted: u64,
    retired: u64,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    tracing::info!("Stress test");
    tracing::info!("  Workers: {}", args.workers);
    tracing::info!("  Rounds: {}", args.rounds);
    tracing::info!("  Batch: {}", args.batch);
    tracing::info!("  Ingress: {}  Tokens: {}", args.ingress, args.tokens);
    if std::env::var_os(env_vars::POLLING_FREQUENCY).is_some() {
        tracing::info!("  {} set in environment", env_vars::POLLING_FREQUENCY);
    }

    let builder = match Builder::from_env() {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    let device = Arc::new(SimDevice::with_auto_complete());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = match builder
        .ingress_capacity(args.ingress)
        .token_capacity(args.tokens)
        .fatal_policy(FatalPolicy::Panic)
        .build(device.clone(), bridge.clone())
    {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("failed to start engine: {}", e);
            std::process::exit(2);
        }
    };

    let reports = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..args.workers {
        let engine = engine.clone();
        let bridge = bridge.clone();
        let stream = device.default_stream();
        let reports = reports.clone();
        let rounds = args.rounds;
        let batch = args.batch;

        let handle = thread::Builder::new()
            .name(format!("producer-{}", i))
            .spawn(move || {
                let tracker = engine.tracker();
                let scope = bridge.enter_task();

                for round in 0..rounds {
                    match round % 3 {
                        0 => tracker.submit(stream),
                        1 => {
                            let mut slot = tracker.generate_request(stream, false);
                            tracker.wait_request_async(&mut slot);
                        }
                        _ => {
                            let mut slots: Vec<Option<CompletionToken>> = (0..batch)
                                .map(|j| (j % 4 != 1).then(|| tracker.defer(stream)))
                                .collect();
                            tracker.process_requests(&mut slots);
                        }
                    }
                }
                while !scope.wait_events(Duration::from_secs(1)) {
                    tracing::warn!(
                        "producer-{} waiting on {} events",
                        i,
                        scope.counter().pending()
                    );
                }

                reports.lock().push(ProducerReport {
                    submitted: scope.counter().total_increased(),
                    retired: scope.counter().total_decreased(),
                });
            })
            .expect("failed to spawn producer");
        handles.push(handle);
    }

    let mut failed = false;
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("producer panicked");
            failed = true;
        }
    }
    let elapsed = start.elapsed();
    engine.shutdown();

    let reports = reports.lock();
    let submitted: u64 = reports.iter().map(|r| r.submitted).sum();
    let retired: u64 = reports.iter().map(|r| r.retired).sum();
    let log = device.retirement_log();
    let unique: HashSet<u64> = log.iter().copied().collect();
    let stats = engine.stats();

    tracing::info!("=== Results ===");
    tracing::info!("Elapsed: {:?}", elapsed);
    tracing::info!("Submitted: {}  Retired: {}", submitted, retired);
    tracing::info!("Tokens/second: {:.0}", submitted as f64 / elapsed.as_secs_f64());
    tracing::info!("Poll cycles: {}", stats.cycles.load(Ordering::Relaxed));

    if submitted != retired {
        tracing::error!("lost completions: {} submitted, {} retired", submitted, retired);
        failed = true;
    }
    if unique.len() != log.len() || log.len() as u64 != submitted {
        tracing::error!(
            "retirement log has {} entries, {} unique, expected {}",
            log.len(),
            unique.len(),
            submitted
        );
        failed = true;
    }
    if device.stale_queries() > 0 {
        tracing::error!("{} queries on destroyed markers", device.stale_queries());
        failed = true;
    }

    if args.metrics {
        print!("{}", engine.metrics_text());
    }

    if failed {
        std::process::exit(1);
    }
    tracing::info!("Stress test passed");
}
