// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Integration tests for the Vigil runtime
//!
//! These drive the engine end to end against the simulated device, with OS
//! threads standing in for cooperative tasks.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use vigil_runtime::metrics::EngineMetrics;
use vigil_runtime::sim::SimDevice;
use vigil_runtime::tracker::{self, TrackerConfig};
use vigil_runtime::{
    Builder, CompletionToken, Engine, FatalPolicy, PollerState, StreamPool, ThreadBridge,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn engine(device: &Arc<SimDevice>, bridge: &Arc<ThreadBridge>) -> Engine<SimDevice, ThreadBridge> {
    Builder::new()
        .polling_frequency(Duration::from_micros(50))
        .token_capacity(4096)
        .ingress_capacity(1024)
        .fatal_policy(FatalPolicy::Panic)
        .build(device.clone(), bridge.clone())
        .expect("engine builds")
}

/// One producer submits 1000 bound tokens; its counter returns to baseline
#[test]
fn test_sequential_producer_returns_to_baseline() {
    let device = Arc::new(SimDevice::new());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = engine(&device, &bridge);
    let stream = device.default_stream();

    let scope = bridge.enter_task();
    let baseline = scope.counter().pending();
    for _ in 0..1000 {
        engine.tracker().submit(stream);
    }
    assert_eq!(scope.counter().pending(), baseline + 1000);

    device.complete_all();
    assert!(scope.wait_events(DRAIN_TIMEOUT), "counter never drained");
    assert_eq!(scope.counter().pending(), baseline);
    assert_eq!(scope.counter().total_decreased(), 1000);
    drop(scope);

    engine.shutdown();
    let stats = engine.stats();
    assert_eq!(stats.retired.load(Ordering::Relaxed), 1000);
    assert_eq!(stats.pending.load(Ordering::Relaxed), 0);
    assert_eq!(device.stale_queries(), 0);
    assert_eq!(device.live_markers(), 0);
}

/// A batch of five slots with two empty ones binds exactly three tokens
#[test]
fn test_batch_with_empty_slots() {
    let device = Arc::new(SimDevice::new());
    let bridge = Arc::new(ThreadBridge::new());
    let (tracker, mut retirer) = tracker::split(
        device.clone(),
        bridge.clone(),
        TrackerConfig {
            token_capacity: 16,
            ingress_capacity: 16,
            fatal: FatalPolicy::Panic,
        },
        Arc::new(EngineMetrics::new()),
    );
    let stream = device.default_stream();

    let scope = bridge.enter_task();
    let mut slots: [Option<CompletionToken>; 5] = [
        tracker.generate_request(stream, false),
        None,
        tracker.generate_request(stream, false),
        None,
        tracker.generate_request(stream, false),
    ];
    tracker.process_requests(&mut slots);

    assert_eq!(scope.counter().total_increased(), 3);
    assert_eq!(tracker.ingress_stats().pushed.load(Ordering::Relaxed), 3);
    assert!(slots.iter().all(Option::is_none));

    let report = retirer.check_completions();
    assert_eq!(report.drained, 3);
    assert_eq!(report.pending, 3);

    device.complete_all();
    assert_eq!(retirer.check_completions().retired, 3);
    assert!(scope.counter().is_drained());
}

/// Two concurrent producers of 500 tokens each; every token retires once
#[test]
fn test_concurrent_producers_retire_exactly_once() {
    let device = Arc::new(SimDevice::with_auto_complete());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = Arc::new(engine(&device, &bridge));

    let producers: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let bridge = bridge.clone();
            let stream = device.default_stream();
            thread::spawn(move || {
                let scope = bridge.enter_task();
                for _ in 0..500 {
                    engine.tracker().submit(stream);
                }
                assert!(scope.wait_events(DRAIN_TIMEOUT));
                scope.counter().total_decreased()
            })
        })
        .collect();

    let decreased: u64 = producers.into_iter().map(|p| p.join().unwrap()).sum();
    assert_eq!(decreased, 1000);

    engine.shutdown();
    let log = device.retirement_log();
    assert_eq!(log.len(), 1000);
    let unique: HashSet<u64> = log.iter().copied().collect();
    assert_eq!(unique.len(), 1000, "a marker was retired twice");
    assert_eq!(device.markers_created(), 1000);
    assert_eq!(device.stale_queries(), 0);
}

/// Everything pushed into ingress is drained, single and batch alike
#[test]
fn test_ingress_conservation() {
    let device = Arc::new(SimDevice::with_auto_complete());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = engine(&device, &bridge);
    let tracker = engine.tracker();
    let stream = device.default_stream();

    let scope = bridge.enter_task();
    for round in 0..20 {
        tracker.submit(stream);
        let mut slots: Vec<Option<CompletionToken>> = (0..8)
            .map(|i| (i % 3 != round % 3).then(|| tracker.defer(stream)))
            .collect();
        tracker.process_requests(&mut slots);
    }
    assert!(scope.wait_events(DRAIN_TIMEOUT));
    let submitted = scope.counter().total_increased();
    drop(scope);
    engine.shutdown();

    let ingress = tracker.ingress_stats();
    assert_eq!(ingress.pushed.load(Ordering::Relaxed), submitted);
    assert_eq!(ingress.drained.load(Ordering::Relaxed), submitted);
    assert_eq!(engine.stats().drained.load(Ordering::Relaxed), submitted);
    assert_eq!(engine.stats().retired.load(Ordering::Relaxed), submitted);
}

/// After shutdown the polling function is never called again
#[test]
fn test_no_polling_after_shutdown() {
    let device = Arc::new(SimDevice::new());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = engine(&device, &bridge);

    thread::sleep(Duration::from_millis(5));
    engine.shutdown();
    assert_eq!(engine.poller_state(), PollerState::Stopped);

    let cycles = engine.stats().cycles.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(10));
    assert_eq!(engine.stats().cycles.load(Ordering::Relaxed), cycles);
    assert_eq!(bridge.spawned(), 1);
}

/// Producers on separate streams each wait only for their own work
#[test]
fn test_stream_pool_producers() {
    let device = Arc::new(SimDevice::new());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = Arc::new(engine(&device, &bridge));
    let pool = Arc::new(StreamPool::new(device.clone(), 4).unwrap());

    let producers: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            let bridge = bridge.clone();
            let device = device.clone();
            let pool = pool.clone();
            thread::spawn(move || {
                let scope = bridge.enter_task();
                let stream = pool.get(i).unwrap();
                for _ in 0..50 {
                    engine.tracker().synchronize_stream_async(stream);
                }
                assert_eq!(scope.counter().pending(), 50);

                device.complete(stream, 50);
                assert!(scope.wait_events(DRAIN_TIMEOUT));
                scope.counter().total_decreased()
            })
        })
        .collect();

    for producer in producers {
        assert_eq!(producer.join().unwrap(), 50);
    }
    engine.shutdown();
    assert_eq!(device.retirement_log().len(), 200);
    assert_eq!(device.stale_queries(), 0);
}

/// Producers holding more deferred tokens than the initial arena never wait
#[test]
fn test_deferred_tokens_beyond_initial_capacity() {
    let device = Arc::new(SimDevice::with_auto_complete());
    let bridge = Arc::new(ThreadBridge::new());
    let engine = Arc::new(
        Builder::new()
            .polling_frequency(Duration::from_micros(50))
            .token_capacity(4)
            .ingress_capacity(16)
            .fatal_policy(FatalPolicy::Panic)
            .build(device.clone(), bridge.clone())
            .expect("engine builds"),
    );
    let barrier = Arc::new(Barrier::new(2));
    let (done_tx, done_rx) = mpsc::channel();

    for _ in 0..2 {
        let engine = engine.clone();
        let bridge = bridge.clone();
        let barrier = barrier.clone();
        let done = done_tx.clone();
        let stream = device.default_stream();
        thread::spawn(move || {
            let scope = bridge.enter_task();
            let tracker = engine.tracker();
            let mut slots: Vec<Option<CompletionToken>> =
                (0..2).map(|_| Some(tracker.defer(stream))).collect();
            // Both producers now hold the whole initial arena
            barrier.wait();
            slots.push(Some(tracker.defer(stream)));
            tracker.process_requests(&mut slots);
            assert!(scope.wait_events(DRAIN_TIMEOUT));
            done.send(scope.counter().total_decreased()).unwrap();
        });
    }
    drop(done_tx);

    for _ in 0..2 {
        let retired = done_rx
            .recv_timeout(DRAIN_TIMEOUT)
            .expect("producer finished");
        assert_eq!(retired, 3);
    }
    assert_eq!(engine.stats().generated.load(Ordering::Relaxed), 6);
    assert!(engine.metrics_text().contains("vigil_token_capacity 12\n"));
    engine.shutdown();
    assert_eq!(device.live_markers(), 0);
}
