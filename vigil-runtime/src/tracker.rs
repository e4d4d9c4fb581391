// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Completion tracking
//!
//! The engine is split in two halves:
//!
//! - [`Tracker`]: shared by every producer. Creates tokens, binds them to the
//!   calling task, and pushes them into the ingress channel.
//! - [`Retirer`]: owned by the polling task. Drains the ingress channel into
//!   the pending set and retires completed tokens.
//!
//! The ordering on the producer side is: bind, increase the task's event
//! counter, then push. The poller can therefore never decrement a counter
//! before the matching increment.
//!
//! On the poller side a completed token is retired as: decrement the bound
//! counter, destroy the marker, recycle the slot. A slot is only reused
//! after both.

use crate::bridge::{SchedulerBridge, TaskHandle};
use crate::device::Device;
use crate::error::{Error, FatalPolicy};
use crate::ingress::{self, IngressChannel, IngressDrain, IngressStats};
use crate::metrics::EngineMetrics;
use crate::pending::PendingSet;
use crate::token::{CompletionToken, TokenArena, TokenBody, TokenId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use vigil_common::{MarkerStatus, TokenState};

/// Tracker statistics
#[derive(Debug, Default)]
pub struct TrackerStats {
    /// Tokens created
    pub generated: AtomicU64,
    /// Tokens bound and pushed into ingress
    pub submitted: AtomicU64,
    /// Tokens moved from ingress to the pending set
    pub drained: AtomicU64,
    /// Tokens whose completion was observed and retired
    pub retired: AtomicU64,
    /// Completion checks performed
    pub cycles: AtomicU64,
    /// Tokens currently in the pending set
    pub pending: AtomicU64,
}

/// Sizing of the tracker's resources
///
/// `token_capacity` is the initial number of token slots; the arena grows
/// past it on demand.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub token_capacity: usize,
    pub ingress_capacity: usize,
    pub fatal: FatalPolicy,
}

/// Outcome of one [`Retirer::check_completions`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tokens moved from ingress into the pending set
    pub drained: usize,
    /// Tokens found complete and retired
    pub retired: usize,
    /// Tokens still pending afterwards
    pub pending: usize,
}

/// Build the producer and poller halves over one arena and ingress channel
pub fn split<D, S>(
    device: Arc<D>,
    bridge: Arc<S>,
    config: TrackerConfig,
    metrics: Arc<EngineMetrics>,
) -> (Tracker<D, S>, Retirer<D, S>)
where
    D: Device,
    S: SchedulerBridge,
{
    let arena = Arc::new(TokenArena::new(config.token_capacity));
    let (ingress, drain) = ingress::channel(config.ingress_capacity);
    let stats = Arc::new(TrackerStats::default());

    let tracker = Tracker {
        device: device.clone(),
        bridge: bridge.clone(),
        arena: arena.clone(),
        ingress,
        stats: stats.clone(),
        fatal: config.fatal,
    };
    let retirer = Retirer {
        device,
        bridge,
        arena,
        drain,
        pending: PendingSet::with_capacity(config.ingress_capacity.min(config.token_capacity)),
        stats,
        metrics,
        fatal: config.fatal,
    };
    (tracker, retirer)
}

/// Producer half of the engine
pub struct Tracker<D: Device, S: SchedulerBridge> {
    device: Arc<D>,
    bridge: Arc<S>,
    arena: Arc<TokenArena<D>>,
    ingress: IngressChannel<TokenId>,
    stats: Arc<TrackerStats>,
    fatal: FatalPolicy,
}

impl<D: Device, S: SchedulerBridge> Tracker<D, S> {
    /// Create a token waiting for the work currently queued on `stream`
    ///
    /// With `bind`, the token is bound to the calling task and submitted
    /// immediately; nothing is returned and the task's counter covers it.
    /// Without `bind`, the armed token is handed to the caller, who decides
    /// later whether to track it via [`Tracker::process_request`] or
    /// [`Tracker::process_requests`].
    pub fn generate_request(&self, stream: D::Stream, bind: bool) -> Option<CompletionToken> {
        let id = self.arm(stream);
        if bind {
            let task = self.fatal.bridge("current_task", self.bridge.current_task());
            self.bind(id, task);
            self.fatal
                .bridge("increase_events", self.bridge.increase_events(task, 1));
            self.submit_one(id);
            None
        } else {
            Some(CompletionToken::new(id, self.arena.id()))
        }
    }

    /// Track completion of the work queued on `stream` for the calling task
    pub fn submit(&self, stream: D::Stream) {
        let token = self.generate_request(stream, true);
        debug_assert!(token.is_none());
    }

    /// Arm a token on `stream` and hand it back unbound
    pub fn defer(&self, stream: D::Stream) -> CompletionToken {
        let id = self.arm(stream);
        CompletionToken::new(id, self.arena.id())
    }

    /// Follow-up for a forwarded operation that just succeeded on `stream`
    ///
    /// Binds immediately when the caller did not ask for a token, otherwise
    /// returns the unbound token.
    pub fn track(&self, stream: D::Stream, want_token: bool) -> Option<CompletionToken> {
        self.generate_request(stream, !want_token)
    }

    /// Wait asynchronously for all work queued on `stream` so far
    pub fn synchronize_stream_async(&self, stream: D::Stream) {
        self.submit(stream);
    }

    /// Bind an unbound token to the calling task and submit it
    ///
    /// The token must come from this tracker; any other token is fatal.
    pub fn process_request(&self, token: CompletionToken) {
        let id = self.claim(token);
        let task = self.fatal.bridge("current_task", self.bridge.current_task());
        self.bind(id, task);
        self.fatal
            .bridge("increase_events", self.bridge.increase_events(task, 1));
        self.submit_one(id);
    }

    /// Process the token in `slot`, if any, and clear the slot
    pub fn wait_request_async(&self, slot: &mut Option<CompletionToken>) {
        if let Some(token) = slot.take() {
            self.process_request(token);
        }
    }

    /// Bind every token in `tokens` to the calling task and submit them
    ///
    /// Empty slots are skipped; every slot is `None` afterwards. The task's
    /// counter is increased once for all non-empty slots, and they are
    /// pushed as a single batch.
    pub fn process_requests(&self, tokens: &mut [Option<CompletionToken>]) {
        if tokens.iter().all(Option::is_none) {
            return;
        }
        let ids: Vec<TokenId> = tokens
            .iter_mut()
            .filter_map(Option::take)
            .map(|token| self.claim(token))
            .collect();

        let task = self.fatal.bridge("current_task", self.bridge.current_task());
        for &id in &ids {
            self.bind(id, task);
        }
        self.fatal.bridge(
            "increase_events",
            self.bridge.increase_events(task, ids.len() as u64),
        );

        for &id in &ids {
            self.expect(id, TokenState::Armed, TokenState::Submitted);
        }
        self.ingress.push_batch(&ids);
        self.stats
            .submitted
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &Arc<TrackerStats> {
        &self.stats
    }

    pub fn ingress_stats(&self) -> &Arc<IngressStats> {
        self.ingress.stats()
    }

    /// Slots backing live tokens
    pub fn tokens_in_use(&self) -> usize {
        self.arena.in_use()
    }

    /// Slots allocated so far, free or not
    pub fn token_capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Create and arm a marker and place it in a slot
    fn arm(&self, stream: D::Stream) -> TokenId {
        let marker = self
            .fatal
            .device("create_marker", self.device.create_marker());
        self.fatal
            .device("arm_marker", self.device.arm_marker(&marker, stream));

        let body = TokenBody {
            marker,
            stream,
            bound: None,
        };
        let id = match self.arena.allocate(body) {
            Ok(id) => id,
            Err(_) => self
                .fatal
                .fail(Error::ArenaExhausted(self.arena.capacity())),
        };
        self.stats.generated.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Check that `token` was issued here and take its id
    fn claim(&self, token: CompletionToken) -> TokenId {
        if token.arena() != self.arena.id() {
            self.fatal.fail(Error::ForeignToken(token.id()));
        }
        token.into_id()
    }

    fn bind(&self, id: TokenId, task: TaskHandle) {
        if !self.arena.bind(id, task) {
            self.fatal
                .fail(ownership_error(&self.arena, id, TokenState::Armed));
        }
    }

    fn expect(&self, id: TokenId, from: TokenState, to: TokenState) {
        if !self.arena.transition(id, from, to) {
            self.fatal.fail(ownership_error(&self.arena, id, from));
        }
    }

    fn submit_one(&self, id: TokenId) {
        self.expect(id, TokenState::Armed, TokenState::Submitted);
        self.ingress.push(id);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Poller half of the engine
pub struct Retirer<D: Device, S: SchedulerBridge> {
    device: Arc<D>,
    bridge: Arc<S>,
    arena: Arc<TokenArena<D>>,
    drain: IngressDrain<TokenId>,
    pending: PendingSet,
    stats: Arc<TrackerStats>,
    metrics: Arc<EngineMetrics>,
    fatal: FatalPolicy,
}

impl<D: Device, S: SchedulerBridge> Retirer<D, S> {
    /// Drain new tokens and retire those whose work has completed
    ///
    /// Never blocks on the device: each pending token gets one
    /// non-blocking query per call.
    pub fn check_completions(&mut self) -> CycleReport {
        let started = Instant::now();
        let Self {
            device,
            bridge,
            arena,
            drain,
            pending,
            stats,
            fatal,
            ..
        } = self;
        let fatal = *fatal;
        let arena: &TokenArena<D> = arena;

        let drained = drain.drain(|id| {
            if !arena.transition(id, TokenState::Submitted, TokenState::Pending) {
                fatal.fail(ownership_error(arena, id, TokenState::Submitted));
            }
            pending.insert(id);
        });

        let retired = pending.retain(|id| {
            let Some(body) = arena.pending_body(id) else {
                fatal.fail(ownership_error(arena, id, TokenState::Pending));
            };
            match fatal.device("query_marker", device.query_marker(&body.marker)) {
                MarkerStatus::NotReady => true,
                MarkerStatus::Ready => {
                    let Some(body) = arena.take(id) else {
                        fatal.fail(ownership_error(arena, id, TokenState::Pending));
                    };
                    match body.bound {
                        Some(task) => {
                            fatal.bridge("decrease_events", bridge.decrease_events(task, 1))
                        }
                        None => warn!("{} on {:?} completed without a bound task", id, body.stream),
                    }
                    fatal.device("destroy_marker", device.destroy_marker(body.marker));
                    if !arena.recycle(id) {
                        fatal.fail(ownership_error(arena, id, TokenState::Pending));
                    }
                    false
                }
            }
        });

        stats.cycles.fetch_add(1, Ordering::Relaxed);
        stats.drained.fetch_add(drained as u64, Ordering::Relaxed);
        stats.retired.fetch_add(retired as u64, Ordering::Relaxed);
        stats.pending.store(pending.len() as u64, Ordering::Relaxed);
        self.metrics
            .record_cycle(started.elapsed().as_nanos() as u64);

        CycleReport {
            drained,
            retired,
            pending: self.pending.len(),
        }
    }

    /// Tokens drained but not yet complete
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &Arc<TrackerStats> {
        &self.stats
    }
}

impl<D: Device, S: SchedulerBridge> Drop for Retirer<D, S> {
    fn drop(&mut self) {
        let in_flight = self.pending.len() + self.drain.len();
        if in_flight == 0 {
            return;
        }
        warn!("{} tracked operations still in flight at teardown", in_flight);
        for id in self.pending.iter() {
            if let Some(body) = self.arena.pending_body(id) {
                info!("  {} still pending on {:?}", id, body.stream);
            }
        }
    }
}

fn ownership_error<D: Device>(arena: &TokenArena<D>, id: TokenId, expected: TokenState) -> Error {
    Error::TokenOwnership {
        id,
        found: arena.state(id),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimOp};
    use crate::worker::ThreadBridge;

    fn setup(
        token_capacity: usize,
    ) -> (
        Arc<SimDevice>,
        Arc<ThreadBridge>,
        Tracker<SimDevice, ThreadBridge>,
        Retirer<SimDevice, ThreadBridge>,
    ) {
        let device = Arc::new(SimDevice::new());
        let bridge = Arc::new(ThreadBridge::new());
        let config = TrackerConfig {
            token_capacity,
            ingress_capacity: 64,
            fatal: FatalPolicy::Panic,
        };
        let (tracker, retirer) = split(
            device.clone(),
            bridge.clone(),
            config,
            Arc::new(EngineMetrics::new()),
        );
        (device, bridge, tracker, retirer)
    }

    #[test]
    fn test_bound_request_retires_after_completion() {
        let (device, bridge, tracker, mut retirer) = setup(16);
        let scope = bridge.enter_task();
        let stream = device.default_stream();

        assert!(tracker.generate_request(stream, true).is_none());
        assert_eq!(scope.counter().pending(), 1);

        let report = retirer.check_completions();
        assert_eq!(report, CycleReport { drained: 1, retired: 0, pending: 1 });

        device.complete_all();
        let report = retirer.check_completions();
        assert_eq!(report, CycleReport { drained: 0, retired: 1, pending: 0 });
        assert!(scope.counter().is_drained());
        assert_eq!(device.live_markers(), 0);
        assert_eq!(tracker.tokens_in_use(), 0);
    }

    #[test]
    fn test_unbound_request_is_not_tracked() {
        let (device, bridge, tracker, mut retirer) = setup(16);
        let scope = bridge.enter_task();

        let token = tracker
            .generate_request(device.default_stream(), false)
            .expect("unbound request returns its token");
        assert_eq!(scope.counter().pending(), 0);
        assert_eq!(retirer.check_completions().drained, 0);

        tracker.process_request(token);
        assert_eq!(scope.counter().pending(), 1);
        device.complete_all();
        retirer.check_completions();
        assert!(scope.counter().is_drained());
    }

    #[test]
    fn test_process_requests_skips_empty_slots() {
        let (device, bridge, tracker, mut retirer) = setup(16);
        let scope = bridge.enter_task();
        let stream = device.default_stream();

        let mut slots: Vec<Option<CompletionToken>> = (0..5)
            .map(|i| (i % 2 == 0).then(|| tracker.defer(stream)))
            .collect();
        tracker.process_requests(&mut slots);

        assert!(slots.iter().all(Option::is_none));
        assert_eq!(scope.counter().total_increased(), 3);
        assert_eq!(tracker.stats().submitted.load(Ordering::Relaxed), 3);
        assert_eq!(tracker.ingress_stats().pushed.load(Ordering::Relaxed), 3);

        device.complete_all();
        let report = retirer.check_completions();
        assert_eq!(report.drained, 3);
        assert_eq!(report.retired, 3);
        assert!(scope.counter().is_drained());
    }

    #[test]
    fn test_process_requests_empty_is_noop() {
        let (_device, bridge, tracker, _retirer) = setup(4);
        // No task scope: an empty batch must not even ask for the current task
        tracker.process_requests(&mut []);
        assert_eq!(bridge.spawned(), 0);
        assert_eq!(tracker.stats().submitted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wait_request_async_clears_slot() {
        let (device, bridge, tracker, mut retirer) = setup(4);
        let scope = bridge.enter_task();

        let mut slot = Some(tracker.defer(device.default_stream()));
        tracker.wait_request_async(&mut slot);
        assert!(slot.is_none());
        tracker.wait_request_async(&mut slot);
        assert_eq!(scope.counter().total_increased(), 1);

        device.complete_all();
        retirer.check_completions();
    }

    #[test]
    fn test_out_of_order_retirement() {
        let (device, bridge, tracker, mut retirer) = setup(16);
        let scope = bridge.enter_task();
        let slow = device.create_stream().unwrap();
        let fast = device.default_stream();

        tracker.submit(slow);
        tracker.submit(fast);
        device.complete(fast, 1);

        let report = retirer.check_completions();
        assert_eq!(report.retired, 1);
        assert_eq!(scope.counter().pending(), 1);

        device.complete(slow, 1);
        retirer.check_completions();
        assert!(scope.counter().is_drained());
    }

    #[test]
    fn test_slots_are_reused() {
        let (device, bridge, tracker, mut retirer) = setup(2);
        let _scope = bridge.enter_task();
        device.set_auto_complete(true);

        for _ in 0..10 {
            tracker.submit(device.default_stream());
            tracker.submit(device.default_stream());
            assert_eq!(retirer.check_completions().retired, 2);
        }
        assert_eq!(device.markers_created(), 20);
        assert_eq!(device.stale_queries(), 0);
        assert_eq!(tracker.tokens_in_use(), 0);
        assert_eq!(tracker.token_capacity(), 2);
    }

    #[test]
    fn test_deferred_batch_larger_than_arena() {
        let (device, bridge, tracker, mut retirer) = setup(2);
        let scope = bridge.enter_task();
        let stream = device.default_stream();

        let mut slots: Vec<Option<CompletionToken>> =
            (0..10).map(|_| Some(tracker.defer(stream))).collect();
        assert_eq!(tracker.tokens_in_use(), 10);
        assert!(tracker.token_capacity() >= 10);

        tracker.process_requests(&mut slots);
        assert_eq!(scope.counter().pending(), 10);

        device.complete_all();
        let report = retirer.check_completions();
        assert_eq!(report.retired, 10);
        assert!(scope.counter().is_drained());
        assert_eq!(tracker.tokens_in_use(), 0);
        assert_eq!(device.live_markers(), 0);
    }

    #[test]
    fn test_retirer_drop_reports_pending_streams() {
        let (device, bridge, tracker, mut retirer) = setup(4);
        let scope = bridge.enter_task();
        let stream = device.create_stream().unwrap();

        tracker.submit(stream);
        retirer.check_completions();
        let id = retirer.pending.iter().next().unwrap();
        assert_eq!(retirer.arena.pending_body(id).unwrap().stream, stream);

        drop(retirer);
        bridge.decrease_events(scope.handle(), 1).unwrap();
        assert_eq!(tracker.tokens_in_use(), 1);
    }

    #[test]
    #[should_panic(expected = "query_marker")]
    fn test_query_failure_is_fatal() {
        let (device, bridge, tracker, mut retirer) = setup(4);
        let scope = bridge.enter_task();
        tracker.submit(device.default_stream());
        // Balance the counter so the scope can close while unwinding
        bridge.decrease_events(scope.handle(), 1).unwrap();
        device.fail_next(SimOp::QueryMarker, 700);
        retirer.check_completions();
    }

    #[test]
    #[should_panic(expected = "issued by another engine")]
    fn test_foreign_token_is_fatal() {
        let (device, bridge, tracker, _retirer) = setup(4);
        let (_other_device, _other_bridge, other, _other_retirer) = setup(4);
        let _scope = bridge.enter_task();
        let token = other.defer(device.default_stream());
        tracker.process_request(token);
    }

    #[test]
    #[should_panic(expected = "issued by another engine")]
    fn test_foreign_token_in_batch_is_fatal() {
        let (device, bridge, tracker, _retirer) = setup(4);
        let (_other_device, _other_bridge, other, _other_retirer) = setup(4);
        let _scope = bridge.enter_task();
        let stream = device.default_stream();
        let mut slots = vec![Some(tracker.defer(stream)), Some(other.defer(stream))];
        // Rejected before the task's counter is raised
        tracker.process_requests(&mut slots);
    }

    #[test]
    #[should_panic(expected = "current_task")]
    fn test_bind_outside_task_is_fatal() {
        let (device, _bridge, tracker, _retirer) = setup(4);
        tracker.submit(device.default_stream());
    }
}
