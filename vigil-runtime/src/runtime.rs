// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Engine builder and main entry point
//!
//! The Engine owns the token arena, the ingress channel and the polling
//! instance that retires completed tokens. It is built once the device is
//! initialized and shut down (explicitly or on drop) before the device goes
//! away.

use crate::bridge::SchedulerBridge;
use crate::device::Device;
use crate::error::{Error, FatalPolicy, Result};
use crate::metrics::{EngineMetrics, Gauges};
use crate::poller::{self, PollingHandle};
use crate::tracker::{self, Tracker, TrackerConfig, TrackerStats};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vigil_common::{config, env_vars, PollerState};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between two completion checks
    pub polling_frequency: Duration,

    /// Ingress ring capacity
    pub ingress_capacity: usize,

    /// Token slots allocated up front; the arena grows past this on demand
    pub token_capacity: usize,

    /// Name of the polling task
    pub poller_name: String,

    /// Reaction to device and bridge failures
    pub fatal_policy: FatalPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            polling_frequency: Duration::from_micros(config::DEFAULT_POLLING_FREQUENCY_US),
            ingress_capacity: config::DEFAULT_INGRESS_CAPACITY,
            token_capacity: config::DEFAULT_TOKEN_CAPACITY,
            poller_name: config::DEFAULT_POLLER_NAME.to_string(),
            fatal_policy: FatalPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the `VIGIL_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(us) = env_value::<u64>(env_vars::POLLING_FREQUENCY)? {
            config.polling_frequency = Duration::from_micros(us);
        }
        if let Some(n) = env_value::<usize>(env_vars::INGRESS_CAPACITY)? {
            config.ingress_capacity = n;
        }
        if let Some(n) = env_value::<usize>(env_vars::TOKEN_CAPACITY)? {
            config.token_capacity = n;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_frequency.is_zero() {
            return Err(Error::InvalidConfig("polling frequency must be nonzero".into()));
        }
        if self.ingress_capacity == 0 {
            return Err(Error::InvalidConfig("ingress capacity must be nonzero".into()));
        }
        if self.token_capacity == 0 || self.token_capacity > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "token capacity {} out of range",
                self.token_capacity
            )));
        }
        if self.poller_name.is_empty() {
            return Err(Error::InvalidConfig("poller name must not be empty".into()));
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::InvalidConfig(format!("{}: {}", name, e))),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: cannot parse {:?}", name, raw)))
}

/// Engine builder
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: EngineConfig,
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            config: EngineConfig::from_env()?,
        })
    }

    /// Set the pause between two completion checks
    pub fn polling_frequency(mut self, frequency: Duration) -> Self {
        self.config.polling_frequency = frequency;
        self
    }

    /// Set the ingress ring capacity
    pub fn ingress_capacity(mut self, n: usize) -> Self {
        self.config.ingress_capacity = n;
        self
    }

    /// Set the initial number of token slots
    pub fn token_capacity(mut self, n: usize) -> Self {
        self.config.token_capacity = n;
        self
    }

    /// Set the polling task name
    pub fn poller_name(mut self, name: impl Into<String>) -> Self {
        self.config.poller_name = name.into();
        self
    }

    /// Set how device and bridge failures are handled
    ///
    /// - `Abort`: log and abort the process (default)
    /// - `Panic`: log and panic the failing thread
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.config.fatal_policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the engine and start its polling task
    pub fn build<D, S>(self, device: Arc<D>, bridge: Arc<S>) -> Result<Engine<D, S>>
    where
        D: Device,
        S: SchedulerBridge,
    {
        Engine::start(self.config, device, bridge)
    }
}

/// Completion tracking engine
///
/// Producers call into [`Engine::tracker`]; a background polling task
/// retires completed tokens.
pub struct Engine<D: Device, S: SchedulerBridge> {
    config: EngineConfig,
    tracker: Tracker<D, S>,
    poller: Mutex<Option<PollingHandle<S>>>,
    metrics: Arc<EngineMetrics>,
    running: AtomicBool,
}

impl<D: Device, S: SchedulerBridge> Engine<D, S> {
    fn start(config: EngineConfig, device: Arc<D>, bridge: Arc<S>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let (tracker, mut retirer) = tracker::split(
            device,
            bridge.clone(),
            TrackerConfig {
                token_capacity: config.token_capacity,
                ingress_capacity: config.ingress_capacity,
                fatal: config.fatal_policy,
            },
            metrics.clone(),
        );

        let handle = poller::register(
            &bridge,
            &config.poller_name,
            config.polling_frequency,
            config.fatal_policy,
            move || {
                retirer.check_completions();
            },
        );

        info!(
            "vigil engine started: {} initial token slots, ingress {}, polling every {:?}",
            config.token_capacity, config.ingress_capacity, config.polling_frequency
        );

        Ok(Self {
            config,
            tracker,
            poller: Mutex::new(Some(handle)),
            metrics,
            running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Producer interface
    pub fn tracker(&self) -> &Tracker<D, S> {
        &self.tracker
    }

    pub fn stats(&self) -> &Arc<TrackerStats> {
        self.tracker.stats()
    }

    /// Current state of the polling task
    pub fn poller_state(&self) -> PollerState {
        match self.poller.lock().as_ref() {
            Some(handle) => handle.instance().state(),
            None => PollerState::Stopped,
        }
    }

    /// Metrics in Prometheus text format
    pub fn metrics_text(&self) -> String {
        self.metrics.render(
            self.tracker.stats(),
            self.tracker.ingress_stats(),
            Gauges {
                tokens_in_use: self.tracker.tokens_in_use(),
                token_capacity: self.tracker.token_capacity(),
            },
        )
    }

    /// Whether the engine accepts work and its polling task is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.poller_state() == PollerState::Registered
    }

    /// Stop the polling task
    ///
    /// Blocks until the polling task has exited; no completion is retired
    /// afterwards. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.poller.lock().take() {
            handle.unregister();
        }

        let in_use = self.tracker.tokens_in_use();
        if in_use > 0 {
            warn!("{} completion tokens never retired", in_use);
        }
        let stats = self.tracker.stats();
        info!(
            "vigil engine shutdown complete: {} submitted, {} retired",
            stats.submitted.load(Ordering::Relaxed),
            stats.retired.load(Ordering::Relaxed)
        );
    }
}

impl<D: Device, S: SchedulerBridge> Drop for Engine<D, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimOp};
    use crate::worker::ThreadBridge;

    #[test]
    fn test_builder() {
        let builder = Builder::new()
            .polling_frequency(Duration::from_micros(50))
            .ingress_capacity(128)
            .token_capacity(256)
            .poller_name("vigil-test")
            .fatal_policy(FatalPolicy::Panic);

        let config = builder.config();
        assert_eq!(config.polling_frequency, Duration::from_micros(50));
        assert_eq!(config.ingress_capacity, 128);
        assert_eq!(config.token_capacity, 256);
        assert_eq!(config.poller_name, "vigil-test");
        assert_eq!(config.fatal_policy, FatalPolicy::Panic);
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.polling_frequency, Duration::from_micros(500));
        assert_eq!(config.ingress_capacity, 63 * 1024);
        assert_eq!(config.token_capacity, 64 * 1024);
        assert_eq!(config.poller_name, "vigil");
        assert_eq!(config.fatal_policy, FatalPolicy::Abort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let zero_freq = Builder::new().polling_frequency(Duration::ZERO);
        assert!(zero_freq.config().validate().is_err());
        assert!(Builder::new().ingress_capacity(0).config().validate().is_err());
        assert!(Builder::new().token_capacity(0).config().validate().is_err());
        assert!(Builder::new().poller_name("").config().validate().is_err());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value::<u64>("X", " 250 ").unwrap(), 250);
        assert!(matches!(
            parse_value::<usize>("X", "lots"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let device = Arc::new(SimDevice::new());
        let bridge = Arc::new(ThreadBridge::new());
        let result = Builder::new().token_capacity(0).build(device, bridge.clone());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert_eq!(bridge.spawned(), 0);
    }

    #[test]
    fn test_engine_lifecycle() {
        let device = Arc::new(SimDevice::with_auto_complete());
        let bridge = Arc::new(ThreadBridge::new());
        let engine = Builder::new()
            .polling_frequency(Duration::from_micros(100))
            .token_capacity(64)
            .ingress_capacity(64)
            .fatal_policy(FatalPolicy::Panic)
            .build(device.clone(), bridge.clone())
            .unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.poller_state(), PollerState::Registered);

        {
            let scope = bridge.enter_task();
            for _ in 0..10 {
                engine.tracker().submit(device.default_stream());
            }
            assert!(scope.wait_events(Duration::from_secs(10)));
        }

        let text = engine.metrics_text();
        assert!(text.contains("vigil_tokens_submitted_total 10\n"));

        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_running());
        assert_eq!(engine.poller_state(), PollerState::Stopped);
        assert_eq!(engine.stats().retired.load(Ordering::Relaxed), 10);
        assert_eq!(device.live_markers(), 0);
    }

    #[test]
    fn test_engine_reports_dead_poller() {
        let device = Arc::new(SimDevice::new());
        let bridge = Arc::new(ThreadBridge::new());
        let engine = Builder::new()
            .polling_frequency(Duration::from_micros(100))
            .token_capacity(8)
            .ingress_capacity(8)
            .fatal_policy(FatalPolicy::Panic)
            .build(device.clone(), bridge.clone())
            .unwrap();

        {
            let scope = bridge.enter_task();
            device.fail_next(SimOp::QueryMarker, 700);
            engine.tracker().submit(device.default_stream());
            // The poller dies before retiring; settle the counter by hand
            bridge.decrease_events(scope.handle(), 1).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while engine.poller_state() != PollerState::Stopped {
            assert!(std::time::Instant::now() < deadline, "poller did not stop");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!engine.is_running());
        engine.shutdown();
        assert_eq!(engine.poller_state(), PollerState::Stopped);
    }
}
