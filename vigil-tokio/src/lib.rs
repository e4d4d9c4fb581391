// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Vigil Tokio Integration
//!
//! A [`SchedulerBridge`] for Tokio, so async code can track device work
//! with the Vigil engine.
//!
//! ## Features
//!
//! - **Task scopes**: [`TokioBridge::scope`] runs a future as a tracked task
//!   and only completes once every event bound to it has been retired
//! - **Event waits**: [`TokioBridge::wait_events`] awaits the current task's
//!   outstanding events mid-flight
//! - **Background polling**: the engine's poller runs on Tokio's blocking pool
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil_runtime::{sim::SimDevice, Builder};
//! use vigil_tokio::TokioBridge;
//!
//! #[tokio::main]
//! async fn main() {
//!     let device = Arc::new(SimDevice::new());
//!     let bridge = Arc::new(TokioBridge::current().unwrap());
//!     let engine = Builder::new().build(device.clone(), bridge.clone()).unwrap();
//!
//!     bridge
//!         .scope(async {
//!             // ... queue device work ...
//!             engine.tracker().submit(device.default_stream());
//!         })
//!         .await;
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;
use vigil_common::codes;
use vigil_runtime::bridge::BackgroundFn;
use vigil_runtime::counter::{CounterRegistry, EventCounter};
use vigil_runtime::worker;

pub use vigil_runtime::{BridgeError, Error, Result, SchedulerBridge, TaskHandle};

tokio::task_local! {
    /// The tracked task the current future belongs to
    static CURRENT_TASK: TaskHandle;
}

/// Scheduler bridge backed by a Tokio runtime
#[derive(Debug)]
pub struct TokioBridge {
    handle: Handle,
    registry: Arc<CounterRegistry>,
    check_interval: Duration,
    spawned: AtomicU64,
}

impl TokioBridge {
    /// Bridge to the runtime the caller is running on
    pub fn current() -> std::result::Result<Self, BridgeError> {
        TokioBridgeBuilder::new().build()
    }

    /// Bridge to the runtime behind `handle`
    pub fn new(handle: Handle) -> Self {
        TokioBridgeBuilder::new().build_with(handle)
    }

    /// Run `future` as a tracked task
    ///
    /// Tokens bound while the future runs count against this task. Once the
    /// future has finished, this keeps waiting until every one of them has
    /// been retired.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        let (task, counter) = self.registry.register();
        let output = CURRENT_TASK.scope(task, future).await;
        self.drain(&counter).await;
        self.registry.unregister(task);
        output
    }

    /// Wait until the current task has no outstanding events
    ///
    /// Returns immediately outside of [`TokioBridge::scope`].
    pub async fn wait_events(&self) {
        let Ok(task) = CURRENT_TASK.try_with(|t| *t) else {
            return;
        };
        if let Some(counter) = self.registry.get(task) {
            self.drain(&counter).await;
        }
    }

    /// Counter of a tracked task
    pub fn counter(&self, task: TaskHandle) -> Option<Arc<EventCounter>> {
        self.registry.get(task)
    }

    /// Background tasks spawned so far
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    async fn drain(&self, counter: &EventCounter) {
        while !counter.is_drained() {
            tokio::time::sleep(self.check_interval).await;
        }
    }

    fn lookup(&self, task: TaskHandle) -> std::result::Result<Arc<EventCounter>, BridgeError> {
        self.registry
            .get(task)
            .ok_or_else(|| BridgeError::from_code(codes::UNKNOWN_TASK))
    }
}

impl SchedulerBridge for TokioBridge {
    fn current_task(&self) -> std::result::Result<TaskHandle, BridgeError> {
        CURRENT_TASK
            .try_with(|t| *t)
            .map_err(|_| BridgeError::from_code(codes::NO_CURRENT_TASK))
    }

    fn increase_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError> {
        self.lookup(task)?.increase(n);
        Ok(())
    }

    fn decrease_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError> {
        self.lookup(task)?
            .decrease(n)
            .map(|_| ())
            .map_err(|_| BridgeError::from_code(codes::COUNTER_UNDERFLOW))
    }

    fn spawn_background(
        &self,
        name: &str,
        body: BackgroundFn,
        on_complete: BackgroundFn,
    ) -> std::result::Result<(), BridgeError> {
        // Runs even if the runtime drops the closure without calling it
        let complete = CompleteOnDrop(Some(on_complete));
        // The poller sleeps between cycles, so it belongs on the blocking pool
        drop(self.handle.spawn_blocking(move || {
            let _complete = complete;
            body();
        }));
        self.spawned.fetch_add(1, Ordering::Relaxed);
        debug!("spawned background task {} on tokio blocking pool", name);
        Ok(())
    }

    fn suspend_for(&self, duration: Duration) -> std::result::Result<(), BridgeError> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| thread::sleep(duration));
            }
            _ => thread::sleep(duration),
        }
        Ok(())
    }

    fn cpu_count(&self) -> std::result::Result<u64, BridgeError> {
        Ok(self.handle.metrics().num_workers() as u64)
    }

    fn current_cpu(&self) -> std::result::Result<u64, BridgeError> {
        worker::current_cpu_id().ok_or_else(|| BridgeError::from_code(codes::TOPOLOGY_UNAVAILABLE))
    }
}

/// Runs a completion callback when dropped, after a panic included
struct CompleteOnDrop(Option<BackgroundFn>);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        if let Some(on_complete) = self.0.take() {
            on_complete();
        }
    }
}

/// Builder for configuring the Tokio bridge.
pub struct TokioBridgeBuilder {
    check_interval: Duration,
}

impl Default for TokioBridgeBuilder {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_micros(100),
        }
    }
}

impl TokioBridgeBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how often a finishing scope rechecks its counter.
    ///
    /// Lower values = quicker task completion but more wakeups.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Get the check interval.
    pub fn get_check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Build a bridge to the runtime the caller is running on.
    pub fn build(self) -> std::result::Result<TokioBridge, BridgeError> {
        let handle =
            Handle::try_current().map_err(|e| BridgeError::new(codes::RUNTIME_GONE, e.to_string()))?;
        Ok(self.build_with(handle))
    }

    /// Build a bridge to the runtime behind `handle`.
    pub fn build_with(self, handle: Handle) -> TokioBridge {
        TokioBridge {
            handle,
            registry: Arc::new(CounterRegistry::new()),
            check_interval: self.check_interval,
            spawned: AtomicU64::new(0),
        }
    }
}
