// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Vigil Runtime
//!
//! Completion tracking for asynchronous device work under a cooperative
//! tasking runtime.
//!
//! A task that queues work on a device stream does not block waiting for
//! it. Instead it creates a completion token, which bumps its event
//! counter; a background polling task queries the token's marker and
//! decrements the counter once the work has finished. The tasking runtime
//! keeps the task from completing until its counter is back at zero.
//!
//! ## Key Components
//!
//! - **Tracker**: producer side; creates, binds and submits tokens
//! - **Retirer**: poller side; drains submitted tokens and retires completed ones
//! - **Ingress Channel**: SPSC ring behind a fair ticket spinlock
//! - **Scheduler Bridge**: the services needed from the tasking runtime
//! - **Device**: completion markers and streams of the hardware layer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil_runtime::{sim::SimDevice, Builder, ThreadBridge};
//!
//! let device = Arc::new(SimDevice::new());
//! let bridge = Arc::new(ThreadBridge::new());
//! let engine = Builder::new().build(device.clone(), bridge.clone()).unwrap();
//!
//! let scope = bridge.enter_task();
//! // ... queue device work on the stream ...
//! engine.tracker().submit(device.default_stream());
//! drop(scope); // returns once the work above has completed
//! ```
//!
//! ## Deferred binding
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use vigil_runtime::{sim::SimDevice, Builder, ThreadBridge};
//! # let device = Arc::new(SimDevice::new());
//! # let bridge = Arc::new(ThreadBridge::new());
//! # let engine = Builder::new().build(device.clone(), bridge.clone()).unwrap();
//! let tracker = engine.tracker();
//! let token = tracker.generate_request(device.default_stream(), false);
//!
//! // Later, from the task that should wait for it
//! let _scope = bridge.enter_task();
//! let mut slots = [token];
//! tracker.process_requests(&mut slots);
//! ```

pub mod bridge;
pub mod counter;
pub mod device;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod pending;
pub mod poller;
pub mod ringbuf;
pub mod runtime;
pub mod sim;
pub mod spinlock;
pub mod stream_pool;
pub mod token;
pub mod tracker;
pub mod worker;

pub use bridge::{CapabilityTable, SchedulerBridge, TableBridge, TaskHandle};
pub use device::Device;
pub use error::{BridgeError, DeviceError, Error, FatalPolicy, Result};
pub use runtime::{Builder, Engine, EngineConfig};
pub use spinlock::SpinLock;
pub use stream_pool::StreamPool;
pub use token::{CompletionToken, TokenId};
pub use tracker::{CycleReport, Retirer, Tracker, TrackerStats};
pub use worker::{TaskScope, ThreadBridge};

/// Re-export common types
pub use vigil_common::{MarkerStatus, PollerState, TokenState};
