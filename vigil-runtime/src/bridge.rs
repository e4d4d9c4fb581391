// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Scheduler Bridge
//!
//! The minimal capability surface the engine needs from a cooperative
//! tasking runtime. The engine never blocks a task on device work; it only
//! adjusts the task's event counter, and the runtime decides when the task
//! may resume or complete based on that counter.
//!
//! ## Implementations
//!
//! - [`TableBridge`]: adapts a [`CapabilityTable`] of function pointers, the
//!   shape a runtime exposes when its entry points are resolved at startup
//! - [`crate::worker::ThreadBridge`]: OS threads as tasks
//! - `vigil-tokio`: Tokio tasks

use crate::error::{BridgeError, Error, Result};
use std::num::NonZeroU64;
use std::time::Duration;
use vigil_common::version;

/// Opaque identity of a task (and of its event counter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(NonZeroU64);

impl TaskHandle {
    /// Wrap a raw runtime handle; zero is never a valid task
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// Body or completion callback of a background task
pub type BackgroundFn = Box<dyn FnOnce() + Send + 'static>;

/// Services the engine consumes from the tasking runtime
///
/// Every error returned here is treated by the engine as fatal.
pub trait SchedulerBridge: Send + Sync + 'static {
    /// Identity of the calling task
    fn current_task(&self) -> std::result::Result<TaskHandle, BridgeError>;

    /// Add `n` outstanding events to a task
    fn increase_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError>;

    /// Retire `n` outstanding events of a task
    fn decrease_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError>;

    /// Schedule a background task; `on_complete` runs after `body` returns
    fn spawn_background(
        &self,
        name: &str,
        body: BackgroundFn,
        on_complete: BackgroundFn,
    ) -> std::result::Result<(), BridgeError>;

    /// Suspend the calling task for at least `duration`
    fn suspend_for(&self, duration: Duration) -> std::result::Result<(), BridgeError>;

    /// Number of CPUs the runtime schedules on
    fn cpu_count(&self) -> std::result::Result<u64, BridgeError>;

    /// Logical id (0..cpu_count) of the CPU running the caller
    fn current_cpu(&self) -> std::result::Result<u64, BridgeError>;
}

/// Status code returned by capability functions; nonzero is failure
pub type Code = i32;

/// Runtime entry points, resolved once at startup
#[derive(Clone, Copy)]
pub struct CapabilityTable {
    pub error_string: fn(Code) -> &'static str,
    pub version: fn() -> std::result::Result<(u32, u32), Code>,
    pub task_self: fn() -> std::result::Result<TaskHandle, Code>,
    pub task_events_increase: fn(TaskHandle, u64) -> Code,
    pub task_events_decrease: fn(TaskHandle, u64) -> Code,
    pub task_waitfor_ns: fn(u64) -> Code,
    pub task_spawn: fn(&str, BackgroundFn, BackgroundFn) -> Code,
    pub cpu_count: fn() -> std::result::Result<u64, Code>,
    pub cpu_logical_id: fn() -> std::result::Result<u64, Code>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable").finish_non_exhaustive()
    }
}

/// Scheduler bridge over a [`CapabilityTable`]
#[derive(Debug)]
pub struct TableBridge {
    table: CapabilityTable,
    version: (u32, u32),
}

impl TableBridge {
    /// Check the table's capability version and wrap it
    pub fn new(table: CapabilityTable) -> Result<Self> {
        let (major, minor) = (table.version)()
            .map_err(|code| Error::bridge("version", Self::error(&table, code)))?;
        if major != version::MAJOR || minor < version::MINOR {
            return Err(Error::IncompatibleBridge {
                found_major: major,
                found_minor: minor,
                need_major: version::MAJOR,
                need_minor: version::MINOR,
            });
        }
        Ok(Self {
            table,
            version: (major, minor),
        })
    }

    /// Capability version reported by the runtime
    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    fn error(table: &CapabilityTable, code: Code) -> BridgeError {
        BridgeError::new(code, (table.error_string)(code))
    }

    fn check(&self, code: Code) -> std::result::Result<(), BridgeError> {
        if code == 0 {
            Ok(())
        } else {
            Err(Self::error(&self.table, code))
        }
    }
}

impl SchedulerBridge for TableBridge {
    fn current_task(&self) -> std::result::Result<TaskHandle, BridgeError> {
        (self.table.task_self)().map_err(|code| Self::error(&self.table, code))
    }

    fn increase_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError> {
        self.check((self.table.task_events_increase)(task, n))
    }

    fn decrease_events(&self, task: TaskHandle, n: u64) -> std::result::Result<(), BridgeError> {
        self.check((self.table.task_events_decrease)(task, n))
    }

    fn spawn_background(
        &self,
        name: &str,
        body: BackgroundFn,
        on_complete: BackgroundFn,
    ) -> std::result::Result<(), BridgeError> {
        self.check((self.table.task_spawn)(name, body, on_complete))
    }

    fn suspend_for(&self, duration: Duration) -> std::result::Result<(), BridgeError> {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.check((self.table.task_waitfor_ns)(ns))
    }

    fn cpu_count(&self) -> std::result::Result<u64, BridgeError> {
        (self.table.cpu_count)().map_err(|code| Self::error(&self.table, code))
    }

    fn current_cpu(&self) -> std::result::Result<u64, BridgeError> {
        (self.table.cpu_logical_id)().map_err(|code| Self::error(&self.table, code))
    }
}
