// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # vigil-common
//!
//! Shared vocabulary for the Vigil completion engine and its scheduler
//! bridges.
//!
//! The engine lets a cooperative task hand the completion of asynchronous
//! device work (a kernel launch, a copy on a stream) to a background poller
//! instead of blocking its worker. This crate holds the pieces that every
//! side of that arrangement must agree on: the lifecycle states of tokens and
//! pollers, the result of a marker query, tuning constants, environment
//! variable names, and the status codes a scheduler bridge reports.
//!
//! ## Design Principles
//!
//! - **No allocation**: `no_std`, plain integers and enums only
//! - **Stable encodings**: every state has a `u32` representation so it can
//!   live in an atomic
//! - **Opaque to the device**: nothing here names a concrete GPU API

#![no_std]

// ============================================================================
// Completion token lifecycle
// ============================================================================

/// Lifecycle state of a completion token slot
///
/// State transitions:
/// ```text
/// FREE → ARMED → SUBMITTED → PENDING → FREE
/// ```
///
/// Rules:
/// - Only the producer holding the token touches it while ARMED
/// - SUBMITTED tokens sit in the ingress channel, owned by nobody
/// - Only the poller touches PENDING tokens
/// - The slot returns to FREE after the marker is destroyed and the bound
///   counter has been decremented
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenState {
    /// Slot is on the free list
    #[default]
    Free = 0,

    /// Marker created and armed, token held by a producer
    Armed = 1,

    /// Pushed into the ingress channel, not yet drained
    Submitted = 2,

    /// Drained into the pending set, awaiting completion
    Pending = 3,
}

impl TokenState {
    /// Whether the token is being tracked by the engine
    #[inline]
    pub fn is_tracked(self) -> bool {
        matches!(self, TokenState::Submitted | TokenState::Pending)
    }

    /// Whether the slot currently backs a live token
    #[inline]
    pub fn is_live(self) -> bool {
        !matches!(self, TokenState::Free)
    }
}

impl TryFrom<u32> for TokenState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TokenState::Free),
            1 => Ok(TokenState::Armed),
            2 => Ok(TokenState::Submitted),
            3 => Ok(TokenState::Pending),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Poller lifecycle
// ============================================================================

/// Lifecycle state of a polling instance
///
/// ```text
/// UNREGISTERED → REGISTERED → STOPPING → STOPPED
/// ```
///
/// The polling function is only invoked while REGISTERED. Once STOPPED the
/// background task has exited and will never invoke it again.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerState {
    /// Instance allocated, background task not spawned
    #[default]
    Unregistered = 0,

    /// Background task running the polling loop
    Registered = 1,

    /// Stop requested, background task not yet exited
    Stopping = 2,

    /// Background task exited
    Stopped = 3,
}

impl PollerState {
    /// Whether the polling function may still be invoked
    #[inline]
    pub fn may_poll(self) -> bool {
        matches!(self, PollerState::Registered)
    }
}

impl TryFrom<u32> for PollerState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PollerState::Unregistered),
            1 => Ok(PollerState::Registered),
            2 => Ok(PollerState::Stopping),
            3 => Ok(PollerState::Stopped),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Marker queries
// ============================================================================

/// Outcome of a non-blocking completion query that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    /// All work recorded before the marker has finished
    Ready,
    /// Work recorded before the marker is still running
    NotReady,
}

impl MarkerStatus {
    #[inline]
    pub fn is_ready(self) -> bool {
        matches!(self, MarkerStatus::Ready)
    }
}

// ============================================================================
// Scheduler bridge status codes
// ============================================================================

/// Status codes reported by scheduler bridges
///
/// Zero is success; bridges backed by a foreign runtime may report any other
/// nonzero code, these are the ones the in-tree bridges produce.
pub mod codes {
    /// Success
    pub const OK: i32 = 0;

    /// The caller is not running inside a task
    pub const NO_CURRENT_TASK: i32 = 1;

    /// The task handle is not known to the bridge
    pub const UNKNOWN_TASK: i32 = 2;

    /// An event counter would drop below its baseline
    pub const COUNTER_UNDERFLOW: i32 = 3;

    /// A background task could not be spawned
    pub const SPAWN_FAILED: i32 = 4;

    /// The CPU topology could not be queried
    pub const TOPOLOGY_UNAVAILABLE: i32 = 5;

    /// The bridge runtime has shut down
    pub const RUNTIME_GONE: i32 = 6;

    /// Human readable description of a status code
    pub fn describe(code: i32) -> &'static str {
        match code {
            OK => "success",
            NO_CURRENT_TASK => "caller is not running inside a task",
            UNKNOWN_TASK => "unknown task handle",
            COUNTER_UNDERFLOW => "event counter below baseline",
            SPAWN_FAILED => "failed to spawn background task",
            TOPOLOGY_UNAVAILABLE => "cpu topology unavailable",
            RUNTIME_GONE => "scheduler runtime has shut down",
            _ => "unknown error",
        }
    }
}

/// Capability version a bridge must provide
pub mod version {
    /// Major version: must match exactly
    pub const MAJOR: u32 = 1;

    /// Minor version: the bridge must provide at least this
    pub const MINOR: u32 = 0;
}

// ============================================================================
// Configuration constants
// ============================================================================

/// Configuration constants
pub mod config {
    /// Upper bound on concurrently contending CPUs (spinlock ticket slots)
    pub const MAX_SYSTEM_CPUS: usize = 256;

    /// Default ingress channel capacity (entries)
    pub const DEFAULT_INGRESS_CAPACITY: usize = 63 * 1024;

    /// Default number of completion token slots
    pub const DEFAULT_TOKEN_CAPACITY: usize = 64 * 1024;

    /// Default polling period in microseconds
    pub const DEFAULT_POLLING_FREQUENCY_US: u64 = 500;

    /// Suspension step while waiting for a poller to stop (1ms)
    pub const UNREGISTER_WAIT_NS: u64 = 1_000_000;

    /// Default name of the engine's polling task
    pub const DEFAULT_POLLER_NAME: &str = "vigil";
}

/// Environment variables read by `Builder::from_env`
pub mod env_vars {
    /// Polling period in microseconds
    pub const POLLING_FREQUENCY: &str = "VIGIL_POLLING_FREQUENCY";

    /// Ingress channel capacity in entries
    pub const INGRESS_CAPACITY: &str = "VIGIL_INGRESS_CAPACITY";

    /// Number of completion token slots
    pub const TOKEN_CAPACITY: &str = "VIGIL_TOKEN_CAPACITY";
}

// ============================================================================
// Tests
// ============================================================================
