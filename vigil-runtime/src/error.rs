// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Error types for the Vigil engine
//!
//! Device and bridge failures are unrecoverable once the engine is running:
//! they go through [`FatalPolicy::fail`] instead of being returned. Only the
//! init window (configuration, bridge version) reports errors to the caller.

use crate::token::TokenId;
use thiserror::Error;
use tracing::error;
use vigil_common::TokenState;

/// Alias for `Result<T, Error>`
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the device layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure reported by a scheduler bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bridge error {code}: {message}")]
pub struct BridgeError {
    pub code: i32,
    pub message: String,
}

impl BridgeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error from one of the in-tree status codes
    pub fn from_code(code: i32) -> Self {
        Self::new(code, vigil_common::codes::describe(code))
    }
}

/// Vigil engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// A device operation failed
    #[error("failed in {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A scheduler bridge call failed
    #[error("failed in {op}: {source}")]
    Bridge {
        op: &'static str,
        #[source]
        source: BridgeError,
    },

    /// The bridge capability version cannot serve this engine
    #[error("incompatible bridge version {found_major}.{found_minor} (need {need_major}.{need_minor})")]
    IncompatibleBridge {
        found_major: u32,
        found_minor: u32,
        need_major: u32,
        need_minor: u32,
    },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stream index outside the pool
    #[error("invalid stream index: {0}")]
    InvalidStream(usize),

    /// The engine has already been shut down
    #[error("engine already shut down")]
    ShutDown,

    /// A token was handed to an engine that did not issue it
    #[error("{0} was issued by another engine")]
    ForeignToken(TokenId),

    /// A token slot was not in the state its owner expected
    #[error("{id} is {found:?}, expected {expected:?}")]
    TokenOwnership {
        id: TokenId,
        found: TokenState,
        expected: TokenState,
    },

    /// No token index is left to grow the arena with
    #[error("token arena exhausted at {0} slots")]
    ArenaExhausted(usize),

    /// The polling function panicked
    #[error("polling instance {name} panicked: {message}")]
    PollerPanicked { name: String, message: String },
}

impl Error {
    pub fn device(op: &'static str, source: DeviceError) -> Self {
        Error::Device { op, source }
    }

    pub fn bridge(op: &'static str, source: BridgeError) -> Self {
        Error::Bridge { op, source }
    }
}

/// What to do with an unrecoverable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Report and abort the process
    #[default]
    Abort,

    /// Report and panic the calling thread
    Panic,
}

impl FatalPolicy {
    /// Report the failure and never return
    #[cold]
    #[inline(never)]
    pub fn fail(self, err: Error) -> ! {
        error!("unrecoverable failure: {}", err);
        match self {
            FatalPolicy::Abort => std::process::abort(),
            FatalPolicy::Panic => panic!("vigil: {}", err),
        }
    }

    /// Unwrap a device result or fail
    #[inline]
    pub fn device<T>(self, op: &'static str, res: std::result::Result<T, DeviceError>) -> T {
        match res {
            Ok(v) => v,
            Err(e) => self.fail(Error::device(op, e)),
        }
    }

    /// Unwrap a bridge result or fail
    #[inline]
    pub fn bridge<T>(self, op: &'static str, res: std::result::Result<T, BridgeError>) -> T {
        match res {
            Ok(v) => v,
            Err(e) => self.fail(Error::bridge(op, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device("query_marker", DeviceError::new(700, "illegal address"));
        assert_eq!(
            err.to_string(),
            "failed in query_marker: device error 700: illegal address"
        );

        let err = Error::bridge(
            "task_self",
            BridgeError::from_code(vigil_common::codes::NO_CURRENT_TASK),
        );
        assert!(err.to_string().contains("not running inside a task"));
    }

    #[test]
    fn test_passthrough_on_success() {
        let policy = FatalPolicy::Panic;
        assert_eq!(policy.device("create_marker", Ok::<_, DeviceError>(7)), 7);
        assert_eq!(policy.bridge("cpu_count", Ok::<_, BridgeError>(4u64)), 4);
    }

    #[test]
    fn test_token_error_display() {
        let err = Error::TokenOwnership {
            id: crate::token::TokenId::from_raw(5),
            found: TokenState::Free,
            expected: TokenState::Pending,
        };
        assert_eq!(err.to_string(), "token#5 is Free, expected Pending");
    }

    #[test]
    #[should_panic(expected = "failed in destroy_marker")]
    fn test_panic_policy() {
        FatalPolicy::Panic.device::<()>("destroy_marker", Err(DeviceError::new(1, "boom")));
    }
}
