// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Device layer interface
//!
//! The engine never performs device work itself. It only needs completion
//! markers (create, arm against a stream, query, destroy) and, for the
//! stream pool, stream creation. A backend for a real GPU API implements
//! [`Device`]; [`crate::sim::SimDevice`] is the in-tree simulated backend.

use crate::error::DeviceError;
use std::fmt;
use vigil_common::MarkerStatus;

/// Completion markers and streams of one device context
///
/// Every method reporting an error other than "not ready" is treated by the
/// engine as an unrecoverable device fault.
pub trait Device: Send + Sync + 'static {
    /// Owned marker handle; destroying consumes it
    type Marker: Send + 'static;

    /// Execution stream identifier
    type Stream: Copy + Send + Sync + fmt::Debug + 'static;

    /// Create a marker that is not yet armed
    fn create_marker(&self) -> Result<Self::Marker, DeviceError>;

    /// Record the marker behind all work currently queued on `stream`
    fn arm_marker(&self, marker: &Self::Marker, stream: Self::Stream) -> Result<(), DeviceError>;

    /// Non-blocking check whether the work behind the marker has finished
    fn query_marker(&self, marker: &Self::Marker) -> Result<MarkerStatus, DeviceError>;

    /// Release the marker
    fn destroy_marker(&self, marker: Self::Marker) -> Result<(), DeviceError>;

    /// Create an execution stream
    fn create_stream(&self) -> Result<Self::Stream, DeviceError>;

    /// Destroy an execution stream
    fn destroy_stream(&self, stream: Self::Stream) -> Result<(), DeviceError>;
}
