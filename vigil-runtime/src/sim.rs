// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Simulated device
//!
//! Streams are counters of recorded and completed operations. Arming a
//! marker records one operation on its stream; the marker is ready once the
//! stream has completed that operation. Tests and benchmarks drive
//! completion by hand ([`SimDevice::complete`], [`SimDevice::complete_all`])
//! or let every query succeed ([`SimDevice::set_auto_complete`]).
//!
//! The device also keeps the evidence the engine's invariants are checked
//! against: a log of destroyed markers in retirement order and a count of
//! queries issued against markers that no longer exist.

use crate::device::Device;
use crate::error::DeviceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use vigil_common::MarkerStatus;

/// Error code for an unknown marker or stream
pub const ERR_INVALID_HANDLE: i32 = 400;

/// Error code used when no explicit code is injected
pub const ERR_INJECTED: i32 = 999;

/// Simulated marker handle
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimMarker(u64);

impl SimMarker {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Simulated stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimStream(u32);

impl SimStream {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Device operation, for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    CreateMarker,
    ArmMarker,
    QueryMarker,
    DestroyMarker,
    CreateStream,
    DestroyStream,
}

#[derive(Debug, Default)]
struct StreamRecord {
    recorded: u64,
    completed: u64,
    live: bool,
}

#[derive(Debug)]
struct MarkerRecord {
    /// Stream and operation number the marker waits for; `None` until armed
    target: Option<(SimStream, u64)>,
}

#[derive(Debug, Default)]
struct SimState {
    next_marker: u64,
    streams: Vec<StreamRecord>,
    markers: HashMap<u64, MarkerRecord>,
    retired: Vec<u64>,
    fault: Option<(SimOp, i32)>,
}

impl SimState {
    fn take_fault(&mut self, op: SimOp) -> Result<(), DeviceError> {
        match self.fault {
            Some((fault_op, code)) if fault_op == op => {
                self.fault = None;
                Err(DeviceError::new(code, format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn stream_mut(&mut self, stream: SimStream) -> Result<&mut StreamRecord, DeviceError> {
        match self.streams.get_mut(stream.0 as usize) {
            Some(record) if record.live => Ok(record),
            _ => Err(DeviceError::new(
                ERR_INVALID_HANDLE,
                format!("invalid stream {}", stream.0),
            )),
        }
    }
}

/// Simulated device with one default stream
#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<SimState>,
    auto_complete: AtomicBool,
    markers_created: AtomicU64,
    queries: AtomicU64,
    stale_queries: AtomicU64,
}

impl SimDevice {
    pub fn new() -> Self {
        let mut state = SimState::default();
        state.streams.push(StreamRecord {
            live: true,
            ..Default::default()
        });
        Self {
            state: Mutex::new(state),
            auto_complete: AtomicBool::new(false),
            markers_created: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            stale_queries: AtomicU64::new(0),
        }
    }

    /// A device whose markers report ready on the first query
    pub fn with_auto_complete() -> Self {
        let device = Self::new();
        device.set_auto_complete(true);
        device
    }

    /// The stream created with the device
    pub fn default_stream(&self) -> SimStream {
        SimStream(0)
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
    }

    /// Finish up to `n` recorded operations on `stream`
    pub fn complete(&self, stream: SimStream, n: u64) {
        let mut state = self.state.lock();
        if let Some(record) = state.streams.get_mut(stream.0 as usize) {
            record.completed = (record.completed + n).min(record.recorded);
        }
    }

    /// Finish every operation recorded so far on every stream
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for record in state.streams.iter_mut() {
            record.completed = record.recorded;
        }
    }

    /// Make the next call of `op` fail with `code`
    pub fn fail_next(&self, op: SimOp, code: i32) {
        self.state.lock().fault = Some((op, code));
    }

    /// Operations recorded on `stream` and not yet completed
    pub fn outstanding(&self, stream: SimStream) -> u64 {
        let state = self.state.lock();
        state
            .streams
            .get(stream.0 as usize)
            .map(|r| r.recorded - r.completed)
            .unwrap_or(0)
    }

    /// Markers created and not yet destroyed
    pub fn live_markers(&self) -> usize {
        self.state.lock().markers.len()
    }

    pub fn markers_created(&self) -> u64 {
        self.markers_created.load(Ordering::Relaxed)
    }

    /// Total completion queries issued
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Queries issued against markers that were already destroyed
    pub fn stale_queries(&self) -> u64 {
        self.stale_queries.load(Ordering::Relaxed)
    }

    /// Ids of destroyed markers, in destruction order
    pub fn retirement_log(&self) -> Vec<u64> {
        self.state.lock().retired.clone()
    }

    /// Number of live streams
    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.iter().filter(|s| s.live).count()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SimDevice {
    type Marker = SimMarker;
    type Stream = SimStream;

    fn create_marker(&self) -> Result<SimMarker, DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::CreateMarker)?;
        state.next_marker += 1;
        let id = state.next_marker;
        state.markers.insert(id, MarkerRecord { target: None });
        self.markers_created.fetch_add(1, Ordering::Relaxed);
        Ok(SimMarker(id))
    }

    fn arm_marker(&self, marker: &SimMarker, stream: SimStream) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::ArmMarker)?;
        let record = state.stream_mut(stream)?;
        record.recorded += 1;
        let op = record.recorded;
        match state.markers.get_mut(&marker.0) {
            Some(m) => {
                m.target = Some((stream, op));
                Ok(())
            }
            None => Err(DeviceError::new(ERR_INVALID_HANDLE, "invalid marker")),
        }
    }

    fn query_marker(&self, marker: &SimMarker) -> Result<MarkerStatus, DeviceError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.take_fault(SimOp::QueryMarker)?;
        let target = match state.markers.get(&marker.0) {
            Some(m) => m.target,
            None => {
                self.stale_queries.fetch_add(1, Ordering::Relaxed);
                return Err(DeviceError::new(ERR_INVALID_HANDLE, "query on destroyed marker"));
            }
        };
        if self.auto_complete.load(Ordering::Acquire) {
            return Ok(MarkerStatus::Ready);
        }
        // An unarmed marker has nothing to wait for
        let ready = match target {
            None => true,
            Some((stream, op)) => state.streams[stream.0 as usize].completed >= op,
        };
        Ok(if ready {
            MarkerStatus::Ready
        } else {
            MarkerStatus::NotReady
        })
    }

    fn destroy_marker(&self, marker: SimMarker) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::DestroyMarker)?;
        if state.markers.remove(&marker.0).is_none() {
            return Err(DeviceError::new(ERR_INVALID_HANDLE, "destroy of unknown marker"));
        }
        state.retired.push(marker.0);
        Ok(())
    }

    fn create_stream(&self) -> Result<SimStream, DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::CreateStream)?;
        state.streams.push(StreamRecord {
            live: true,
            ..Default::default()
        });
        Ok(SimStream((state.streams.len() - 1) as u32))
    }

    fn destroy_stream(&self, stream: SimStream) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::DestroyStream)?;
        let record = state.stream_mut(stream)?;
        record.live = false;
        Ok(())
    }
}
