// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Per-CPU device streams
//!
//! Producers on different CPUs queue work on different streams so they do
//! not serialize on one hardware queue. The pool owns its streams and
//! destroys them exactly once, explicitly or on drop.

use crate::bridge::SchedulerBridge;
use crate::device::Device;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error};

pub struct StreamPool<D: Device> {
    device: Arc<D>,
    streams: Vec<D::Stream>,
    destroyed: bool,
}

impl<D: Device> StreamPool<D> {
    /// Create `count` streams
    ///
    /// Streams created before a failure are destroyed again.
    pub fn new(device: Arc<D>, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidConfig("stream pool needs at least one stream".into()));
        }
        let mut pool = Self {
            device,
            streams: Vec::with_capacity(count),
            destroyed: false,
        };
        for _ in 0..count {
            let stream = pool
                .device
                .create_stream()
                .map_err(|e| Error::device("create_stream", e))?;
            pool.streams.push(stream);
        }
        debug!("created stream pool of {} streams", count);
        Ok(pool)
    }

    /// One stream per CPU the runtime schedules on
    pub fn auto<S: SchedulerBridge>(device: Arc<D>, bridge: &S) -> Result<Self> {
        let cpus = bridge
            .cpu_count()
            .map_err(|e| Error::bridge("cpu_count", e))?;
        let count = usize::try_from(cpus)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::InvalidConfig(format!("bridge reported {} CPUs", cpus)))?;
        Self::new(device, count)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<D::Stream> {
        if self.destroyed {
            return Err(Error::ShutDown);
        }
        self.streams
            .get(index)
            .copied()
            .ok_or(Error::InvalidStream(index))
    }

    /// The stream assigned to the CPU running the caller
    pub fn for_current_cpu<S: SchedulerBridge>(&self, bridge: &S) -> Result<D::Stream> {
        let cpu = bridge
            .current_cpu()
            .map_err(|e| Error::bridge("current_cpu", e))?;
        let len = self.streams.len().max(1) as u64;
        self.get((cpu % len) as usize)
    }

    /// Destroy every stream; later calls are no-ops
    ///
    /// Every stream is attempted; the first failure is returned.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let mut first_err = None;
        for stream in self.streams.drain(..) {
            if let Err(e) = self.device.destroy_stream(stream) {
                first_err.get_or_insert(Error::device("destroy_stream", e));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<D: Device> Drop for StreamPool<D> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("failed to destroy stream pool: {}", e);
        }
    }
}
