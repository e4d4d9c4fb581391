// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Polling instances
//!
//! A polling instance is a background task that calls a function, suspends
//! for the polling period, and repeats until it is told to stop. The engine
//! registers one to retire completed tokens.
//!
//! ```text
//! register()   → REGISTERED (background task spawned)
//! unregister() → STOPPING   (stop flag set, caller suspends in 1ms steps)
//!              → STOPPED    (completion callback ran; function never called again)
//! ```
//!
//! A panic in the polling function is unrecoverable and goes through the
//! instance's [`FatalPolicy`]. The instance still reaches `STOPPED`.

use crate::bridge::SchedulerBridge;
use crate::error::{Error, FatalPolicy};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vigil_common::config::UNREGISTER_WAIT_NS;
use vigil_common::PollerState;

/// Shared state of one polling instance
#[derive(Debug)]
pub struct PollingInstance {
    name: String,
    frequency: Duration,
    state: AtomicU32,
    must_finish: AtomicBool,
    finished: AtomicBool,
    invocations: AtomicU64,
}

impl PollingInstance {
    fn new(name: &str, frequency: Duration) -> Self {
        Self {
            name: name.to_string(),
            frequency,
            state: AtomicU32::new(PollerState::Unregistered as u32),
            must_finish: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn state(&self) -> PollerState {
        PollerState::try_from(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Times the polling function has run
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: PollerState) {
        self.state.store(state as u32, Ordering::Release);
    }

    fn transition(&self, from: PollerState, to: PollerState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle returned by [`register`]; consumed by [`PollingHandle::unregister`]
pub struct PollingHandle<S: SchedulerBridge> {
    instance: Arc<PollingInstance>,
    bridge: Arc<S>,
    fatal: FatalPolicy,
}

impl<S: SchedulerBridge> std::fmt::Debug for PollingHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingHandle")
            .field("instance", &self.instance)
            .finish()
    }
}

/// Spawn a background task calling `function` every `frequency`
///
/// Returns immediately. A bridge failure while spawning or suspending is
/// handled according to `fatal`.
pub fn register<S, F>(
    bridge: &Arc<S>,
    name: &str,
    frequency: Duration,
    fatal: FatalPolicy,
    mut function: F,
) -> PollingHandle<S>
where
    S: SchedulerBridge,
    F: FnMut() + Send + 'static,
{
    let instance = Arc::new(PollingInstance::new(name, frequency));
    instance.set_state(PollerState::Registered);

    let body = {
        let instance = instance.clone();
        let bridge = bridge.clone();
        Box::new(move || {
            while !instance.must_finish.load(Ordering::Acquire) {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut function)) {
                    fatal.fail(Error::PollerPanicked {
                        name: instance.name.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                }
                instance.invocations.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = bridge.suspend_for(instance.frequency) {
                    fatal.fail(Error::bridge("suspend_for", e));
                }
            }
        })
    };
    let on_complete = {
        let instance = instance.clone();
        Box::new(move || {
            instance.set_state(PollerState::Stopped);
            instance.finished.store(true, Ordering::Release);
        })
    };

    if let Err(e) = bridge.spawn_background(name, body, on_complete) {
        fatal.fail(Error::bridge("spawn_background", e));
    }
    debug!("registered polling instance {} every {:?}", name, frequency);

    PollingHandle {
        instance,
        bridge: bridge.clone(),
        fatal,
    }
}

impl<S: SchedulerBridge> PollingHandle<S> {
    pub fn instance(&self) -> &Arc<PollingInstance> {
        &self.instance
    }

    /// Stop the polling task and wait for it to exit
    ///
    /// The calling task suspends in short steps until the background task
    /// has observed the stop flag. Once this returns the polling function
    /// will not be called again. Returns the number of invocations made.
    pub fn unregister(self) -> u64 {
        // A poller that already died stays STOPPED
        self.instance
            .transition(PollerState::Registered, PollerState::Stopping);
        self.instance.must_finish.store(true, Ordering::Release);

        let step = Duration::from_nanos(UNREGISTER_WAIT_NS);
        while !self.instance.finished.load(Ordering::Acquire) {
            // Suspending instead of spinning lets a single-CPU runtime run the poller
            if let Err(e) = self.bridge.suspend_for(step) {
                self.fatal.fail(Error::bridge("suspend_for", e));
            }
        }

        let invocations = self.instance.invocations();
        debug!(
            "unregistered polling instance {} after {} invocations",
            self.instance.name, invocations
        );
        invocations
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
