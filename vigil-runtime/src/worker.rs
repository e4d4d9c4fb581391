// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Thread-backed scheduler bridge
//!
//! Every OS thread that enters a [`TaskScope`] acts as one task with its own
//! event counter. Background tasks are named threads and suspension is a
//! plain sleep. This is the bridge used by the tests and benchmarks, and a
//! reasonable default for programs without a tasking runtime.

use crate::bridge::{BackgroundFn, SchedulerBridge, TaskHandle};
use crate::counter::{CounterRegistry, EventCounter};
use crate::error::BridgeError;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_common::codes;

thread_local! {
    /// The task the current thread is running, if any
    static CURRENT_TASK: Cell<Option<TaskHandle>> = const { Cell::new(None) };
}

/// Task handle of the current thread, if it is inside a [`TaskScope`]
#[inline]
pub fn current_task() -> Option<TaskHandle> {
    CURRENT_TASK.with(Cell::get)
}

/// Number of CPUs available to this process
pub fn available_cpus() -> u64 {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1) as u64
}

/// Logical id of the CPU running the calling thread
#[cfg(target_os = "linux")]
pub fn current_cpu_id() -> Option<u64> {
    let cpu = unsafe { libc::sched_getcpu() };
    u64::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu_id() -> Option<u64> {
    // No portable query; everything maps to the first CPU
    Some(0)
}

/// Scheduler bridge where tasks are OS threads
#[derive(Debug, Default)]
pub struct ThreadBridge {
    registry: Arc<CounterRegistry>,
    spawned: AtomicU64,
}

impl ThreadBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the calling thread a task until the scope is dropped
    pub fn enter_task(&self) -> TaskScope {
        let (handle, counter) = self.registry.register();
        let previous = CURRENT_TASK.with(|c| c.replace(Some(handle)));
        TaskScope {
            handle,
            counter,
            previous,
            registry: self.registry.clone(),
            _marker: PhantomData,
        }
    }

    /// Counter of a task started by this bridge
    pub fn counter(&self, task: TaskHandle) -> Option<Arc<EventCounter>> {
        self.registry.get(task)
    }

    /// Background tasks spawned so far
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    fn lookup(&self, task: TaskHandle) -> Result<Arc<EventCounter>, BridgeError> {
        self.registry
            .get(task)
            .ok_or_else(|| BridgeError::from_code(codes::UNKNOWN_TASK))
    }
}

impl SchedulerBridge for ThreadBridge {
    fn current_task(&self) -> Result<TaskHandle, BridgeError> {
        current_task().ok_or_else(|| BridgeError::from_code(codes::NO_CURRENT_TASK))
    }

    fn increase_events(&self, task: TaskHandle, n: u64) -> Result<(), BridgeError> {
        self.lookup(task)?.increase(n);
        Ok(())
    }

    fn decrease_events(&self, task: TaskHandle, n: u64) -> Result<(), BridgeError> {
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
    ) -> Result<(), BridgeError> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(body));
                on_complete();
                if let Err(payload) = result {
                    panic::resume_unwind(payload);
                }
            })
            .map_err(|e| BridgeError::new(codes::SPAWN_FAILED, e.to_string()))?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        debug!("spawned background task {}", name);
        Ok(())
    }

    fn suspend_for(&self, duration: Duration) -> Result<(), BridgeError> {
        thread::sleep(duration);
        Ok(())
    }

    fn cpu_count(&self) -> Result<u64, BridgeError> {
        Ok(available_cpus())
    }

    fn current_cpu(&self) -> Result<u64, BridgeError> {
        current_cpu_id().ok_or_else(|| BridgeError::from_code(codes::TOPOLOGY_UNAVAILABLE))
    }
}

/// RAII task scope for the current thread
///
/// Like a task in a cooperative runtime, the scope cannot finish while it
/// has outstanding events: dropping it blocks until its counter is back at
/// baseline.
///
/// This type is `!Send`: the task identity belongs to the thread that
/// entered it.
pub struct TaskScope {
    handle: TaskHandle,
    counter: Arc<EventCounter>,
    previous: Option<TaskHandle>,
    registry: Arc<CounterRegistry>,
    _marker: PhantomData<*const ()>,
}

impl TaskScope {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn counter(&self) -> &Arc<EventCounter> {
        &self.counter
    }

    /// Wait until every event bound to this task has been retired
    pub fn wait_events(&self, timeout: Duration) -> bool {
        self.counter.wait_drained(timeout)
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        let mut waited = 0u64;
        while !self.counter.wait_drained(Duration::from_secs(1)) {
            waited += 1;
            warn!(
                "task {} waiting on {} outstanding events ({}s)",
                self.handle.as_raw(),
                self.counter.pending(),
                waited
            );
        }
        self.registry.unregister(self.handle);
        CURRENT_TASK.with(|c| c.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_task_scope_nesting() {
        let bridge = ThreadBridge::new();
        assert!(bridge.current_task().is_err());
        {
            let outer = bridge.enter_task();
            assert_eq!(bridge.current_task().unwrap(), outer.handle());
            {
                let inner = bridge.enter_task();
                assert_eq!(bridge.current_task().unwrap(), inner.handle());
            }
            assert_eq!(bridge.current_task().unwrap(), outer.handle());
        }
        assert!(current_task().is_none());
    }

    #[test]
    fn test_event_accounting() {
        let bridge = ThreadBridge::new();
        let scope = bridge.enter_task();
        let task = scope.handle();

        bridge.increase_events(task, 2).unwrap();
        assert_eq!(scope.counter().pending(), 2);
        bridge.decrease_events(task, 2).unwrap();
        assert!(scope.wait_events(Duration::from_millis(1)));

        let err = bridge.decrease_events(task, 1).unwrap_err();
        assert_eq!(err.code, codes::COUNTER_UNDERFLOW);
    }

    #[test]
    fn test_unknown_task() {
        let bridge = ThreadBridge::new();
        let stranger = TaskHandle::from_raw(u64::MAX).unwrap();
        let err = bridge.increase_events(stranger, 1).unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_TASK);
    }

    #[test]
    fn test_scope_drop_waits_for_events() {
        let bridge = Arc::new(ThreadBridge::new());
        let scope = bridge.enter_task();
        let task = scope.handle();
        bridge.increase_events(task, 1).unwrap();

        let remote = bridge.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.decrease_events(task, 1).unwrap();
        });
        drop(scope);
        assert!(bridge.counter(task).is_none());
        t.join().unwrap();
    }

    #[test]
    fn test_spawn_background_runs_completion() {
        let bridge = ThreadBridge::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        bridge
            .spawn_background("vigil-test", Box::new(|| {}), Box::new(move || {
                flag.store(true, Ordering::Release)
            }))
            .unwrap();
        while !finished.load(Ordering::Acquire) {
            thread::yield_now();
        }
        assert_eq!(bridge.spawned(), 1);
    }

    #[test]
    fn test_topology() {
        let bridge = ThreadBridge::new();
        let cpus = bridge.cpu_count().unwrap();
        assert!(cpus >= 1);
        assert!(bridge.current_cpu().is_ok());
    }

    #[test]
    fn test_task_scope_not_send() {
        static_assertions::assert_not_impl_any!(TaskScope: Send, Sync);
        static_assertions::assert_impl_all!(ThreadBridge: Send, Sync);
    }
}
