//! Background maintenance: flushing sealed memtables and compaction.
//!
//! One thread per engine. It sleeps on a condition variable and wakes when a
//! memtable is sealed or when `background_interval` elapses. The thread holds
//! only a `Weak<Engine>`, so it never keeps a dropped engine alive.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{Engine, EngineError};

/// Wakeup and stop flags shared with the worker thread.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl Signal {
    pub(crate) fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Blocks until notified or `timeout` elapses. Returns `false` once the
    /// worker should exit.
    fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending && !self.is_stopped() {
            self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
        !self.is_stopped()
    }
}

pub(crate) fn spawn(
    engine: Weak<Engine>,
    signal: Arc<Signal>,
    interval: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("shoalkv-maintenance".into())
        .spawn(move || {
            debug!("maintenance worker started");
            while signal.wait(interval) {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.run_maintenance();
            }
            debug!("maintenance worker stopped");
        })
}

impl Engine {
    /// Wakes the worker, or does the work inline when background work is
    /// disabled.
    pub(crate) fn schedule_maintenance(&self) {
        if self.config.background_work {
            self.signal.notify();
        } else {
            self.run_maintenance();
        }
    }

    /// Flushes every sealed memtable, then compacts if the trigger is met.
    /// Failures are logged and counted, never propagated.
    pub(crate) fn run_maintenance(&self) {
        loop {
            match self.with_retries("flush", || self.flush_oldest_sealed()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.counters.background_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "background flush failed");
                    return;
                }
            }
        }
        if let Err(e) = self.maybe_compact() {
            self.counters.background_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "background compaction failed");
        }
    }

    /// Runs `op`, retrying transient I/O failures with exponential backoff.
    pub(crate) fn with_retries<T, F>(&self, operation: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Result<T, EngineError>,
    {
        let mut delay = self.config.retry_backoff;
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %e, "transient failure, retrying");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                result => return result,
            }
        }
    }
}
