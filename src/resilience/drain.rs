//! Graceful drain gate.
//!
//! While serving, every request enters through [`Drainer::begin_request`] and
//! holds an RAII guard for its duration. Once draining starts no new request
//! is admitted; [`Drainer::await_drain`] waits for in-flight work to finish.

use super::error::Draining;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug)]
struct DrainState {
    draining: bool,
    in_flight: usize,
    drain_started_at: Option<Instant>,
    total_rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainSnapshot {
    pub draining: bool,
    pub in_flight: usize,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct DrainShared {
    state: Mutex<DrainState>,
    idle: Notify,
}

#[derive(Clone, Debug)]
pub struct Drainer {
    shared: Arc<DrainShared>,
}

/// RAII in-flight marker; dropping it ends the request.
#[derive(Debug)]
pub struct DrainGuard {
    shared: Arc<DrainShared>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.shared.idle.notify_waiters();
        }
    }
}

impl Default for Drainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drainer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DrainShared {
                state: Mutex::new(DrainState {
                    draining: false,
                    in_flight: 0,
                    drain_started_at: None,
                    total_rejected: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Enter the serving critical section. Fails once draining has started.
    pub fn begin_request(&self) -> Result<DrainGuard, Draining> {
        let mut state = self.shared.state.lock().unwrap();
        if state.draining {
            state.total_rejected += 1;
            return Err(Draining);
        }
        state.in_flight += 1;
        Ok(DrainGuard { shared: self.shared.clone() })
    }

    /// Stop admitting new requests. Idempotent.
    pub fn start_drain(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.draining {
            state.draining = true;
            state.drain_started_at = Some(Instant::now());
            tracing::info!(in_flight = state.in_flight, "drain started");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.shared.state.lock().unwrap().draining
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().unwrap().in_flight
    }

    /// Wait until in-flight work reaches zero or `timeout` elapses.
    /// Returns `true` iff the drain completed within the bound.
    pub async fn await_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking to avoid a missed wakeup.
            let idle = self.shared.idle.notified();
            if self.shared.state.lock().unwrap().in_flight == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, idle).await.is_err() {
                return self.shared.state.lock().unwrap().in_flight == 0;
            }
        }
    }

    pub fn snapshot(&self) -> DrainSnapshot {
        let state = self.shared.state.lock().unwrap();
        DrainSnapshot {
            draining: state.draining,
            in_flight: state.in_flight,
            total_rejected: state.total_rejected,
        }
    }
}
