//! Rolling-window retry budget.
//!
//! Caps the aggregate number of retries a dependency may absorb within a
//! sliding window, preventing retry storms when the dependency is degraded.

use super::error::RetryBudgetExceeded;
use super::time::TimeSource;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryBudgetConfig {
    /// Maximum retries permitted within the window.
    pub max_retries: usize,
    /// Rolling window over which retries are counted.
    pub window: Duration,
    /// Minimum spacing between consecutive retries.
    pub min_retry_interval: Duration,
}

#[derive(Debug)]
struct BudgetInner {
    /// Retry timestamps (time-source millis) within the rolling window.
    retries: Vec<u64>,
    total_retries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryBudgetSnapshot {
    pub in_window: usize,
    pub max_retries: usize,
    pub total_retries: u64,
}

#[derive(Clone)]
pub struct RetryBudget {
    name: String,
    config: RetryBudgetConfig,
    inner: Arc<Mutex<BudgetInner>>,
    time: TimeSource,
}

impl std::fmt::Debug for RetryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBudget")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl RetryBudget {
    pub fn new(name: impl Into<String>, config: RetryBudgetConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BudgetInner { retries: Vec::new(), total_retries: 0 })),
            time: TimeSource::monotonic(),
        }
    }

    #[cfg(test)]
    fn with_time_source(mut self, time: TimeSource) -> Self {
        self.time = time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a retry would currently be permitted. Advisory only:
    /// [`Self::record_retry`] re-checks atomically.
    pub fn can_retry(&self) -> bool {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();
        self.permitted(&mut inner, now)
    }

    /// Consume one unit of budget, failing if it was exhausted between a
    /// `can_retry` check and this call.
    pub fn record_retry(&self) -> Result<(), RetryBudgetExceeded> {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();
        if !self.permitted(&mut inner, now) {
            tracing::warn!(budget = %self.name, "retry budget exhausted");
            return Err(RetryBudgetExceeded {
                in_window: inner.retries.len(),
                max: self.config.max_retries,
            });
        }
        inner.retries.push(now);
        inner.total_retries += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> RetryBudgetSnapshot {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();
        Self::expire(&mut inner, now, &self.config);
        RetryBudgetSnapshot {
            in_window: inner.retries.len(),
            max_retries: self.config.max_retries,
            total_retries: inner.total_retries,
        }
    }

    fn permitted(&self, inner: &mut BudgetInner, now: u64) -> bool {
        Self::expire(inner, now, &self.config);
        if inner.retries.len() >= self.config.max_retries {
            return false;
        }
        match inner.retries.last() {
            Some(&last) => {
                now.saturating_sub(last) >= self.config.min_retry_interval.as_millis() as u64
            }
            None => true,
        }
    }

    fn expire(inner: &mut BudgetInner, now: u64, config: &RetryBudgetConfig) {
        let window = config.window.as_millis() as u64;
        inner.retries.retain(|&ts| now.saturating_sub(ts) <= window);
    }
}
