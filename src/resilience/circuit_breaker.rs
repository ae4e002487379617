//! Circuit breaker with a rolling failure window.
//!
//! Failures are timestamped and expired lazily: every evaluation drops
//! timestamps older than the window before deciding on a transition. The
//! wrapped operation is always invoked outside the state lock.

use super::error::ResilienceError;
use super::time::TimeSource;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// In-window failures required to trip the breaker.
    pub failure_threshold: usize,
    /// How long the breaker stays open before admitting a probe.
    pub timeout: Duration,
    /// Rolling window over which failures are counted.
    pub window: Duration,
    /// Minimum total calls before the breaker is allowed to trip.
    pub min_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps (time-source millis) within the rolling window.
    failures: Vec<u64>,
    opened_at_millis: u64,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
}

/// Point-in-time view of a breaker, exposed at `/health/resilience`.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub total_calls: u64,
    pub total_failures: u64,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    time: TimeSource,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                opened_at_millis: 0,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
            })),
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

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();
        Self::expire_failures(&mut inner, now, &self.config);
        CircuitSnapshot {
            state: inner.state,
            failures_in_window: inner.failures.len(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
        }
    }

    /// Run `operation` under the breaker's admission policy.
    ///
    /// Any `Err` from the operation counts as a failure. When the breaker is
    /// open and the recovery timeout has not elapsed the operation is not
    /// invoked at all.
    pub async fn call<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let was_probe = self.admit()?;
        let result = operation().await;
        self.record(result.is_ok(), was_probe);
        result.map_err(ResilienceError::Inner)
    }

    /// Admission check. Returns whether the admitted call is the half-open
    /// probe, or the rejection if the circuit is open.
    fn admit<E>(&self) -> Result<bool, ResilienceError<E>> {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();
        Self::expire_failures(&mut inner, now, &self.config);

        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                Ok(false)
            }
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.opened_at_millis);
                if elapsed < self.config.timeout.as_millis() as u64 {
                    return Err(ResilienceError::CircuitOpen {
                        failures: inner.failures.len(),
                        open_for: Duration::from_millis(elapsed),
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.failures.clear();
                inner.probe_in_flight = true;
                inner.total_calls += 1;
                tracing::info!(circuit = %self.name, "circuit breaker half-open, admitting probe");
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(ResilienceError::CircuitOpen {
                        failures: inner.failures.len(),
                        open_for: Duration::ZERO,
                    });
                }
                inner.probe_in_flight = true;
                inner.total_calls += 1;
                Ok(true)
            }
        }
    }

    fn record(&self, success: bool, was_probe: bool) {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock().unwrap();

        if was_probe {
            inner.probe_in_flight = false;
            if success {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at_millis = 0;
                tracing::info!(circuit = %self.name, "circuit breaker closed");
            } else {
                inner.total_failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at_millis = now;
                tracing::warn!(circuit = %self.name, "probe failed, circuit breaker open");
            }
            return;
        }

        if success {
            return;
        }

        inner.total_failures += 1;
        if inner.state == CircuitState::Closed {
            inner.failures.push(now);
            Self::expire_failures(&mut inner, now, &self.config);
            if inner.total_calls >= self.config.min_calls
                && inner.failures.len() >= self.config.failure_threshold
            {
                inner.state = CircuitState::Open;
                inner.opened_at_millis = now;
                tracing::error!(
                    circuit = %self.name,
                    failures = inner.failures.len(),
                    threshold = self.config.failure_threshold,
                    "circuit breaker open"
                );
            }
        }
    }

    fn expire_failures(inner: &mut BreakerInner, now: u64, config: &CircuitBreakerConfig) {
        let window = config.window.as_millis() as u64;
        inner.failures.retain(|&ts| now.saturating_sub(ts) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::time::testing::ManualTime;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_secs(10),
            window: Duration::from_secs(60),
            min_calls: 3,
        }
    }

    fn io_err() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "dependency down")
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<io::Error>> {
        breaker.call(|| async { Err::<(), _>(io_err()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, ResilienceError<io::Error>> {
        breaker.call(|| async { Ok::<_, io::Error>(42) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls_through() {
        let breaker = CircuitBreaker::new("db", test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_within_window() {
        let breaker = CircuitBreaker::new("db", test_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open circuit rejects without invoking the operation.
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        let result = breaker
            .call(|| {
                let invoked = invoked_clone.clone();
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn does_not_open_below_min_calls() {
        let breaker = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig { min_calls: 10, ..test_config() },
        );
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failures_expire_out_of_the_window() {
        let time = ManualTime::new();
        let breaker = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig { window: Duration::from_secs(60), ..test_config() },
        )
        .with_time_source(time.source());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Old failures age out before the third arrives.
        time.advance(61_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 1);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let time = ManualTime::new();
        let breaker = CircuitBreaker::new("db", test_config()).with_time_source(time.source());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        time.advance(10_001);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let time = ManualTime::new();
        let breaker = CircuitBreaker::new("db", test_config()).with_time_source(time.source());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        time.advance(10_001);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Still rejects until another timeout elapses.
        let result = succeed(&breaker).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let time = ManualTime::new();
        let breaker = CircuitBreaker::new("db", test_config()).with_time_source(time.source());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        time.advance(10_001);

        let gate = Arc::new(tokio::sync::Notify::new());
        let probe_breaker = breaker.clone();
        let probe_gate = gate.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| {
                    let gate = probe_gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, io::Error>(())
                    }
                })
                .await
        });

        // Give the probe a chance to be admitted, then contend.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = succeed(&breaker).await;
        assert!(result.unwrap_err().is_circuit_open());

        gate.notify_waiters();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn snapshot_reports_counters() {
        let breaker = CircuitBreaker::new("db", test_config());
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let snap = breaker.snapshot();
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.total_failures, 1);
        assert_eq!(snap.failures_in_window, 1);
        assert_eq!(snap.state, CircuitState::Closed);
    }
}
