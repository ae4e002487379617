//! Rejection types produced by resilience policies.

use std::fmt;
use std::time::Duration;

/// Unified error for operations wrapped by resilience policies.
///
/// `Inner` carries the wrapped operation's own error; the other variants are
/// rejections raised by a policy before or instead of invoking the operation.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open and the recovery timeout has not elapsed.
    CircuitOpen { failures: usize, open_for: Duration },
    /// The bulkhead could not grant a permit within its wait bound.
    BulkheadFull { in_flight: usize, max: usize },
    /// The process is draining and not accepting new work.
    Draining,
    /// The rolling retry budget is exhausted.
    RetryBudgetExceeded { in_window: usize, max: usize },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failures, open_for } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failures, open_for
                )
            }
            Self::BulkheadFull { in_flight, max } => {
                write!(f, "bulkhead rejected request ({} in-flight, max {})", in_flight, max)
            }
            Self::Draining => write!(f, "server is draining and not accepting new requests"),
            Self::RetryBudgetExceeded { in_window, max } => {
                write!(f, "retry budget exhausted ({} retries in window, max {})", in_window, max)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Draining)
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Extract the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Standalone rejection from [`crate::resilience::Bulkhead::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadFull {
    pub in_flight: usize,
    pub max: usize,
}

impl fmt::Display for BulkheadFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bulkhead rejected request ({} in-flight, max {})", self.in_flight, self.max)
    }
}

impl std::error::Error for BulkheadFull {}

/// Standalone rejection from [`crate::resilience::Drainer::begin_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draining;

impl fmt::Display for Draining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server is draining and not accepting new requests")
    }
}

impl std::error::Error for Draining {}

/// Standalone rejection from [`crate::resilience::RetryBudget::record_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudgetExceeded {
    pub in_window: usize,
    pub max: usize,
}

impl fmt::Display for RetryBudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retry budget exhausted ({} retries in window, max {})",
            self.in_window, self.max
        )
    }
}

impl std::error::Error for RetryBudgetExceeded {}

impl<E> From<BulkheadFull> for ResilienceError<E> {
    fn from(r: BulkheadFull) -> Self {
        Self::BulkheadFull { in_flight: r.in_flight, max: r.max }
    }
}

impl<E> From<Draining> for ResilienceError<E> {
    fn from(_: Draining) -> Self {
        Self::Draining
    }
}

impl<E> From<RetryBudgetExceeded> for ResilienceError<E> {
    fn from(r: RetryBudgetExceeded) -> Self {
        Self::RetryBudgetExceeded { in_window: r.in_window, max: r.max }
    }
}
