//! Resilience primitives: circuit breaker, retry budget, bulkhead, and the
//! graceful drain gate, plus the process-wide manager that names them.
//!
//! Each primitive owns its state under its own lock and is cheap to clone;
//! wrapped operations always run outside the lock.

mod bulkhead;
mod circuit_breaker;
mod drain;
mod error;
mod manager;
mod retry_budget;
mod time;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadSnapshot};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use drain::{DrainGuard, DrainSnapshot, Drainer};
pub use error::{BulkheadFull, Draining, ResilienceError, RetryBudgetExceeded};
pub use manager::{ResilienceManager, ResilienceManagerBuilder, ResilienceSnapshot};
pub use retry_budget::{RetryBudget, RetryBudgetConfig, RetryBudgetSnapshot};
