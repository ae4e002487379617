//! Named resilience instances for the process.
//!
//! One manager owns every circuit breaker, retry budget, bulkhead, and the
//! drainer. The registry is immutable after construction; each primitive
//! locks only its own state. The builder exists so tests and specialized
//! deployments can tighten individual limits without touching the rest.

use super::bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use super::drain::{DrainSnapshot, Drainer};
use super::retry_budget::{RetryBudget, RetryBudgetConfig, RetryBudgetSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct ResilienceManager {
    db_circuit: CircuitBreaker,
    cache_circuit: CircuitBreaker,
    audit_circuit: CircuitBreaker,
    db_retry_budget: RetryBudget,
    cache_retry_budget: RetryBudget,
    read_bulkhead: Bulkhead,
    write_bulkhead: Bulkhead,
    audit_bulkhead: Bulkhead,
    drainer: Drainer,
}

/// JSON document served at `/health/resilience`.
#[derive(Debug, Serialize)]
pub struct ResilienceSnapshot {
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
    pub retry_budgets: BTreeMap<String, RetryBudgetSnapshot>,
    pub bulkheads: BTreeMap<String, BulkheadSnapshot>,
    pub graceful_drain: DrainSnapshot,
}

pub struct ResilienceManagerBuilder {
    db_circuit: CircuitBreakerConfig,
    cache_circuit: CircuitBreakerConfig,
    audit_circuit: CircuitBreakerConfig,
    db_retry_budget: RetryBudgetConfig,
    cache_retry_budget: RetryBudgetConfig,
    read_bulkhead: BulkheadConfig,
    write_bulkhead: BulkheadConfig,
    audit_bulkhead: BulkheadConfig,
}

impl Default for ResilienceManagerBuilder {
    fn default() -> Self {
        Self {
            db_circuit: CircuitBreakerConfig {
                failure_threshold: 5,
                timeout: Duration::from_secs(30),
                window: Duration::from_secs(60),
                min_calls: 5,
            },
            cache_circuit: CircuitBreakerConfig {
                failure_threshold: 10,
                timeout: Duration::from_secs(15),
                window: Duration::from_secs(60),
                min_calls: 10,
            },
            audit_circuit: CircuitBreakerConfig {
                failure_threshold: 5,
                timeout: Duration::from_secs(30),
                window: Duration::from_secs(60),
                min_calls: 5,
            },
            db_retry_budget: RetryBudgetConfig {
                max_retries: 10,
                window: Duration::from_secs(60),
                min_retry_interval: Duration::from_millis(100),
            },
            cache_retry_budget: RetryBudgetConfig {
                max_retries: 20,
                window: Duration::from_secs(60),
                min_retry_interval: Duration::from_millis(50),
            },
            read_bulkhead: BulkheadConfig {
                max_concurrent: 50,
                max_wait: Duration::from_secs(5),
            },
            write_bulkhead: BulkheadConfig {
                max_concurrent: 20,
                max_wait: Duration::from_secs(10),
            },
            audit_bulkhead: BulkheadConfig {
                max_concurrent: 10,
                max_wait: Duration::from_secs(5),
            },
        }
    }
}

impl ResilienceManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db_circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.db_circuit = config;
        self
    }

    pub fn cache_circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.cache_circuit = config;
        self
    }

    pub fn audit_circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.audit_circuit = config;
        self
    }

    pub fn db_retry_budget(mut self, config: RetryBudgetConfig) -> Self {
        self.db_retry_budget = config;
        self
    }

    pub fn cache_retry_budget(mut self, config: RetryBudgetConfig) -> Self {
        self.cache_retry_budget = config;
        self
    }

    pub fn read_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.read_bulkhead = config;
        self
    }

    pub fn write_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.write_bulkhead = config;
        self
    }

    pub fn audit_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.audit_bulkhead = config;
        self
    }

    pub fn build(self) -> ResilienceManager {
        ResilienceManager {
            db_circuit: CircuitBreaker::new("database", self.db_circuit),
            cache_circuit: CircuitBreaker::new("cache", self.cache_circuit),
            audit_circuit: CircuitBreaker::new("audit", self.audit_circuit),
            db_retry_budget: RetryBudget::new("database", self.db_retry_budget),
            cache_retry_budget: RetryBudget::new("cache", self.cache_retry_budget),
            read_bulkhead: Bulkhead::new("read_operations", self.read_bulkhead),
            write_bulkhead: Bulkhead::new("write_operations", self.write_bulkhead),
            audit_bulkhead: Bulkhead::new("audit_operations", self.audit_bulkhead),
            drainer: Drainer::new(),
        }
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceManager {
    pub fn new() -> Self {
        ResilienceManagerBuilder::default().build()
    }

    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::default()
    }

    pub fn db_circuit(&self) -> &CircuitBreaker {
        &self.db_circuit
    }

    pub fn cache_circuit(&self) -> &CircuitBreaker {
        &self.cache_circuit
    }

    pub fn audit_circuit(&self) -> &CircuitBreaker {
        &self.audit_circuit
    }

    pub fn db_retry_budget(&self) -> &RetryBudget {
        &self.db_retry_budget
    }

    pub fn cache_retry_budget(&self) -> &RetryBudget {
        &self.cache_retry_budget
    }

    pub fn read_bulkhead(&self) -> &Bulkhead {
        &self.read_bulkhead
    }

    pub fn write_bulkhead(&self) -> &Bulkhead {
        &self.write_bulkhead
    }

    pub fn audit_bulkhead(&self) -> &Bulkhead {
        &self.audit_bulkhead
    }

    pub fn drainer(&self) -> &Drainer {
        &self.drainer
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        let mut circuit_breakers = BTreeMap::new();
        for breaker in [&self.db_circuit, &self.cache_circuit, &self.audit_circuit] {
            circuit_breakers.insert(breaker.name().to_string(), breaker.snapshot());
        }
        let mut retry_budgets = BTreeMap::new();
        for budget in [&self.db_retry_budget, &self.cache_retry_budget] {
            retry_budgets.insert(budget.name().to_string(), budget.snapshot());
        }
        let mut bulkheads = BTreeMap::new();
        for bulkhead in [&self.read_bulkhead, &self.write_bulkhead, &self.audit_bulkhead] {
            bulkheads.insert(bulkhead.name().to_string(), bulkhead.snapshot());
        }
        ResilienceSnapshot {
            circuit_breakers,
            retry_budgets,
            bulkheads,
            graceful_drain: self.drainer.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;

    #[test]
    fn snapshot_names_every_instance() {
        let manager = ResilienceManager::new();
        let snapshot = manager.snapshot();

        assert_eq!(
            snapshot.circuit_breakers.keys().collect::<Vec<_>>(),
            vec!["audit", "cache", "database"]
        );
        assert_eq!(snapshot.retry_budgets.keys().collect::<Vec<_>>(), vec!["cache", "database"]);
        assert_eq!(
            snapshot.bulkheads.keys().collect::<Vec<_>>(),
            vec!["audit_operations", "read_operations", "write_operations"]
        );
        assert!(!snapshot.graceful_drain.draining);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let manager = ResilienceManager::new();
        let json = serde_json::to_value(manager.snapshot()).unwrap();
        assert_eq!(json["circuit_breakers"]["database"]["state"], "closed");
        assert_eq!(json["bulkheads"]["read_operations"]["max_concurrent"], 50);
        assert_eq!(json["graceful_drain"]["in_flight"], 0);
    }

    #[test]
    fn fresh_manager_starts_closed_and_serving() {
        let manager = ResilienceManager::new();
        assert_eq!(manager.db_circuit().state(), CircuitState::Closed);
        assert!(!manager.drainer().is_draining());
        assert!(manager.db_retry_budget().can_retry());
    }

    #[test]
    fn builder_overrides_individual_limits() {
        let manager = ResilienceManager::builder()
            .read_bulkhead(BulkheadConfig {
                max_concurrent: 1,
                max_wait: Duration::from_millis(5),
            })
            .db_circuit(CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_millis(50),
                window: Duration::from_secs(10),
                min_calls: 2,
            })
            .build();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.bulkheads["read_operations"].max_concurrent, 1);
        // Untouched instances keep their defaults.
        assert_eq!(snapshot.bulkheads["write_operations"].max_concurrent, 20);
    }
}
