//! Read path: resolve a route key to its active endpoint URL.
//!
//! Three-tier lookup: positive cache, negative cache, relational store, with
//! write-through caching of whatever the store answered. Cache failures are
//! swallowed. Each dependency sits behind its own breaker: the cache circuit
//! wraps every cache call, the database circuit wraps only the relational
//! query, so cache traffic never counts against the database breaker.

use crate::cache::{CacheLookup, RouteCache};
use crate::events::RouteKey;
use crate::metrics::Metrics;
use crate::resilience::{CircuitBreaker, ResilienceError, RetryBudget};
use crate::store::{RouteStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a resolved URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    Cache,
    Database,
}

/// Business-level outcome of a resolve. `NotFound` is a value, not an error,
/// so it never trips the database circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Found { url: String, source: ResolveSource },
    NotFound,
}

pub struct ResolveEngine {
    cache: Arc<dyn RouteCache>,
    store: Arc<dyn RouteStore>,
    db_circuit: CircuitBreaker,
    cache_circuit: CircuitBreaker,
    cache_retry_budget: RetryBudget,
    metrics: Metrics,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl ResolveEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn RouteCache>,
        store: Arc<dyn RouteStore>,
        db_circuit: CircuitBreaker,
        cache_circuit: CircuitBreaker,
        cache_retry_budget: RetryBudget,
        metrics: Metrics,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            db_circuit,
            cache_circuit,
            cache_retry_budget,
            metrics,
            positive_ttl,
            negative_ttl,
        }
    }

    /// Resolve `key`. A `CircuitOpen` error means the cache could not answer
    /// and the database breaker refused the query; callers with a safe
    /// fallback (the HTTP handler) may then consult [`Self::cached_url`].
    pub async fn resolve(
        &self,
        key: &RouteKey,
    ) -> Result<ResolveOutcome, ResilienceError<StoreError>> {
        let start = Instant::now();
        self.metrics.resolve_requests_total.inc();
        let cache_key = key.cache_key();
        tracing::info!(route = %key, "resolving endpoint");

        match self.cache_get(&cache_key).await {
            Some(CacheLookup::Hit(url)) => {
                tracing::info!(route = %key, "cache hit");
                self.metrics.resolve_cache_hit_total.inc();
                self.observe(start);
                return Ok(ResolveOutcome::Found { url, source: ResolveSource::Cache });
            }
            Some(CacheLookup::NegativeHit) => {
                tracing::info!(route = %key, "negative cache hit");
                self.metrics.resolve_negative_cache_hit_total.inc();
                self.observe(start);
                return Ok(ResolveOutcome::NotFound);
            }
            Some(CacheLookup::Miss) | None => {
                self.metrics.resolve_cache_miss_total.inc();
            }
        }

        tracing::debug!(route = %key, "querying database");
        let row = self
            .db_circuit
            .call(|| async {
                self.metrics.db_queries_total.inc();
                self.store.resolve_active_url(key).await
            })
            .await
            .map_err(|err| {
                if matches!(&err, ResilienceError::Inner(inner) if inner.is_retryable()) {
                    self.metrics.db_connection_errors_total.inc();
                }
                err
            })?;

        match row {
            Some(url) => {
                self.cache_put(&cache_key, Some(&url)).await;
                self.observe(start);
                Ok(ResolveOutcome::Found { url, source: ResolveSource::Database })
            }
            None => {
                tracing::warn!(route = %key, "route not found in database");
                self.cache_put(&cache_key, None).await;
                self.observe(start);
                Ok(ResolveOutcome::NotFound)
            }
        }
    }

    /// Final cache consultation for the circuit-open fallback: a positive
    /// entry or nothing.
    pub async fn cached_url(&self, key: &RouteKey) -> Option<String> {
        match self.cache.get(&key.cache_key()).await {
            Ok(CacheLookup::Hit(url)) => Some(url),
            _ => None,
        }
    }

    /// Lookup through the cache circuit with one budgeted retry. `None`
    /// means the cache could not answer and the store decides.
    async fn cache_get(&self, cache_key: &str) -> Option<CacheLookup> {
        match self.cache_circuit.call(|| self.cache.get(cache_key)).await {
            Ok(lookup) => Some(lookup),
            Err(err) => {
                tracing::warn!(error = %err, "cache lookup failed");
                if matches!(err, ResilienceError::Inner(_))
                    && self.cache_retry_budget.record_retry().is_ok()
                {
                    if let Ok(lookup) = self.cache_circuit.call(|| self.cache.get(cache_key)).await
                    {
                        return Some(lookup);
                    }
                }
                None
            }
        }
    }

    /// Write-through (or negative) cache population; errors are swallowed.
    async fn cache_put(&self, cache_key: &str, url: Option<&str>) {
        let result = match url {
            Some(url) => {
                self.cache_circuit.call(|| self.cache.set(cache_key, url, self.positive_ttl)).await
            }
            None => {
                self.cache_circuit
                    .call(|| self.cache.set_negative(cache_key, self.negative_ttl))
                    .await
            }
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to populate cache");
        }
    }

    fn observe(&self, start: Instant) {
        self.metrics.resolve_latency_seconds.observe(start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NEGATIVE_SENTINEL};
    use crate::resilience::{CircuitBreakerConfig, RetryBudgetConfig};

    fn engine(cache: Arc<MemoryCache>, store: Arc<MemoryRouteStore>) -> ResolveEngine {
        ResolveEngine::new(
            cache,
            store,
            CircuitBreaker::new(
                "database",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    timeout: Duration::from_secs(30),
                    window: Duration::from_secs(60),
                    min_calls: 5,
                },
            ),
            CircuitBreaker::new(
                "cache",
                CircuitBreakerConfig {
                    failure_threshold: 10,
                    timeout: Duration::from_secs(15),
                    window: Duration::from_secs(60),
                    min_calls: 10,
                },
            ),
            RetryBudget::new(
                "cache",
                RetryBudgetConfig {
                    max_retries: 20,
                    window: Duration::from_secs(60),
                    min_retry_interval: Duration::from_millis(0),
                },
            ),
            Metrics::new().unwrap(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
    }

    use crate::store::MemoryRouteStore;

    fn key() -> RouteKey {
        RouteKey::new("team-a", "payments", "prod", "v2")
    }

    #[tokio::test]
    async fn cache_hit_skips_the_database() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        cache
            .set("route:team-a:payments:prod:v2", "https://payments.example.com/v2", Duration::from_secs(60))
            .await
            .unwrap();

        let engine = engine(cache, store.clone());
        let outcome = engine.resolve(&key()).await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::Found {
                url: "https://payments.example.com/v2".to_string(),
                source: ResolveSource::Cache,
            }
        );
        assert_eq!(store.query_count(), 0);
        assert_eq!(engine.metrics.resolve_cache_hit_total.get(), 1);
    }

    #[tokio::test]
    async fn negative_cache_hit_short_circuits_to_not_found() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        cache
            .set("route:team-a:payments:prod:v2", NEGATIVE_SENTINEL, Duration::from_secs(10))
            .await
            .unwrap();

        let engine = engine(cache, store.clone());
        assert_eq!(engine.resolve(&key()).await.unwrap(), ResolveOutcome::NotFound);
        assert_eq!(store.query_count(), 0);
        assert_eq!(engine.metrics.resolve_negative_cache_hit_total.get(), 1);
    }

    #[tokio::test]
    async fn miss_falls_through_to_database_and_populates_cache() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        store.insert(key(), "https://payments.example.com/v2", true);

        let engine = engine(cache.clone(), store);
        let outcome = engine.resolve(&key()).await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::Found {
                url: "https://payments.example.com/v2".to_string(),
                source: ResolveSource::Database,
            }
        );
        assert_eq!(engine.metrics.resolve_cache_miss_total.get(), 1);

        // Second resolve is served from the populated cache.
        let outcome = engine.resolve(&key()).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::Found { source: ResolveSource::Cache, .. }));
        assert_eq!(engine.metrics.resolve_cache_hit_total.get(), 1);
    }

    #[tokio::test]
    async fn absent_route_is_negatively_cached() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());

        let engine = engine(cache.clone(), store.clone());
        assert_eq!(engine.resolve(&key()).await.unwrap(), ResolveOutcome::NotFound);
        assert_eq!(store.query_count(), 1);

        // Second call inside the negative TTL never reaches the store.
        assert_eq!(engine.resolve(&key()).await.unwrap(), ResolveOutcome::NotFound);
        assert_eq!(store.query_count(), 1);
        assert_eq!(engine.metrics.resolve_negative_cache_hit_total.get(), 1);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        store.set_failing(true);

        let engine = engine(cache, store);
        let err = engine.resolve(&key()).await.unwrap_err();
        assert!(err.is_inner());
        assert_eq!(engine.metrics.db_connection_errors_total.get(), 1);
    }

    #[tokio::test]
    async fn cache_answers_never_count_against_the_db_circuit() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        cache
            .set("route:team-a:payments:prod:v2", "https://cached", Duration::from_secs(60))
            .await
            .unwrap();
        cache.set_negative("route:other:s:prod:v1", Duration::from_secs(10)).await.unwrap();

        let engine = engine(cache, store.clone());
        engine.resolve(&key()).await.unwrap();
        engine.resolve(&RouteKey::new("other", "s", "prod", "v1")).await.unwrap();

        // Neither the hit nor the negative hit reached the database breaker.
        let snapshot = engine.db_circuit.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(store.query_count(), 0);

        // A miss does: exactly one gated call for the one query.
        store.insert(key(), "https://fresh", true);
        engine.cache.delete("route:team-a:payments:prod:v2").await.unwrap();
        engine.resolve(&key()).await.unwrap();
        assert_eq!(engine.db_circuit.snapshot().total_calls, 1);
    }

    #[tokio::test]
    async fn open_db_circuit_rejects_misses_without_touching_the_store() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        store.set_failing(true);

        let engine = engine(cache, store.clone());
        for _ in 0..5 {
            let _ = engine.resolve(&key()).await;
        }
        let queries_while_tripping = store.query_count();

        let err = engine.resolve(&key()).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(store.query_count(), queries_while_tripping);
    }

    #[tokio::test]
    async fn cached_url_ignores_negative_entries() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryRouteStore::new());
        cache.set_negative("route:team-a:payments:prod:v2", Duration::from_secs(10)).await.unwrap();

        let engine = engine(cache.clone(), store);
        assert_eq!(engine.cached_url(&key()).await, None);

        cache
            .set("route:team-a:payments:prod:v2", "https://cached", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(engine.cached_url(&key()).await, Some("https://cached".to_string()));
    }
}
