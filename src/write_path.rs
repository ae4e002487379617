//! Write path: create, activate, and deactivate routes.
//!
//! Each operation runs one transaction against the relational store, commits,
//! and then publishes the matching route event. Publication is best-effort;
//! the committed row is the source of truth and a failed publish only logs
//! and counts.

use crate::events::{RouteAction, RouteEvent, RouteKey};
use crate::kafka::producer::EventPublisher;
use crate::metrics::Metrics;
use crate::resilience::RetryBudget;
use crate::store::{RouteStore, StoreError};
use crate::correlation;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Business-level outcome of a write. Only [`StoreError`] is an error, so
/// validation misses and unknown routes never trip the database circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created(RouteRecord),
    Updated(RouteRecord),
    NotFound,
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub key: RouteKey,
    pub url: String,
    pub is_active: bool,
}

pub struct WriteEngine {
    store: Arc<dyn RouteStore>,
    publisher: Arc<dyn EventPublisher>,
    db_retry_budget: RetryBudget,
    metrics: Metrics,
}

impl WriteEngine {
    pub fn new(
        store: Arc<dyn RouteStore>,
        publisher: Arc<dyn EventPublisher>,
        db_retry_budget: RetryBudget,
        metrics: Metrics,
    ) -> Self {
        Self { store, publisher, db_retry_budget, metrics }
    }

    /// Create a route, or update URL and reactivate if it already exists.
    pub async fn create(&self, key: &RouteKey, url: &str) -> Result<WriteOutcome, StoreError> {
        let start = Instant::now();
        self.metrics.write_requests_total.inc();
        tracing::info!(route = %key, url, "creating route");

        if !key.is_complete() {
            self.metrics.write_failure_total.inc();
            return Ok(WriteOutcome::Validation(
                "all of tenant, service, env, version are required".to_string(),
            ));
        }
        let url = url.trim();
        if url.is_empty() {
            self.metrics.write_failure_total.inc();
            return Ok(WriteOutcome::Validation("url cannot be empty".to_string()));
        }

        let upsert = self
            .with_db_retry(|| self.store.upsert_route(key, url))
            .await
            .inspect_err(|_| self.metrics.write_failure_total.inc())?;

        self.metrics.write_success_total.inc();
        self.metrics.write_latency_seconds.observe(start.elapsed().as_secs_f64());
        tracing::info!(route = %key, "route created");

        self.publish(RouteAction::Created, key, url).await;

        let record =
            RouteRecord { key: key.clone(), url: url.to_string(), is_active: upsert.is_active };
        Ok(if upsert.inserted {
            WriteOutcome::Created(record)
        } else {
            WriteOutcome::Updated(record)
        })
    }

    /// Make the route visible to the read path again.
    pub async fn activate(&self, key: &RouteKey) -> Result<WriteOutcome, StoreError> {
        self.set_active(key, true, RouteAction::Activated).await
    }

    /// Soft-delete: the row stays, the read path stops seeing it.
    pub async fn deactivate(&self, key: &RouteKey) -> Result<WriteOutcome, StoreError> {
        self.set_active(key, false, RouteAction::Deactivated).await
    }

    async fn set_active(
        &self,
        key: &RouteKey,
        active: bool,
        action: RouteAction,
    ) -> Result<WriteOutcome, StoreError> {
        let start = Instant::now();
        self.metrics.write_requests_total.inc();
        tracing::info!(route = %key, action = %action, "updating route state");

        if !key.is_complete() {
            self.metrics.write_failure_total.inc();
            return Ok(WriteOutcome::Validation(
                "all of tenant, service, env, version are required".to_string(),
            ));
        }

        let url = self
            .with_db_retry(|| self.store.set_active(key, active))
            .await
            .inspect_err(|_| self.metrics.write_failure_total.inc())?;

        let Some(url) = url else {
            self.metrics.write_failure_total.inc();
            tracing::warn!(route = %key, "route not found");
            return Ok(WriteOutcome::NotFound);
        };

        self.metrics.write_success_total.inc();
        self.metrics.write_latency_seconds.observe(start.elapsed().as_secs_f64());
        tracing::info!(route = %key, action = %action, "route state updated");

        self.publish(action, key, &url).await;

        let record = RouteRecord { key: key.clone(), url, is_active: active };
        Ok(WriteOutcome::Updated(record))
    }

    /// Publish after commit; failures are recorded, never surfaced.
    async fn publish(&self, action: RouteAction, key: &RouteKey, url: &str) {
        let event = RouteEvent::new(action, key, url, correlation::current());
        match self.publisher.publish(&event).await {
            Ok(()) => {
                self.metrics.kafka_events_published_total.with_label_values(&[action.as_str()]).inc();
            }
            Err(err) => {
                self.metrics.kafka_events_failed_total.with_label_values(&[action.as_str()]).inc();
                tracing::warn!(error = %err, route = %key, "failed to publish route event");
            }
        }
    }

    /// One budgeted retry for pool-acquisition failures.
    async fn with_db_retry<T, Fut, Op>(&self, mut op: Op) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
        Op: FnMut() -> Fut,
    {
        self.metrics.db_queries_total.inc();
        match op().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() && self.db_retry_budget.record_retry().is_ok() => {
                self.metrics.db_connection_errors_total.inc();
                tracing::debug!(error = %err, "retrying after pool acquisition failure");
                self.metrics.db_queries_total.inc();
                op().await
            }
            Err(err) => {
                if err.is_retryable() {
                    self.metrics.db_connection_errors_total.inc();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::producer::RecordingPublisher;
    use crate::resilience::RetryBudgetConfig;
    use crate::store::MemoryRouteStore;
    use std::time::Duration;

    fn engine(
        store: Arc<MemoryRouteStore>,
        publisher: Arc<RecordingPublisher>,
    ) -> WriteEngine {
        WriteEngine::new(
            store,
            publisher,
            RetryBudget::new(
                "database",
                RetryBudgetConfig {
                    max_retries: 10,
                    window: Duration::from_secs(60),
                    min_retry_interval: Duration::from_millis(0),
                },
            ),
            Metrics::new().unwrap(),
        )
    }

    fn key() -> RouteKey {
        RouteKey::new("t", "s", "prod", "v1")
    }

    #[tokio::test]
    async fn create_persists_and_publishes_created_event() {
        let store = Arc::new(MemoryRouteStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = engine(store.clone(), publisher.clone());

        let outcome = engine.create(&key(), "https://s.t.example.com/v1").await.unwrap();
        let WriteOutcome::Created(record) = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert!(record.is_active);
        assert_eq!(
            store.resolve_active_url(&key()).await.unwrap(),
            Some("https://s.t.example.com/v1".to_string())
        );

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RouteAction::Created);
        assert_eq!(events[0].url, "https://s.t.example.com/v1");
        assert_eq!(engine.metrics.write_success_total.get(), 1);
    }

    #[tokio::test]
    async fn create_twice_reports_updated_with_new_url() {
        let store = Arc::new(MemoryRouteStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = engine(store.clone(), publisher);

        engine.create(&key(), "https://v1").await.unwrap();
        let outcome = engine.create(&key(), "https://v2").await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated(ref r) if r.url == "https://v2"));
        assert_eq!(store.resolve_active_url(&key()).await.unwrap(), Some("https://v2".to_string()));
    }

    #[tokio::test]
    async fn create_rejects_incomplete_key_and_blank_url() {
        let engine = engine(Arc::new(MemoryRouteStore::new()), Arc::new(RecordingPublisher::new()));

        let incomplete = RouteKey::new("", "s", "prod", "v1");
        assert!(matches!(
            engine.create(&incomplete, "https://x").await.unwrap(),
            WriteOutcome::Validation(_)
        ));
        assert!(matches!(
            engine.create(&key(), "   ").await.unwrap(),
            WriteOutcome::Validation(_)
        ));
        assert_eq!(engine.metrics.write_failure_total.get(), 2);
    }

    #[tokio::test]
    async fn deactivate_then_activate_round_trip() {
        let store = Arc::new(MemoryRouteStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = engine(store.clone(), publisher.clone());

        engine.create(&key(), "https://x").await.unwrap();
        let outcome = engine.deactivate(&key()).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated(ref r) if !r.is_active));
        assert_eq!(store.resolve_active_url(&key()).await.unwrap(), None);

        let outcome = engine.activate(&key()).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated(ref r) if r.is_active && r.url == "https://x"));
        assert_eq!(store.resolve_active_url(&key()).await.unwrap(), Some("https://x".to_string()));

        let actions: Vec<_> = publisher.events().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![RouteAction::Created, RouteAction::Deactivated, RouteAction::Activated]
        );
    }

    #[tokio::test]
    async fn activate_unknown_route_is_not_found() {
        let engine = engine(Arc::new(MemoryRouteStore::new()), Arc::new(RecordingPublisher::new()));
        assert_eq!(engine.activate(&key()).await.unwrap(), WriteOutcome::NotFound);
        assert_eq!(engine.metrics.write_failure_total.get(), 1);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_write() {
        let store = Arc::new(MemoryRouteStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_failing(true);
        let engine = engine(store.clone(), publisher);

        let outcome = engine.create(&key(), "https://x").await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Created(_)));
        assert_eq!(store.resolve_active_url(&key()).await.unwrap(), Some("https://x".to_string()));
        assert_eq!(
            engine
                .metrics
                .kafka_events_failed_total
                .with_label_values(&["created"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn events_carry_the_bound_correlation_id() {
        let store = Arc::new(MemoryRouteStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = engine(store, publisher.clone());

        correlation::scope(Some("req-write-1".to_string()), async {
            engine.create(&key(), "https://x").await.unwrap();
        })
        .await;

        assert_eq!(publisher.events()[0].correlation_id.as_deref(), Some("req-write-1"));
    }

    #[tokio::test]
    async fn store_errors_propagate_and_count_failures() {
        let store = Arc::new(MemoryRouteStore::new());
        store.set_failing(true);
        let engine = engine(store, Arc::new(RecordingPublisher::new()));

        assert!(engine.create(&key(), "https://x").await.is_err());
        assert_eq!(engine.metrics.write_failure_total.get(), 1);
    }
}
