//! End-to-end fan-out: write-engine events replayed through the three
//! consumer handlers, exercising the round-trip and idempotence laws.

use std::sync::Arc;
use std::time::Duration;

use traffic_manager::audit::{AuditFilter, AuditStore, MemoryAuditStore};
use traffic_manager::cache::{CacheLookup, MemoryCache, RouteCache};
use traffic_manager::events::{RouteAction, RouteKey};
use traffic_manager::kafka::consumer::{
    dispatch_event, AuditHandler, InvalidationHandler, WarmingHandler,
};
use traffic_manager::kafka::producer::RecordingPublisher;
use traffic_manager::metrics::Metrics;
use traffic_manager::read_path::{ResolveEngine, ResolveOutcome, ResolveSource};
use traffic_manager::resilience::ResilienceManager;
use traffic_manager::store::MemoryRouteStore;
use traffic_manager::write_path::{WriteEngine, WriteOutcome};

struct Pipeline {
    cache: Arc<MemoryCache>,
    store: Arc<MemoryRouteStore>,
    publisher: Arc<RecordingPublisher>,
    audit: Arc<MemoryAuditStore>,
    resolver: Arc<ResolveEngine>,
    writer: WriteEngine,
}

fn pipeline() -> Pipeline {
    let manager = ResilienceManager::new();
    let metrics = Metrics::new().unwrap();
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryRouteStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let audit = Arc::new(MemoryAuditStore::new());

    let resolver = Arc::new(ResolveEngine::new(
        cache.clone(),
        store.clone(),
        manager.db_circuit().clone(),
        manager.cache_circuit().clone(),
        manager.cache_retry_budget().clone(),
        metrics.clone(),
        Duration::from_secs(60),
        Duration::from_secs(10),
    ));
    let writer = WriteEngine::new(
        store.clone(),
        publisher.clone(),
        manager.db_retry_budget().clone(),
        metrics,
    );
    Pipeline { cache, store, publisher, audit, resolver, writer }
}

impl Pipeline {
    /// Drain published events through all three consumer groups, the way the
    /// broker would deliver them.
    async fn fan_out(&self) {
        let invalidate = InvalidationHandler::new(self.cache.clone());
        let warm = WarmingHandler::new(self.resolver.clone());
        let audit = AuditHandler::new(self.audit.clone());
        for event in self.publisher.events() {
            dispatch_event(&invalidate, &event).await;
            dispatch_event(&warm, &event).await;
            dispatch_event(&audit, &event).await;
        }
    }
}

fn key() -> RouteKey {
    RouteKey::new("t", "s", "prod", "v1")
}

#[tokio::test]
async fn create_then_resolve_returns_the_written_url() {
    let p = pipeline();
    p.writer.create(&key(), "https://s.t.example.com/v1").await.unwrap();
    p.fan_out().await;

    let outcome = p.resolver.resolve(&key()).await.unwrap();
    assert!(matches!(outcome, ResolveOutcome::Found { ref url, .. } if url == "https://s.t.example.com/v1"));
}

#[tokio::test]
async fn second_create_wins_after_invalidation() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();
    p.fan_out().await;
    assert!(matches!(
        p.resolver.resolve(&key()).await.unwrap(),
        ResolveOutcome::Found { source: ResolveSource::Cache, .. }
    ));

    p.writer.create(&key(), "https://v2").await.unwrap();
    p.fan_out().await;

    let outcome = p.resolver.resolve(&key()).await.unwrap();
    assert!(matches!(outcome, ResolveOutcome::Found { ref url, .. } if url == "https://v2"));
}

#[tokio::test]
async fn deactivate_then_resolve_is_not_found() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();
    p.fan_out().await;

    let outcome = p.writer.deactivate(&key()).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Updated(ref r) if !r.is_active));
    p.fan_out().await;

    assert_eq!(p.resolver.resolve(&key()).await.unwrap(), ResolveOutcome::NotFound);
}

#[tokio::test]
async fn deactivate_then_activate_restores_the_original_url() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();
    p.writer.deactivate(&key()).await.unwrap();
    p.writer.activate(&key()).await.unwrap();
    p.fan_out().await;

    let outcome = p.resolver.resolve(&key()).await.unwrap();
    assert!(matches!(outcome, ResolveOutcome::Found { ref url, .. } if url == "https://v1"));
}

#[tokio::test]
async fn warming_repopulates_the_cache_after_invalidation() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();
    p.fan_out().await;

    // The warming pass resolved through the engine, so the cache holds the
    // fresh URL even though invalidation deleted the key first.
    assert_eq!(
        p.cache.get("route:t:s:prod:v1").await.unwrap(),
        CacheLookup::Hit("https://v1".to_string())
    );
}

#[tokio::test]
async fn redelivery_persists_exactly_one_audit_document() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();

    // At-least-once delivery: run the audit pass twice over the same events.
    let audit = AuditHandler::new(p.audit.clone());
    for event in p.publisher.events() {
        dispatch_event(&audit, &event).await;
        dispatch_event(&audit, &event).await;
    }
    assert_eq!(p.audit.len(), 1);
}

#[tokio::test]
async fn audit_trail_preserves_per_route_order() {
    let p = pipeline();
    p.writer.create(&key(), "https://v1").await.unwrap();
    p.writer.deactivate(&key()).await.unwrap();
    p.writer.activate(&key()).await.unwrap();
    p.fan_out().await;

    let history = p.audit.route_history(&key(), 100).await.unwrap();
    assert_eq!(history.len(), 3);
    let actions: Vec<RouteAction> = history.iter().rev().map(|doc| doc.action).collect();
    assert_eq!(
        actions,
        vec![RouteAction::Created, RouteAction::Deactivated, RouteAction::Activated]
    );

    let recent = p.audit.recent_events(1, &AuditFilter::default(), 100).await.unwrap();
    assert_eq!(recent.len(), 3);
}

#[tokio::test]
async fn fanout_preserves_event_correlation_ids() {
    let p = pipeline();
    traffic_manager::correlation::scope(Some("req-fanout".to_string()), async {
        p.writer.create(&key(), "https://v1").await.unwrap();
    })
    .await;
    p.fan_out().await;

    let history = p.audit.route_history(&key(), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(p.publisher.events()[0].correlation_id.as_deref(), Some("req-fanout"));
}
