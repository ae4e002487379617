//! Resilience behavior across the full HTTP stack: drain lifecycle with
//! in-flight work, bulkhead load shedding, and circuit recovery through the
//! half-open probe.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use traffic_manager::api::{router, AppState};
use traffic_manager::audit::MemoryAuditStore;
use traffic_manager::cache::MemoryCache;
use traffic_manager::config::Settings;
use traffic_manager::events::RouteKey;
use traffic_manager::kafka::producer::RecordingPublisher;
use traffic_manager::lifecycle;
use traffic_manager::metrics::Metrics;
use traffic_manager::resilience::{
    BulkheadConfig, CircuitBreakerConfig, ResilienceManager,
};
use traffic_manager::store::MemoryRouteStore;

struct Harness {
    state: AppState,
    store: Arc<MemoryRouteStore>,
}

fn harness(manager: ResilienceManager) -> Harness {
    let settings = Settings::from_lookup(|_| None).unwrap();
    let metrics = Metrics::new().unwrap();
    let resilience = Arc::new(manager);
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryRouteStore::new());
    let publisher = Arc::new(RecordingPublisher::new());

    let (resolver, writer) = lifecycle::build_engines(
        &settings,
        &resilience,
        cache.clone(),
        store.clone(),
        publisher.clone(),
        metrics.clone(),
    );

    let state = AppState {
        resilience,
        resolver,
        writer,
        store: store.clone(),
        cache,
        audit: Arc::new(MemoryAuditStore::new()),
        publisher,
        metrics,
    };
    Harness { state, store }
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn resolve_request() -> Request<Body> {
    Request::builder()
        .uri("/api/v1/routes/resolve?tenant=t&service=s&env=prod&version=v1")
        .body(Body::empty())
        .unwrap()
}

fn key() -> RouteKey {
    RouteKey::new("t", "s", "prod", "v1")
}

#[tokio::test]
async fn drain_finishes_in_flight_work_and_rejects_new_requests() {
    let h = harness(ResilienceManager::new());
    h.store.insert(key(), "https://s.t.example.com/v1", true);
    h.store.set_delay(Some(Duration::from_millis(150)));

    let slow = {
        let state = h.state.clone();
        tokio::spawn(async move { send(&state, resolve_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.state.resilience.drainer().in_flight(), 1);

    h.state.resilience.drainer().start_drain();

    let (status, body) = send(&h.state, resolve_request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Service is shutting down");

    // The request admitted before the drain still completes normally.
    let drained = h.state.resilience.drainer().await_drain(Duration::from_secs(1)).await;
    assert!(drained);
    let (status, body) = slow.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://s.t.example.com/v1");
}

#[tokio::test]
async fn drain_times_out_when_work_outlasts_the_bound() {
    let h = harness(ResilienceManager::new());
    h.store.insert(key(), "https://x", true);
    h.store.set_delay(Some(Duration::from_millis(300)));

    let slow = {
        let state = h.state.clone();
        tokio::spawn(async move { send(&state, resolve_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.state.resilience.drainer().start_drain();

    assert!(!h.state.resilience.drainer().await_drain(Duration::from_millis(50)).await);
    let _ = slow.await.unwrap();
}

#[tokio::test]
async fn saturated_read_bulkhead_sheds_load() {
    let manager = ResilienceManager::builder()
        .read_bulkhead(BulkheadConfig {
            max_concurrent: 1,
            max_wait: Duration::from_millis(20),
        })
        .build();
    let h = harness(manager);
    h.store.insert(key(), "https://x", true);
    h.store.set_delay(Some(Duration::from_millis(200)));

    let first = {
        let state = h.state.clone();
        tokio::spawn(async move { send(&state, resolve_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = send(&h.state, resolve_request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Service overloaded");

    let (status, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn write_bulkhead_is_isolated_from_read_saturation() {
    let manager = ResilienceManager::builder()
        .read_bulkhead(BulkheadConfig {
            max_concurrent: 1,
            max_wait: Duration::from_millis(20),
        })
        .build();
    let h = harness(manager);
    h.store.insert(key(), "https://x", true);
    h.store.set_delay(Some(Duration::from_millis(150)));

    let slow_read = {
        let state = h.state.clone();
        tokio::spawn(async move { send(&state, resolve_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    // A read spike cannot starve writes: separate ceilings.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/routes")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "tenant": "t2", "service": "s2", "env": "prod", "version": "v1",
                "url": "https://s2.t2.example.com/v1",
            }))
            .unwrap(),
        ))
        .unwrap();
    let (status, body) = send(&h.state, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["is_active"], true);

    let _ = slow_read.await.unwrap();
}

#[tokio::test]
async fn db_circuit_recovers_through_the_half_open_probe() {
    let manager = ResilienceManager::builder()
        .db_circuit(CircuitBreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_millis(100),
            window: Duration::from_secs(10),
            min_calls: 2,
        })
        .build();
    let h = harness(manager);
    h.store.insert(key(), "https://x", true);
    h.store.set_failing(true);

    for _ in 0..2 {
        let (status, _) = send(&h.state, resolve_request()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Open: no cached entry, so the rejection surfaces as 503.
    let (status, body) = send(&h.state, resolve_request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Service temporarily unavailable");

    // Dependency heals; after the recovery timeout the probe closes the
    // circuit and traffic flows again.
    h.store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let (status, body) = send(&h.state, resolve_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://x");

    let (status, _) = send(&h.state, resolve_request()).await;
    assert_eq!(status, StatusCode::OK);
}
