//! HTTP surface: router assembly and middleware wiring.
//!
//! Middleware order, outermost first: correlation, request metrics, then the
//! drain gate on the route endpoints. Health probes, `/metrics`, and
//! `/health/resilience` bypass the drain gate so they keep serving while the
//! process drains.

mod error;
mod handlers;
mod middleware;
mod state;

pub use error::ApiError;
pub use state::{AppState, SERVICE_NAME};

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let route_api = Router::new()
        .route("/api/v1/routes/resolve", get(handlers::resolve_route))
        .route("/api/v1/routes", post(handlers::create_route))
        .route("/api/v1/routes/activate", post(handlers::activate_route))
        .route("/api/v1/routes/deactivate", post(handlers::deactivate_route))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::drain_gate));

    let audit_api = Router::new()
        .route("/api/v1/audit/route", get(handlers::audit_route_history))
        .route("/api/v1/audit/recent", get(handlers::audit_recent_events))
        .route("/api/v1/audit/action", get(handlers::audit_events_by_action))
        .route("/api/v1/audit/time-range", get(handlers::audit_events_in_time_range));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/health/resilience", get(handlers::health_resilience))
        .route("/metrics", get(handlers::metrics))
        .merge(route_api)
        .merge(audit_api)
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::request_metrics))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::correlation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
