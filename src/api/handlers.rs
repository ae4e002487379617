//! Route handlers for the HTTP surface.
//!
//! Every route endpoint sits behind the drain gate (middleware), then takes
//! its bulkhead permit and wraps the dependency call in the matching circuit
//! breaker. Business outcomes map to statuses here; the engines never see
//! HTTP.

use super::error::ApiError;
use super::state::{AppState, SERVICE_NAME};
use crate::audit::{AuditEventView, AuditFilter};
use crate::events::{RouteAction, RouteKey};
use crate::read_path::ResolveOutcome;
use crate::write_path::{RouteRecord, WriteOutcome};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

const ROUTE_KEY_PARAMS: [&str; 4] = ["tenant", "service", "env", "version"];

// ---------------------------------------------------------------------------
// Health and observability
// ---------------------------------------------------------------------------

pub async fn health() -> Response {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME })).into_response()
}

pub async fn health_live() -> Response {
    Json(json!({ "status": "alive", "service": SERVICE_NAME })).into_response()
}

/// Readiness: the database is the only critical dependency; cache, broker,
/// and audit store degrade gracefully. Draining always reports not-ready so
/// load balancers stop routing here.
pub async fn health_ready(State(state): State<AppState>) -> Response {
    let drainer = state.resilience.drainer();
    let is_draining = drainer.is_draining();

    let database = match state.store.ping().await {
        Ok(()) => {
            let pool = state.store.pool_status();
            json!({
                "status": "healthy",
                "message": "Database is accessible",
                "pool": {
                    "max_connections": pool.max_connections,
                    "in_use": pool.in_use,
                    "available": pool.available,
                },
            })
        }
        Err(err) => {
            tracing::warn!(error = %err, "database health check failed");
            json!({ "status": "unhealthy", "message": format!("Database is not accessible: {err}") })
        }
    };

    let cache = match state.cache.ping().await {
        Ok(()) => json!({ "status": "healthy", "message": "Cache is accessible" }),
        Err(err) => {
            tracing::warn!(error = %err, "cache health check failed");
            json!({ "status": "degraded", "message": format!("Cache is not accessible: {err}") })
        }
    };

    let kafka = if state.publisher.is_ready() {
        json!({ "status": "healthy", "message": "Kafka producer is ready" })
    } else {
        json!({ "status": "degraded", "message": "Kafka producer is not ready" })
    };

    let mongodb = match state.audit.ping().await {
        Ok(()) => json!({ "status": "healthy", "message": "Audit store is accessible" }),
        Err(err) => {
            tracing::warn!(error = %err, "audit store health check failed");
            json!({
                "status": "degraded",
                "message": format!("Audit store is not accessible: {err}"),
            })
        }
    };

    let draining = json!({
        "status": if is_draining { "draining" } else { "not_draining" },
        "in_flight_requests": drainer.in_flight(),
        "message": if is_draining {
            "Server is draining and not accepting new requests"
        } else {
            "Server is ready"
        },
    });

    let ready = database["status"] == "healthy" && !is_draining;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "database": database,
                "cache": cache,
                "kafka": kafka,
                "mongodb": mongodb,
                "draining": draining,
            },
        })),
    )
        .into_response()
}

pub async fn health_resilience(State(state): State<AppState>) -> Response {
    Json(state.resilience.snapshot()).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.metrics.record_uptime();
    let body = state.metrics.render().map_err(|err| {
        tracing::error!(error = %err, "failed to render metrics");
        ApiError::internal()
    })?;
    Ok(([("content-type", "text/plain; version=0.0.4")], body).into_response())
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "message": "The requested endpoint does not exist",
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

pub async fn resolve_route(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let key = route_key_from(&params).ok_or(ApiError::missing_params(&ROUTE_KEY_PARAMS))?;

    let _permit = state.resilience.read_bulkhead().acquire().await.map_err(|_| {
        ApiError::overloaded("Too many concurrent requests. Please try again later.")
    })?;

    // The engine runs the relational query under the database circuit; a
    // CircuitOpen here means the cache had no answer either.
    match state.resolver.resolve(&key).await {
        Ok(ResolveOutcome::Found { url, .. }) => Ok(Json(json!({
            "tenant": key.tenant,
            "service": key.service,
            "env": key.env,
            "version": key.version,
            "url": url,
        }))
        .into_response()),
        Ok(ResolveOutcome::NotFound) => Err(ApiError::route_not_found(&key)),
        Err(err) if err.is_circuit_open() => {
            tracing::warn!(route = %key, "database circuit open, attempting cache fallback");
            match state.resolver.cached_url(&key).await {
                Some(url) => {
                    tracing::info!(route = %key, "serving cached data as circuit fallback");
                    Ok(Json(json!({
                        "tenant": key.tenant,
                        "service": key.service,
                        "env": key.env,
                        "version": key.version,
                        "url": url,
                        "source": "cache_fallback",
                    }))
                    .into_response())
                }
                None => Err(ApiError::dependency_unavailable(
                    "Database is currently unavailable. Please try again later.",
                )),
            }
        }
        Err(err) => {
            tracing::error!(error = %err, route = %key, "error resolving route");
            Err(ApiError::internal())
        }
    }
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

pub async fn create_route(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Ok(Json(data)) = body else {
        return Err(ApiError::body_not_json());
    };
    let key = route_key_from_body(&data);
    let url = field(&data, "url");
    let (Some(key), Some(url)) = (key, url) else {
        return Err(ApiError::missing_fields(&["tenant", "service", "env", "version", "url"]));
    };

    let _permit = write_permit(&state).await?;
    match state.resilience.db_circuit().call(|| state.writer.create(&key, &url)).await {
        Ok(WriteOutcome::Created(record)) | Ok(WriteOutcome::Updated(record)) => {
            Ok((StatusCode::CREATED, Json(record_body(&record))).into_response())
        }
        Ok(WriteOutcome::Validation(message)) => Err(ApiError::validation(message)),
        Ok(WriteOutcome::NotFound) => Err(ApiError::write_target_not_found(&key)),
        Err(err) => Err(map_write_dependency_error(err, &key, "creating")),
    }
}

pub async fn activate_route(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    set_route_state(state, body, true).await
}

pub async fn deactivate_route(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    set_route_state(state, body, false).await
}

async fn set_route_state(
    state: AppState,
    body: Result<Json<Value>, JsonRejection>,
    activate: bool,
) -> Result<Response, ApiError> {
    let Ok(Json(data)) = body else {
        return Err(ApiError::body_not_json());
    };
    let Some(key) = route_key_from_body(&data) else {
        return Err(ApiError::missing_fields(&ROUTE_KEY_PARAMS));
    };

    let _permit = write_permit(&state).await?;
    let call = state
        .resilience
        .db_circuit()
        .call(|| async {
            if activate {
                state.writer.activate(&key).await
            } else {
                state.writer.deactivate(&key).await
            }
        })
        .await;

    match call {
        Ok(WriteOutcome::Created(record)) | Ok(WriteOutcome::Updated(record)) => {
            Ok(Json(record_body(&record)).into_response())
        }
        Ok(WriteOutcome::NotFound) => Err(ApiError::write_target_not_found(&key)),
        Ok(WriteOutcome::Validation(message)) => Err(ApiError::validation(message)),
        Err(err) => Err(map_write_dependency_error(err, &key, "updating")),
    }
}

async fn write_permit(
    state: &AppState,
) -> Result<crate::resilience::BulkheadPermit, ApiError> {
    state.resilience.write_bulkhead().acquire().await.map_err(|_| {
        ApiError::overloaded("Too many concurrent write operations. Please try again later.")
    })
}

fn map_write_dependency_error<E: std::fmt::Display>(
    err: crate::resilience::ResilienceError<E>,
    key: &RouteKey,
    verb: &str,
) -> ApiError {
    if err.is_circuit_open() {
        tracing::error!(route = %key, "database circuit open, cannot write route");
        ApiError::dependency_unavailable("Database is currently unavailable. Please try again later.")
    } else {
        tracing::error!(error = %err, route = %key, "error {verb} route");
        ApiError::internal()
    }
}

fn record_body(record: &RouteRecord) -> Value {
    json!({
        "tenant": record.key.tenant,
        "service": record.key.service,
        "env": record.key.env,
        "version": record.key.version,
        "url": record.url,
        "is_active": record.is_active,
    })
}

// ---------------------------------------------------------------------------
// Audit queries
// ---------------------------------------------------------------------------

pub async fn audit_route_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let key = route_key_from(&params).ok_or(ApiError::missing_params(&ROUTE_KEY_PARAMS))?;
    let limit = parse_limit(&params)?;

    let _permit = audit_permit(&state).await?;
    let events = state
        .resilience
        .audit_circuit()
        .call(|| state.audit.route_history(&key, limit))
        .await
        .map_err(map_audit_error)?;

    let views: Vec<AuditEventView> =
        events.iter().map(|doc| AuditEventView::from_document(doc, false)).collect();
    Ok(Json(json!({
        "route": {
            "tenant": key.tenant,
            "service": key.service,
            "env": key.env,
            "version": key.version,
        },
        "count": views.len(),
        "events": views,
    }))
    .into_response())
}

pub async fn audit_recent_events(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let days = parse_int(&params, "days", 30)
        .map_err(|_| ApiError::invalid("Invalid days", "Days must be between 1 and 365"))?;
    if !(1..=365).contains(&days) {
        return Err(ApiError::invalid("Invalid days", "Days must be between 1 and 365"));
    }
    let limit = parse_limit(&params)?;
    let filter = audit_filter_from(&params);

    let _permit = audit_permit(&state).await?;
    let events = state
        .resilience
        .audit_circuit()
        .call(|| state.audit.recent_events(days, &filter, limit))
        .await
        .map_err(map_audit_error)?;

    let views: Vec<AuditEventView> =
        events.iter().map(|doc| AuditEventView::from_document(doc, true)).collect();
    Ok(Json(json!({ "days": days, "count": views.len(), "events": views })).into_response())
}

pub async fn audit_events_by_action(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let Some(raw_action) = params.get("action").filter(|value| !value.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameter",
                "required": ["action"],
                "valid_actions": ["created", "activated", "deactivated"],
            }),
        ));
    };
    let action: RouteAction =
        raw_action.parse().map_err(|_| ApiError::invalid_action())?;
    let hours = match params.get("hours") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::invalid("Invalid hours", "Hours must be a positive integer"))?,
        ),
        None => None,
    };
    let limit = parse_limit(&params)?;
    let filter = audit_filter_from(&params);

    let _permit = audit_permit(&state).await?;
    let events = state
        .resilience
        .audit_circuit()
        .call(|| state.audit.events_by_action(action, hours, &filter, limit))
        .await
        .map_err(map_audit_error)?;

    let views: Vec<AuditEventView> =
        events.iter().map(|doc| AuditEventView::from_document(doc, true)).collect();
    Ok(Json(json!({
        "action": action.as_str(),
        "hours": hours,
        "count": views.len(),
        "events": views,
    }))
    .into_response())
}

pub async fn audit_events_in_time_range(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (Some(start_raw), Some(end_raw)) = (params.get("start_time"), params.get("end_time"))
    else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["start_time", "end_time"],
                "format": "ISO 8601 (e.g., 2024-01-14T17:00:00Z)",
            }),
        ));
    };
    let start = parse_timestamp(start_raw)?;
    let end = parse_timestamp(end_raw)?;
    if start >= end {
        return Err(ApiError::invalid("Invalid time range", "start_time must be before end_time"));
    }
    let action = match params.get("action").filter(|value| !value.is_empty()) {
        Some(raw) => Some(raw.parse::<RouteAction>().map_err(|_| ApiError::invalid_action())?),
        None => None,
    };
    let limit = parse_limit(&params)?;
    let filter = audit_filter_from(&params);

    let _permit = audit_permit(&state).await?;
    let events = state
        .resilience
        .audit_circuit()
        .call(|| state.audit.events_in_range(start, end, action, &filter, limit))
        .await
        .map_err(map_audit_error)?;

    let views: Vec<AuditEventView> =
        events.iter().map(|doc| AuditEventView::from_document(doc, true)).collect();
    Ok(Json(json!({
        "start_time": start_raw,
        "end_time": end_raw,
        "count": views.len(),
        "events": views,
    }))
    .into_response())
}

async fn audit_permit(
    state: &AppState,
) -> Result<crate::resilience::BulkheadPermit, ApiError> {
    state.resilience.audit_bulkhead().acquire().await.map_err(|_| {
        ApiError::overloaded("Too many concurrent requests. Please try again later.")
    })
}

fn map_audit_error<E: std::fmt::Display>(err: crate::resilience::ResilienceError<E>) -> ApiError {
    if err.is_circuit_open() {
        ApiError::dependency_unavailable(
            "Audit store is currently unavailable. Please try again later.",
        )
    } else {
        tracing::error!(error = %err, "audit query failed");
        ApiError::internal()
    }
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn route_key_from(params: &HashMap<String, String>) -> Option<RouteKey> {
    let get = |name: &str| params.get(name).filter(|value| !value.is_empty()).cloned();
    Some(RouteKey {
        tenant: get("tenant")?,
        service: get("service")?,
        env: get("env")?,
        version: get("version")?,
    })
}

fn route_key_from_body(data: &Value) -> Option<RouteKey> {
    Some(RouteKey {
        tenant: field(data, "tenant")?,
        service: field(data, "service")?,
        env: field(data, "env")?,
        version: field(data, "version")?,
    })
}

fn field(data: &Value, name: &str) -> Option<String> {
    data.get(name).and_then(Value::as_str).filter(|value| !value.is_empty()).map(String::from)
}

fn audit_filter_from(params: &HashMap<String, String>) -> AuditFilter {
    let get = |name: &str| params.get(name).filter(|value| !value.is_empty()).cloned();
    AuditFilter { tenant: get("tenant"), service: get("service"), env: get("env") }
}

fn parse_limit(params: &HashMap<String, String>) -> Result<i64, ApiError> {
    let limit = parse_int(params, "limit", 100)
        .map_err(|_| ApiError::invalid("Invalid limit", "Limit must be between 1 and 1000"))?;
    if !(1..=1000).contains(&limit) {
        return Err(ApiError::invalid("Invalid limit", "Limit must be between 1 and 1000"));
    }
    Ok(limit)
}

fn parse_int(params: &HashMap<String, String>, name: &str, default: i64) -> Result<i64, ()> {
    match params.get(name) {
        Some(raw) => raw.parse().map_err(|_| ()),
        None => Ok(default),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Invalid timestamp format",
                "message": err.to_string(),
                "format": "ISO 8601 (e.g., 2024-01-14T17:00:00Z)",
            }),
        )
    })
}
