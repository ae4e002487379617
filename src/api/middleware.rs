//! Request middleware: correlation binding, request metrics, and the drain
//! gate. Ordering (outermost first) is correlation, metrics, drain gate;
//! bulkheads and circuit breakers sit inside the handlers at the call sites.

use super::error::ApiError;
use super::state::AppState;
use crate::correlation;
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::Instrument;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Read or generate the correlation id, bind it for the request, and echo it
/// on the response.
pub async fn correlation(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(correlation::sanitize);

    let correlation_id = match provided {
        Some(id) => {
            state.metrics.correlation_ids_provided_total.inc();
            id
        }
        None => {
            state.metrics.correlation_ids_generated_total.inc();
            correlation::generate()
        }
    };

    let span = tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = correlation::scope(Some(correlation_id.clone()), next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Count and time every request by method, path template, and status.
pub async fn request_metrics(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    state
        .metrics
        .api_requests_total
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    state
        .metrics
        .api_request_duration_seconds
        .with_label_values(&[&method, &endpoint])
        .observe(elapsed.as_secs_f64());

    if elapsed.as_secs_f64() > 1.0 {
        tracing::warn!(%method, %endpoint, elapsed_secs = elapsed.as_secs_f64(), "slow request");
    }
    response
}

/// Reject new route traffic once draining has started; requests admitted
/// before the drain hold their in-flight guard until the response is built.
pub async fn drain_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.resilience.drainer().begin_request() {
        Ok(_guard) => next.run(request).await,
        Err(_) => ApiError::draining().into_response(),
    }
}
