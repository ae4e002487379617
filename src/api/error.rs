//! JSON error responses for the HTTP surface.

use crate::events::RouteKey;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// An error response with the body shapes clients already depend on.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    pub fn missing_params(required: &[&str]) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Missing required parameters", "required": required }),
        )
    }

    pub fn missing_fields(required: &[&str]) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Missing required fields", "required": required }),
        )
    }

    pub fn body_not_json() -> Self {
        Self::new(StatusCode::BAD_REQUEST, json!({ "error": "Request body must be JSON" }))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Validation error", "message": message.into() }),
        )
    }

    pub fn invalid(error: &str, message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, json!({ "error": error, "message": message }))
    }

    pub fn invalid_action() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Invalid action",
                "valid_actions": ["created", "activated", "deactivated"],
            }),
        )
    }

    pub fn route_not_found(key: &RouteKey) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            json!({
                "error": "Route not found",
                "message": format!("No active route found for {}", key),
                "tenant": key.tenant,
                "service": key.service,
                "env": key.env,
                "version": key.version,
            }),
        )
    }

    pub fn write_target_not_found(key: &RouteKey) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            json!({
                "error": "Route not found",
                "message": format!("Route not found: {}", key),
            }),
        )
    }

    pub fn draining() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "Service is shutting down",
                "message": "Server is draining and not accepting new requests",
            }),
        )
    }

    pub fn overloaded(message: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": "Service overloaded", "message": message }),
        )
    }

    pub fn dependency_unavailable(message: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": "Service temporarily unavailable", "message": message }),
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": "Internal server error",
                "message": "An unexpected error occurred",
            }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
