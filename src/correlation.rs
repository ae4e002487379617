//! Per-request correlation ids.
//!
//! The id lives in a tokio task-local so it follows a request (or one
//! consumed event) through every call without threading a parameter around.
//! A scope restores whatever value was previously bound when it exits, so
//! background work never inherits a stale id.

use std::future::Future;

tokio::task_local! {
    static CORRELATION_ID: Option<String>;
}

/// Maximum accepted length for an inbound correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 64;

/// Generate a fresh id of the form `req-<16 hex>`.
pub fn generate() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("req-{}", &hex[..16])
}

/// The id bound to the current task scope, if any.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok().flatten()
}

/// The current id, or `-` for log records outside any request scope.
pub fn current_or_dash() -> String {
    current().unwrap_or_else(|| "-".to_string())
}

/// Run `fut` with `id` bound as the correlation id. The previous binding (if
/// the caller was itself inside a scope) is restored on exit.
pub async fn scope<F>(id: Option<String>, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(id, fut).await
}

/// Accept an inbound header value, rejecting empty or oversized ids.
pub fn sanitize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_CORRELATION_ID_LEN {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_req_prefix_and_16_hex() {
        let id = generate();
        assert!(id.starts_with("req-"));
        let hex = &id["req-".len()..];
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate(), generate());
    }

    #[tokio::test]
    async fn current_is_none_outside_any_scope() {
        assert_eq!(current(), None);
        assert_eq!(current_or_dash(), "-");
    }

    #[tokio::test]
    async fn scope_binds_and_unbinds() {
        let seen = scope(Some("req-abc".into()), async { current() }).await;
        assert_eq!(seen, Some("req-abc".to_string()));
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn nested_scope_restores_outer_value() {
        scope(Some("req-outer".into()), async {
            assert_eq!(current().as_deref(), Some("req-outer"));
            scope(Some("req-inner".into()), async {
                assert_eq!(current().as_deref(), Some("req-inner"));
            })
            .await;
            assert_eq!(current().as_deref(), Some("req-outer"));
        })
        .await;
    }

    #[test]
    fn sanitize_rejects_empty_and_oversized() {
        assert_eq!(sanitize("  "), None);
        assert_eq!(sanitize(&"x".repeat(65)), None);
        assert_eq!(sanitize(" req-1 "), Some("req-1".to_string()));
    }
}
