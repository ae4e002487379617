//! Route event consumers.
//!
//! Three worker groups subscribe to the same topic under distinct group ids:
//! cache invalidation, cache warming, and audit persistence. Delivery is
//! at-least-once, so every handler is idempotent. Handler errors are logged
//! and the loop continues; shutdown is cooperative at poll boundaries.

use crate::audit::AuditStore;
use crate::cache::RouteCache;
use crate::config::KafkaConfig;
use crate::correlation;
use crate::events::RouteEvent;
use crate::read_path::{ResolveEngine, ResolveOutcome};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to create consumer: {0}")]
    Setup(String),
    #[error("handler failed: {0}")]
    Handler(String),
}

/// The three worker groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    CacheInvalidation,
    CacheWarming,
    AuditLog,
}

impl ConsumerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheInvalidation => "cache-invalidation",
            Self::CacheWarming => "cache-warming",
            Self::AuditLog => "audit-log",
        }
    }

    /// Consumer group id: `<prefix>-<kind>`, so each use case scales
    /// independently.
    pub fn group_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.as_str())
    }
}

impl std::fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &RouteEvent) -> Result<(), ConsumerError>;
}

/// Removes the cached entry for the changed route. Deleting an absent key is
/// a no-op, so re-delivery is harmless.
pub struct InvalidationHandler {
    cache: Arc<dyn RouteCache>,
}

impl InvalidationHandler {
    pub fn new(cache: Arc<dyn RouteCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for InvalidationHandler {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    async fn handle(&self, event: &RouteEvent) -> Result<(), ConsumerError> {
        let cache_key = event.key().cache_key();
        self.cache
            .delete(&cache_key)
            .await
            .map_err(|e| ConsumerError::Handler(e.to_string()))?;
        tracing::info!(cache_key = %cache_key, "cache invalidated");
        Ok(())
    }
}

/// Re-resolves the changed route through the read engine, which repopulates
/// the cache as a side effect. A missing route is a non-error outcome.
pub struct WarmingHandler {
    resolver: Arc<ResolveEngine>,
}

impl WarmingHandler {
    pub fn new(resolver: Arc<ResolveEngine>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl EventHandler for WarmingHandler {
    fn name(&self) -> &'static str {
        "cache-warming"
    }

    async fn handle(&self, event: &RouteEvent) -> Result<(), ConsumerError> {
        let key = event.key();
        match self.resolver.resolve(&key).await {
            Ok(ResolveOutcome::Found { .. }) => {
                tracing::info!(route = %key, "cache warmed");
                Ok(())
            }
            Ok(ResolveOutcome::NotFound) => {
                tracing::info!(route = %key, "cache warming skipped, route not found");
                Ok(())
            }
            Err(err) => Err(ConsumerError::Handler(err.to_string())),
        }
    }
}

/// Persists the audit projection; the unique `event_id` index makes repeat
/// deliveries a no-op.
pub struct AuditHandler {
    audit: Arc<dyn AuditStore>,
}

impl AuditHandler {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &'static str {
        "audit-log"
    }

    async fn handle(&self, event: &RouteEvent) -> Result<(), ConsumerError> {
        let stored = self
            .audit
            .insert(event)
            .await
            .map_err(|e| ConsumerError::Handler(e.to_string()))?;
        if stored {
            tracing::info!(event_id = %event.event_id, route = %event.key(), "audit event saved");
        }
        Ok(())
    }
}

/// Poll/handle loop over one consumer group.
pub struct ConsumerRuntime {
    consumer: StreamConsumer,
    handler: Box<dyn EventHandler>,
    poll_timeout: Duration,
    kind: ConsumerKind,
}

impl ConsumerRuntime {
    pub fn new(
        config: &KafkaConfig,
        kind: ConsumerKind,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self, ConsumerError> {
        let group_id = kind.group_id(&config.consumer_group_prefix);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.consumer_auto_offset_reset)
            .set("enable.auto.commit", config.consumer_auto_commit.to_string())
            .create()
            .map_err(|e| ConsumerError::Setup(e.to_string()))?;
        consumer
            .subscribe(&[&config.route_events_topic])
            .map_err(|e| ConsumerError::Setup(e.to_string()))?;
        tracing::info!(
            kind = %kind,
            group_id = %group_id,
            topic = %config.route_events_topic,
            "Kafka consumer started"
        );
        Ok(Self { consumer, handler, poll_timeout: config.consumer_poll_timeout(), kind })
    }

    /// Run until `shutdown` resolves. The flag is observed at poll
    /// boundaries; an in-flight message finishes before the loop exits.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(kind = %self.kind, "shutdown requested, stopping consumer");
                    break;
                }
                polled = tokio::time::timeout(self.poll_timeout, self.consumer.recv()) => {
                    match polled {
                        // Poll boundary with no message.
                        Err(_) => continue,
                        Ok(Err(err)) => {
                            tracing::error!(error = %err, kind = %self.kind, "consumer poll failed");
                        }
                        Ok(Ok(message)) => {
                            let payload = message.payload().map(<[u8]>::to_vec);
                            drop(message);
                            if let Some(payload) = payload {
                                self.dispatch(&payload).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Decode one message and run the handler inside the event's correlation
    /// scope. Errors are logged and swallowed so the loop keeps consuming.
    pub async fn dispatch(&self, payload: &[u8]) {
        let event: RouteEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, kind = %self.kind, "discarding undecodable event");
                return;
            }
        };
        dispatch_event(self.handler.as_ref(), &event).await;
    }
}

/// Shared dispatch: restore the correlation context from the event, then run
/// the handler. Used by the runtime and directly by tests.
pub async fn dispatch_event(handler: &dyn EventHandler, event: &RouteEvent) {
    use tracing::Instrument;

    let correlation_id = event.correlation_id.clone();
    let span = tracing::info_span!(
        "consume",
        handler = handler.name(),
        correlation_id = %correlation_id.as_deref().unwrap_or("-"),
    );
    let result = correlation::scope(correlation_id, handler.handle(event))
        .instrument(span)
        .await;
    if let Err(err) = result {
        tracing::error!(
            error = %err,
            handler = handler.name(),
            event_id = %event.event_id,
            "event handler failed, continuing"
        );
    }
}
