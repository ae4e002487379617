//! Route event publication.
//!
//! One producer per process, configured for at-least-once delivery:
//! `acks=all`, idempotence, bounded retries, and a bounded wait for the
//! broker ack. Publish failures never fail the write that caused them; the
//! database commit is the source of truth.

use crate::config::KafkaConfig;
use crate::events::RouteEvent;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("broker rejected event: {0}")]
    Broker(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event, keyed by the route's partition key, waiting for
    /// the broker ack within the configured bound.
    async fn publish(&self, event: &RouteEvent) -> Result<(), PublishError>;

    fn is_ready(&self) -> bool {
        true
    }

    /// Flush pending deliveries within `timeout`. Called once at shutdown.
    fn flush(&self, _timeout: Duration) {}
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher").field("topic", &self.topic).finish()
    }
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.route_events_topic,
            acks = %config.acks,
            idempotent = config.idempotent,
            "creating Kafka producer"
        );
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", &config.acks)
            .set("retries", config.retries.to_string())
            .set("enable.idempotence", config.idempotent.to_string())
            .set("request.timeout.ms", config.request_timeout_ms.to_string())
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .create()
            .map_err(|e| PublishError::Broker(e.to_string()))?;
        Ok(Self {
            producer,
            topic: config.route_events_topic.clone(),
            request_timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &RouteEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;
        let key = event.partition_key();
        tracing::info!(
            action = %event.action,
            route = %event.key(),
            event_id = %event.event_id,
            "publishing route event"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        match self.producer.send(record, Timeout::After(self.request_timeout)).await {
            Ok((partition, offset)) => {
                tracing::info!(
                    topic = %self.topic,
                    partition,
                    offset,
                    "route event published"
                );
                Ok(())
            }
            Err((err, _)) => Err(PublishError::Broker(err.to_string())),
        }
    }

    fn flush(&self, timeout: Duration) {
        if let Err(err) = self.producer.flush(Timeout::After(timeout)) {
            tracing::warn!(error = %err, "Kafka producer flush failed");
        }
    }
}

/// Test publisher: records everything it is asked to publish, optionally
/// failing to exercise the best-effort contract.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RouteEvent>>,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<RouteEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &RouteEvent) -> Result<(), PublishError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PublishError::Broker("injected failure".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
