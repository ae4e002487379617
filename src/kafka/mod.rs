//! Kafka integration: the route event producer and the consumer runtime.

pub mod consumer;
pub mod producer;

pub use consumer::{
    AuditHandler, ConsumerError, ConsumerKind, ConsumerRuntime, EventHandler, InvalidationHandler,
    WarmingHandler,
};
pub use producer::{EventPublisher, KafkaPublisher, PublishError, RecordingPublisher};
