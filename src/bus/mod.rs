//! Message bus for downstream event delivery.
//!
//! This module contains:
//! - `MessageBus` trait: delivery of outbox envelopes to a broker
//! - `EventEnvelope`: the wire format published downstream
//! - Implementations: in-process channel bus, mock for testing
//!
//! External brokers (AMQP, Kafka, Pub/Sub) are collaborators reached
//! through the `MessageBus` trait; they are not implemented in-tree.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod channel;
pub mod mock;

pub use channel::ChannelBus;
pub use mock::MockBus;

/// Version stamped on every published envelope.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Consumer '{name}' failed: {message}")]
    ConsumerFailed { name: String, message: String },
}

/// The wire format delivered to consumers.
///
/// `id` is the originating outbox event id and doubles as the consumer-side
/// idempotency key: re-processing the same `id` must be a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub schema_version: u32,
    pub payload: serde_json::Value,
}

/// Interface for event delivery to a message broker.
///
/// Implementations must be safe to call from multiple relay workers; the
/// outbox table, not the bus, is the coordination point between them.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one envelope. Delivery is at-least-once: a crash between a
    /// broker ack and the durable status update re-publishes the envelope.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Handler for envelopes received from the bus.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Name used for logging and error reports.
    fn name(&self) -> &str;

    /// Process one envelope.
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Result<()>;
}
