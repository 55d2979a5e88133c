//! Transactional outbox.
//!
//! Domain events are inserted in the same database transaction as the state
//! change they describe, then relayed to the message bus by a background
//! worker (`relay`). Delivery is at-least-once; consumers deduplicate on the
//! event id (`consumer`).
//!
//! Row lifecycle: `PENDING → PROCESSING → COMPLETED`, or
//! `PROCESSING → FAILED` with a durable `retry_after`, and finally a move to
//! the dead-letter table once the retry budget is exhausted. The
//! `PROCESSING` status plus a compare-and-swap update is the mutex between
//! relay workers; no in-process coordination exists or is needed.

pub mod consumer;
pub mod relay;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::bus::{EventEnvelope, ENVELOPE_SCHEMA_VERSION};
use crate::ids;
use crate::storage::Result;

/// Default retry budget for a new outbox event.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "COMPLETED" => Some(OutboxStatus::Completed),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A durable pending message.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Build the wire envelope for this event.
    ///
    /// `occurredAt` is the producer-side creation time, not the delivery
    /// time, so redeliveries carry an identical envelope.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            event_type: self.event_type.clone(),
            occurred_at: self.created_at,
            schema_version: ENVELOPE_SCHEMA_VERSION,
            payload: self.payload.clone(),
        }
    }
}

/// An event to be appended inside a producer's transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        // The creation instant lives in the id's timestamp prefix; reusing
        // it keeps `created_at` and id order consistent by construction.
        let id = ids::new_id();
        let created_at = ids::id_timestamp(&id).unwrap_or_else(Utc::now);
        Self {
            id,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at,
        }
    }
}

/// Outbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Maximum rows claimed per poll.
    pub batch_size: u32,
    /// Poll interval before any adaptation.
    pub initial_poll_ms: u64,
    /// Floor for the adaptive poll interval.
    pub min_poll_ms: u64,
    /// Ceiling for the adaptive poll interval.
    pub max_poll_ms: u64,
    /// Base for the durable redelivery backoff (`base × 2^retry_count`).
    pub retry_backoff_base_ms: u64,
    /// Cap for the durable redelivery backoff.
    pub max_retry_backoff_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            initial_poll_ms: 1_000,
            min_poll_ms: 100,
            max_poll_ms: 10_000,
            retry_backoff_base_ms: 1_000,
            max_retry_backoff_ms: 3_600_000,
        }
    }
}

/// Relay-side operations on the outbox table.
///
/// Producers never see this trait: they append events through the
/// store-level composite operations that pair the append with the domain
/// write in one transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` deliverable rows.
    ///
    /// A row is deliverable when `PENDING`, or `FAILED` with
    /// `retry_after <= now`, and no earlier row for the same aggregate is
    /// still unprocessed. At most one row per aggregate is claimed per call,
    /// which is what gives consumers FIFO per aggregate. Each claim is a
    /// compare-and-swap to `PROCESSING`; rows lost to another worker are
    /// silently skipped.
    async fn claim_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxEvent>>;

    /// Record successful delivery: `COMPLETED` with `processed_at = now`.
    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Record a failed delivery: increment `retry_count`, set `last_error`
    /// and the durable `retry_after`, and return the row to `FAILED`.
    async fn mark_failed(&self, id: Uuid, error: &str, retry_after: DateTime<Utc>) -> Result<()>;

    /// Move an exhausted row to the dead-letter table and delete it from the
    /// outbox, in one transaction.
    async fn move_to_dead_letter(
        &self,
        event: &OutboxEvent,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Return a claimed-but-undispatched row to `PENDING` (shutdown path).
    async fn release(&self, id: Uuid) -> Result<()>;

    /// Return every `PROCESSING` row to `PENDING`.
    ///
    /// Called once at relay startup: a crash between claim and outcome
    /// leaves rows stuck in `PROCESSING`, and re-releasing them is exactly
    /// the re-delivery the at-least-once contract allows.
    async fn release_stale(&self) -> Result<u64>;

    /// Delete `COMPLETED` rows processed before `cutoff`. Reconciler GC.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Fetch one row by id.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    /// Count rows in a given status.
    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("GARBAGE"), None);
    }

    #[test]
    fn test_envelope_carries_event_id_and_creation_time() {
        let event = OutboxEvent {
            id: ids::new_id(),
            aggregate_type: "session".to_string(),
            aggregate_id: "abc".to_string(),
            event_type: "SESSION_REVOKED".to_string(),
            payload: serde_json::json!({"reason": "logout"}),
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            processed_at: None,
            retry_after: None,
            created_at: Utc::now(),
        };

        let envelope = event.envelope();
        assert_eq!(envelope.id, event.id);
        assert_eq!(envelope.occurred_at, event.created_at);
        assert_eq!(envelope.schema_version, ENVELOPE_SCHEMA_VERSION);
        assert_eq!(envelope.payload, event.payload);
    }

    #[test]
    fn test_config_defaults() {
        let config = OutboxConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.min_poll_ms, 100);
        assert_eq!(config.max_poll_ms, 10_000);
        assert_eq!(config.max_retry_backoff_ms, 3_600_000);
    }

    #[test]
    fn test_new_event_defaults() {
        let event = NewOutboxEvent::new("consent", "c-1", "CONSENT_GRANTED", serde_json::json!({}));
        assert_eq!(event.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(event.aggregate_type, "consent");
    }
}
