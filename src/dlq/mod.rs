//! Dead letter queue (DLQ) infrastructure.
//!
//! An outbox event that exhausts its retry budget is moved here for human
//! triage. Rows keep the full original payload so an operator can inspect,
//! `resolve` (handled out of band), `ignore` (never deliver), or `requeue`
//! (re-insert into the outbox as a fresh `PENDING` row).
//!
//! Resolved and ignored rows are garbage-collected by the reconciler after
//! the retention window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::storage::Result;

/// Triage status of a dead-lettered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    Unresolved,
    Resolved,
    Ignored,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Unresolved => "UNRESOLVED",
            DeadLetterStatus::Resolved => "RESOLVED",
            DeadLetterStatus::Ignored => "IGNORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNRESOLVED" => Some(DeadLetterStatus::Unresolved),
            "RESOLVED" => Some(DeadLetterStatus::Resolved),
            "IGNORED" => Some(DeadLetterStatus::Ignored),
            _ => None,
        }
    }
}

/// A dead-lettered outbox event awaiting triage.
///
/// Mirrors the outbox row shape plus triage bookkeeping.
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub original_outbox_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub last_error: String,
    pub retry_count: i32,
    pub status: DeadLetterStatus,
    pub first_failed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Persistence and triage operations for dead letters.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>>;

    /// Unresolved rows, oldest first.
    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetterEvent>>;

    /// Mark a row handled out of band. Returns false if it was not unresolved.
    async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Mark a row as never-to-be-delivered. Returns false if not unresolved.
    async fn ignore(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Re-insert the original event into the outbox as `PENDING` with a
    /// fresh retry budget, and mark this row resolved, in one transaction.
    /// Returns false if the row was not unresolved.
    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Delete resolved/ignored rows created before `cutoff`. Reconciler GC.
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_by_status(&self, status: DeadLetterStatus) -> Result<i64>;
}
