//! Compliance artifacts with deadlines: consents and data-subject requests.
//!
//! Both are driven through their lifecycles by the reconciler: consents are
//! warned about and expired as `expires_at` approaches and passes; DSR
//! requests escalate monotonically through severity levels as `due_date`
//! nears. Every transition pairs its outbox event with the row update in
//! one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::json;
use uuid::Uuid;

use crate::cache::{build_cache, CacheConfig};
use crate::ids;
use crate::outbox::NewOutboxEvent;
use crate::storage::Result as StorageResult;

/// Aggregate type for consent outbox events.
pub const AGGREGATE_CONSENT: &str = "consent";
/// Aggregate type for DSR outbox events.
pub const AGGREGATE_DSR: &str = "dsr_request";

pub const EVENT_CONSENT_GRANTED: &str = "CONSENT_GRANTED";
pub const EVENT_CONSENT_REVOKED: &str = "CONSENT_REVOKED";
pub const EVENT_CONSENT_EXPIRING_SOON: &str = "CONSENT_EXPIRING_SOON";
pub const EVENT_CONSENT_EXPIRED: &str = "CONSENT_EXPIRED";

pub const EVENT_DSR_DEADLINE_WARNING: &str = "DSR_DEADLINE_WARNING";
pub const EVENT_DSR_DEADLINE_CRITICAL: &str = "DSR_DEADLINE_CRITICAL";
pub const EVENT_DSR_DEADLINE_OVERDUE: &str = "DSR_DEADLINE_OVERDUE";

/// Consent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    Granted,
    ExpiringSoon,
    Expired,
    Revoked,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Granted => "GRANTED",
            ConsentStatus::ExpiringSoon => "EXPIRING_SOON",
            ConsentStatus::Expired => "EXPIRED",
            ConsentStatus::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRANTED" => Some(ConsentStatus::Granted),
            "EXPIRING_SOON" => Some(ConsentStatus::ExpiringSoon),
            "EXPIRED" => Some(ConsentStatus::Expired),
            "REVOKED" => Some(ConsentStatus::Revoked),
            _ => None,
        }
    }

    /// Whether this status still counts as consent.
    pub fn grants_consent(&self) -> bool {
        matches!(self, ConsentStatus::Granted | ConsentStatus::ExpiringSoon)
    }
}

/// A consent grant for one document type.
#[derive(Debug, Clone)]
pub struct Consent {
    pub id: Uuid,
    pub account_id: Uuid,
    pub document_type: String,
    pub status: ConsentStatus,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Consent {
    /// Consent holds iff the status grants it and the expiry has not passed.
    pub fn has_consent(&self, now: DateTime<Utc>) -> bool {
        self.status.grants_consent() && self.expires_at.map(|e| now < e).unwrap_or(true)
    }
}

/// Monotonic severity marker for time-bound work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    None,
    Warning,
    Critical,
    Overdue,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::None => "NONE",
            EscalationLevel::Warning => "WARNING",
            EscalationLevel::Critical => "CRITICAL",
            EscalationLevel::Overdue => "OVERDUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(EscalationLevel::None),
            "WARNING" => Some(EscalationLevel::Warning),
            "CRITICAL" => Some(EscalationLevel::Critical),
            "OVERDUE" => Some(EscalationLevel::Overdue),
            _ => None,
        }
    }

    /// Event type announcing a transition to this level, if any.
    pub fn event_type(&self) -> Option<&'static str> {
        match self {
            EscalationLevel::None => None,
            EscalationLevel::Warning => Some(EVENT_DSR_DEADLINE_WARNING),
            EscalationLevel::Critical => Some(EVENT_DSR_DEADLINE_CRITICAL),
            EscalationLevel::Overdue => Some(EVENT_DSR_DEADLINE_OVERDUE),
        }
    }
}

/// Data-subject request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsrStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl DsrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DsrStatus::Open => "OPEN",
            DsrStatus::InProgress => "IN_PROGRESS",
            DsrStatus::Completed => "COMPLETED",
            DsrStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(DsrStatus::Open),
            "IN_PROGRESS" => Some(DsrStatus::InProgress),
            "COMPLETED" => Some(DsrStatus::Completed),
            "CANCELLED" => Some(DsrStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DsrStatus::Completed | DsrStatus::Cancelled)
    }
}

/// A data-subject request with a statutory deadline.
#[derive(Debug, Clone)]
pub struct DsrRequest {
    pub id: Uuid,
    pub account_id: Uuid,
    pub request_type: String,
    pub status: DsrStatus,
    pub due_date: DateTime<Utc>,
    pub escalation_level: EscalationLevel,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Escalation policy: warning inside 7 days, critical inside 2, overdue past
/// the deadline.
pub fn target_escalation(due_date: DateTime<Utc>, now: DateTime<Utc>) -> EscalationLevel {
    if due_date <= now {
        EscalationLevel::Overdue
    } else if due_date - now <= chrono::Duration::days(2) {
        EscalationLevel::Critical
    } else if due_date - now <= chrono::Duration::days(7) {
        EscalationLevel::Warning
    } else {
        EscalationLevel::None
    }
}

/// Persistence for consents.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Latest consent for `(account, document type)`.
    async fn get(&self, account_id: Uuid, document_type: &str) -> StorageResult<Option<Consent>>;

    /// Insert or re-grant, pairing the event in one transaction.
    async fn upsert_grant(&self, consent: &Consent, event: NewOutboxEvent) -> StorageResult<()>;

    /// Revoke a grant. Returns false if no granting consent existed.
    async fn revoke(
        &self,
        account_id: Uuid,
        document_type: &str,
        now: DateTime<Utc>,
        event: NewOutboxEvent,
    ) -> StorageResult<bool>;

    /// `GRANTED` consents with `expires_at` in `(now, horizon]`.
    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<Consent>>;

    /// CAS `GRANTED → EXPIRING_SOON`, emitting the warning event once.
    async fn mark_expiring_soon(&self, id: Uuid, event: NewOutboxEvent) -> StorageResult<bool>;

    /// Granting consents whose `expires_at` has passed.
    async fn find_expired(&self, now: DateTime<Utc>, limit: u32) -> StorageResult<Vec<Consent>>;

    /// CAS into `EXPIRED`, emitting the expiry event once.
    async fn mark_expired(&self, id: Uuid, event: NewOutboxEvent) -> StorageResult<bool>;
}

/// Persistence for DSR requests.
#[async_trait]
pub trait DsrStore: Send + Sync {
    async fn insert(&self, request: &DsrRequest) -> StorageResult<()>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<DsrRequest>>;

    /// Non-terminal requests due on or before `horizon` that are not yet
    /// `OVERDUE`.
    async fn find_escalation_candidates(
        &self,
        horizon: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<DsrRequest>>;

    /// CAS the escalation level forward, pairing the event in one
    /// transaction. Returns false when the stored level no longer matches
    /// `expected` (another sweeper won).
    async fn escalate(
        &self,
        id: Uuid,
        expected: EscalationLevel,
        target: EscalationLevel,
        event: NewOutboxEvent,
    ) -> StorageResult<bool>;
}

/// Consent reads and writes with a bounded-staleness cache.
///
/// Writes go through the store and invalidate. [`ConsentService::check`] is
/// the authoritative read and always consults the database; only
/// [`ConsentService::check_cached`] may serve from the cache, for call
/// sites that are not making an access decision.
pub struct ConsentService {
    store: Arc<dyn ConsentStore>,
    cache: Cache<(Uuid, String), bool>,
}

impl ConsentService {
    pub fn new(store: Arc<dyn ConsentStore>, cache_config: &CacheConfig) -> Self {
        Self {
            store,
            cache: build_cache(cache_config),
        }
    }

    /// Grant (or re-grant) consent for a document type.
    pub async fn grant(
        &self,
        account_id: Uuid,
        document_type: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<Consent> {
        let consent = Consent {
            id: ids::new_id(),
            account_id,
            document_type: document_type.to_string(),
            status: ConsentStatus::Granted,
            granted_at: Utc::now(),
            expires_at,
        };
        let event = NewOutboxEvent::new(
            AGGREGATE_CONSENT,
            consent.id.to_string(),
            EVENT_CONSENT_GRANTED,
            json!({
                "consentId": consent.id,
                "accountId": account_id,
                "documentType": document_type,
                "expiresAt": expires_at,
            }),
        );

        self.store.upsert_grant(&consent, event).await?;
        self.cache
            .invalidate(&(account_id, document_type.to_string()))
            .await;
        Ok(consent)
    }

    /// Revoke consent for a document type.
    pub async fn revoke(&self, account_id: Uuid, document_type: &str) -> StorageResult<bool> {
        let event = NewOutboxEvent::new(
            AGGREGATE_CONSENT,
            account_id.to_string(),
            EVENT_CONSENT_REVOKED,
            json!({
                "accountId": account_id,
                "documentType": document_type,
            }),
        );
        let revoked = self
            .store
            .revoke(account_id, document_type, Utc::now(), event)
            .await?;
        self.cache
            .invalidate(&(account_id, document_type.to_string()))
            .await;
        Ok(revoked)
    }

    /// Whether the account currently consents to the document type.
    ///
    /// Matches on document type; a consent for a different document never
    /// satisfies the check. Consent gates access decisions, so this always
    /// reads the store - a cache hit on its own must never grant access.
    /// The answer is written through to the cache for the non-authoritative
    /// read path.
    pub async fn check(&self, account_id: Uuid, document_type: &str) -> StorageResult<bool> {
        let has_consent = self
            .store
            .get(account_id, document_type)
            .await?
            .map(|c| c.has_consent(Utc::now()))
            .unwrap_or(false);
        self.cache
            .insert((account_id, document_type.to_string()), has_consent)
            .await;
        Ok(has_consent)
    }

    /// Cached variant for read-heavy call sites with no access decision
    /// behind them (dashboards, reporting). May serve a value stale by at
    /// most the cache TTL; misses fall through to the authoritative check.
    pub async fn check_cached(
        &self,
        account_id: Uuid,
        document_type: &str,
    ) -> StorageResult<bool> {
        let key = (account_id, document_type.to_string());
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        self.check(account_id, document_type).await
    }
}
