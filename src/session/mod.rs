//! Session & token lifecycle.
//!
//! Issues opaque access/refresh tokens, authenticates them, rotates them
//! with refresh-token reuse detection, and revokes them with a cascade over
//! the whole account. Only token hashes are ever persisted; plaintext
//! tokens leave the engine exactly once, in the response that issued them.
//!
//! Validity is always the conjunction `is_active ∧ expires_at > now`,
//! evaluated at call time. It is never stored as a field.

pub mod binding;
pub mod lifecycle;
pub mod tokens;

pub use lifecycle::{DeviceDirectory, IssuedSession, SessionManager, TrustingDirectory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::outbox::NewOutboxEvent;
use crate::storage::{Result as StorageResult, StorageError};

/// Aggregate type for session outbox events.
pub const AGGREGATE_SESSION: &str = "session";
/// Aggregate type for account-scoped security events.
pub const AGGREGATE_ACCOUNT: &str = "account";

/// Event emitted when a session is created.
pub const EVENT_SESSION_CREATED: &str = "SESSION_CREATED";
/// Event emitted when a session's tokens are rotated.
pub const EVENT_SESSION_REFRESHED: &str = "SESSION_REFRESHED";
/// Event emitted when a session is revoked (single or cascade).
pub const EVENT_SESSION_REVOKED: &str = "SESSION_REVOKED";
/// Audit event emitted when a rotated refresh token is replayed.
pub const EVENT_TOKEN_REUSE_DETECTED: &str = "TOKEN_REUSE_DETECTED";

/// Result type for session lifecycle operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors surfaced by the session lifecycle.
///
/// `Unauthorized` deliberately carries no detail: validation never reveals
/// why it failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub account_id: Uuid,
    pub device_id: Option<Uuid>,
    pub token_hash: String,
    pub refresh_token_hash: String,
    pub previous_refresh_token_hash: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// The validity conjunction. Evaluated, never stored.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// A deny-list entry for a revoked access token, kept until the token would
/// have expired naturally.
#[derive(Debug, Clone)]
pub struct RevokedToken {
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Atomic field update applied during token rotation.
#[derive(Debug, Clone)]
pub struct SessionRotation {
    pub token_hash: String,
    pub refresh_token_hash: String,
    pub previous_refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default lifetime for issued sessions.
    pub default_duration_ms: u64,
    /// Cap on concurrently active sessions per account, enforced at create.
    pub max_sessions_per_account: i64,
    /// Enable Zero-Trust binding validation on refresh.
    pub enable_binding: bool,
    /// Exact-IP match instead of subnet match in binding validation.
    pub ip_binding_strict: bool,
    /// Enable refresh-token reuse detection.
    pub enable_token_reuse_detection: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 86_400_000,
            max_sessions_per_account: 10,
            enable_binding: false,
            ip_binding_strict: false,
            enable_token_reuse_detection: true,
        }
    }
}

/// Persistence for sessions and the revoked-token deny list.
///
/// Mutating operations that the platform must observe take the outbox event
/// to append; implementations perform the domain write and the append in
/// one database transaction.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session, event: NewOutboxEvent) -> StorageResult<()>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<Session>>;

    async fn find_by_token_hash(&self, token_hash: &str) -> StorageResult<Option<Session>>;

    async fn find_by_refresh_hash(&self, refresh_hash: &str) -> StorageResult<Option<Session>>;

    /// Reuse detection probe: an *active* session whose previous refresh
    /// hash equals the presented hash.
    async fn find_active_by_previous_refresh_hash(
        &self,
        refresh_hash: &str,
    ) -> StorageResult<Option<Session>>;

    /// Rotate tokens atomically. The update is a compare-and-swap on the
    /// current refresh hash; returns false when a concurrent rotation won.
    async fn rotate(
        &self,
        id: Uuid,
        expected_refresh_hash: &str,
        rotation: &SessionRotation,
        event: NewOutboxEvent,
    ) -> StorageResult<bool>;

    /// Revoke one session and deny-list its access token. Returns false if
    /// the session was already inactive.
    async fn revoke(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
        event: NewOutboxEvent,
    ) -> StorageResult<bool>;

    /// Revoke every active session of an account in a single statement,
    /// deny-listing their access tokens. Returns the number revoked.
    async fn revoke_all_for_account(
        &self,
        account_id: Uuid,
        exclude: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
        event: NewOutboxEvent,
    ) -> StorageResult<u64>;

    /// Update `last_activity_at` only. Missing sessions are a silent no-op.
    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<()>;

    async fn count_active(&self, account_id: Uuid, now: DateTime<Utc>) -> StorageResult<i64>;

    /// Deactivate sessions past expiry with reason "expired". Reconciler.
    async fn expire_batch(&self, now: DateTime<Utc>, limit: u32) -> StorageResult<u64>;

    async fn is_token_revoked(&self, token_hash: &str) -> StorageResult<bool>;

    /// Delete deny-list entries past their natural expiry. Reconciler GC.
    async fn purge_revoked_before(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    fn make_session(is_active: bool, expires_in_secs: i64) -> Session {
        let now = Utc::now();
        Session {
            id: ids::new_id(),
            account_id: ids::new_id(),
            device_id: None,
            token_hash: "th".to_string(),
            refresh_token_hash: "rh".to_string(),
            previous_refresh_token_hash: None,
            ip_address: None,
            user_agent: None,
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
            is_active,
            revoked_at: None,
            revoked_reason: None,
            last_activity_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_validity_is_a_conjunction() {
        let now = Utc::now();
        assert!(make_session(true, 60).is_valid(now));
        assert!(!make_session(true, -60).is_valid(now));
        assert!(!make_session(false, 60).is_valid(now));
        assert!(!make_session(false, -60).is_valid(now));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let session = make_session(true, 0);
        assert!(!session.is_valid(session.expires_at));
    }
}
