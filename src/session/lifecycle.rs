//! Session lifecycle operations.
//!
//! Create, validate, refresh (token rotation with reuse detection), revoke,
//! and touch. Every mutation the platform must observe is paired with its
//! outbox event inside the store's transaction, so a session can never
//! change without the corresponding event becoming durable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::binding::{BindingValidator, RequestContext, RISK_THRESHOLD};
use super::tokens::{hash_token, hashes_match, TokenPair};
use super::{
    AuthError, Result, Session, SessionConfig, SessionRotation, SessionStore,
    AGGREGATE_ACCOUNT, AGGREGATE_SESSION, EVENT_SESSION_CREATED, EVENT_SESSION_REFRESHED,
    EVENT_SESSION_REVOKED, EVENT_TOKEN_REUSE_DETECTED,
};
use crate::ids;
use crate::outbox::NewOutboxEvent;
use crate::storage::Result as StorageResult;

/// Existence checks the engine delegates to the identity service.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn account_exists(&self, account_id: Uuid) -> StorageResult<bool>;

    async fn device_belongs_to(&self, device_id: Uuid, account_id: Uuid) -> StorageResult<bool>;
}

/// Directory for deployments where the upstream service has already
/// validated account and device existence before reaching the engine.
pub struct TrustingDirectory;

#[async_trait]
impl DeviceDirectory for TrustingDirectory {
    async fn account_exists(&self, _account_id: Uuid) -> StorageResult<bool> {
        Ok(true)
    }

    async fn device_belongs_to(&self, _device_id: Uuid, _account_id: Uuid) -> StorageResult<bool> {
        Ok(true)
    }
}

/// Request to create a session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub account_id: Uuid,
    pub device_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Override for the configured default session duration.
    pub expires_in_ms: Option<u64>,
}

/// A session together with its plaintext tokens.
///
/// The plaintext leaves the engine exactly once, in this value.
#[derive(Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
}

/// Orchestrates the session lifecycle against the store.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn DeviceDirectory>,
    validator: BindingValidator,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn DeviceDirectory>,
        config: SessionConfig,
    ) -> Self {
        let validator = BindingValidator::new(config.ip_binding_strict);
        Self {
            store,
            directory,
            validator,
            config,
        }
    }

    /// Create a session and issue its token pair.
    pub async fn create(&self, request: CreateSession) -> Result<IssuedSession> {
        if !self.directory.account_exists(request.account_id).await? {
            return Err(AuthError::NotFound("account"));
        }
        if let Some(device_id) = request.device_id {
            if !self
                .directory
                .device_belongs_to(device_id, request.account_id)
                .await?
            {
                return Err(AuthError::NotFound("device"));
            }
        }

        let now = Utc::now();
        let active = self.store.count_active(request.account_id, now).await?;
        if active >= self.config.max_sessions_per_account {
            return Err(AuthError::Conflict(format!(
                "account has {active} active sessions (limit {})",
                self.config.max_sessions_per_account
            )));
        }

        let duration_ms = request.expires_in_ms.unwrap_or(self.config.default_duration_ms);
        let pair = TokenPair::generate();
        let session = Session {
            id: ids::new_id(),
            account_id: request.account_id,
            device_id: request.device_id,
            token_hash: pair.access_hash.clone(),
            refresh_token_hash: pair.refresh_hash.clone(),
            previous_refresh_token_hash: None,
            ip_address: request.ip_address,
            user_agent: request.user_agent,
            expires_at: now + chrono::Duration::milliseconds(duration_ms as i64),
            is_active: true,
            revoked_at: None,
            revoked_reason: None,
            last_activity_at: now,
            created_at: now,
        };

        let event = NewOutboxEvent::new(
            AGGREGATE_SESSION,
            session.id.to_string(),
            EVENT_SESSION_CREATED,
            json!({
                "sessionId": session.id,
                "accountId": session.account_id,
                "deviceId": session.device_id,
                "expiresAt": session.expires_at,
            }),
        );
        self.store.insert(&session, event).await?;

        info!(session_id = %session.id, account_id = %session.account_id, "Session created");
        Ok(IssuedSession {
            session,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        })
    }

    /// Authenticate an access token.
    ///
    /// Returns the session iff `is_active ∧ now < expires_at` and the token
    /// is not deny-listed. Returns `None` for every failure mode: the caller
    /// learns nothing about why.
    pub async fn validate(&self, access_token: &str) -> StorageResult<Option<Session>> {
        let token_hash = hash_token(access_token);
        if self.store.is_token_revoked(&token_hash).await? {
            return Ok(None);
        }

        let session = self.store.find_by_token_hash(&token_hash).await?;
        Ok(session.filter(|s| s.is_valid(Utc::now())))
    }

    /// Rotate the token pair presented via its refresh token.
    #[tracing::instrument(name = "session.refresh", skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
    ) -> Result<IssuedSession> {
        let presented_hash = hash_token(refresh_token);
        let now = Utc::now();

        // Reuse check comes first: a hash sitting in any active session's
        // previous-hash slot means the token was already rotated away and a
        // second party is replaying it.
        if self.config.enable_token_reuse_detection {
            if let Some(compromised) = self
                .store
                .find_active_by_previous_refresh_hash(&presented_hash)
                .await?
            {
                self.handle_token_reuse(&compromised, now).await?;
                return Err(AuthError::Forbidden("Token reuse detected".to_string()));
            }
        }

        let session = self
            .store
            .find_by_refresh_hash(&presented_hash)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        if !hashes_match(&session.refresh_token_hash, &presented_hash) {
            return Err(AuthError::Unauthorized);
        }
        if !session.is_valid(now) {
            return Err(AuthError::Unauthorized);
        }

        if self.config.enable_binding {
            let risk = self.validator.risk_score(&session, ctx);
            if risk >= RISK_THRESHOLD {
                warn!(
                    session_id = %session.id,
                    account_id = %session.account_id,
                    risk,
                    "Session binding validation failed"
                );
                return Err(AuthError::Forbidden(
                    "Session binding validation failed".to_string(),
                ));
            }
        }

        let pair = TokenPair::generate();
        let rotation = SessionRotation {
            token_hash: pair.access_hash.clone(),
            refresh_token_hash: pair.refresh_hash.clone(),
            previous_refresh_token_hash: presented_hash.clone(),
            expires_at: now + chrono::Duration::milliseconds(self.config.default_duration_ms as i64),
            last_activity_at: now,
        };
        let event = NewOutboxEvent::new(
            AGGREGATE_SESSION,
            session.id.to_string(),
            EVENT_SESSION_REFRESHED,
            json!({
                "sessionId": session.id,
                "accountId": session.account_id,
                "expiresAt": rotation.expires_at,
            }),
        );

        let rotated = self
            .store
            .rotate(session.id, &presented_hash, &rotation, event)
            .await?;
        if !rotated {
            // A concurrent rotation won the compare-and-swap; the presented
            // token is no longer current.
            return Err(AuthError::Unauthorized);
        }

        debug!(session_id = %session.id, "Session refreshed");
        let session = Session {
            token_hash: rotation.token_hash,
            refresh_token_hash: rotation.refresh_token_hash,
            previous_refresh_token_hash: Some(rotation.previous_refresh_token_hash),
            expires_at: rotation.expires_at,
            last_activity_at: rotation.last_activity_at,
            ..session
        };
        Ok(IssuedSession {
            session,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        })
    }

    /// Revoke one session.
    pub async fn revoke(&self, session_id: Uuid, reason: &str) -> Result<()> {
        let now = Utc::now();
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or(AuthError::NotFound("session"))?;

        let event = self.revoked_event(&session, reason);
        let revoked = self.store.revoke(session_id, reason, now, event).await?;
        if revoked {
            info!(session_id = %session_id, reason, "Session revoked");
        }
        Ok(())
    }

    /// Revoke every active session of an account in one statement.
    ///
    /// Returns the number of sessions revoked.
    pub async fn revoke_all_for_account(
        &self,
        account_id: Uuid,
        exclude: Option<Uuid>,
        reason: &str,
    ) -> Result<u64> {
        let now = Utc::now();
        let event = NewOutboxEvent::new(
            AGGREGATE_ACCOUNT,
            account_id.to_string(),
            EVENT_SESSION_REVOKED,
            json!({
                "accountId": account_id,
                "excludedSessionId": exclude,
                "reason": reason,
                "cascade": true,
            }),
        );
        let revoked = self
            .store
            .revoke_all_for_account(account_id, exclude, reason, now, event)
            .await?;
        info!(account_id = %account_id, revoked, reason, "Account sessions revoked");
        Ok(revoked)
    }

    /// Update `last_activity_at`. Missing sessions are a silent no-op so hot
    /// paths never fail auth over bookkeeping.
    pub async fn touch(&self, session_id: Uuid) -> StorageResult<()> {
        self.store.touch(session_id, Utc::now()).await
    }

    /// Token theft response: one revocation cascade plus an audit event.
    async fn handle_token_reuse(&self, compromised: &Session, now: DateTime<Utc>) -> Result<()> {
        error!(
            session_id = %compromised.id,
            account_id = %compromised.account_id,
            "Refresh token reuse detected, revoking all account sessions"
        );

        let event = NewOutboxEvent::new(
            AGGREGATE_ACCOUNT,
            compromised.account_id.to_string(),
            EVENT_TOKEN_REUSE_DETECTED,
            json!({
                "accountId": compromised.account_id,
                "sessionId": compromised.id,
                "detectedAt": now,
            }),
        );
        self.store
            .revoke_all_for_account(compromised.account_id, None, "token_reuse", now, event)
            .await?;
        Ok(())
    }

    fn revoked_event(&self, session: &Session, reason: &str) -> NewOutboxEvent {
        NewOutboxEvent::new(
            AGGREGATE_SESSION,
            session.id.to_string(),
            EVENT_SESSION_REVOKED,
            json!({
                "sessionId": session.id,
                "accountId": session.account_id,
                "reason": reason,
            }),
        )
    }
}
