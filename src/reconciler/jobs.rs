//! The sweeper jobs.
//!
//! | Job | Target rows | Action |
//! |---|---|---|
//! | expire-sessions | active sessions past expiry | deactivate, reason "expired" |
//! | gc-revoked-tokens | deny-list entries past expiry | delete |
//! | gc-idempotency | consumer dedup keys past expiry | delete |
//! | saga-timeouts | running sagas past deadline; old terminal rows | time out; delete |
//! | gc-dead-letters | resolved/ignored rows past retention | delete |
//! | gc-outbox | completed rows past retention | delete |
//! | consent-expiry | consents near/past expiry | warn / expire, emit events |
//! | dsr-deadlines | open DSRs approaching the due date | escalate, emit events |
//!
//! Per-row transitions run in their own short transaction inside the store,
//! so one poisoned row never blocks the rest of a sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{error, warn};

use super::{ReconcilerJob, Result};
use crate::compliance::{
    target_escalation, ConsentStore, DsrStore, AGGREGATE_CONSENT, AGGREGATE_DSR,
    EVENT_CONSENT_EXPIRED, EVENT_CONSENT_EXPIRING_SOON,
};
use crate::dlq::DeadLetterStore;
use crate::outbox::consumer::IdempotencyStore;
use crate::outbox::{NewOutboxEvent, OutboxStore};
use crate::saga::SagaLogStore;
use crate::session::SessionStore;

/// Deactivate sessions whose expiry has passed. No event: downstream
/// consumers already treat the session as stale via the validity
/// conjunction.
pub struct ExpireSessionsJob {
    pub sessions: Arc<dyn SessionStore>,
    pub batch_size: u32,
}

#[async_trait]
impl ReconcilerJob for ExpireSessionsJob {
    fn name(&self) -> &'static str {
        "expire-sessions"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.sessions.expire_batch(now, self.batch_size).await?)
    }
}

/// Delete deny-list entries past the natural expiry of their token.
pub struct GcRevokedTokensJob {
    pub sessions: Arc<dyn SessionStore>,
}

#[async_trait]
impl ReconcilerJob for GcRevokedTokensJob {
    fn name(&self) -> &'static str {
        "gc-revoked-tokens"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.sessions.purge_revoked_before(now).await?)
    }
}

/// Delete consumer idempotency keys past their retention.
pub struct GcIdempotencyJob {
    pub keys: Arc<dyn IdempotencyStore>,
}

#[async_trait]
impl ReconcilerJob for GcIdempotencyJob {
    fn name(&self) -> &'static str {
        "gc-idempotency"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.keys.purge_expired(now).await?)
    }
}

/// Two phases: time out sagas orphaned past their deadline (a crash between
/// start and terminal write leaves the log row `RUNNING`), then delete
/// terminal rows past retention.
pub struct SagaTimeoutsJob {
    pub saga_log: Arc<dyn SagaLogStore>,
    pub retention_days: i64,
}

#[async_trait]
impl ReconcilerJob for SagaTimeoutsJob {
    fn name(&self) -> &'static str {
        "saga-timeouts"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        let timed_out = self.saga_log.mark_timed_out(now).await?;
        if timed_out > 0 {
            warn!(timed_out, "Orphaned sagas marked timed out");
        }
        let purged = self
            .saga_log
            .purge_terminal_before(now - Duration::days(self.retention_days))
            .await?;
        Ok(timed_out + purged)
    }
}

/// Delete resolved and ignored dead letters past retention.
pub struct GcDeadLettersJob {
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub retention_days: i64,
}

#[async_trait]
impl ReconcilerJob for GcDeadLettersJob {
    fn name(&self) -> &'static str {
        "gc-dead-letters"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .dead_letters
            .purge_closed_before(now - Duration::days(self.retention_days))
            .await?)
    }
}

/// Delete completed outbox rows past retention.
pub struct GcOutboxJob {
    pub outbox: Arc<dyn OutboxStore>,
    pub retention_days: i64,
}

#[async_trait]
impl ReconcilerJob for GcOutboxJob {
    fn name(&self) -> &'static str {
        "gc-outbox"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .outbox
            .delete_completed_before(now - Duration::days(self.retention_days))
            .await?)
    }
}

/// Warn on consents expiring inside the horizon, expire those past it.
pub struct ConsentExpiryJob {
    pub consents: Arc<dyn ConsentStore>,
    pub warning_days: i64,
    pub batch_size: u32,
}

#[async_trait]
impl ReconcilerJob for ConsentExpiryJob {
    fn name(&self) -> &'static str {
        "consent-expiry"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut affected = 0;

        let horizon = now + Duration::days(self.warning_days);
        let expiring = self
            .consents
            .find_expiring(now, horizon, self.batch_size)
            .await?;
        for consent in expiring {
            let event = NewOutboxEvent::new(
                AGGREGATE_CONSENT,
                consent.id.to_string(),
                EVENT_CONSENT_EXPIRING_SOON,
                json!({
                    "consentId": consent.id,
                    "accountId": consent.account_id,
                    "documentType": consent.document_type,
                    "expiresAt": consent.expires_at,
                }),
            );
            match self.consents.mark_expiring_soon(consent.id, event).await {
                Ok(true) => affected += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(consent_id = %consent.id, error = %e, "Consent warning failed");
                }
            }
        }

        let expired = self.consents.find_expired(now, self.batch_size).await?;
        for consent in expired {
            let event = NewOutboxEvent::new(
                AGGREGATE_CONSENT,
                consent.id.to_string(),
                EVENT_CONSENT_EXPIRED,
                json!({
                    "consentId": consent.id,
                    "accountId": consent.account_id,
                    "documentType": consent.document_type,
                }),
            );
            match self.consents.mark_expired(consent.id, event).await {
                Ok(true) => affected += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(consent_id = %consent.id, error = %e, "Consent expiry failed");
                }
            }
        }

        Ok(affected)
    }
}

/// Escalate open DSR requests towards their due date. Escalation is
/// monotonic: the sweep only ever moves a request to a higher level, one
/// event per transition.
pub struct DsrDeadlinesJob {
    pub dsr_requests: Arc<dyn DsrStore>,
    pub batch_size: u32,
}

#[async_trait]
impl ReconcilerJob for DsrDeadlinesJob {
    fn name(&self) -> &'static str {
        "dsr-deadlines"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut affected = 0;

        let horizon = now + Duration::days(7);
        let candidates = self
            .dsr_requests
            .find_escalation_candidates(horizon, self.batch_size)
            .await?;

        for request in candidates {
            let target = target_escalation(request.due_date, now);
            if target <= request.escalation_level {
                continue;
            }
            let Some(event_type) = target.event_type() else {
                continue;
            };

            let event = NewOutboxEvent::new(
                AGGREGATE_DSR,
                request.id.to_string(),
                event_type,
                json!({
                    "requestId": request.id,
                    "accountId": request.account_id,
                    "requestType": request.request_type,
                    "dueDate": request.due_date,
                    "escalationLevel": target.as_str(),
                }),
            );
            match self
                .dsr_requests
                .escalate(request.id, request.escalation_level, target, event)
                .await
            {
                Ok(true) => affected += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "DSR escalation failed");
                }
            }
        }

        Ok(affected)
    }
}
