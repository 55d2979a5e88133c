//! Session lifecycle against real storage: issuance, validation, rotation,
//! reuse detection with the revocation cascade, and binding enforcement.

#![cfg(feature = "sqlite")]

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use keel::ids;
use keel::session::binding::RequestContext;
use keel::session::lifecycle::CreateSession;
use keel::session::{
    AuthError, DeviceDirectory, SessionConfig, SessionManager, SessionStore, TrustingDirectory,
    EVENT_SESSION_CREATED, EVENT_SESSION_REVOKED, EVENT_TOKEN_REUSE_DETECTED,
};
use keel::storage::Result as StorageResult;

use common::Harness;

fn manager(harness: &Harness, config: SessionConfig) -> SessionManager {
    SessionManager::new(
        Arc::clone(&harness.sessions) as _,
        Arc::new(TrustingDirectory),
        config,
    )
}

fn create_request(account_id: Uuid) -> CreateSession {
    CreateSession {
        account_id,
        device_id: None,
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Chrome/120.0".to_string()),
        expires_in_ms: None,
    }
}

#[tokio::test]
async fn test_create_then_validate() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());
    let account = ids::new_id();

    let issued = manager.create(create_request(account)).await.unwrap();
    assert_eq!(issued.session.account_id, account);
    assert!(issued.session.is_active);

    let validated = manager.validate(&issued.access_token).await.unwrap();
    assert_eq!(validated.unwrap().id, issued.session.id);

    // The event rode the same transaction as the insert.
    assert_eq!(harness.count_outbox_events(EVENT_SESSION_CREATED).await, 1);
}

#[tokio::test]
async fn test_validate_rejects_unknown_and_garbage_tokens() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());

    assert!(manager.validate("never-issued").await.unwrap().is_none());
    assert!(manager.validate("").await.unwrap().is_none());
}

#[tokio::test]
async fn test_max_sessions_per_account_conflict() {
    let harness = Harness::new().await;
    let manager = manager(
        &harness,
        SessionConfig {
            max_sessions_per_account: 2,
            ..Default::default()
        },
    );
    let account = ids::new_id();

    manager.create(create_request(account)).await.unwrap();
    manager.create(create_request(account)).await.unwrap();

    let third = manager.create(create_request(account)).await;
    assert!(matches!(third, Err(AuthError::Conflict(_))));

    // A different account is unaffected.
    assert!(manager.create(create_request(ids::new_id())).await.is_ok());
}

#[tokio::test]
async fn test_refresh_rotates_both_tokens() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());

    let issued = manager.create(create_request(ids::new_id())).await.unwrap();
    let refreshed = manager
        .refresh(&issued.refresh_token, &RequestContext::default())
        .await
        .unwrap();

    assert_eq!(refreshed.session.id, issued.session.id);
    assert_ne!(refreshed.access_token, issued.access_token);
    assert_ne!(refreshed.refresh_token, issued.refresh_token);

    // Old access token is gone, new one authenticates.
    assert!(manager.validate(&issued.access_token).await.unwrap().is_none());
    assert!(manager.validate(&refreshed.access_token).await.unwrap().is_some());
}

#[tokio::test]
async fn test_refresh_with_unknown_token_is_unauthorized() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());
    manager.create(create_request(ids::new_id())).await.unwrap();

    let result = manager
        .refresh("completely-unknown", &RequestContext::default())
        .await;
    assert!(matches!(result, Err(AuthError::Unauthorized)));
}

#[tokio::test]
async fn test_refresh_token_reuse_revokes_the_whole_account() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());
    let account = ids::new_id();

    let first = manager.create(create_request(account)).await.unwrap();
    let second = manager.create(create_request(account)).await.unwrap();

    // Rotate once; the original refresh token moves to the previous slot.
    let rotated = manager
        .refresh(&first.refresh_token, &RequestContext::default())
        .await
        .unwrap();

    // An attacker replays the original refresh token.
    let replay = manager
        .refresh(&first.refresh_token, &RequestContext::default())
        .await;
    match replay {
        Err(AuthError::Forbidden(message)) => {
            assert!(message.contains("reuse"), "got: {message}")
        }
        other => panic!("expected Forbidden, got {other:?}"),
    }

    // Cascade: every session of the account is dead, the rotated one and
    // the unrelated second one included.
    for token in [&rotated.access_token, &second.access_token] {
        assert!(manager.validate(token).await.unwrap().is_none());
    }
    let stored = harness.sessions.get(first.session.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert_eq!(stored.revoked_reason.as_deref(), Some("token_reuse"));

    // The audit event was written with the cascade.
    assert_eq!(
        harness.count_outbox_events(EVENT_TOKEN_REUSE_DETECTED).await,
        1
    );

    // The legitimate rotated token is dead too.
    let after = manager
        .refresh(&rotated.refresh_token, &RequestContext::default())
        .await;
    assert!(matches!(after, Err(AuthError::Unauthorized)));
}

#[tokio::test]
async fn test_revoke_then_validate_is_none() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());

    let issued = manager.create(create_request(ids::new_id())).await.unwrap();
    manager.revoke(issued.session.id, "logout").await.unwrap();

    assert!(manager.validate(&issued.access_token).await.unwrap().is_none());
    assert_eq!(harness.count_outbox_events(EVENT_SESSION_REVOKED).await, 1);

    // Idempotent: revoking again neither fails nor emits another event.
    manager.revoke(issued.session.id, "logout").await.unwrap();
    assert_eq!(harness.count_outbox_events(EVENT_SESSION_REVOKED).await, 1);
}

#[tokio::test]
async fn test_revoke_missing_session_is_not_found() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());

    let result = manager.revoke(ids::new_id(), "logout").await;
    assert!(matches!(result, Err(AuthError::NotFound(_))));
}

#[tokio::test]
async fn test_revoke_all_spares_the_excluded_session() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());
    let account = ids::new_id();

    let keep = manager.create(create_request(account)).await.unwrap();
    let drop_a = manager.create(create_request(account)).await.unwrap();
    let drop_b = manager.create(create_request(account)).await.unwrap();

    let revoked = manager
        .revoke_all_for_account(account, Some(keep.session.id), "password_change")
        .await
        .unwrap();
    assert_eq!(revoked, 2);

    assert!(manager.validate(&keep.access_token).await.unwrap().is_some());
    assert!(manager.validate(&drop_a.access_token).await.unwrap().is_none());
    assert!(manager.validate(&drop_b.access_token).await.unwrap().is_none());
}

#[tokio::test]
async fn test_touch_updates_activity_and_ignores_missing() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());

    let issued = manager.create(create_request(ids::new_id())).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    manager.touch(issued.session.id).await.unwrap();

    let stored = harness.sessions.get(issued.session.id).await.unwrap().unwrap();
    assert!(stored.last_activity_at > issued.session.last_activity_at);

    // Hot paths must not fail over a missing session.
    manager.touch(ids::new_id()).await.unwrap();
}

#[tokio::test]
async fn test_binding_refuses_high_risk_refresh() {
    let harness = Harness::new().await;
    let manager = manager(
        &harness,
        SessionConfig {
            enable_binding: true,
            ip_binding_strict: true,
            ..Default::default()
        },
    );

    let issued = manager.create(create_request(ids::new_id())).await.unwrap();

    // Same client context refreshes fine.
    let same = RequestContext {
        ip_address: issued.session.ip_address.clone(),
        user_agent: issued.session.user_agent.clone(),
        device_id: None,
    };
    let refreshed = manager.refresh(&issued.refresh_token, &same).await.unwrap();

    // New IP (+50 strict) and a new client (+30) stay under the threshold;
    // nothing else is bound, so the refresh is allowed.
    let drifted = RequestContext {
        ip_address: Some("198.51.100.9".to_string()),
        user_agent: Some("curl/8.4.0".to_string()),
        device_id: None,
    };
    let allowed = manager.refresh(&refreshed.refresh_token, &drifted).await;
    assert!(allowed.is_ok());
}

#[tokio::test]
async fn test_binding_with_device_mismatch_crosses_threshold() {
    let harness = Harness::new().await;

    struct OneDevice {
        device: Uuid,
        account: Uuid,
    }

    #[async_trait]
    impl DeviceDirectory for OneDevice {
        async fn account_exists(&self, account_id: Uuid) -> StorageResult<bool> {
            Ok(account_id == self.account)
        }

        async fn device_belongs_to(
            &self,
            device_id: Uuid,
            account_id: Uuid,
        ) -> StorageResult<bool> {
            Ok(device_id == self.device && account_id == self.account)
        }
    }

    let account = ids::new_id();
    let device = ids::new_id();
    let manager = SessionManager::new(
        Arc::clone(&harness.sessions) as _,
        Arc::new(OneDevice { device, account }),
        SessionConfig {
            enable_binding: true,
            ip_binding_strict: true,
            ..Default::default()
        },
    );

    let issued = manager
        .create(CreateSession {
            account_id: account,
            device_id: Some(device),
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("Mozilla/5.0 Chrome/120.0".to_string()),
            expires_in_ms: None,
        })
        .await
        .unwrap();

    // IP change (+50), UA change (+30), device mismatch (+40): refused.
    let hostile = RequestContext {
        ip_address: Some("198.51.100.9".to_string()),
        user_agent: Some("curl/8.4.0".to_string()),
        device_id: Some(ids::new_id()),
    };
    let result = manager.refresh(&issued.refresh_token, &hostile).await;
    assert!(matches!(result, Err(AuthError::Forbidden(_))));

    // Unknown device at create time is a 404.
    let bad_create = manager
        .create(CreateSession {
            account_id: account,
            device_id: Some(ids::new_id()),
            ip_address: None,
            user_agent: None,
            expires_in_ms: None,
        })
        .await;
    assert!(matches!(bad_create, Err(AuthError::NotFound(_))));
}

#[tokio::test]
async fn test_refresh_hash_uniqueness_invariant() {
    let harness = Harness::new().await;
    let manager = manager(&harness, SessionConfig::default());
    let account = ids::new_id();

    for _ in 0..3 {
        let issued = manager.create(create_request(account)).await.unwrap();
        manager
            .refresh(&issued.refresh_token, &RequestContext::default())
            .await
            .unwrap();
    }

    // Across the whole table, every refresh hash and previous hash appears
    // at most once.
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT refresh_token_hash, previous_refresh_token_hash FROM sessions WHERE is_active = TRUE",
    )
    .fetch_all(&harness.pool)
    .await
    .unwrap();

    let mut current: HashSet<String> = HashSet::new();
    let mut previous: HashMap<String, usize> = HashMap::new();
    for row in &rows {
        assert!(current.insert(row.get::<String, _>("refresh_token_hash")));
        if let Some(hash) = row.get::<Option<String>, _>("previous_refresh_token_hash") {
            *previous.entry(hash).or_default() += 1;
        }
    }
    assert!(previous.values().all(|&n| n == 1));
}
