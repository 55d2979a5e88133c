//! Saga execution with the durable lifecycle log.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use keel::saga::{
    FnStep, SagaConfig, SagaDefinition, SagaLogStatus, SagaLogStore, SagaOptions,
    SagaOrchestrator, SagaStatus,
};
use keel::utils::retry::StepRetryConfig;

use common::Harness;

#[derive(Debug, Clone, PartialEq)]
struct Transfer {
    debited: bool,
    credited: bool,
}

fn options() -> SagaOptions {
    SagaOptions {
        step_timeout: Duration::from_secs(5),
        saga_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn test_completed_saga_logged_as_completed() {
    let harness = Harness::new().await;
    let orchestrator = SagaOrchestrator::new(SagaConfig::default())
        .with_log(Arc::clone(&harness.saga_log) as _);

    let definition = SagaDefinition::new("transfer")
        .step(FnStep::new(
            "debit",
            |mut ctx: Transfer| async move {
                ctx.debited = true;
                Ok(ctx)
            },
            |_ctx| async move { Ok(()) },
        ))
        .step(FnStep::new(
            "credit",
            |mut ctx: Transfer| async move {
                ctx.credited = true;
                Ok(ctx)
            },
            |_ctx| async move { Ok(()) },
        ));

    let result = orchestrator
        .execute(
            definition,
            Transfer {
                debited: false,
                credited: false,
            },
            options(),
        )
        .await;

    assert!(result.success);
    assert_eq!(
        result.context,
        Transfer {
            debited: true,
            credited: true
        }
    );

    let entry = harness.saga_log.get(result.saga_id).await.unwrap().unwrap();
    assert_eq!(entry.name, "transfer");
    assert_eq!(entry.status, SagaLogStatus::Completed);
    assert!(entry.completed_at.is_some());
    assert!(entry.error.is_none());
    assert_eq!(harness.saga_log.count_running().await.unwrap(), 0);
}

#[tokio::test]
async fn test_compensated_saga_logged_with_error() {
    let harness = Harness::new().await;
    let orchestrator = SagaOrchestrator::new(SagaConfig::default())
        .with_log(Arc::clone(&harness.saga_log) as _);

    let definition = SagaDefinition::new("doomed-transfer")
        .step(FnStep::new(
            "debit",
            |mut ctx: Transfer| async move {
                ctx.debited = true;
                Ok(ctx)
            },
            |_ctx| async move { Ok(()) },
        ))
        .step(
            FnStep::new(
                "credit",
                |_ctx: Transfer| async move { Err("ledger unavailable".into()) },
                |_ctx| async move { Ok(()) },
            )
            .with_retry(StepRetryConfig {
                max_retries: 0,
                ..Default::default()
            }),
        );

    let result = orchestrator
        .execute(
            definition,
            Transfer {
                debited: false,
                credited: false,
            },
            options(),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.status, SagaStatus::Compensated);

    let entry = harness.saga_log.get(result.saga_id).await.unwrap().unwrap();
    assert_eq!(entry.status, SagaLogStatus::Compensated);
    assert_eq!(entry.error.as_deref(), Some("ledger unavailable"));
}

#[tokio::test]
async fn test_orphaned_running_entry_is_timed_out_by_sweep() {
    let harness = Harness::new().await;

    // Simulate a crash: a RUNNING entry whose deadline has long passed and
    // whose process never wrote a terminal state.
    let entry = keel::saga::SagaLogEntry {
        id: keel::ids::new_id(),
        name: "orphan".to_string(),
        status: SagaLogStatus::Running,
        error: None,
        started_at: Utc::now() - chrono::Duration::minutes(20),
        timeout_at: Utc::now() - chrono::Duration::minutes(15),
        completed_at: None,
    };
    harness.saga_log.insert(&entry).await.unwrap();

    let timed_out = harness.saga_log.mark_timed_out(Utc::now()).await.unwrap();
    assert_eq!(timed_out, 1);

    let stored = harness.saga_log.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SagaLogStatus::TimedOut);
    assert!(stored.completed_at.is_some());

    // A live RUNNING entry inside its deadline is untouched.
    let live = keel::saga::SagaLogEntry {
        id: keel::ids::new_id(),
        name: "live".to_string(),
        status: SagaLogStatus::Running,
        error: None,
        started_at: Utc::now(),
        timeout_at: Utc::now() + chrono::Duration::minutes(5),
        completed_at: None,
    };
    harness.saga_log.insert(&live).await.unwrap();
    assert_eq!(harness.saga_log.mark_timed_out(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_terminal_entries_are_purged_after_retention() {
    let harness = Harness::new().await;

    let old = keel::saga::SagaLogEntry {
        id: keel::ids::new_id(),
        name: "ancient".to_string(),
        status: SagaLogStatus::Completed,
        error: None,
        started_at: Utc::now() - chrono::Duration::days(45),
        timeout_at: Utc::now() - chrono::Duration::days(45),
        completed_at: Some(Utc::now() - chrono::Duration::days(44)),
    };
    harness.saga_log.insert(&old).await.unwrap();

    let running = keel::saga::SagaLogEntry {
        id: keel::ids::new_id(),
        name: "current".to_string(),
        status: SagaLogStatus::Running,
        error: None,
        started_at: Utc::now(),
        timeout_at: Utc::now() + chrono::Duration::minutes(5),
        completed_at: None,
    };
    harness.saga_log.insert(&running).await.unwrap();

    let purged = harness
        .saga_log
        .purge_terminal_before(Utc::now() - chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(harness.saga_log.get(old.id).await.unwrap().is_none());
    assert!(harness.saga_log.get(running.id).await.unwrap().is_some());
}
