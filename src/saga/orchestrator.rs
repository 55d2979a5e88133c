//! Saga execution engine.
//!
//! Sequences steps, retries transient failures with backoff, enforces the
//! per-step and whole-saga deadlines, and compensates completed steps in
//! reverse when a later step fails. Compensation never aborts: a failing
//! compensation is recorded on its step and the remaining steps still run.
//!
//! Step and saga timers share `tokio::time::Instant` as their clock source,
//! so a shutdown or deadline can never race two disagreeing clocks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    SagaConfig, SagaDefinition, SagaLogEntry, SagaLogStatus, SagaLogStore, SagaOptions,
    SagaResult, SagaStatus, StepState, StepStatus,
};
use crate::ids;

/// Terminal error recorded on sagas aborted by shutdown.
pub const SHUTDOWN_ERROR: &str = "Service shutdown during saga execution";

/// Metadata for an execution currently in flight.
#[derive(Debug, Clone)]
pub struct ActiveSaga {
    pub name: String,
    pub started_at: chrono::DateTime<Utc>,
}

/// Executes saga definitions.
///
/// The orchestrator itself is context-agnostic; `execute` is generic over
/// the context type, so one instance serves every saga in the process.
pub struct SagaOrchestrator {
    config: SagaConfig,
    log: Option<Arc<dyn SagaLogStore>>,
    active: Arc<RwLock<HashMap<Uuid, ActiveSaga>>>,
    shutdown: watch::Sender<bool>,
}

impl SagaOrchestrator {
    pub fn new(config: SagaConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            log: None,
            active: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Attach a durable lifecycle log.
    pub fn with_log(mut self, log: Arc<dyn SagaLogStore>) -> Self {
        self.log = Some(log);
        self
    }

    /// Default options derived from configuration.
    pub fn default_options(&self) -> SagaOptions {
        self.config.default_options()
    }

    /// Number of executions currently in flight.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Abort every active saga with a terminal shutdown error.
    ///
    /// Shutdown is an administrative abort, not a rollback: no compensation
    /// is attempted and step timers are dropped.
    pub fn shutdown(&self) {
        info!("Saga orchestrator shutting down");
        let _ = self.shutdown.send(true);
    }

    /// Execute a saga to completion, failure, or compensation.
    #[tracing::instrument(name = "saga.execute", skip_all, fields(saga = %definition.name))]
    pub async fn execute<C>(
        &self,
        definition: SagaDefinition<C>,
        initial: C,
        options: SagaOptions,
    ) -> SagaResult<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        let saga_id = ids::new_id();
        let started_at = Utc::now();
        let deadline = tokio::time::Instant::now() + options.saga_timeout;

        self.active.write().await.insert(
            saga_id,
            ActiveSaga {
                name: definition.name.clone(),
                started_at,
            },
        );

        if let Some(log) = &self.log {
            let entry = SagaLogEntry {
                id: saga_id,
                name: definition.name.clone(),
                status: SagaLogStatus::Running,
                error: None,
                started_at,
                timeout_at: started_at
                    + chrono::Duration::milliseconds(options.saga_timeout.as_millis() as i64),
                completed_at: None,
            };
            if let Err(e) = log.insert(&entry).await {
                warn!(saga_id = %saga_id, error = %e, "Failed to persist saga log entry");
            }
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut steps: Vec<StepState> =
            definition.steps.iter().map(|s| StepState::new(s.name())).collect();
        let mut ctx = initial;
        let mut failure: Option<String> = None;
        let mut shutdown_abort = *shutdown_rx.borrow();

        if !shutdown_abort {
            'steps: for (index, step) in definition.steps.iter().enumerate() {
                steps[index].status = StepStatus::Executing;
                steps[index].started_at = Some(Utc::now());

                let retry = step
                    .retry_config()
                    .unwrap_or_else(|| self.config.default_retry());
                let mut attempt: u32 = 0;

                loop {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        let message = format!(
                            "saga '{}' timeout after {}ms",
                            definition.name,
                            options.saga_timeout.as_millis()
                        );
                        steps[index].status = StepStatus::Failed;
                        steps[index].error = Some(message.clone());
                        steps[index].completed_at = Some(Utc::now());
                        failure = Some(message);
                        break 'steps;
                    }

                    let budget = options.step_timeout.min(remaining);
                    let outcome = tokio::select! {
                        res = tokio::time::timeout(budget, step.execute(ctx.clone())) => res,
                        _ = shutdown_rx.changed() => {
                            shutdown_abort = true;
                            steps[index].status = StepStatus::Failed;
                            steps[index].error = Some(SHUTDOWN_ERROR.to_string());
                            steps[index].completed_at = Some(Utc::now());
                            break 'steps;
                        }
                    };

                    let message = match outcome {
                        Ok(Ok(next)) => {
                            ctx = next;
                            steps[index].status = StepStatus::Completed;
                            steps[index].completed_at = Some(Utc::now());
                            debug!(saga_id = %saga_id, step = %steps[index].name, "Step completed");
                            continue 'steps;
                        }
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => format!(
                            "step '{}' timeout after {}ms",
                            step.name(),
                            budget.as_millis()
                        ),
                    };

                    if retry.should_retry(attempt) {
                        let delay = retry.delay_for_attempt(attempt);
                        attempt += 1;
                        steps[index].retry_count = attempt;
                        warn!(
                            saga_id = %saga_id,
                            step = %steps[index].name,
                            attempt,
                            error = %message,
                            "Step failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = shutdown_rx.changed() => {
                                shutdown_abort = true;
                                steps[index].status = StepStatus::Failed;
                                steps[index].error = Some(SHUTDOWN_ERROR.to_string());
                                steps[index].completed_at = Some(Utc::now());
                                break 'steps;
                            }
                        }
                    } else {
                        error!(
                            saga_id = %saga_id,
                            step = %steps[index].name,
                            retries = attempt,
                            error = %message,
                            "Step failed permanently"
                        );
                        steps[index].status = StepStatus::Failed;
                        steps[index].error = Some(message.clone());
                        steps[index].completed_at = Some(Utc::now());
                        failure = Some(message);
                        break 'steps;
                    }
                }
            }
        }

        let compensated_any = if failure.is_some() && !shutdown_abort {
            self.compensate(saga_id, &definition, &mut steps, &ctx, &options)
                .await
        } else {
            false
        };

        let status = if shutdown_abort {
            SagaStatus::Failed
        } else if failure.is_none() {
            SagaStatus::Completed
        } else if compensated_any {
            SagaStatus::Compensated
        } else {
            SagaStatus::Failed
        };
        let error = if shutdown_abort {
            Some(SHUTDOWN_ERROR.to_string())
        } else {
            failure
        };

        self.active.write().await.remove(&saga_id);

        if let Some(log) = &self.log {
            let log_status = match status {
                SagaStatus::Completed => SagaLogStatus::Completed,
                SagaStatus::Failed => SagaLogStatus::Failed,
                SagaStatus::Compensated => SagaLogStatus::Compensated,
            };
            if let Err(e) = log
                .mark_terminal(saga_id, log_status, error.as_deref(), Utc::now())
                .await
            {
                warn!(saga_id = %saga_id, error = %e, "Failed to persist saga log terminal state");
            }
        }

        SagaResult {
            success: status == SagaStatus::Completed,
            saga_id,
            status,
            context: ctx,
            error,
            steps,
        }
    }

    /// Compensate completed steps in reverse order.
    ///
    /// Returns whether any compensation was attempted. A failing or
    /// timed-out compensation marks its step `COMPENSATION_FAILED` and the
    /// remaining steps still compensate.
    async fn compensate<C>(
        &self,
        saga_id: Uuid,
        definition: &SagaDefinition<C>,
        steps: &mut [StepState],
        ctx: &C,
        options: &SagaOptions,
    ) -> bool
    where
        C: Clone + Send + Sync + 'static,
    {
        let mut any = false;

        for index in (0..definition.steps.len()).rev() {
            if steps[index].status != StepStatus::Completed {
                continue;
            }
            any = true;
            steps[index].status = StepStatus::Compensating;

            let step = &definition.steps[index];
            match tokio::time::timeout(options.step_timeout, step.compensate(ctx)).await {
                Ok(Ok(())) => {
                    steps[index].status = StepStatus::Compensated;
                    debug!(saga_id = %saga_id, step = %steps[index].name, "Step compensated");
                }
                Ok(Err(e)) => {
                    steps[index].status = StepStatus::CompensationFailed;
                    steps[index].error = Some(e.to_string());
                    error!(
                        saga_id = %saga_id,
                        step = %steps[index].name,
                        error = %e,
                        "Compensation failed"
                    );
                }
                Err(_) => {
                    let message = format!(
                        "compensation for '{}' timeout after {}ms",
                        steps[index].name,
                        options.step_timeout.as_millis()
                    );
                    steps[index].status = StepStatus::CompensationFailed;
                    steps[index].error = Some(message.clone());
                    error!(saga_id = %saga_id, step = %steps[index].name, "Compensation timed out");
                }
            }
        }

        any
    }
}
