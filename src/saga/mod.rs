//! Saga orchestration.
//!
//! A saga is an ordered list of steps executed as one logical unit of work.
//! When step *k* fails, the completed steps *k-1 … 0* are compensated in
//! reverse order. Steps retry with exponential backoff and run under both a
//! per-step and a whole-saga deadline.
//!
//! Step-level state lives in memory for the duration of the execution; a
//! durable `saga_log` row records the whole-saga lifecycle so the reconciler
//! can time out executions orphaned by a crash and garbage-collect old ones.

pub mod orchestrator;


pub use orchestrator::SagaOrchestrator;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use uuid::Uuid;

use crate::storage::Result as StorageResult;
use crate::utils::retry::StepRetryConfig;

/// Error type steps may fail with; the orchestrator coerces it to a string.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a step's forward action: the context to hand to the next step.
pub type StepResult<C> = std::result::Result<C, StepError>;

/// One step of a saga: a forward action and its best-effort inverse.
#[async_trait]
pub trait SagaStep<C>: Send + Sync {
    /// Name used in step state, logs and errors.
    fn name(&self) -> &str;

    /// Forward action. Receives the current context and returns the context
    /// for the next step.
    async fn execute(&self, ctx: C) -> StepResult<C>;

    /// Best-effort inverse, invoked only if this step completed and a later
    /// step failed.
    async fn compensate(&self, ctx: &C) -> std::result::Result<(), StepError>;

    /// Per-step retry override; `None` uses the orchestrator default.
    fn retry_config(&self) -> Option<StepRetryConfig> {
        None
    }
}

type ExecuteFn<C> = Box<dyn Fn(C) -> BoxFuture<'static, StepResult<C>> + Send + Sync>;
type CompensateFn<C> =
    Box<dyn Fn(C) -> BoxFuture<'static, std::result::Result<(), StepError>> + Send + Sync>;

/// Closure-backed step, for sagas assembled at runtime.
pub struct FnStep<C> {
    name: String,
    execute: ExecuteFn<C>,
    compensate: CompensateFn<C>,
    retry: Option<StepRetryConfig>,
}

impl<C: Clone + Send + Sync + 'static> FnStep<C> {
    pub fn new<F, FFut, G, GFut>(name: impl Into<String>, execute: F, compensate: G) -> Self
    where
        F: Fn(C) -> FFut + Send + Sync + 'static,
        FFut: std::future::Future<Output = StepResult<C>> + Send + 'static,
        G: Fn(C) -> GFut + Send + Sync + 'static,
        GFut: std::future::Future<Output = std::result::Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(move |ctx| Box::pin(execute(ctx))),
            compensate: Box::new(move |ctx| Box::pin(compensate(ctx))),
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: StepRetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> SagaStep<C> for FnStep<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: C) -> StepResult<C> {
        (self.execute)(ctx).await
    }

    async fn compensate(&self, ctx: &C) -> std::result::Result<(), StepError> {
        (self.compensate)(ctx.clone()).await
    }

    fn retry_config(&self) -> Option<StepRetryConfig> {
        self.retry.clone()
    }
}

/// An ordered list of steps with a name.
pub struct SagaDefinition<C> {
    pub name: String,
    pub steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Clone + Send + Sync + 'static> SagaDefinition<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step<S: SagaStep<C> + 'static>(mut self, step: S) -> Self {
        self.steps.push(Box::new(step));
        self
    }
}

/// Terminal status of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Completed,
    Failed,
    Compensated,
}

/// Per-step progress. Transitions are strictly forward:
/// `PENDING → EXECUTING → COMPLETED / FAILED → COMPENSATING →
/// COMPENSATED / COMPENSATION_FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

/// Observable state of one step after execution.
#[derive(Debug, Clone)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of retries performed (0 = succeeded or failed on first attempt).
    pub retry_count: u32,
    pub error: Option<String>,
}

impl StepState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
        }
    }
}

/// Deadlines for one execution.
#[derive(Debug, Clone)]
pub struct SagaOptions {
    pub step_timeout: Duration,
    pub saga_timeout: Duration,
}

impl Default for SagaOptions {
    fn default() -> Self {
        SagaConfig::default().default_options()
    }
}

/// Result of a saga execution. `success ⇔ status == Completed`.
#[derive(Debug)]
pub struct SagaResult<C> {
    pub success: bool,
    pub saga_id: Uuid,
    pub status: SagaStatus,
    pub context: C,
    pub error: Option<String>,
    pub steps: Vec<StepState>,
}

/// Saga configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub default_step_timeout_ms: u64,
    pub default_saga_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_backoff_multiplier: f64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            default_saga_timeout_ms: 300_000,
            default_max_retries: 3,
            default_retry_delay_ms: 100,
            default_backoff_multiplier: 2.0,
        }
    }
}

impl SagaConfig {
    pub fn default_retry(&self) -> StepRetryConfig {
        StepRetryConfig {
            max_retries: self.default_max_retries,
            delay: Duration::from_millis(self.default_retry_delay_ms),
            backoff_multiplier: self.default_backoff_multiplier,
        }
    }

    pub fn default_options(&self) -> SagaOptions {
        SagaOptions {
            step_timeout: Duration::from_millis(self.default_step_timeout_ms),
            saga_timeout: Duration::from_millis(self.default_saga_timeout_ms),
        }
    }
}

/// Durable whole-saga lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaLogStatus {
    Running,
    Completed,
    Failed,
    Compensated,
    TimedOut,
}

impl SagaLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaLogStatus::Running => "RUNNING",
            SagaLogStatus::Completed => "COMPLETED",
            SagaLogStatus::Failed => "FAILED",
            SagaLogStatus::Compensated => "COMPENSATED",
            SagaLogStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(SagaLogStatus::Running),
            "COMPLETED" => Some(SagaLogStatus::Completed),
            "FAILED" => Some(SagaLogStatus::Failed),
            "COMPENSATED" => Some(SagaLogStatus::Compensated),
            "TIMED_OUT" => Some(SagaLogStatus::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaLogStatus::Running)
    }
}

/// Durable copy of one saga execution's lifecycle.
#[derive(Debug, Clone)]
pub struct SagaLogEntry {
    pub id: Uuid,
    pub name: String,
    pub status: SagaLogStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistence for the saga lifecycle log.
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    async fn insert(&self, entry: &SagaLogEntry) -> StorageResult<()>;

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: SagaLogStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Transition `RUNNING` rows past their `timeout_at` to `TIMED_OUT`.
    /// Catches executions orphaned by a process crash.
    async fn mark_timed_out(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    /// Delete terminal rows completed before `cutoff`. Reconciler GC.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<SagaLogEntry>>;

    async fn count_running(&self) -> StorageResult<i64>;
}
