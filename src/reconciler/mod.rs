//! Scheduled reconciliation loop.
//!
//! Periodic sweepers drive every time-based state transition: expiring
//! sessions, escalating DSR deadlines, warning on consent expiry, and
//! garbage-collecting completed records. Each job follows the same shape:
//! scan, classify, transact per row, emit events through the outbox.
//!
//! Every job holds a per-job lock; a tick that fires while the previous run
//! is still executing is dropped. Shutdown lets in-flight runs finish.

pub mod jobs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::storage::StorageError;

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcilerError>;

/// Errors from reconciler jobs.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// One periodic sweeper.
///
/// `run` receives the sweep time explicitly so tests can drive jobs with a
/// synthetic clock. It returns the number of rows it affected.
#[async_trait]
pub trait ReconcilerJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Reconciler configuration: cadences, retentions and batch size.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub expire_sessions_interval_secs: u64,
    pub gc_revoked_tokens_interval_secs: u64,
    pub gc_idempotency_interval_secs: u64,
    pub saga_timeouts_interval_secs: u64,
    pub gc_dead_letters_interval_secs: u64,
    pub gc_outbox_interval_secs: u64,
    pub consent_expiry_interval_secs: u64,
    pub dsr_deadlines_interval_secs: u64,
    /// Completed outbox rows are kept this many days.
    pub outbox_retention_days: i64,
    /// Resolved/ignored dead letters are kept this many days.
    pub dead_letter_retention_days: i64,
    /// Terminal saga log rows are kept this many days.
    pub saga_log_retention_days: i64,
    /// Consents are warned about this many days before expiry.
    pub consent_warning_days: i64,
    /// Rows touched per sweep.
    pub sweep_batch_size: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_sessions_interval_secs: 300,
            gc_revoked_tokens_interval_secs: 3_600,
            gc_idempotency_interval_secs: 3_600,
            saga_timeouts_interval_secs: 300,
            gc_dead_letters_interval_secs: 86_400,
            gc_outbox_interval_secs: 3_600,
            consent_expiry_interval_secs: 3_600,
            dsr_deadlines_interval_secs: 900,
            outbox_retention_days: 7,
            dead_letter_retention_days: 90,
            saga_log_retention_days: 30,
            consent_warning_days: 30,
            sweep_batch_size: 500,
        }
    }
}

struct ScheduledJob {
    job: Arc<dyn ReconcilerJob>,
    interval: Duration,
    guard: Arc<Mutex<()>>,
}

/// Registration table of jobs and their cadences.
///
/// Built explicitly at startup; there is no annotation magic - a job exists
/// because something registered it here.
#[derive(Default)]
pub struct Reconciler {
    jobs: Vec<ScheduledJob>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            shutdown: None,
        }
    }

    /// Register a job with its cadence.
    pub fn register(&mut self, job: Arc<dyn ReconcilerJob>, interval: Duration) -> &mut Self {
        self.jobs.push(ScheduledJob {
            job,
            interval,
            guard: Arc::new(Mutex::new(())),
        });
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.job.name()).collect()
    }

    /// Spawn one task per registered job. Call [`Reconciler::shutdown`] to
    /// stop them; await the returned handles to let in-flight runs finish.
    pub fn spawn(&mut self) -> Vec<JoinHandle<()>> {
        let (tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.jobs.len());

        for scheduled in &self.jobs {
            let job = Arc::clone(&scheduled.job);
            let guard = Arc::clone(&scheduled.guard);
            let interval = scheduled.interval;
            let mut rx = tx.subscribe();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(job = job.name(), interval_secs = interval.as_secs(), "Job scheduled");

                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                debug!(job = job.name(), "Job loop stopped");
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            // A tick during a running sweep is dropped.
                            let Ok(_lock) = guard.try_lock() else {
                                debug!(job = job.name(), "Tick dropped, previous run still active");
                                continue;
                            };
                            match job.run(Utc::now()).await {
                                Ok(affected) if affected > 0 => {
                                    info!(job = job.name(), affected, "Sweep complete");
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(job = job.name(), error = %e, "Sweep failed");
                                }
                            }
                        }
                    }
                }
            }));
        }

        self.shutdown = Some(tx);
        handles
    }

    /// Signal every job loop to stop after its current run.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.shutdown {
            let _ = tx.send(true);
        }
    }

    /// Run one job by name, waiting for any in-flight run to finish first.
    pub async fn run_job_once(&self, name: &str, now: DateTime<Utc>) -> Result<u64> {
        let scheduled = self
            .jobs
            .iter()
            .find(|j| j.job.name() == name)
            .ok_or_else(|| ReconcilerError::UnknownJob(name.to_string()))?;

        let _lock = scheduled.guard.lock().await;
        scheduled.job.run(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingJob {
        name: &'static str,
        runs: AtomicU64,
        delay: Duration,
    }

    #[async_trait]
    impl ReconcilerJob for CountingJob {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _now: DateTime<Utc>) -> Result<u64> {
            tokio::time::sleep(self.delay).await;
            Ok(self.runs.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_registration_table() {
        let mut reconciler = Reconciler::new();
        reconciler.register(
            Arc::new(CountingJob {
                name: "a",
                runs: AtomicU64::new(0),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(60),
        );
        reconciler.register(
            Arc::new(CountingJob {
                name: "b",
                runs: AtomicU64::new(0),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(60),
        );
        assert_eq!(reconciler.job_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_run_job_once_by_name() {
        let job = Arc::new(CountingJob {
            name: "sweep",
            runs: AtomicU64::new(0),
            delay: Duration::ZERO,
        });
        let mut reconciler = Reconciler::new();
        reconciler.register(Arc::clone(&job) as Arc<dyn ReconcilerJob>, Duration::from_secs(60));

        assert_eq!(reconciler.run_job_once("sweep", Utc::now()).await.unwrap(), 1);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        let err = reconciler.run_job_once("missing", Utc::now()).await;
        assert!(matches!(err, Err(ReconcilerError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_spawned_jobs_tick_and_stop() {
        let job = Arc::new(CountingJob {
            name: "ticking",
            runs: AtomicU64::new(0),
            delay: Duration::ZERO,
        });
        let mut reconciler = Reconciler::new();
        reconciler.register(Arc::clone(&job) as Arc<dyn ReconcilerJob>, Duration::from_millis(20));

        let handles = reconciler.spawn();
        tokio::time::sleep(Duration::from_millis(90)).await;
        reconciler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected multiple ticks, got {runs}");
    }
}
