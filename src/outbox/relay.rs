//! Outbox relay worker.
//!
//! A single logical worker per process: claims deliverable rows, hands the
//! envelope to the message bus, and records the outcome durably. Horizontal
//! scaling happens through the database-level claim, never through
//! in-process sharing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{OutboxConfig, OutboxEvent, OutboxStore};
use crate::bus::MessageBus;
use crate::storage::Result;
use crate::utils::retry::redelivery_backoff;

/// Outcome of one claim/dispatch cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub released: usize,
}

/// Background relay between the outbox table and the message bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    config: OutboxConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn MessageBus>,
        config: OutboxConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            shutdown,
        }
    }

    /// Run the poll loop until shutdown.
    ///
    /// The interval adapts to load: an empty batch doubles it (up to
    /// `max_poll_ms`), a full batch halves it (down to `min_poll_ms`).
    pub async fn run(mut self) {
        let mut poll = Duration::from_millis(self.config.initial_poll_ms);
        info!(
            batch_size = self.config.batch_size,
            poll_ms = poll.as_millis() as u64,
            "Outbox relay started"
        );

        // Reclaim rows stranded in PROCESSING by a previous crash.
        match self.store.release_stale().await {
            Ok(0) => {}
            Ok(released) => warn!(released, "Stale claims released for redelivery"),
            Err(e) => error!(error = %e, "Failed to release stale claims"),
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll) => {
                    match self.process_batch().await {
                        Ok(outcome) => {
                            if outcome.claimed > 0 {
                                debug!(
                                    claimed = outcome.claimed,
                                    published = outcome.published,
                                    retried = outcome.retried,
                                    dead_lettered = outcome.dead_lettered,
                                    "Relay batch processed"
                                );
                            }
                            poll = next_poll(poll, outcome.claimed, &self.config);
                        }
                        Err(e) => {
                            error!(error = %e, "Relay batch failed");
                        }
                    }
                }
            }
        }

        info!("Outbox relay stopped");
    }

    /// Claim and dispatch one batch. Public so tests and operators can drive
    /// the relay without the poll loop.
    #[tracing::instrument(name = "outbox.batch", skip_all)]
    pub async fn process_batch(&self) -> Result<BatchOutcome> {
        let now = Utc::now();
        let events = self.store.claim_batch(now, self.config.batch_size).await?;

        let mut outcome = BatchOutcome {
            claimed: events.len(),
            ..Default::default()
        };

        let mut events = events.into_iter();

        // The in-flight item always finishes, shutdown or not; only the
        // items behind it are released for redelivery.
        if let Some(event) = events.next() {
            self.dispatch(event, &mut outcome).await?;
        }
        for event in events {
            if *self.shutdown.borrow() {
                self.store.release(event.id).await?;
                outcome.released += 1;
                continue;
            }
            self.dispatch(event, &mut outcome).await?;
        }

        Ok(outcome)
    }

    async fn dispatch(&self, event: OutboxEvent, outcome: &mut BatchOutcome) -> Result<()> {
        let envelope = event.envelope();

        match self.bus.publish(&envelope).await {
            Ok(()) => {
                self.store.mark_completed(event.id, Utc::now()).await?;
                outcome.published += 1;
            }
            Err(e) => {
                let retry_count = event.retry_count + 1;
                if retry_count < event.max_retries {
                    let backoff = redelivery_backoff(
                        Duration::from_millis(self.config.retry_backoff_base_ms),
                        retry_count as u32,
                        Duration::from_millis(self.config.max_retry_backoff_ms),
                    );
                    let retry_after =
                        Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64);
                    warn!(
                        id = %event.id,
                        event_type = %event.event_type,
                        retry_count,
                        retry_after = %retry_after,
                        error = %e,
                        "Dispatch failed, scheduled for redelivery"
                    );
                    self.store
                        .mark_failed(event.id, &e.to_string(), retry_after)
                        .await?;
                    outcome.retried += 1;
                } else {
                    error!(
                        id = %event.id,
                        event_type = %event.event_type,
                        retry_count,
                        error = %e,
                        "Retry budget exhausted, moving to dead letter"
                    );
                    self.store
                        .move_to_dead_letter(&event, &e.to_string(), Utc::now())
                        .await?;
                    outcome.dead_lettered += 1;
                }
            }
        }

        Ok(())
    }
}

/// Adaptive poll interval: empty batch backs off, full batch speeds up.
fn next_poll(current: Duration, claimed: usize, config: &OutboxConfig) -> Duration {
    if claimed == 0 {
        (current * 2).min(Duration::from_millis(config.max_poll_ms))
    } else if claimed as u32 >= config.batch_size {
        (current / 2).max(Duration::from_millis(config.min_poll_ms))
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 10,
            min_poll_ms: 100,
            max_poll_ms: 10_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_batch_doubles_interval() {
        let config = config();
        let poll = next_poll(Duration::from_millis(1_000), 0, &config);
        assert_eq!(poll, Duration::from_millis(2_000));
    }

    #[test]
    fn test_interval_capped_at_max() {
        let config = config();
        let poll = next_poll(Duration::from_millis(8_000), 0, &config);
        assert_eq!(poll, Duration::from_millis(10_000));
    }

    #[test]
    fn test_full_batch_halves_interval() {
        let config = config();
        let poll = next_poll(Duration::from_millis(1_000), 10, &config);
        assert_eq!(poll, Duration::from_millis(500));
    }

    #[test]
    fn test_interval_floored_at_min() {
        let config = config();
        let poll = next_poll(Duration::from_millis(150), 10, &config);
        assert_eq!(poll, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_batch_keeps_interval() {
        let config = config();
        let poll = next_poll(Duration::from_millis(1_000), 3, &config);
        assert_eq!(poll, Duration::from_millis(1_000));
    }
}
