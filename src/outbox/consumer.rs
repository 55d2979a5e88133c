//! Consumer-side idempotency.
//!
//! Delivery is at-least-once, so every consumer must treat a re-delivered
//! envelope as a no-op. `IdempotentConsumer` wraps a handler and dedupes on
//! the envelope id: a key is recorded only after the handler succeeds, so a
//! crash mid-handle re-processes (at-least-once preserved) while a completed
//! handle is never repeated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bus::{BusError, EnvelopeHandler, EventEnvelope};
use crate::storage::{Result as StorageResult, StorageError};

/// Processed-event bookkeeping keyed by `OutboxEvent.id`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` has already been processed.
    async fn seen(&self, key: &str) -> StorageResult<bool>;

    /// Record `key` as processed until `expires_at`.
    async fn record(&self, key: &str, expires_at: DateTime<Utc>) -> StorageResult<()>;

    /// Delete keys past their expiry. Reconciler GC.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}

/// Wraps a handler with id-based deduplication.
pub struct IdempotentConsumer {
    store: Arc<dyn IdempotencyStore>,
    inner: Arc<dyn EnvelopeHandler>,
    retention: Duration,
}

impl IdempotentConsumer {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        inner: Arc<dyn EnvelopeHandler>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            inner,
            retention,
        }
    }

    fn storage_err(&self, e: StorageError) -> BusError {
        BusError::ConsumerFailed {
            name: self.inner.name().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl EnvelopeHandler for IdempotentConsumer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, envelope: Arc<EventEnvelope>) -> crate::bus::Result<()> {
        let key = envelope.id.to_string();

        if self.store.seen(&key).await.map_err(|e| self.storage_err(e))? {
            debug!(id = %envelope.id, handler = self.inner.name(), "Duplicate envelope skipped");
            return Ok(());
        }

        self.inner.handle(Arc::clone(&envelope)).await?;

        let expires_at = Utc::now() + chrono::Duration::from_std(self.retention).unwrap_or_default();
        self.store
            .record(&key, expires_at)
            .await
            .map_err(|e| self.storage_err(e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    use crate::bus::ENVELOPE_SCHEMA_VERSION;
    use crate::ids;

    #[derive(Default)]
    struct MemoryIdempotencyStore {
        keys: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    #[async_trait]
    impl IdempotencyStore for MemoryIdempotencyStore {
        async fn seen(&self, key: &str) -> StorageResult<bool> {
            Ok(self.keys.lock().await.contains_key(key))
        }

        async fn record(&self, key: &str, expires_at: DateTime<Utc>) -> StorageResult<()> {
            self.keys.lock().await.insert(key.to_string(), expires_at);
            Ok(())
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
            let mut keys = self.keys.lock().await;
            let before = keys.len();
            keys.retain(|_, expires| *expires > now);
            Ok((before - keys.len()) as u64)
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl EnvelopeHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _envelope: Arc<EventEnvelope>) -> crate::bus::Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(BusError::ConsumerFailed {
                    name: "counting".to_string(),
                    message: "transient".to_string(),
                });
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_envelope() -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope {
            id: ids::new_id(),
            aggregate_type: "dsr_request".to_string(),
            aggregate_id: ids::new_id().to_string(),
            event_type: "DSR_DEADLINE_WARNING".to_string(),
            occurred_at: Utc::now(),
            schema_version: ENVELOPE_SCHEMA_VERSION,
            payload: serde_json::json!({}),
        })
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let store = Arc::new(MemoryIdempotencyStore::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        });
        let consumer =
            IdempotentConsumer::new(store, handler.clone(), Duration::from_secs(3600));

        let envelope = make_envelope();
        consumer.handle(Arc::clone(&envelope)).await.unwrap();
        consumer.handle(Arc::clone(&envelope)).await.unwrap();
        consumer.handle(envelope).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_handle_is_retried_not_recorded() {
        let store = Arc::new(MemoryIdempotencyStore::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(1),
        });
        let consumer =
            IdempotentConsumer::new(store, handler.clone(), Duration::from_secs(3600));

        let envelope = make_envelope();
        assert!(consumer.handle(Arc::clone(&envelope)).await.is_err());
        // Redelivery succeeds because no key was recorded on failure.
        consumer.handle(envelope).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_envelopes_all_processed() {
        let store = Arc::new(MemoryIdempotencyStore::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        });
        let consumer =
            IdempotentConsumer::new(store, handler.clone(), Duration::from_secs(3600));

        for _ in 0..3 {
            consumer.handle(make_envelope()).await.unwrap();
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }
}
