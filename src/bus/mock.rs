//! Mock message bus implementation for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, EventEnvelope, MessageBus, Result};

/// Mock bus for testing: records publishes and injects failures.
#[derive(Default)]
pub struct MockBus {
    published: RwLock<Vec<EventEnvelope>>,
    fail_remaining: RwLock<Option<u32>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish until cleared.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_remaining.write().await = if fail { Some(u32::MAX) } else { None };
    }

    /// Fail exactly the next `n` publishes, then succeed.
    pub async fn fail_next(&self, n: u32) {
        *self.fail_remaining.write().await = Some(n);
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<EventEnvelope> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Event types in publish order, for ordering assertions.
    pub async fn published_event_types(&self) -> Vec<String> {
        self.published
            .read()
            .await
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let mut remaining = self.fail_remaining.write().await;
        match remaining.as_mut() {
            Some(0) | None => {}
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                return Err(BusError::Connection("mock publish failure".to_string()));
            }
        }
        drop(remaining);

        self.published.write().await.push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ENVELOPE_SCHEMA_VERSION;
    use crate::ids;
    use chrono::Utc;

    fn make_envelope() -> EventEnvelope {
        EventEnvelope {
            id: ids::new_id(),
            aggregate_type: "session".to_string(),
            aggregate_id: ids::new_id().to_string(),
            event_type: "SESSION_CREATED".to_string(),
            occurred_at: Utc::now(),
            schema_version: ENVELOPE_SCHEMA_VERSION,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let bus = MockBus::new();
        bus.publish(&make_envelope()).await.unwrap();
        bus.publish(&make_envelope()).await.unwrap();
        assert_eq!(bus.published_count().await, 2);
    }

    #[tokio::test]
    async fn test_mock_fail_next_then_recovers() {
        let bus = MockBus::new();
        bus.fail_next(2).await;

        assert!(bus.publish(&make_envelope()).await.is_err());
        assert!(bus.publish(&make_envelope()).await.is_err());
        assert!(bus.publish(&make_envelope()).await.is_ok());
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_persistent_failure() {
        let bus = MockBus::new();
        bus.set_fail_on_publish(true).await;
        for _ in 0..3 {
            assert!(bus.publish(&make_envelope()).await.is_err());
        }
        bus.set_fail_on_publish(false).await;
        assert!(bus.publish(&make_envelope()).await.is_ok());
    }
}
