//! In-process channel bus.
//!
//! The default bus for standalone deployments: publish fans out to every
//! registered subscriber over unbounded channels. No external broker, no
//! durability of its own - durability comes from the outbox table feeding it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BusError, EventEnvelope, MessageBus, Result};

/// In-process fan-out bus.
#[derive(Default)]
pub struct ChannelBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<Arc<EventEnvelope>>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its receiving end.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<EventEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Number of live subscribers (dropped receivers are pruned on publish).
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let envelope = Arc::new(envelope.clone());
        let mut subscribers = self.subscribers.write().await;

        // Prune closed channels while delivering.
        subscribers.retain(|tx| tx.send(Arc::clone(&envelope)).is_ok());

        if subscribers.is_empty() {
            return Err(BusError::Publish("no live subscribers".to_string()));
        }

        debug!(
            id = %envelope.id,
            event_type = %envelope.event_type,
            subscribers = subscribers.len(),
            "Envelope delivered in-process"
        );
        Ok(())
    }
}
