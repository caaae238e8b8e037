//! Broadcast Channel Adapter
//!
//! In-process [`TickPublisher`] built on a tokio broadcast channel, for
//! fanning live ticks out to local subscribers without a Redis bus.
//! Slow receivers lag and lose the oldest ticks.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::application::ports::{PublishError, TickPublisher};

/// A tick as published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTick {
    /// Bus channel name.
    pub channel: String,
    /// Raw tick payload.
    pub payload: String,
}

/// Broadcast-backed tick publisher.
#[derive(Debug, Clone)]
pub struct BroadcastTickPublisher {
    tx: broadcast::Sender<PublishedTick>,
}

impl BroadcastTickPublisher {
    /// Create a publisher buffering up to `capacity` ticks per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to published ticks.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedTick> {
        self.tx.subscribe()
    }

    /// Number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl TickPublisher for BroadcastTickPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
        let tick = PublishedTick {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        if self.tx.send(tick).is_err() {
            tracing::trace!(channel, "No tick subscribers");
        }
        Ok(())
    }
}
