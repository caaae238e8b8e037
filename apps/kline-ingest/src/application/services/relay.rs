//! Tick Relay
//!
//! Forwards live ticks to the publish bus and keeps the live
//! subscriptions in place. Both run on the relay worker so the I/O task
//! only ever does a non-blocking channel send.
//!
//! Subscribe and fetch requests share the `<symbol>_<granularity>` id, and
//! an error reply carries nothing else to tell them apart. Subscribe ids
//! stay pending until acknowledged, and an error reply for a pending id is
//! taken as the subscription's.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::application::ports::{ExchangeGateway, StoreError, SymbolRegistry, TickPublisher};
use crate::domain::market::{Granularity, SeriesKey, SymbolState};
use crate::domain::protocol::{OutboundFrame, TickMessage};
use crate::infrastructure::metrics;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Publish channel for raw ticks.
    pub channel: String,
    /// Minimum time between subscription sweeps.
    pub resubscribe_interval: Duration,
    /// Capacity of the worker queue.
    pub queue_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel: "tick_data".to_string(),
            resubscribe_interval: Duration::from_secs(30),
            queue_capacity: 1024,
        }
    }
}

/// Admits at most one event per interval.
#[derive(Debug)]
pub struct ResubscribeThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ResubscribeThrottle {
    /// Create a throttle that has never fired.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Fire if the interval has passed since the last admitted call.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Work item for the relay worker.
#[derive(Debug)]
pub enum RelayCommand {
    /// Publish a tick.
    Tick(TickMessage),
    /// Send subscribe frames for every active symbol.
    Resubscribe,
}

/// Live tick forwarding and subscription upkeep.
pub struct TickRelay {
    registry: Arc<dyn SymbolRegistry>,
    gateway: Arc<dyn ExchangeGateway>,
    publisher: Arc<dyn TickPublisher>,
    channel: String,
    throttle: ResubscribeThrottle,
    pending: Mutex<HashSet<String>>,
    tx: mpsc::Sender<RelayCommand>,
}

impl TickRelay {
    /// Create a relay and the receiver its worker consumes.
    #[must_use]
    pub fn new(
        registry: Arc<dyn SymbolRegistry>,
        gateway: Arc<dyn ExchangeGateway>,
        publisher: Arc<dyn TickPublisher>,
        settings: RelaySettings,
    ) -> (Self, mpsc::Receiver<RelayCommand>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let relay = Self {
            registry,
            gateway,
            publisher,
            channel: settings.channel,
            throttle: ResubscribeThrottle::new(settings.resubscribe_interval),
            pending: Mutex::new(HashSet::new()),
            tx,
        };
        (relay, rx)
    }

    /// Queue a tick for publishing. Dropped when the worker is backed up.
    pub fn forward_tick(&self, tick: TickMessage) {
        self.enqueue(RelayCommand::Tick(tick));
    }

    /// Ask for a subscription sweep. Returns `false` if throttled.
    pub fn request_resubscribe(&self) -> bool {
        if !self.throttle.try_acquire(Instant::now()) {
            tracing::trace!("Resubscribe throttled");
            return false;
        }
        self.enqueue(RelayCommand::Resubscribe);
        true
    }

    /// Record the exchange's acknowledgement of a subscription.
    pub fn confirm_subscription(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Claim an error reply if `id` names an unacknowledged subscription.
    pub fn claim_rejection(&self, id: &str) -> bool {
        self.pending.lock().remove(id)
    }

    fn enqueue(&self, command: RelayCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                tracing::warn!(?command, "Relay queue full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Relay worker gone, dropping command");
            }
        }
    }

    /// Process commands until every sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RelayCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RelayCommand::Tick(tick) => self.publish(&tick).await,
                RelayCommand::Resubscribe => match self.resubscribe().await {
                    Ok(sent) => tracing::info!(sent, "Live subscriptions refreshed"),
                    Err(e) => tracing::warn!(error = %e, "Resubscribe sweep failed"),
                },
            }
        }
        tracing::debug!("Relay channel closed, relay stopping");
    }

    /// Publish one tick verbatim. Failures are logged and dropped.
    pub async fn publish(&self, tick: &TickMessage) {
        match self.publisher.publish(&self.channel, &tick.raw).await {
            Ok(()) => metrics::record_tick_published(true),
            Err(e) => {
                metrics::record_tick_published(false);
                tracing::warn!(channel = %tick.channel, error = %e, "Tick publish failed");
            }
        }
    }

    /// Send a one-minute subscribe frame for every active symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn resubscribe(&self) -> Result<usize, StoreError> {
        let mut sent = 0;
        for symbol in self.registry.symbols().await? {
            if self.registry.state(&symbol).await? != SymbolState::Active {
                continue;
            }
            let series = SeriesKey::new(symbol, Granularity::OneMinute);
            match self.gateway.send(OutboundFrame::subscribe(&series)) {
                Ok(()) => {
                    self.pending.lock().insert(series.to_string());
                    sent += 1;
                }
                Err(e) => tracing::warn!(series = %series, error = %e, "Subscribe not sent"),
            }
        }
        Ok(sent)
    }
}
