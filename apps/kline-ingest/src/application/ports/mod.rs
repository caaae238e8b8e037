//! Port Interfaces
//!
//! Defines the interfaces (ports) between the ingestion services and
//! external systems following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BarStore`: Idempotent per-series bar persistence
//! - `CursorStore`: Per-series high-water marks
//! - `SymbolRegistry`: Ordered symbol list with enablement state
//! - `TickPublisher`: Fire-and-forget publish of raw ticks
//! - `ExchangeGateway`: Send side of the streaming connection
//!
//! ## Driver Ports (Inbound)
//!
//! - `StreamHandler`: Typed callbacks the streaming connection drives

use async_trait::async_trait;

use crate::domain::market::{Bar, SeriesKey, Symbol, SymbolState};
use crate::domain::protocol::{Envelope, OutboundFrame};

// =============================================================================
// Errors
// =============================================================================

/// Storage error shared by the bar, cursor and registry ports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store connection error: {message}")]
    Connection {
        /// Error detail.
        message: String,
    },

    /// A read or write was rejected.
    #[error("store query failed: {message}")]
    Query {
        /// Error detail.
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt stored value: {message}")]
    Corrupt {
        /// Error detail.
        message: String,
    },
}

/// Publish error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The bus could not be reached.
    #[error("publish connection error: {message}")]
    Connection {
        /// Error detail.
        message: String,
    },

    /// Publishing was rejected.
    #[error("publish failed: {message}")]
    PublishFailed {
        /// Error detail.
        message: String,
    },
}

/// Reason a frame could not be queued on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is not in the `Connected` state.
    #[error("connection is not connected")]
    NotConnected,

    /// The writer queue is saturated.
    #[error("outbound queue is full")]
    QueueFull,

    /// The connection has been stopped.
    #[error("connection is stopped")]
    Stopped,
}

/// Result of inserting one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The bar was new and is now stored.
    Inserted,
    /// A bar with the same id already exists; nothing changed.
    Duplicate,
}

// =============================================================================
// Driven Ports
// =============================================================================

/// Idempotent per-(symbol, granularity) bar storage.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert a bar. An existing id reports [`InsertOutcome::Duplicate`].
    async fn insert(&self, series: &SeriesKey, bar: &Bar) -> Result<InsertOutcome, StoreError>;

    /// Look up a bar by id.
    async fn find_one(&self, series: &SeriesKey, id: i64) -> Result<Option<Bar>, StoreError>;
}

/// Per-series cursor (next unfetched bucket start, unix seconds).
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read a cursor. `None` when it was never initialized.
    async fn cursor(&self, series: &SeriesKey) -> Result<Option<i64>, StoreError>;

    /// Overwrite a cursor.
    async fn set_cursor(&self, series: &SeriesKey, value: i64) -> Result<(), StoreError>;
}

/// Symbol list and per-symbol enablement state.
#[async_trait]
pub trait SymbolRegistry: Send + Sync {
    /// All registered symbols in registry order.
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError>;

    /// Enablement state of a symbol. Unknown symbols read as disabled.
    async fn state(&self, symbol: &str) -> Result<SymbolState, StoreError>;

    /// Update the enablement state of a symbol.
    async fn set_state(&self, symbol: &str, state: SymbolState) -> Result<(), StoreError>;
}

/// Publish/subscribe bus for live ticks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TickPublisher: Send + Sync {
    /// Publish a raw payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError>;
}

/// Send side of the exchange connection.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Queue a frame for the writer. Fails fast unless connected.
    fn send(&self, frame: OutboundFrame) -> Result<(), SendError>;

    /// Check whether the connection is currently `Connected`.
    fn is_connected(&self) -> bool;

    /// Wait until the connection is `Connected`.
    ///
    /// Returns `false` if the connection stopped instead.
    async fn wait_connected(&self) -> bool;

    /// Stop the connection for good.
    fn stop(&self);
}

// =============================================================================
// Driver Ports
// =============================================================================

/// Callbacks invoked by the streaming connection on its I/O task.
///
/// Implementations must return quickly and hand real work to other tasks.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// A session opened. `reconnect` is `false` only for the first session.
    async fn handle_open(&self, reconnect: bool);

    /// A decoded non-keepalive message arrived.
    async fn handle_message(&self, envelope: Envelope);

    /// No message was dispatched for longer than the stale threshold while
    /// keepalives kept arriving.
    async fn handle_stale(&self);

    /// Writing a queued frame to the transport failed.
    async fn handle_send_failure(&self, frame: &OutboundFrame, error: &str);
}
