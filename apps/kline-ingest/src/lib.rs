#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_wrap
    )
)]

//! Kline Ingest - Exchange Kline Ingestion Pipeline
//!
//! Keeps one streaming connection to the exchange's market websocket and
//! uses it to backfill historical bars, keep every enabled series current,
//! and relay live ticks onto a publish channel.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure kline types
//!   - `market`: Symbols, granularities, series keys, bars
//!   - `task`: Fetch windows and scheduler tasks
//!   - `protocol`: Exchange envelopes and outbound frames
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Stores, publish bus, exchange gateway, stream handler
//!   - `services`: Admission, scheduler, applier, relay, handler
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: WebSocket client with keepalive and reconnect
//!   - `persistence`: SQLite bars, Redis cursors/registry, in-memory doubles
//!   - `broadcast`: In-process tick publisher
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics endpoint
//!
//! # Data Flow
//!
//! ```text
//!                  ┌────────────┐  fetch frames   ┌──────────────┐
//! Registry/Cursors─►│ Scheduler  │────────────────►│  Connection  │◄──► exchange ws
//!                  └────────────┘   (admission)   └──────┬───────┘
//!                                                        │ envelopes
//!                          ┌─────────────────────────────┼──────────────┐
//!                          ▼                             ▼              ▼
//!                   ┌────────────┐               ┌────────────┐    (ping/pong
//!                   │  Applier   │──► bars,      │   Relay    │──►  handled
//!                   └────────────┘    cursors    └────────────┘    in the I/O task)
//!                                                  tick_data
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core kline types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    Bar, Granularity, MAX_BARS_PER_REQUEST, SeriesKey, Symbol, SymbolState,
};
pub use domain::protocol::{Envelope, FetchResponse, OutboundFrame, TickMessage};
pub use domain::task::{FetchWindow, Task};

// Services
pub use application::services::{
    AdmissionControl, IngestHandler, ResponseApplier, RunMode, TaskScheduler, TickRelay,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, IngestConfig, ServerSettings, StoreSettings, StreamSettings,
};

// Exchange connection
pub use infrastructure::exchange::{
    ConnectionHandle, ConnectionState, StreamConfig, StreamConnection, StreamError,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{LogFile, TelemetryConfig, TelemetryGuard, init as init_telemetry};
