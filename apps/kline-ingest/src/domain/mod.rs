//! Domain Layer - Core kline types.
//!
//! This layer contains the pure data types of the ingestion pipeline:
//! symbols and granularities, bars, scheduler tasks and the exchange
//! message shapes. Nothing here performs I/O.

/// Symbols, granularities, series keys and bars.
pub mod market;

/// Exchange envelopes and outbound request frames.
pub mod protocol;

/// Scheduler tasks.
pub mod task;
