//! Configuration Module
//!
//! Configuration loading for the kline ingester.

mod settings;

pub use settings::{ConfigError, IngestConfig, ServerSettings, StoreSettings, StreamSettings};
