//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the ingestion services and the port interfaces
//! that define how they reach the exchange, the stores and the bus.

/// Port interfaces for external systems (exchange, stores, publish bus).
pub mod ports;

/// Scheduling, admission, applying and relaying services.
pub mod services;
