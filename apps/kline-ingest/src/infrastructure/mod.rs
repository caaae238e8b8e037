//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Exchange WebSocket client (codec, keepalive, reconnect, I/O task).
pub mod exchange;

/// SQLite, Redis and in-memory store adapters.
pub mod persistence;

/// Broadcast channel tick publisher.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
