//! Exchange Stream Adapter
//!
//! WebSocket client for the exchange kline stream.
//!
//! # Components
//!
//! - `codec`: Gzip + JSON frame decoding and classification
//! - `keepalive`: Server-driven ping tracking and stale detection
//! - `reconnect`: Exponential backoff with jitter
//! - `state`: Connection state machine
//! - `connection`: The I/O task and its send handle

pub mod codec;
pub mod connection;
pub mod keepalive;
pub mod reconnect;
pub mod state;

pub use codec::{CodecError, GzipJsonCodec, Inbound};
pub use connection::{ConnectionHandle, ConnectionStats, StreamConfig, StreamConnection, StreamError};
pub use keepalive::{HealthVerdict, KeepaliveConfig, LivenessState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use state::{ConnectionState, ConnectionStatus, IllegalTransition};
