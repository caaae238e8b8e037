//! Exchange Message Types
//!
//! Decoded inbound envelopes and the outbound request frames of the
//! kline websocket protocol.

use serde_json::json;

use super::market::{Bar, SeriesKey};
use super::task::FetchWindow;

// =============================================================================
// Inbound
// =============================================================================

/// A decoded non-keepalive message from the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Reply to a fetch request.
    Response(FetchResponse),
    /// Live update on a subscribed topic.
    Tick(TickMessage),
    /// Subscription acknowledgement.
    Subscribed {
        /// Echoed request id.
        id: Option<String>,
        /// Topic that is now subscribed.
        topic: String,
    },
    /// Anything the pipeline does not act on.
    Unknown(String),
}

impl Envelope {
    /// Short kind name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Response(_) => "response",
            Self::Tick(_) => "tick",
            Self::Subscribed { .. } => "subscribed",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Outcome reported by the exchange for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The request succeeded.
    Ok,
    /// The request was rejected or the reply could not be understood.
    Error {
        /// Exchange error code (or `malformed`).
        code: String,
        /// Human readable reason.
        message: String,
    },
}

impl ResponseStatus {
    /// Check whether the status is `ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Reply to a fetch request, keyed by the echoed request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Request id, `<symbol>_<granularity>`.
    pub id: String,
    /// Exchange status.
    pub status: ResponseStatus,
    /// Bars in exchange order (not necessarily sorted).
    pub bars: Vec<Bar>,
}

impl FetchResponse {
    /// Build a successful response.
    #[must_use]
    pub fn ok(id: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            bars,
        }
    }

    /// Build a failed response.
    #[must_use]
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error {
                code: code.into(),
                message: message.into(),
            },
            bars: Vec::new(),
        }
    }
}

/// Live tick, kept verbatim for republishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickMessage {
    /// Topic the tick belongs to.
    pub channel: String,
    /// Decompressed message text exactly as received.
    pub raw: String,
}

// =============================================================================
// Outbound
// =============================================================================

/// A text frame queued for the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Request id carried by the frame, if any.
    pub request_id: Option<String>,
    /// Serialized JSON text.
    pub text: String,
}

impl OutboundFrame {
    /// Live subscription request for a series.
    #[must_use]
    pub fn subscribe(series: &SeriesKey) -> Self {
        let id = series.to_string();
        let text = json!({ "sub": series.topic(), "id": id }).to_string();
        Self {
            request_id: Some(id),
            text,
        }
    }

    /// Historical fetch for one window. The exchange range is `[start + 1, end]`.
    #[must_use]
    pub fn fetch(window: &FetchWindow) -> Self {
        let id = window.request_id();
        let text = json!({
            "req": window.series.topic(),
            "id": id,
            "from": window.start + 1,
            "to": window.end,
        })
        .to_string();
        Self {
            request_id: Some(id),
            text,
        }
    }

    /// Keepalive reply echoing the exchange timestamp.
    #[must_use]
    pub fn pong(ts: i64) -> Self {
        Self {
            request_id: None,
            text: json!({ "pong": ts }).to_string(),
        }
    }
}
