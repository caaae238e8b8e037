//! Stream Codec
//!
//! The exchange sends every frame as gzip-compressed UTF-8 JSON. This
//! module inflates frames and classifies the JSON object by its keys:
//!
//! | keys               | meaning                    |
//! |--------------------|----------------------------|
//! | `ping`             | keepalive, answer with pong|
//! | `ch` + `tick`      | live tick                  |
//! | `subbed`           | subscription ack           |
//! | `status` + `id`    | fetch response             |

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::market::Bar;
use crate::domain::protocol::{Envelope, FetchResponse, TickMessage};

/// Error code used for responses whose shape could not be decoded.
pub const MALFORMED_CODE: &str = "malformed";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Gzip inflation or UTF-8 decoding failed.
    #[error("gzip decode error: {0}")]
    Decompress(#[from] std::io::Error),

    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keepalive carrying the exchange timestamp in milliseconds.
    Ping(i64),
    /// Anything to dispatch to the handler.
    Message(Envelope),
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    status: String,
    #[serde(default)]
    data: Option<Vec<Bar>>,
    #[serde(rename = "err-code", default)]
    err_code: Option<String>,
    #[serde(rename = "err-msg", default)]
    err_msg: Option<String>,
}

/// Gzip + JSON codec for the kline stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipJsonCodec;

impl GzipJsonCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a compressed binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not gzip, not UTF-8, or not a JSON object.
    pub fn decode_binary(&self, bytes: &[u8]) -> Result<Inbound, CodecError> {
        let text = inflate(bytes)?;
        self.decode_text(&text)
    }

    /// Decode an uncompressed JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object or a ping carries
    /// no integer timestamp.
    pub fn decode_text(&self, text: &str) -> Result<Inbound, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                text.chars().take(50).collect::<String>()
            )));
        };

        if let Some(ping) = object.get("ping") {
            return ping.as_i64().map(Inbound::Ping).ok_or_else(|| {
                CodecError::InvalidFormat(format!("ping without integer timestamp: {ping}"))
            });
        }

        Ok(Inbound::Message(classify(object, text)))
    }
}

fn classify(object: Map<String, Value>, text: &str) -> Envelope {
    if object.contains_key("tick") {
        let channel = object
            .get("ch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Envelope::Tick(TickMessage {
            channel,
            raw: text.to_string(),
        });
    }

    let id = object.get("id").and_then(Value::as_str).map(str::to_string);

    if let Some(topic) = object.get("subbed").and_then(Value::as_str) {
        return Envelope::Subscribed {
            id,
            topic: topic.to_string(),
        };
    }

    match id {
        Some(id) if object.contains_key("status") => {
            Envelope::Response(decode_response(id, Value::Object(object)))
        }
        _ => Envelope::Unknown(text.to_string()),
    }
}

fn decode_response(id: String, value: Value) -> FetchResponse {
    match serde_json::from_value::<RawResponse>(value) {
        Ok(raw) if raw.status == "ok" => FetchResponse::ok(id, raw.data.unwrap_or_default()),
        Ok(raw) => {
            let code = raw.err_code.unwrap_or(raw.status);
            FetchResponse::error(id, code, raw.err_msg.unwrap_or_default())
        }
        Err(e) => FetchResponse::error(id, MALFORMED_CODE, e.to_string()),
    }
}

/// Inflate a gzip payload into UTF-8 text.
///
/// # Errors
///
/// Returns [`CodecError::Decompress`] on corrupt gzip or invalid UTF-8.
pub fn inflate(bytes: &[u8]) -> Result<String, CodecError> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text)?;
    Ok(text)
}

/// Gzip-compress text the way the exchange frames it.
///
/// # Errors
///
/// Returns [`CodecError::Decompress`] if the encoder fails.
pub fn deflate(text: &str) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(encoder.finish()?)
}
