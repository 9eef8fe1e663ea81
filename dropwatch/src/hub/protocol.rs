//! JSON hub protocol records.
//!
//! Every record is a JSON object terminated by the `0x1E` record separator; a
//! single WebSocket frame may carry several records. A session starts with a
//! handshake request answered by `{}` (or `{"error": ...}`).

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub method the server invokes to push analysis messages.
pub const RECEIVE_SIGNAL: &str = "ReceiveSignal";
/// Hub method to start receiving analysis for a symbol/timeframe.
pub const SUBSCRIBE: &str = "SubscribeToAnalysis";
/// Hub method to stop receiving analysis for a symbol/timeframe.
pub const UNSUBSCRIBE: &str = "UnsubscribeFromAnalysis";

const TYPE_INVOCATION: u8 = 1;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { target: String, arguments: Vec<Value> },
    Ping,
    Close { error: Option<String>, allow_reconnect: bool },
    /// Stream items, completions and other record types this client never uses.
    Other(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Invocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    target: &'a str,
    arguments: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// First record sent after the socket opens.
pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

pub fn parse_handshake_response(record: &str) -> Result<(), ProtocolError> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|error| ProtocolError::Handshake(format!("{error}: {record}")))?;
    match response.error {
        Some(error) => Err(ProtocolError::Handshake(error)),
        None => Ok(()),
    }
}

/// Split a frame into its non-empty records.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

pub fn decode_record(record: &str) -> Result<HubMessage, ProtocolError> {
    let raw: RawRecord = serde_json::from_str(record)
        .map_err(|error| ProtocolError::Malformed(format!("{error}: {record}")))?;

    Ok(match raw.kind {
        TYPE_INVOCATION => HubMessage::Invocation {
            target: raw
                .target
                .ok_or_else(|| ProtocolError::Malformed(format!("invocation without target: {record}")))?,
            arguments: raw.arguments,
        },
        TYPE_PING => HubMessage::Ping,
        TYPE_CLOSE => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect.unwrap_or(true),
        },
        other => HubMessage::Other(other),
    })
}

/// Fire-and-forget invocation of a hub method.
pub fn encode_invocation(target: &str, arguments: &[Value]) -> String {
    let invocation = Invocation {
        kind: TYPE_INVOCATION,
        target,
        arguments,
    };
    // Serialising str/Value never fails
    let json = serde_json::to_string(&invocation).unwrap_or_default();
    format!("{json}{RECORD_SEPARATOR}")
}

pub fn encode_ping() -> String {
    format!(r#"{{"type":{TYPE_PING}}}{RECORD_SEPARATOR}"#)
}
