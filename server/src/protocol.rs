//! Realtime wire protocol.
//!
//! Frames are JSON objects discriminated by a `type` field:
//!
//! | Frame | Direction | Effect |
//! |-------|-----------|--------|
//! | `{"type":"AUTH","data":{"token":"..."}}` | client → server | verify the token |
//! | `{"type":"MESSAGE", ...}` | client → server | rebroadcast verbatim to every client |
//! | `{"type":"PING"}` | server → client | liveness probe |
//! | `{"type":"PONG"}` | either | marks the sender alive |
//! | `{"type":"LISTEN"}` | client → server | accepted, no-op |
//! | `{"type":"RESPONSE", ...}` | server → client | AUTH outcome or error |
//!
//! Anything that is not JSON, or does not match one of the shapes above, is
//! rejected as a whole by [`decode_frame`] before any dispatch happens.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

/// Error text sent to clients whose frame failed validation.
pub const INVALID_MESSAGE: &str = "Invalid message";

/// Error text sent to clients whose AUTH token was rejected.
pub const INVALID_TOKEN: &str = "Invalid token";

/// Error text sent when a MESSAGE arrives before a successful AUTH.
pub const NOT_AUTHENTICATED: &str = "Not authenticated";

/// A validated client frame.
///
/// `Message` keeps the frame text exactly as received so it can be
/// republished byte for byte; the gateway never inspects its contents.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Auth { token: String },
    Message(String),
    Ping,
    Pong,
    Response,
    Listen,
}

impl InboundMessage {
    /// Wire tag of this frame, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "AUTH",
            Self::Message(_) => "MESSAGE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Response => "RESPONSE",
            Self::Listen => "LISTEN",
        }
    }
}

/// Schema used to validate inbound frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum InboundSchema {
    Auth { data: AuthData },
    Message,
    Ping,
    Pong,
    Response,
    Listen,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    token: String,
}

/// Parses and validates a text frame.
///
/// # Errors
///
/// - [`ProtocolError::InvalidJson`] if the text is not JSON
/// - [`ProtocolError::InvalidSchema`] if the JSON is not a known frame
pub fn decode_frame(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let schema = InboundSchema::deserialize(&value)
        .map_err(|e| ProtocolError::InvalidSchema(e.to_string()))?;

    Ok(match schema {
        InboundSchema::Auth { data } => InboundMessage::Auth { token: data.token },
        InboundSchema::Message => InboundMessage::Message(text.to_owned()),
        InboundSchema::Ping => InboundMessage::Ping,
        InboundSchema::Pong => InboundMessage::Pong,
        InboundSchema::Response => InboundMessage::Response,
        InboundSchema::Listen => InboundMessage::Listen,
    })
}

/// Body of a RESPONSE frame: a success payload or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Data { data: Value },
    Error { error: String },
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    Ping,
    Pong,
    Response(ResponseBody),
}

impl OutboundMessage {
    /// RESPONSE acknowledging a successful AUTH.
    pub fn authenticated() -> Self {
        Self::Response(ResponseBody::Data {
            data: json!({ "status": "authenticated" }),
        })
    }

    /// RESPONSE carrying an error string.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Response(ResponseBody::Error {
            error: message.into(),
        })
    }

    /// Serializes the frame to its JSON text form.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
