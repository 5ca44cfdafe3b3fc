use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Wire packets exchanged between the host and a module worker process.
///
/// Packets travel as newline-delimited JSON over any reliable, ordered,
/// bidirectional byte stream (in production: the worker's stdin/stdout).
/// The `direction` field tags the two packet kinds; decoding happens once,
/// at the transport boundary.
///
/// `callbackId` pairs a call with its eventual response. It is absent on
/// fire-and-forget calls, and required on every response.
pub const CALLBACK_ID_CEILING: u32 = 1 << 28;

/// Outbound or inbound call: `{direction:"call", name, payload, callbackId?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPacket {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    /// Present iff the caller expects a reply.
    #[serde(rename = "callbackId", skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<u32>,
}

/// Reply to a call: `{direction:"response", callbackId, success, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePacket {
    #[serde(rename = "callbackId")]
    pub callback_id: u32,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
}

/// The decoded union of everything that can arrive on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum Packet {
    Call(CallPacket),
    Response(ResponsePacket),
}

impl CallPacket {
    /// A call expecting a reply under `callback_id`.
    pub fn call(name: impl Into<String>, payload: Value, callback_id: u32) -> Self {
        Self {
            name: name.into(),
            payload,
            callback_id: Some(callback_id),
        }
    }

    /// A fire-and-forget call (no reply will ever come back).
    pub fn notification(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            callback_id: None,
        }
    }
}

impl ResponsePacket {
    pub fn ok(callback_id: u32, payload: Value) -> Self {
        Self {
            callback_id,
            success: true,
            payload,
        }
    }

    pub fn fail(callback_id: u32, error: ErrorPayload) -> Self {
        Self {
            callback_id,
            success: false,
            payload: error.into_value(),
        }
    }
}

// -----------------------------------------------------------------------------
// Failure payloads
// -----------------------------------------------------------------------------

/// Failure payload carried by unsuccessful responses: `{message, stack?}`.
///
/// Handler errors are serialized into this shape on the way out; payloads
/// of this shape coming back in are reconstructed into a typed call error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    pub fn into_value(self) -> Value {
        json!(self)
    }

    /// Rebuild from an arbitrary failure payload. Anything that is not the
    /// serialized-error shape degrades to its JSON text as the message.
    pub fn from_value(payload: &Value) -> Self {
        match serde_json::from_value::<ErrorPayload>(payload.clone()) {
            Ok(err) if !err.message.is_empty() => err,
            _ => ErrorPayload::new(payload.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<anyhow::Error> for ErrorPayload {
    fn from(err: anyhow::Error) -> Self {
        // The chain (`{:#}`) keeps the context a handler attached with `.context()`.
        Self::new(format!("{err:#}"))
    }
}
