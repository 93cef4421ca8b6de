//! Wire codec — the `graphql-transport-ws` message taxonomy.
//!
//! DESIGN
//! ======
//! Every frame on the wire is a UTF-8 JSON object `{type, id?, payload?}`.
//! Connection-scoped types (`connection_init`, `connection_ack`, `ping`,
//! `pong`) never carry an `id`; operation-scoped types (`subscribe`, `next`,
//! `error`, `complete`) require one. Decoding is strict: an unknown `type`,
//! a misplaced or missing `id`, or a malformed payload is a protocol
//! violation and closes the connection with 1002.
//!
//! ERROR HANDLING
//! ==============
//! `DecodeError` carries codec-owned reason strings only — raw serde error
//! text is never forwarded to the peer. Close reasons are stripped of
//! control characters; a reason over the 123-byte close-frame limit is
//! replaced with a generic fallback rather than truncated.

use serde::Serialize;
use serde_json::{Map, Value};

// =============================================================================
// SUBPROTOCOLS
// =============================================================================

/// The current subprotocol token offered during the websocket upgrade.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// Legacy subprotocol token, kept for compatibility with older clients.
pub const DEPRECATED_GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// RFC 6455 caps the close-frame reason at 123 bytes of UTF-8.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Close-code taxonomy: standard codes plus application codes in the
/// private-use range above 4000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000 — normal closure.
    Normal,
    /// 1001 — server going away (shutdown broadcast).
    GoingAway,
    /// 1002 — protocol violation.
    ProtocolError,
    /// 1011 — internal fault, reason sanitized.
    InternalError,
    /// 4408 — `connection_init` not received within the timeout.
    InitTimeout,
    /// 4409 — `subscribe` reused an id that is still registered.
    DuplicateSubscriber,
    /// 4429 — second `connection_init` on an acknowledged connection.
    TooManyInitRequests,
}

impl CloseCode {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::InternalError => 1011,
            Self::InitTimeout => 4408,
            Self::DuplicateSubscriber => 4409,
            Self::TooManyInitRequests => 4429,
        }
    }
}

/// A close directive: code plus an already-sanitized reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub code: CloseCode,
    pub reason: String,
}

impl Close {
    #[must_use]
    pub fn protocol_error(reason: impl AsRef<str>) -> Self {
        Self {
            code: CloseCode::ProtocolError,
            reason: sanitize_close_reason(reason.as_ref(), "Protocol error"),
        }
    }

    #[must_use]
    pub fn init_timeout() -> Self {
        Self { code: CloseCode::InitTimeout, reason: "Connection initialisation timeout".into() }
    }

    #[must_use]
    pub fn duplicate_subscriber(id: &str) -> Self {
        Self {
            code: CloseCode::DuplicateSubscriber,
            reason: sanitize_close_reason(
                &format!("Subscriber already exists for {id}"),
                "Subscriber already exists",
            ),
        }
    }

    #[must_use]
    pub fn too_many_init_requests() -> Self {
        Self { code: CloseCode::TooManyInitRequests, reason: "Too many initialisation requests".into() }
    }

    #[must_use]
    pub fn going_away() -> Self {
        Self { code: CloseCode::GoingAway, reason: "Going away".into() }
    }

    /// Internal fault. The message is sanitized; oversized or unprintable
    /// fault text is replaced by the generic reason.
    #[must_use]
    pub fn internal(message: &str) -> Self {
        Self {
            code: CloseCode::InternalError,
            reason: sanitize_close_reason(message, "Internal server error"),
        }
    }
}

/// Strip control characters from the reason. Falls back to `fallback`
/// when nothing printable remains or the reason does not fit the
/// close-frame limit.
#[must_use]
pub fn sanitize_close_reason(reason: &str, fallback: &str) -> String {
    let cleaned: String = reason.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.len() > MAX_CLOSE_REASON_BYTES {
        return fallback.to_string();
    }
    cleaned.to_string()
}

// =============================================================================
// DECODE ERRORS
// =============================================================================

/// Shape violations detected while decoding an inbound frame. Every variant
/// maps to close 1002; `Display` is the close reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message is not valid json")]
    InvalidJson,
    #[error("message must be a json object")]
    NotAnObject,
    #[error("message is missing the type field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
    #[error("{0} must not carry an id")]
    UnexpectedId(&'static str),
    #[error("{0} requires a non-empty string id")]
    MissingId(&'static str),
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl From<&DecodeError> for Close {
    fn from(err: &DecodeError) -> Self {
        Close::protocol_error(err.to_string())
    }
}

// =============================================================================
// CLIENT MESSAGES
// =============================================================================

/// Payload of a `subscribe` message: one GraphQL operation.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub extensions: Option<Map<String, Value>>,
}

/// Messages a client may send, after shape validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ConnectionInit { payload: Option<Map<String, Value>> },
    Ping { payload: Option<Map<String, Value>> },
    Pong { payload: Option<Map<String, Value>> },
    Subscribe { id: String, payload: SubscribePayload },
    Complete { id: String },
}

/// Decode and validate one inbound text frame.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the frame violates the message taxonomy;
/// the caller closes the connection with 1002.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| DecodeError::InvalidJson)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let Some(msg_type) = obj.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MissingType);
    };

    match msg_type {
        "connection_init" => Ok(ClientMessage::ConnectionInit {
            payload: connection_scoped(&obj, "connection_init")?,
        }),
        "ping" => Ok(ClientMessage::Ping { payload: connection_scoped(&obj, "ping")? }),
        "pong" => Ok(ClientMessage::Pong { payload: connection_scoped(&obj, "pong")? }),
        "subscribe" => {
            let id = required_id(&obj, "subscribe")?;
            let Some(payload) = obj.get("payload").filter(|p| p.is_object()) else {
                return Err(DecodeError::MalformedPayload("subscribe"));
            };
            let payload: SubscribePayload = serde_json::from_value(payload.clone())
                .map_err(|_| DecodeError::MalformedPayload("subscribe"))?;
            if payload.query.trim().is_empty() {
                return Err(DecodeError::MalformedPayload("subscribe"));
            }
            Ok(ClientMessage::Subscribe { id, payload })
        }
        "complete" => Ok(ClientMessage::Complete { id: required_id(&obj, "complete")? }),
        // Known, but server-to-client only.
        "connection_ack" | "next" | "error" => Err(DecodeError::UnexpectedType(msg_type.to_string())),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

/// Validate a connection-scoped message: no `id`, optional object payload.
fn connection_scoped(
    obj: &Map<String, Value>,
    msg_type: &'static str,
) -> Result<Option<Map<String, Value>>, DecodeError> {
    if obj.get("id").is_some_and(|id| !id.is_null()) {
        return Err(DecodeError::UnexpectedId(msg_type));
    }
    match obj.get("payload") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(DecodeError::MalformedPayload(msg_type)),
    }
}

/// Extract the mandatory non-empty string `id` of an operation-scoped message.
fn required_id(obj: &Map<String, Value>, msg_type: &'static str) -> Result<String, DecodeError> {
    match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(DecodeError::MissingId(msg_type)),
    }
}

// =============================================================================
// SERVER MESSAGES
// =============================================================================

/// Messages the server emits. Serialization produces the wire shape
/// directly; absent fields are omitted, not nulled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    Ping,
    Pong,
    Next { id: String, payload: Value },
    Error { id: String, payload: Vec<Value> },
    Complete { id: String },
}

impl ServerMessage {
    #[must_use]
    pub fn next(id: impl Into<String>, payload: Value) -> Self {
        Self::Next { id: id.into(), payload }
    }

    #[must_use]
    pub fn error(id: impl Into<String>, payload: Vec<Value>) -> Self {
        Self::Error { id: id.into(), payload }
    }

    #[must_use]
    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }

    /// The operation this message belongs to, if any.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Next { id, .. } | Self::Error { id, .. } | Self::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// The operation this message terminates, if any. The writer path uses
    /// this to deregister operations as their final frame goes out.
    #[must_use]
    pub fn terminated_operation(&self) -> Option<&str> {
        match self {
            Self::Error { id, .. } | Self::Complete { id } => Some(id),
            _ => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
