use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable error codes.
///
/// These appear on `error` events, in rejected call errors, and on the wire
/// inside `{ok: false}` response bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// An inbound frame's source origin is not on the allow list.
    OriginNotAllowed,
    /// Outbound target-origin policy forbids the resolved target.
    TargetOriginForbidden,
    /// A request waited past its per-call deadline.
    RequestTimeout,
    /// The handshake did not complete within its deadline.
    HandshakeTimeout,
    /// The operation requires an established connection.
    NotConnected,
    /// The engine is already bound to a different peer endpoint.
    AlreadyConnected,
    /// Liveness monitoring declared the peer gone.
    ConnectionLost,
    /// The connection was explicitly closed (either side).
    Disconnected,
    /// The handshake was aborted before completing.
    HandshakeFailed,
    /// The peer endpoint is unreachable (e.g. popup closed).
    TargetNotFound,
    /// The payload could not be serialized for the wire.
    SerializationFailed,
    /// Schema validation rejected a payload.
    ValidationFailed,
    /// The peer has no handler registered for the request's message type.
    NoHandler,
    /// The peer's handler failed while producing a response.
    HandlerError,
    /// The peer speaks an incompatible protocol version.
    ProtocolMismatch,
    /// The engine configuration is invalid.
    InvalidConfig,
}

impl ErrorCode {
    /// Wire/event spelling of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::OriginNotAllowed => "ORIGIN_NOT_ALLOWED",
            ErrorCode::TargetOriginForbidden => "TARGET_ORIGIN_FORBIDDEN",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AlreadyConnected => "ALREADY_CONNECTED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::HandshakeFailed => "HANDSHAKE_FAILED",
            ErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::NoHandler => "NO_HANDLER",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::ProtocolMismatch => "PROTOCOL_MISMATCH",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violation found while validating a payload against a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON-pointer-ish path to the offending value (`""` for the root).
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error body carried inside `{ok: false}` response payloads.
///
/// Handlers return this to signal an application-level failure; the engine
/// also produces them for `NO_HANDLER`, `HANDLER_ERROR` and
/// `VALIDATION_FAILED` replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Error taxonomy of the connection engine.
///
/// Errors raised while handling inbound frames never escape the engine loop;
/// they surface as `error` events and, when a request is involved, as error
/// responses. Errors on user-initiated calls reject the call itself.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ParleyError {
    /// Schema validation failed for an inbound or outbound payload.
    #[error("validation failed for '{message_type}'")]
    Validation {
        message_type: String,
        issues: Vec<ValidationIssue>,
    },

    /// A bounded wait expired (handshake, request, heartbeat probe).
    #[error("{code}: timed out after {elapsed_ms} ms")]
    Timeout {
        code: ErrorCode,
        id: Option<Uuid>,
        message_type: Option<String>,
        elapsed_ms: u64,
    },

    /// The peer endpoint is unreachable.
    #[error("peer endpoint unreachable: {message}")]
    TargetNotFound { message: String },

    /// Origin policy rejected an inbound source or an outbound target.
    #[error("{code}: origin '{origin}'")]
    Security { code: ErrorCode, origin: String },

    /// The payload is not representable on the wire.
    #[error("payload not serializable: {message}")]
    Serialization { message: String },

    /// The connection state machine disallows the operation.
    #[error("{code}: {reason}")]
    Connection { code: ErrorCode, reason: String },

    /// Invalid configuration at construction.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The peer answered a request with an error response.
    #[error("peer replied with error {code}: {message}")]
    ErrorReply {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl ParleyError {
    pub(crate) fn not_connected(reason: impl Into<String>) -> Self {
        ParleyError::Connection {
            code: ErrorCode::NotConnected,
            reason: reason.into(),
        }
    }

    pub(crate) fn target_not_found(message: impl Into<String>) -> Self {
        ParleyError::TargetNotFound {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ParleyError::Config {
            message: message.into(),
        }
    }

    /// The wire/event spelling of this error's code.
    pub fn code(&self) -> &str {
        match self {
            ParleyError::Validation { .. } => ErrorCode::ValidationFailed.as_str(),
            ParleyError::Timeout { code, .. } => code.as_str(),
            ParleyError::TargetNotFound { .. } => ErrorCode::TargetNotFound.as_str(),
            ParleyError::Security { code, .. } => code.as_str(),
            ParleyError::Serialization { .. } => ErrorCode::SerializationFailed.as_str(),
            ParleyError::Connection { code, .. } => code.as_str(),
            ParleyError::Config { .. } => ErrorCode::InvalidConfig.as_str(),
            ParleyError::ErrorReply { code, .. } => code,
        }
    }

    /// Reconstruct an error from a wire error body, mapping engine-produced
    /// codes back to their kind. Unrecognized codes (application errors from
    /// a peer handler) stay as [`ParleyError::ErrorReply`].
    pub fn from_error_body(body: ErrorBody) -> Self {
        if body.code == ErrorCode::ValidationFailed.as_str() {
            let issues = body
                .details
                .as_ref()
                .and_then(|d| serde_json::from_value(d.clone()).ok())
                .unwrap_or_default();
            return ParleyError::Validation {
                message_type: body.message,
                issues,
            };
        }
        ParleyError::ErrorReply {
            code: body.code,
            message: body.message,
            details: body.details,
        }
    }
}
