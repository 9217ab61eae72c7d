//! Protocol frames: the single wire unit, its stamping constructors, and
//! classification of raw inbound values.
//!
//! The wire shape is a plain JSON object so it survives the structured-clone
//! boundary of the host messaging primitive:
//!
//! ```json
//! { "protocol": "parley", "version": 1, "id": "<uuid>", "kind": "request",
//!   "messageType": "getData", "payload": {}, "timestamp": 1700000000000 }
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorBody, ParleyError};

/// Tag discriminating parley frames from foreign messages sharing the same
/// browser endpoint.
pub const PROTOCOL_TAG: &str = "parley";

/// Current (major) protocol version. Frames carrying any other version are
/// rejected with a protocol error, surfaced once per peer.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Request,
    Response,
    HandshakeSyn,
    HandshakeAck,
    HeartbeatPing,
    HeartbeatPong,
    Disconnect,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::HandshakeSyn => "handshake-syn",
            FrameKind::HandshakeAck => "handshake-ack",
            FrameKind::HeartbeatPing => "heartbeat-ping",
            FrameKind::HeartbeatPong => "heartbeat-pong",
            FrameKind::Disconnect => "disconnect",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "request" => FrameKind::Request,
            "response" => FrameKind::Response,
            "handshake-syn" => FrameKind::HandshakeSyn,
            "handshake-ack" => FrameKind::HandshakeAck,
            "heartbeat-ping" => FrameKind::HeartbeatPing,
            "heartbeat-pong" => FrameKind::HeartbeatPong,
            "disconnect" => FrameKind::Disconnect,
            _ => return None,
        })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub protocol: String,
    pub version: u32,
    /// Correlation identifier, unique per producer over the session.
    pub id: Uuid,
    pub kind: FrameKind,
    /// User-defined operation name; present on requests and responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Present on `response` and `heartbeat-pong`; equals the triggering
    /// frame's `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Producer's clock at stamp time, ms since epoch. Diagnostic only.
    pub timestamp: u64,
}

impl Frame {
    fn stamp(kind: FrameKind) -> Self {
        Self {
            protocol: PROTOCOL_TAG.to_string(),
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            kind,
            message_type: None,
            payload: None,
            correlation_id: None,
            timestamp: now_ms(),
        }
    }

    pub fn request(message_type: impl Into<String>, payload: Value) -> Self {
        let mut frame = Self::stamp(FrameKind::Request);
        frame.message_type = Some(message_type.into());
        frame.payload = Some(payload);
        frame
    }

    pub fn response(
        correlation_id: Uuid,
        message_type: impl Into<String>,
        reply: &ReplyPayload,
    ) -> Self {
        let mut frame = Self::stamp(FrameKind::Response);
        frame.message_type = Some(message_type.into());
        frame.correlation_id = Some(correlation_id);
        frame.payload = Some(reply.to_value());
        frame
    }

    pub fn handshake_syn(nonce: Uuid) -> Self {
        let mut frame = Self::stamp(FrameKind::HandshakeSyn);
        frame.payload = Some(serde_json::json!({ "nonce": nonce }));
        frame
    }

    /// Ack carrying the sender's own nonce plus the echoed peer nonce; the
    /// echo is what completes the peer's side of the handshake.
    pub fn handshake_ack(nonce: Uuid, echo: Uuid) -> Self {
        let mut frame = Self::stamp(FrameKind::HandshakeAck);
        frame.payload = Some(serde_json::json!({ "nonce": nonce, "echo": echo }));
        frame
    }

    pub fn heartbeat_ping() -> Self {
        Self::stamp(FrameKind::HeartbeatPing)
    }

    pub fn heartbeat_pong(correlation_id: Uuid) -> Self {
        let mut frame = Self::stamp(FrameKind::HeartbeatPong);
        frame.correlation_id = Some(correlation_id);
        frame
    }

    pub fn disconnect(reason: &str) -> Self {
        let mut frame = Self::stamp(FrameKind::Disconnect);
        frame.payload = Some(serde_json::json!({ "reason": reason }));
        frame
    }

    /// Serialize to the wire value.
    ///
    /// Every field of a stamped frame is JSON-representable, so this cannot
    /// fail for frames built through the constructors above.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).expect("stamped frames are JSON-representable")
    }

    /// Parse the handshake payload of a syn/ack frame.
    pub fn handshake_payload(&self) -> Option<HandshakePayload> {
        serde_json::from_value(self.payload.clone()?).ok()
    }

    /// Parse the `{ok, ...}` payload of a response frame.
    pub fn reply_payload(&self) -> Option<ReplyPayload> {
        serde_json::from_value(self.payload.clone()?).ok()
    }
}

/// Payload of `handshake-syn` and `handshake-ack` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// The sender's own fresh nonce.
    pub nonce: Uuid,
    /// On acks, the peer nonce being confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Uuid>,
}

/// Payload of a `response` frame: `{ok: true, value}` or
/// `{ok: false, error: {code, message, details?}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyPayload {
    pub fn ok(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: ErrorBody) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ParleyError> {
        if self.ok {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            let body = self.error.unwrap_or_else(|| {
                ErrorBody::new("HANDLER_ERROR", "peer sent an error response without a body")
            });
            Err(ParleyError::from_error_body(body))
        }
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("reply payloads are JSON-representable")
    }
}

/// Why a raw inbound value was not accepted as a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameRejection {
    /// Not a parley message at all; dropped without a diagnostic.
    Foreign,
    /// Parley-tagged but from an incompatible protocol version.
    VersionMismatch { version: u64 },
    /// Parley-tagged with an unrecognized `kind` discriminant.
    UnknownKind { kind: String },
    /// A recognized shape missing a field its kind requires.
    Malformed { field: &'static str },
}

/// Cheap pre-filter: is this raw value even addressed to us?
///
/// Used before origin admission so foreign traffic on the shared endpoint
/// never produces origin diagnostics.
pub fn looks_like_parley(raw: &Value) -> bool {
    raw.get("protocol").and_then(Value::as_str) == Some(PROTOCOL_TAG)
}

/// Validate and parse a raw inbound value into a [`Frame`].
pub fn classify(raw: &Value) -> Result<Frame, FrameRejection> {
    let obj = raw.as_object().ok_or(FrameRejection::Foreign)?;
    if obj.get("protocol").and_then(Value::as_str) != Some(PROTOCOL_TAG) {
        return Err(FrameRejection::Foreign);
    }

    let version = obj
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(FrameRejection::Malformed { field: "version" })?;
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(FrameRejection::VersionMismatch { version });
    }

    let kind_str = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(FrameRejection::Malformed { field: "kind" })?;
    let kind = FrameKind::from_wire(kind_str).ok_or_else(|| FrameRejection::UnknownKind {
        kind: kind_str.to_string(),
    })?;

    let frame: Frame = serde_json::from_value(raw.clone())
        .map_err(|_| FrameRejection::Malformed { field: "structure" })?;

    match kind {
        FrameKind::Request => {
            if frame.message_type.is_none() {
                return Err(FrameRejection::Malformed {
                    field: "messageType",
                });
            }
        }
        FrameKind::Response => {
            if frame.correlation_id.is_none() {
                return Err(FrameRejection::Malformed {
                    field: "correlationId",
                });
            }
            if frame.reply_payload().is_none() {
                return Err(FrameRejection::Malformed { field: "payload.ok" });
            }
        }
        FrameKind::HeartbeatPong => {
            if frame.correlation_id.is_none() {
                return Err(FrameRejection::Malformed {
                    field: "correlationId",
                });
            }
        }
        FrameKind::HandshakeSyn => {
            if frame.handshake_payload().is_none() {
                return Err(FrameRejection::Malformed {
                    field: "payload.nonce",
                });
            }
        }
        FrameKind::HandshakeAck => {
            match frame.handshake_payload() {
                Some(p) if p.echo.is_some() => {}
                _ => {
                    return Err(FrameRejection::Malformed {
                        field: "payload.echo",
                    });
                }
            }
        }
        FrameKind::HeartbeatPing | FrameKind::Disconnect => {}
    }

    Ok(frame)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
