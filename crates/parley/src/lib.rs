#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

// Re-export the engine surface.
pub use parley_core::{
    // Origin policy
    AllowedOrigins,
    // Connection engine
    ConnectionState,
    DEFAULT_REQUEST_TIMEOUT_MS,
    DisconnectReason,
    // Transport seam
    EndpointId,
    Engine,
    EngineConfig,
    // Events
    EngineEvent,
    // Errors
    ErrorBody,
    ErrorCode,
    EventKind,
    EventSink,
    // Frames (for advanced use and custom transports)
    Frame,
    FrameKind,
    HandlerResult,
    HandlerSchemas,
    HeartbeatConfig,
    InboundMessage,
    MemTransport,
    OriginGate,
    PROTOCOL_TAG,
    PROTOCOL_VERSION,
    ParleyError,
    PayloadValidator,
    PeerKind,
    ReplyPayload,
    RequestMeta,
    SendOptions,
    SubscriptionId,
    TargetInfo,
    TracingSink,
    Transport,
    TransportError,
    ValidationIssue,
    normalize_origin,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use parley::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AllowedOrigins, ConnectionState, Engine, EngineConfig, EngineEvent, ErrorBody, EventKind,
        HandlerSchemas, HeartbeatConfig, ParleyError, PeerKind, SendOptions, TargetInfo, Transport,
    };
}
