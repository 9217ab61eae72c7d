//! Transport seam between the engine and the host messaging primitive.
//!
//! A transport is bound to exactly one peer endpoint. The engine holds one
//! transport value, posts frames through it, and runs a single pump task
//! over `recv`; dropping the pump is the unsubscribe. Concrete browser
//! transports (iframe content window, opened popup) live with the embedder —
//! they only have to satisfy this contract. The in-process
//! [`MemTransport`] pair is provided for embedding and tests.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;

use crate::config::PeerKind;
use crate::frame::Frame;

/// Opaque identity of an endpoint.
///
/// Inbound messages carry the sender's endpoint id; the engine drops any
/// frame whose source does not match the connected peer, even if the frame's
/// correlation id happens to collide with a pending call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

impl EndpointId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        EndpointId(NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Peer descriptor handed to `connect`; lives until `disconnect`.
#[derive(Clone, Debug)]
pub struct TargetInfo {
    pub endpoint: EndpointId,
    /// The origin the peer is expected to live on, when known. Drives the
    /// outbound target-origin resolution.
    pub expected_origin: Option<String>,
    pub kind: PeerKind,
}

impl TargetInfo {
    pub fn new(endpoint: EndpointId, kind: PeerKind) -> Self {
        Self {
            endpoint,
            expected_origin: None,
            kind,
        }
    }

    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = Some(origin.into());
        self
    }
}

/// One raw message surfaced by a transport, before any protocol filtering.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub data: Value,
    /// Source origin as reported by the messaging primitive.
    pub origin: String,
    /// Which endpoint sent this.
    pub source: EndpointId,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer endpoint is gone (popup closed, iframe removed).
    #[error("peer endpoint is detached")]
    Detached,
    /// This side of the transport was closed.
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync + 'static {
    /// Synchronously enqueue a frame toward the peer.
    fn post(&self, frame: &Frame, target_origin: &str) -> Result<(), TransportError>;

    /// Await the next raw inbound message from the peer's direction.
    fn recv(&self) -> impl Future<Output = Result<InboundMessage, TransportError>> + Send;

    /// Best-effort synchronous liveness probe of the peer endpoint. An
    /// early-drop gate, not a substitute for heartbeats.
    fn is_alive(&self) -> bool;

    /// Release the underlying endpoint resources.
    fn close(&self);
}

mod mem;
pub use mem::MemTransport;
