//! Lifecycle events, the observer registry, and the analytics sink seam.
//!
//! Listeners are synchronous callbacks invoked inline at the emit site; the
//! engine never depends on them for correctness and keeps emitting if one is
//! slow or absent. Every event is additionally mirrored to the configured
//! [`EventSink`], which is where analytics/telemetry integrations attach.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::ConnectionState;
use crate::error::ParleyError;

/// The event alphabet. No wildcard subscriptions; one kind per listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ConnectionLost,
    StateChanged,
    HeartbeatMissed,
    Error,
    Timeout,
    MessageSent,
    MessageReceived,
    ResponseSent,
    ResponseReceived,
    Handshake,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ConnectionLost => "connection-lost",
            EventKind::StateChanged => "connection-state-changed",
            EventKind::HeartbeatMissed => "heartbeat-missed",
            EventKind::Error => "error",
            EventKind::Timeout => "timeout",
            EventKind::MessageSent => "message-sent",
            EventKind::MessageReceived => "message-received",
            EventKind::ResponseSent => "response-sent",
            EventKind::ResponseReceived => "response-received",
            EventKind::Handshake => "handshake",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection ended with a `disconnected` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called locally.
    Local,
    /// The peer posted a `disconnect` frame.
    Peer,
    /// The peer endpoint itself went away (e.g. popup closed).
    EndpointGone,
}

#[derive(Clone, Debug)]
pub enum EngineEvent {
    Connected { peer_origin: String },
    Disconnected { reason: DisconnectReason },
    ConnectionLost { misses: u32 },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    HeartbeatMissed { misses: u32 },
    Error { error: ParleyError },
    Timeout {
        id: Uuid,
        message_type: String,
        elapsed_ms: u64,
    },
    MessageSent { id: Uuid, message_type: String },
    MessageReceived { id: Uuid, message_type: String },
    ResponseSent {
        correlation_id: Uuid,
        message_type: String,
        ok: bool,
    },
    ResponseReceived { correlation_id: Uuid, ok: bool },
    Handshake { peer_origin: String },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Connected { .. } => EventKind::Connected,
            EngineEvent::Disconnected { .. } => EventKind::Disconnected,
            EngineEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            EngineEvent::StateChanged { .. } => EventKind::StateChanged,
            EngineEvent::HeartbeatMissed { .. } => EventKind::HeartbeatMissed,
            EngineEvent::Error { .. } => EventKind::Error,
            EngineEvent::Timeout { .. } => EventKind::Timeout,
            EngineEvent::MessageSent { .. } => EventKind::MessageSent,
            EngineEvent::MessageReceived { .. } => EventKind::MessageReceived,
            EngineEvent::ResponseSent { .. } => EventKind::ResponseSent,
            EngineEvent::ResponseReceived { .. } => EventKind::ResponseReceived,
            EngineEvent::Handshake { .. } => EventKind::Handshake,
        }
    }
}

/// Sink receiving a copy of every emitted event.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &EngineEvent);
}

/// Sink that forwards events to `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Error { error } => {
                tracing::warn!(kind = %event.kind(), %error, "engine event");
            }
            _ => {
                tracing::debug!(kind = %event.kind(), ?event, "engine event");
            }
        }
    }
}

/// Handle for removing a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Observer registry keyed by event kind.
pub struct EventHub {
    listeners: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventHub {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sink,
        }
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn emit(&self, event: EngineEvent) {
        // Snapshot outside the lock so listeners may (un)subscribe freely.
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock();
            listeners
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        for listener in snapshot {
            listener(&event);
        }
        if let Some(sink) = &self.sink {
            sink.event(&event);
        }
    }
}
