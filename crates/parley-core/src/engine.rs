//! The connection engine: state machine, handshake, frame routing.
//!
//! One engine instance binds to exactly one peer endpoint. `connect` drives
//! the syn/ack handshake; once connected, a single pump task processes
//! inbound frames in arrival order and routes them to the pending-call table
//! (responses), the handler registry (requests), or the internal reactors
//! (handshake, heartbeat, disconnect). Errors met while handling inbound
//! frames never escape the pump — they become events or error responses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ErrorBody, ErrorCode, ParleyError};
use crate::events::{DisconnectReason, EngineEvent, EventHub, EventKind, SubscriptionId};
use crate::frame::{self, Frame, FrameKind, FrameRejection, PROTOCOL_VERSION, ReplyPayload};
use crate::handler::{HandlerRegistry, HandlerResult, HandlerSchemas, RequestMeta};
use crate::heartbeat::{self, HeartbeatPort};
use crate::origin::{OriginGate, normalize_origin};
use crate::pending::{CancelReason, PendingTable};
use crate::transport::{InboundMessage, TargetInfo, Transport, TransportError};
use crate::validation::{JsonTypeValidator, PayloadValidator};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Liveness failure, as opposed to an explicit close.
    Lost,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Lost => "lost",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Per-call options for [`Engine::send`].
#[derive(Clone, Debug)]
pub struct SendOptions {
    pub timeout_ms: u64,
    /// Schema the outbound payload must satisfy.
    pub schema: Option<Value>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            schema: None,
        }
    }
}

impl SendOptions {
    pub fn timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            ..Self::default()
        }
    }
}

/// State attached to one connection attempt; created at `connect`, destroyed
/// at teardown.
struct ConnectionCtx {
    target: TargetInfo,
    target_origin: String,
    syn_nonce: Uuid,
    peer_origin: Option<String>,
    pong_tx: Option<mpsc::UnboundedSender<Uuid>>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    version_error_reported: bool,
}

pub struct Engine<T: Transport> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Transport> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

struct EngineInner<T: Transport> {
    transport: T,
    gate: OriginGate,
    strict_origin: bool,
    heartbeat_config: crate::config::HeartbeatConfig,
    expected_peer_kind: crate::config::PeerKind,
    handshake_timeout_ms: u64,
    pending: PendingTable,
    handlers: HandlerRegistry,
    events: EventHub,
    validator: Arc<dyn PayloadValidator>,
    state_tx: watch::Sender<ConnectionState>,
    conn: Mutex<Option<ConnectionCtx>>,
    /// Handed from the pump to a waiting `connect` when the handshake fails
    /// for a reason other than its own timer.
    last_failure: Mutex<Option<ParleyError>>,
}

impl<T: Transport> Engine<T> {
    pub fn new(config: EngineConfig, transport: T) -> Result<Self, ParleyError> {
        config.validate()?;
        let local_origin = config
            .local_origin
            .as_deref()
            .map(normalize_origin)
            .transpose()
            .map_err(|e| ParleyError::config(format!("bad local_origin: {e}")))?;
        let gate = OriginGate::new(
            config.allowed_origins.clone(),
            local_origin,
            config.allow_any_target_origin,
        );
        let validator = config
            .validator
            .clone()
            .unwrap_or_else(|| Arc::new(JsonTypeValidator));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            inner: Arc::new(EngineInner {
                transport,
                gate,
                strict_origin: config.strict_origin,
                heartbeat_config: config.heartbeat,
                expected_peer_kind: config.peer_kind,
                handshake_timeout_ms: config.handshake_timeout_ms,
                pending: PendingTable::new(),
                handlers: HandlerRegistry::new(),
                events: EventHub::new(config.sink.clone()),
                validator,
                state_tx,
                conn: Mutex::new(None),
                last_failure: Mutex::new(None),
            }),
        })
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Register a handler for a message type; replaces any existing one.
    pub fn on<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Value, RequestMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .handlers
            .register(message_type.into(), HandlerSchemas::default(), handler);
    }

    /// Like [`Engine::on`], with request/response schemas enforced by the
    /// configured validator.
    pub fn on_with_schemas<F, Fut>(
        &self,
        message_type: impl Into<String>,
        schemas: HandlerSchemas,
        handler: F,
    ) where
        F: Fn(Value, RequestMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .handlers
            .register(message_type.into(), schemas, handler);
    }

    pub fn off(&self, message_type: &str) -> bool {
        self.inner.handlers.remove(message_type)
    }

    /// Subscribe to a lifecycle event.
    pub fn on_event(
        &self,
        kind: EventKind,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe(kind, listener)
    }

    pub fn off_event(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(kind, id)
    }

    /// Establish the connection: subscribe to the transport, post a
    /// `handshake-syn`, and wait (bounded) for the peer's matching ack.
    ///
    /// Idempotent while connecting or connected to the same endpoint; a
    /// concurrent attempt toward a different endpoint is rejected.
    pub async fn connect(&self, target: TargetInfo) -> Result<(), ParleyError> {
        enum Plan {
            Done,
            AwaitExisting,
            Conflict,
            Fresh,
        }
        let plan = {
            let conn = self.inner.conn.lock();
            match self.inner.state() {
                ConnectionState::Connected | ConnectionState::Connecting => match conn.as_ref() {
                    Some(ctx) if ctx.target.endpoint == target.endpoint => {
                        if self.inner.state() == ConnectionState::Connected {
                            Plan::Done
                        } else {
                            Plan::AwaitExisting
                        }
                    }
                    _ => Plan::Conflict,
                },
                ConnectionState::Disconnecting => Plan::Conflict,
                ConnectionState::Idle
                | ConnectionState::Disconnected
                | ConnectionState::Lost => Plan::Fresh,
            }
        };
        match plan {
            Plan::Done => return Ok(()),
            Plan::AwaitExisting => return self.await_handshake().await,
            Plan::Conflict => {
                return Err(ParleyError::Connection {
                    code: ErrorCode::AlreadyConnected,
                    reason: "engine is already bound to another peer endpoint".into(),
                });
            }
            Plan::Fresh => {}
        }

        if target.kind != self.inner.expected_peer_kind {
            return Err(ParleyError::config(format!(
                "target kind {:?} does not match configured peer kind {:?}",
                target.kind, self.inner.expected_peer_kind
            )));
        }
        let target_origin = self
            .inner
            .gate
            .resolve_target_origin(target.expected_origin.as_deref())?;

        let syn_nonce = Uuid::new_v4();
        {
            let mut conn = self.inner.conn.lock();
            if conn.is_some() {
                return Err(ParleyError::Connection {
                    code: ErrorCode::AlreadyConnected,
                    reason: "another connect is already in progress".into(),
                });
            }
            *conn = Some(ConnectionCtx {
                target: target.clone(),
                target_origin,
                syn_nonce,
                peer_origin: None,
                pong_tx: None,
                pump: None,
                heartbeat: None,
                version_error_reported: false,
            });
        }
        *self.inner.last_failure.lock() = None;
        self.inner.transition(ConnectionState::Connecting);
        tracing::debug!(endpoint = %target.endpoint, "connecting");

        let pump = tokio::spawn(run_pump(Arc::clone(&self.inner)));
        if let Some(ctx) = self.inner.conn.lock().as_mut() {
            ctx.pump = Some(pump);
        }

        let syn = Frame::handshake_syn(syn_nonce);
        if let Err(error) = self.inner.post_frame(&syn) {
            let _ = self.inner.teardown_link(true);
            self.inner.transition(ConnectionState::Disconnected);
            return Err(match error {
                TransportError::Detached => {
                    ParleyError::target_not_found("peer endpoint closed before the handshake")
                }
                TransportError::Closed => ParleyError::not_connected("transport is closed"),
            });
        }

        self.await_handshake().await
    }

    async fn await_handshake(&self) -> Result<(), ParleyError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let deadline = Duration::from_millis(self.inner.handshake_timeout_ms);
        let outcome = tokio::time::timeout(deadline, async {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Connecting => {}
                    _ => return Err(()),
                }
                if state_rx.changed().await.is_err() {
                    return Err(());
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(())) => {
                let error = self.inner.last_failure.lock().take().unwrap_or_else(|| {
                    ParleyError::Connection {
                        code: ErrorCode::HandshakeFailed,
                        reason: "connection closed during handshake".into(),
                    }
                });
                Err(error)
            }
            Err(_elapsed) => {
                let _ = self.inner.teardown_link(true);
                self.inner.transition(ConnectionState::Disconnected);
                let error = ParleyError::Timeout {
                    code: ErrorCode::HandshakeTimeout,
                    id: None,
                    message_type: None,
                    elapsed_ms: self.inner.handshake_timeout_ms,
                };
                self.inner.emit(EngineEvent::Error {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Close the connection: best-effort `disconnect` frame to the peer,
    /// cancel every pending call, stop timers, release the subscription.
    /// Idempotent and safe from any state; tearing down a live link
    /// (connected or still handshaking) emits exactly one `disconnected`
    /// event.
    pub async fn disconnect(&self) {
        let previous = self.inner.state();
        let Some(ctx) = self.inner.teardown_link(true) else {
            if previous == ConnectionState::Lost {
                self.inner.transition(ConnectionState::Disconnected);
            }
            return;
        };

        if previous == ConnectionState::Connected {
            self.inner.transition(ConnectionState::Disconnecting);
        }
        if previous == ConnectionState::Connecting {
            // Hand the in-flight connect() its real failure cause.
            *self.inner.last_failure.lock() = Some(ParleyError::Connection {
                code: ErrorCode::Disconnected,
                reason: "disconnected locally during handshake".into(),
            });
        }
        let goodbye = Frame::disconnect("local");
        if let Err(error) = self.inner.transport.post(&goodbye, &ctx.target_origin) {
            tracing::debug!(%error, "disconnect frame not delivered");
        }
        self.inner.pending.cancel_all(CancelReason::LocalDisconnect);
        self.inner.transition(ConnectionState::Disconnected);
        self.inner.emit(EngineEvent::Disconnected {
            reason: DisconnectReason::Local,
        });
        tracing::debug!("disconnected locally");
    }

    /// Send a request and await the peer's correlated response.
    pub async fn send(
        &self,
        message_type: &str,
        payload: impl Serialize,
        options: SendOptions,
    ) -> Result<Value, ParleyError> {
        let state = self.inner.state();
        if state != ConnectionState::Connected {
            return Err(ParleyError::not_connected(format!(
                "cannot send '{message_type}' while {state}"
            )));
        }
        let payload = serde_json::to_value(payload).map_err(|e| ParleyError::Serialization {
            message: e.to_string(),
        })?;
        if let Some(schema) = &options.schema {
            self.inner
                .validator
                .validate(schema, &payload)
                .map_err(|issues| ParleyError::Validation {
                    message_type: message_type.to_string(),
                    issues,
                })?;
        }
        if !self.inner.transport.is_alive() {
            self.inner.on_endpoint_detached(false);
            return Err(ParleyError::target_not_found("peer endpoint is gone"));
        }

        let request = Frame::request(message_type, payload);
        let id = request.id;
        // Register before posting so a response can never beat the entry.
        let rx = self.inner.pending.register(id, message_type);
        if let Err(error) = self.inner.post_frame(&request) {
            self.inner.pending.evict(id);
            return Err(match error {
                TransportError::Detached => {
                    self.inner.on_endpoint_detached(false);
                    ParleyError::target_not_found("peer endpoint closed before the request")
                }
                TransportError::Closed => ParleyError::not_connected("transport is closed"),
            });
        }
        self.inner.emit(EngineEvent::MessageSent {
            id,
            message_type: message_type.to_string(),
        });

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(Duration::from_millis(options.timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(ParleyError::Connection {
                code: ErrorCode::ConnectionLost,
                reason: "engine was torn down while the call was in flight".into(),
            }),
            Err(_elapsed) => {
                self.inner.pending.evict(id);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.inner.emit(EngineEvent::Timeout {
                    id,
                    message_type: message_type.to_string(),
                    elapsed_ms,
                });
                Err(ParleyError::Timeout {
                    code: ErrorCode::RequestTimeout,
                    id: Some(id),
                    message_type: Some(message_type.to_string()),
                    elapsed_ms,
                })
            }
        }
    }

    /// One-way variant of `send`: posts the request without registering a
    /// pending call, so any response the peer produces is discarded.
    pub fn fire(&self, message_type: &str, payload: impl Serialize) -> Result<(), ParleyError> {
        let state = self.inner.state();
        if state != ConnectionState::Connected {
            return Err(ParleyError::not_connected(format!(
                "cannot fire '{message_type}' while {state}"
            )));
        }
        let payload = serde_json::to_value(payload).map_err(|e| ParleyError::Serialization {
            message: e.to_string(),
        })?;
        let request = Frame::request(message_type, payload);
        let id = request.id;
        if let Err(error) = self.inner.post_frame(&request) {
            return Err(match error {
                TransportError::Detached => {
                    self.inner.on_endpoint_detached(false);
                    ParleyError::target_not_found("peer endpoint closed before the request")
                }
                TransportError::Closed => ParleyError::not_connected("transport is closed"),
            });
        }
        self.inner.emit(EngineEvent::MessageSent {
            id,
            message_type: message_type.to_string(),
        });
        Ok(())
    }
}

impl<T: Transport> Drop for Engine<T> {
    fn drop(&mut self) {
        // Break the pump ↔ engine cycle if the embedder never disconnected.
        if self.inner.teardown_link(true).is_some() {
            self.inner.pending.cancel_all(CancelReason::LocalDisconnect);
        }
    }
}

impl<T: Transport> EngineInner<T> {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    fn transition(&self, to: ConnectionState) {
        let from = *self.state_tx.borrow();
        if from == to {
            return;
        }
        self.state_tx.send_replace(to);
        tracing::debug!(%from, %to, "connection state");
        self.emit(EngineEvent::StateChanged { from, to });
    }

    fn post_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let target_origin = {
            let conn = self.conn.lock();
            match conn.as_ref() {
                Some(ctx) => ctx.target_origin.clone(),
                None => return Err(TransportError::Closed),
            }
        };
        self.transport.post(frame, &target_origin)
    }

    /// Detach the connection context and stop its tasks. Returns `None` when
    /// no link is active (already torn down).
    fn teardown_link(&self, abort_pump: bool) -> Option<ConnectionCtx> {
        let mut ctx = self.conn.lock().take()?;
        if let Some(heartbeat) = ctx.heartbeat.take() {
            heartbeat.abort();
        }
        ctx.pong_tx = None;
        if abort_pump {
            if let Some(pump) = ctx.pump.take() {
                pump.abort();
            }
        }
        Some(ctx)
    }

    fn fail_handshake(&self, error: ParleyError) {
        let _ = self.teardown_link(false);
        *self.last_failure.lock() = Some(error.clone());
        self.emit(EngineEvent::Error { error });
        self.transition(ConnectionState::Disconnected);
    }

    /// The peer endpoint itself is gone (closed popup, removed iframe).
    fn on_endpoint_detached(&self, from_pump: bool) {
        if self.teardown_link(!from_pump).is_none() {
            return;
        }
        let previous = self.state();
        if previous == ConnectionState::Connecting {
            *self.last_failure.lock() =
                Some(ParleyError::target_not_found("peer endpoint went away"));
        }
        self.pending.cancel_all(CancelReason::EndpointDetached);
        self.transition(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            self.emit(EngineEvent::Disconnected {
                reason: DisconnectReason::EndpointGone,
            });
        }
        tracing::warn!("peer endpoint detached");
    }

    fn declare_lost(&self, misses: u32) {
        if self.teardown_link(true).is_none() {
            return;
        }
        self.transition(ConnectionState::Lost);
        self.emit(EngineEvent::ConnectionLost { misses });
        self.pending.cancel_all(CancelReason::HeartbeatLost);
        tracing::warn!(misses, "connection lost: heartbeat threshold reached");
    }

    fn report_version_mismatch(&self, version: u64) {
        let first = {
            let mut conn = self.conn.lock();
            match conn.as_mut() {
                Some(ctx) if !ctx.version_error_reported => {
                    ctx.version_error_reported = true;
                    true
                }
                _ => false,
            }
        };
        if first {
            self.emit(EngineEvent::Error {
                error: ParleyError::Connection {
                    code: ErrorCode::ProtocolMismatch,
                    reason: format!(
                        "peer speaks protocol version {version}, this engine speaks {PROTOCOL_VERSION}"
                    ),
                },
            });
        }
    }

    fn on_syn(&self, frame: &Frame) {
        match self.state() {
            // Re-acking duplicate syns tolerates the both-sides-initiate race
            // and lost acks.
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => return,
        }
        let Some(payload) = frame.handshake_payload() else {
            return;
        };
        let own_nonce = {
            let conn = self.conn.lock();
            match conn.as_ref() {
                Some(ctx) => ctx.syn_nonce,
                None => return,
            }
        };
        let ack = Frame::handshake_ack(own_nonce, payload.nonce);
        if let Err(error) = self.post_frame(&ack) {
            tracing::debug!(%error, "handshake ack not delivered");
        }
    }

    fn on_response(&self, frame: &Frame) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let Some(correlation_id) = frame.correlation_id else {
            return;
        };
        let Some(reply) = frame.reply_payload() else {
            return;
        };
        self.emit(EngineEvent::ResponseReceived {
            correlation_id,
            ok: reply.ok,
        });
        if !self.pending.settle(correlation_id, reply) {
            tracing::debug!(%correlation_id, "response without a pending call (late, duplicate, or fired)");
        }
    }

    fn on_ping(&self, frame: &Frame) -> bool {
        if self.state() != ConnectionState::Connected {
            return true;
        }
        let pong = Frame::heartbeat_pong(frame.id);
        match self.post_frame(&pong) {
            Ok(()) => true,
            Err(TransportError::Detached) => {
                self.on_endpoint_detached(true);
                false
            }
            Err(TransportError::Closed) => false,
        }
    }

    fn on_pong(&self, frame: &Frame) {
        let pong_tx = {
            let conn = self.conn.lock();
            conn.as_ref().and_then(|ctx| ctx.pong_tx.clone())
        };
        // No monitor (disabled, or state is lost): pong is ignored.
        if let (Some(tx), Some(correlation_id)) = (pong_tx, frame.correlation_id) {
            let _ = tx.send(correlation_id);
        }
    }

    fn on_peer_disconnect(&self) -> bool {
        match self.state() {
            ConnectionState::Connected => {
                let _ = self.teardown_link(false);
                self.pending.cancel_all(CancelReason::PeerDisconnect);
                self.transition(ConnectionState::Disconnected);
                self.emit(EngineEvent::Disconnected {
                    reason: DisconnectReason::Peer,
                });
                tracing::debug!("peer disconnected");
                false
            }
            ConnectionState::Connecting => {
                self.fail_handshake(ParleyError::Connection {
                    code: ErrorCode::HandshakeFailed,
                    reason: "peer disconnected during handshake".into(),
                });
                false
            }
            _ => true,
        }
    }

    fn post_response(&self, correlation_id: Uuid, message_type: &str, reply: &ReplyPayload) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let response = Frame::response(correlation_id, message_type, reply);
        match self.post_frame(&response) {
            Ok(()) => self.emit(EngineEvent::ResponseSent {
                correlation_id,
                message_type: message_type.to_string(),
                ok: reply.ok,
            }),
            Err(TransportError::Detached) => self.on_endpoint_detached(false),
            Err(TransportError::Closed) => {}
        }
    }
}

impl<T: Transport> HeartbeatPort for EngineInner<T> {
    fn endpoint_alive(&self) -> bool {
        self.transport.is_alive()
    }

    fn post_ping(&self) -> Result<Uuid, ()> {
        let ping = Frame::heartbeat_ping();
        let id = ping.id;
        self.post_frame(&ping).map(|_| id).map_err(|_| ())
    }

    fn on_missed(&self, misses: u32) {
        self.emit(EngineEvent::HeartbeatMissed { misses });
    }

    fn on_lost(&self, misses: u32) {
        self.declare_lost(misses);
    }

    fn on_detached(&self) {
        self.on_endpoint_detached(false);
    }
}

async fn run_pump<T: Transport>(inner: Arc<EngineInner<T>>) {
    loop {
        match inner.transport.recv().await {
            Ok(message) => {
                if !handle_inbound(&inner, message) {
                    break;
                }
            }
            Err(TransportError::Detached) => {
                if matches!(
                    inner.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    inner.on_endpoint_detached(true);
                }
                break;
            }
            Err(TransportError::Closed) => break,
        }
    }
}

/// Process one raw inbound message. Returns `false` when the pump should
/// stop (connection over).
fn handle_inbound<T: Transport>(inner: &Arc<EngineInner<T>>, message: InboundMessage) -> bool {
    // Foreign traffic on the shared endpoint is none of our business.
    if !frame::looks_like_parley(&message.data) {
        return true;
    }

    if !inner.gate.admit(&message.origin) {
        tracing::warn!(origin = %message.origin, "dropped frame from disallowed origin");
        let error = ParleyError::Security {
            code: ErrorCode::OriginNotAllowed,
            origin: message.origin.clone(),
        };
        inner.emit(EngineEvent::Error {
            error: error.clone(),
        });
        if inner.strict_origin && inner.state() == ConnectionState::Connecting {
            inner.fail_handshake(error);
            return false;
        }
        return true;
    }

    let parsed = match frame::classify(&message.data) {
        Ok(parsed) => parsed,
        Err(FrameRejection::Foreign) => return true,
        Err(FrameRejection::VersionMismatch { version }) => {
            inner.report_version_mismatch(version);
            return true;
        }
        Err(rejection) => {
            tracing::debug!(?rejection, "dropped malformed frame");
            return true;
        }
    };

    // Never settle or serve anything on behalf of an endpoint other than the
    // connected peer, even when ids collide.
    let expected = inner.conn.lock().as_ref().map(|ctx| ctx.target.endpoint);
    if expected != Some(message.source) {
        tracing::debug!(source = %message.source, "dropped frame from unexpected endpoint");
        return true;
    }

    let origin = normalize_origin(&message.origin).unwrap_or_else(|_| message.origin.clone());
    match parsed.kind {
        FrameKind::HandshakeSyn => {
            inner.on_syn(&parsed);
            true
        }
        FrameKind::HandshakeAck => {
            on_ack(inner, &parsed, origin);
            true
        }
        FrameKind::Request => {
            serve_request(inner, parsed, origin);
            true
        }
        FrameKind::Response => {
            inner.on_response(&parsed);
            true
        }
        FrameKind::HeartbeatPing => inner.on_ping(&parsed),
        FrameKind::HeartbeatPong => {
            inner.on_pong(&parsed);
            true
        }
        FrameKind::Disconnect => inner.on_peer_disconnect(),
    }
}

fn on_ack<T: Transport>(inner: &Arc<EngineInner<T>>, frame: &Frame, peer_origin: String) {
    if inner.state() != ConnectionState::Connecting {
        return;
    }
    let Some(payload) = frame.handshake_payload() else {
        return;
    };
    let own_nonce = {
        let conn = inner.conn.lock();
        match conn.as_ref() {
            Some(ctx) => ctx.syn_nonce,
            None => return,
        }
    };
    if payload.echo != Some(own_nonce) {
        // Somebody replied, but not to our syn; bidirectional reachability
        // is only proven by our own nonce coming back.
        tracing::debug!("handshake ack with foreign nonce");
        return;
    }
    complete_handshake(inner, peer_origin);
}

fn complete_handshake<T: Transport>(inner: &Arc<EngineInner<T>>, peer_origin: String) {
    {
        let mut conn = inner.conn.lock();
        let Some(ctx) = conn.as_mut() else {
            return;
        };
        if ctx.peer_origin.is_some() {
            return; // duplicate ack
        }
        ctx.peer_origin = Some(peer_origin.clone());
        if inner.heartbeat_config.enabled {
            let (pong_tx, pong_rx) = mpsc::unbounded_channel();
            ctx.pong_tx = Some(pong_tx);
            let port: Arc<dyn HeartbeatPort> = Arc::clone(inner) as Arc<dyn HeartbeatPort>;
            ctx.heartbeat = Some(tokio::spawn(heartbeat::run(
                port,
                inner.heartbeat_config,
                pong_rx,
            )));
        }
    }
    tracing::debug!(%peer_origin, "handshake complete");
    inner.emit(EngineEvent::Handshake {
        peer_origin: peer_origin.clone(),
    });
    inner.transition(ConnectionState::Connected);
    inner.emit(EngineEvent::Connected { peer_origin });
}

fn serve_request<T: Transport>(inner: &Arc<EngineInner<T>>, request: Frame, origin: String) {
    if inner.state() != ConnectionState::Connected {
        return;
    }
    let Some(message_type) = request.message_type.clone() else {
        return;
    };
    let id = request.id;
    inner.emit(EngineEvent::MessageReceived {
        id,
        message_type: message_type.clone(),
    });
    let payload = request.payload.clone().unwrap_or(Value::Null);
    let meta = RequestMeta {
        id,
        message_type: message_type.clone(),
        origin,
        timestamp: request.timestamp,
    };

    // A request must never be silently dropped, or the caller's pending
    // call would hang until its timeout.
    let Some(prepared) = inner.handlers.prepare(&message_type) else {
        let reply = ReplyPayload::err(ErrorBody::new(
            ErrorCode::NoHandler.as_str(),
            format!("no handler registered for '{message_type}'"),
        ));
        inner.post_response(id, &message_type, &reply);
        return;
    };

    if let Some(schema) = &prepared.request_schema {
        if let Err(issues) = inner.validator.validate(schema, &payload) {
            inner.emit(EngineEvent::Error {
                error: ParleyError::Validation {
                    message_type: message_type.clone(),
                    issues: issues.clone(),
                },
            });
            let reply = ReplyPayload::err(
                ErrorBody::new(ErrorCode::ValidationFailed.as_str(), message_type.clone())
                    .with_details(serde_json::to_value(&issues).unwrap_or(Value::Null)),
            );
            inner.post_response(id, &message_type, &reply);
            return;
        }
    }

    // Handlers run in their own task so a slow one never stalls the pump;
    // dispatch order is still arrival order.
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = prepared.handler.call(payload, meta).await;
        let reply = match result {
            Ok(value) => match &prepared.response_schema {
                Some(schema) => match inner.validator.validate(schema, &value) {
                    Ok(()) => ReplyPayload::ok(value),
                    Err(issues) => {
                        inner.emit(EngineEvent::Error {
                            error: ParleyError::Validation {
                                message_type: message_type.clone(),
                                issues: issues.clone(),
                            },
                        });
                        ReplyPayload::err(
                            ErrorBody::new(
                                ErrorCode::ValidationFailed.as_str(),
                                message_type.clone(),
                            )
                            .with_details(serde_json::to_value(&issues).unwrap_or(Value::Null)),
                        )
                    }
                },
                None => ReplyPayload::ok(value),
            },
            Err(body) => ReplyPayload::err(body),
        };
        inner.post_response(id, &message_type, &reply);
    });
}
