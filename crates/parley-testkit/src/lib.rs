//! Test harness for the parley engine.
//!
//! Provides paired engines over the in-memory transport, an [`EventRecorder`]
//! sink for asserting on lifecycle events, and a [`ScriptedPeer`] that drives
//! the wire protocol by hand — for exercising handshake races, silent peers,
//! forged origins, and malformed frames that a well-behaved engine would
//! never produce.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use parley_core::{
    AllowedOrigins, Engine, EngineConfig, EngineEvent, EventKind, EventSink, Frame, FrameKind,
    MemTransport, ParleyError, TargetInfo, Transport, TransportError, classify,
};

/// Origin the "host page" side presents in paired setups.
pub const ORIGIN_A: &str = "https://host.example";
/// Origin the "embedded widget" side presents in paired setups.
pub const ORIGIN_B: &str = "https://widget.example";

/// Install a `tracing` subscriber writing to the test output, filtered by
/// `RUST_LOG`. Only the first call installs; the harness constructors call
/// this so engine logs show up in failing tests without any setup.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Event sink that records everything for later assertions.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl EventSink for EventRecorder {
    fn event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(EngineEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.count(kind) > 0
    }

    /// Poll until an event of `kind` has been recorded. Pairs well with a
    /// paused tokio clock, which auto-advances while everything is idle.
    pub async fn wait_for(&self, kind: EventKind) {
        loop {
            if self.has(kind) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Two engines joined by an in-memory transport pair, plus the raw transport
/// handles for fault injection.
pub struct TestPair {
    pub a: Engine<MemTransport>,
    pub b: Engine<MemTransport>,
    pub a_events: Arc<EventRecorder>,
    pub b_events: Arc<EventRecorder>,
    pub a_transport: MemTransport,
    pub b_transport: MemTransport,
    pub a_target: TargetInfo,
    pub b_target: TargetInfo,
}

impl TestPair {
    /// Paired engines with each side allowing exactly the other's origin.
    pub fn new() -> Self {
        Self::with_configs(Self::config_a(), Self::config_b())
    }

    /// Default config for the A side (allows [`ORIGIN_B`]).
    pub fn config_a() -> EngineConfig {
        EngineConfig {
            allowed_origins: AllowedOrigins::list([ORIGIN_B]).expect("static origin"),
            local_origin: Some(ORIGIN_A.to_string()),
            ..EngineConfig::default()
        }
    }

    /// Default config for the B side (allows [`ORIGIN_A`]).
    pub fn config_b() -> EngineConfig {
        EngineConfig {
            allowed_origins: AllowedOrigins::list([ORIGIN_A]).expect("static origin"),
            local_origin: Some(ORIGIN_B.to_string()),
            ..EngineConfig::default()
        }
    }

    /// Build a pair from explicit configs; recorders are installed as the
    /// event sinks.
    pub fn with_configs(mut config_a: EngineConfig, mut config_b: EngineConfig) -> Self {
        init_tracing();
        let (ta, tb) = MemTransport::pair(ORIGIN_A, ORIGIN_B);
        let a_events = EventRecorder::new();
        let b_events = EventRecorder::new();
        config_a.sink = Some(a_events.clone());
        config_b.sink = Some(b_events.clone());
        let peer_kind_a = config_a.peer_kind;
        let peer_kind_b = config_b.peer_kind;

        let a_target =
            TargetInfo::new(ta.peer_endpoint(), peer_kind_a).with_expected_origin(ORIGIN_B);
        let b_target =
            TargetInfo::new(tb.peer_endpoint(), peer_kind_b).with_expected_origin(ORIGIN_A);

        let a = Engine::new(config_a, ta.clone()).expect("valid test config");
        let b = Engine::new(config_b, tb.clone()).expect("valid test config");

        Self {
            a,
            b,
            a_events,
            b_events,
            a_transport: ta,
            b_transport: tb,
            a_target,
            b_target,
        }
    }

    /// Connect both sides concurrently (each initiates its own syn).
    pub async fn connect(&self) -> Result<(), ParleyError> {
        tokio::try_join!(
            self.a.connect(self.a_target.clone()),
            self.b.connect(self.b_target.clone()),
        )?;
        Ok(())
    }

    /// Sever the underlying transport pair, as if the peer window closed.
    pub fn detach(&self) {
        self.a_transport.detach();
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}

/// A hand-driven wire peer: speaks raw frames over a [`MemTransport`] so
/// tests control exactly what (and whether) anything is sent back.
#[derive(Clone)]
pub struct ScriptedPeer {
    transport: MemTransport,
    syn_nonce: Uuid,
}

impl ScriptedPeer {
    pub fn new(transport: MemTransport) -> Self {
        Self {
            transport,
            syn_nonce: Uuid::new_v4(),
        }
    }

    /// This peer's endpoint id, for the engine's [`TargetInfo`].
    pub fn endpoint(&self) -> parley_core::EndpointId {
        self.transport.local_endpoint()
    }

    pub fn transport(&self) -> &MemTransport {
        &self.transport
    }

    /// Post a frame toward the engine under test.
    pub fn send(&self, frame: &Frame) {
        self.transport
            .post(frame, "*")
            .expect("scripted peer transport severed");
    }

    /// Receive and parse the next frame.
    pub async fn next_frame(&self) -> Result<Frame, TransportError> {
        let message = self.transport.recv().await?;
        Ok(classify(&message.data).expect("engine under test sent a malformed frame"))
    }

    /// Receive frames until one of `kind` arrives, answering heartbeat pings
    /// along the way so the link stays up.
    pub async fn expect_kind(&self, kind: FrameKind) -> Frame {
        loop {
            let frame = self.next_frame().await.expect("transport severed");
            if frame.kind == kind {
                return frame;
            }
            if frame.kind == FrameKind::HeartbeatPing {
                self.send(&Frame::heartbeat_pong(frame.id));
            }
        }
    }

    /// Reply to a syn with a well-formed ack.
    pub fn ack(&self, syn: &Frame) {
        let nonce = syn
            .handshake_payload()
            .expect("syn carries a nonce")
            .nonce;
        self.send(&Frame::handshake_ack(self.syn_nonce, nonce));
    }

    /// Act as the responder for one handshake: wait for the engine's syn and
    /// ack it.
    pub async fn complete_handshake(&self) -> Frame {
        let syn = self.expect_kind(FrameKind::HandshakeSyn).await;
        self.ack(&syn);
        syn
    }
}

/// An engine wired to a [`ScriptedPeer`] instead of a second engine.
pub struct ScriptedSetup {
    pub engine: Engine<MemTransport>,
    pub peer: ScriptedPeer,
    pub events: Arc<EventRecorder>,
    pub target: TargetInfo,
    pub engine_transport: MemTransport,
}

impl ScriptedSetup {
    pub fn new(mut config: EngineConfig) -> Self {
        init_tracing();
        let (ta, tb) = MemTransport::pair(ORIGIN_A, ORIGIN_B);
        let events = EventRecorder::new();
        config.sink = Some(events.clone());
        let peer_kind = config.peer_kind;
        let target = TargetInfo::new(ta.peer_endpoint(), peer_kind).with_expected_origin(ORIGIN_B);
        let engine = Engine::new(config, ta.clone()).expect("valid test config");
        let peer = ScriptedPeer::new(tb);
        Self {
            engine,
            peer,
            events,
            target,
            engine_transport: ta,
        }
    }

    /// Engine side A with defaults that admit the scripted peer's origin.
    pub fn with_defaults() -> Self {
        Self::new(TestPair::config_a())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_peer_completes_a_handshake() {
        let ScriptedSetup {
            engine,
            peer,
            target,
            ..
        } = ScriptedSetup::with_defaults();
        let responder = tokio::spawn(async move { peer.complete_handshake().await });

        engine.connect(target).await.unwrap();
        assert_eq!(engine.state(), parley_core::ConnectionState::Connected);
        responder.await.unwrap();
    }

    #[test]
    fn recorder_counts() {
        let recorder = EventRecorder::new();
        recorder.event(&EngineEvent::HeartbeatMissed { misses: 1 });
        recorder.event(&EngineEvent::HeartbeatMissed { misses: 2 });
        assert_eq!(recorder.count(EventKind::HeartbeatMissed), 2);
        assert!(!recorder.has(EventKind::Connected));
    }
}
