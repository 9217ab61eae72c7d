//! End-to-end scenarios over paired engines and scripted peers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use parley::{
    ConnectionState, DisconnectReason, EndpointId, EngineEvent, ErrorBody, ErrorCode, EventKind,
    Frame, FrameKind, HandlerSchemas, HeartbeatConfig, InboundMessage, ParleyError, PeerKind,
    ReplyPayload, SendOptions,
};
use parley_testkit::{ORIGIN_B, ScriptedSetup, TestPair};

fn index_of(kinds: &[EventKind], kind: EventKind) -> usize {
    kinds
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_else(|| panic!("no {kind} event in {kinds:?}"))
}

// S1: both sides handshake, then a request/response round trip, with the
// expected event trail on each side.
#[tokio::test]
async fn happy_handshake_and_echo() {
    let pair = TestPair::new();
    pair.b.on("echo", |payload, _meta| async move { Ok(payload) });

    pair.connect().await.unwrap();
    assert_eq!(pair.a.state(), ConnectionState::Connected);
    assert_eq!(pair.b.state(), ConnectionState::Connected);

    let value = pair
        .a
        .send("echo", json!({"n": 1}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!({"n": 1}));

    let a_kinds = pair.a_events.kinds();
    assert!(
        index_of(&a_kinds, EventKind::Handshake) < index_of(&a_kinds, EventKind::Connected),
        "handshake precedes connected: {a_kinds:?}"
    );
    assert!(
        index_of(&a_kinds, EventKind::MessageSent)
            < index_of(&a_kinds, EventKind::ResponseReceived)
    );

    let b_kinds = pair.b_events.kinds();
    assert!(pair.b_events.has(EventKind::Handshake));
    assert!(pair.b_events.has(EventKind::Connected));
    assert!(
        index_of(&b_kinds, EventKind::MessageReceived)
            < index_of(&b_kinds, EventKind::ResponseSent)
    );
}

// Round-trip property: echoed payloads come back structurally equal.
#[tokio::test]
async fn echo_preserves_structure() {
    let pair = TestPair::new();
    pair.b.on("echo", |payload, _meta| async move { Ok(payload) });
    pair.connect().await.unwrap();

    let payload = json!({
        "nested": {"list": [1, 2.5, "three", null, true]},
        "empty": {},
    });
    let value = pair
        .a
        .send("echo", payload.clone(), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, payload);
}

// S2: a slow responder trips the per-call timeout; the eventual late
// response is ignored without double-settling or disturbing the connection.
#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_late_response_is_ignored() {
    let pair = TestPair::new();
    pair.b.on("slow", |_payload, _meta| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!("finally"))
    });
    pair.b.on("echo", |payload, _meta| async move { Ok(payload) });
    pair.connect().await.unwrap();

    let err = pair
        .a
        .send("slow", json!({}), SendOptions::timeout_ms(50))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParleyError::Timeout {
            code: ErrorCode::RequestTimeout,
            ..
        }
    ));
    assert_eq!(pair.a_events.count(EventKind::Timeout), 1);

    // Let the late response arrive; nothing blows up and the link stays.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(pair.a.state(), ConnectionState::Connected);

    let value = pair
        .a
        .send("echo", json!(7), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!(7));
}

// S3: a valid frame from a disallowed origin is dropped with a diagnostic;
// the handshake stays pending and eventually times out.
#[tokio::test(start_paused = true)]
async fn disallowed_origin_is_dropped_and_handshake_times_out() {
    let mut config = TestPair::config_a();
    config.handshake_timeout_ms = 200;
    let ScriptedSetup {
        engine,
        peer,
        events,
        target,
        engine_transport,
    } = ScriptedSetup::new(config);
    let engine = Arc::new(engine);

    let attempt = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.connect(target).await }
    });

    // Ack the syn correctly, but from an origin the engine does not trust.
    let syn = peer.expect_kind(FrameKind::HandshakeSyn).await;
    let nonce = syn.handshake_payload().unwrap().nonce;
    engine_transport.inject(InboundMessage {
        data: Frame::handshake_ack(Uuid::new_v4(), nonce).to_wire(),
        origin: "https://evil.example".into(),
        source: peer.endpoint(),
    });

    events.wait_for(EventKind::Error).await;
    assert_eq!(engine.state(), ConnectionState::Connecting);
    assert!(events.events().iter().any(|event| matches!(
        event,
        EngineEvent::Error {
            error: ParleyError::Security {
                code: ErrorCode::OriginNotAllowed,
                ..
            }
        }
    )));

    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "HANDSHAKE_TIMEOUT");
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

// Strict mode turns the same rejection into an immediate connect failure.
#[tokio::test(start_paused = true)]
async fn strict_origin_fails_the_handshake_immediately() {
    let mut config = TestPair::config_a();
    config.strict_origin = true;
    let ScriptedSetup {
        engine,
        peer,
        target,
        engine_transport,
        ..
    } = ScriptedSetup::new(config);
    let engine = Arc::new(engine);

    let attempt = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.connect(target).await }
    });

    let syn = peer.expect_kind(FrameKind::HandshakeSyn).await;
    let nonce = syn.handshake_payload().unwrap().nonce;
    engine_transport.inject(InboundMessage {
        data: Frame::handshake_ack(Uuid::new_v4(), nonce).to_wire(),
        origin: "https://evil.example".into(),
        source: peer.endpoint(),
    });

    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "ORIGIN_NOT_ALLOWED");
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

// S4: a peer that stops answering heartbeats is declared lost within the
// miss budget, and in-flight calls reject with CONNECTION_LOST.
#[tokio::test(start_paused = true)]
async fn silent_peer_is_declared_lost() {
    let mut config = TestPair::config_a();
    config.heartbeat = HeartbeatConfig {
        enabled: true,
        interval_ms: 50,
        timeout_ms: 20,
        max_misses: 3,
    };
    let ScriptedSetup {
        engine,
        peer,
        events,
        target,
        ..
    } = ScriptedSetup::new(config);
    let engine = Arc::new(engine);

    let responder = tokio::spawn({
        let peer = peer.clone();
        async move { peer.complete_handshake().await }
    });
    engine.connect(target).await.unwrap();
    responder.await.unwrap();
    // The peer now goes silent: no pongs, no responses. (It stays alive so
    // the endpoint itself is reachable; this is a liveness failure, not a
    // detached window.)

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .send("query", json!({}), SendOptions::timeout_ms(10_000))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    events.wait_for(EventKind::ConnectionLost).await;
    assert_eq!(engine.state(), ConnectionState::Lost);
    assert_eq!(events.count(EventKind::HeartbeatMissed), 3);

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ParleyError::Connection {
            code: ErrorCode::ConnectionLost,
            ..
        }
    ));
}

// S5: the peer window closes mid-flight; pending calls reject with
// TargetNotFound and the engine lands in `disconnected`.
#[tokio::test(start_paused = true)]
async fn detached_endpoint_fails_pending_calls() {
    let mut config = TestPair::config_a();
    config.peer_kind = PeerKind::Window;
    let ScriptedSetup {
        engine,
        peer,
        events,
        target,
        engine_transport,
    } = ScriptedSetup::new(config);
    let engine = Arc::new(engine);

    let responder = tokio::spawn({
        let peer = peer.clone();
        async move { peer.complete_handshake().await }
    });
    engine.connect(target).await.unwrap();
    responder.await.unwrap();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .send("query", json!({}), SendOptions::timeout_ms(10_000))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    engine_transport.detach();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ParleyError::TargetNotFound { .. }));
    events.wait_for(EventKind::Disconnected).await;
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert!(events.events().iter().any(|event| matches!(
        event,
        EngineEvent::Disconnected {
            reason: DisconnectReason::EndpointGone
        }
    )));
}

// A send toward an already-closed endpoint fails fast on the post.
#[tokio::test]
async fn send_after_detach_is_target_not_found() {
    let pair = TestPair::new();
    pair.b.on("echo", |payload, _meta| async move { Ok(payload) });
    pair.connect().await.unwrap();

    pair.detach();
    let err = pair
        .a
        .send("echo", json!(1), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::TargetNotFound { .. }));
    assert_eq!(pair.a.state(), ConnectionState::Disconnected);
}

// S6: requests without a registered handler come back as NO_HANDLER errors
// instead of hanging the caller, and the responder keeps serving.
#[tokio::test]
async fn missing_handler_yields_error_reply() {
    let pair = TestPair::new();
    pair.b.on("known", |payload, _meta| async move { Ok(payload) });
    pair.connect().await.unwrap();

    let err = pair
        .a
        .send("unknown", json!({}), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_HANDLER");

    // B's engine is unaffected.
    let value = pair
        .a
        .send("known", json!(42), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!(42));
}

// Handler-returned errors travel as {ok: false} replies and reject the
// caller with the handler's code and details.
#[tokio::test]
async fn handler_errors_become_error_replies() {
    let pair = TestPair::new();
    pair.b.on("fail", |_payload, _meta| async move {
        Err(ErrorBody::new("HANDLER_ERROR", "boom").with_details(json!({"line": 3})))
    });
    pair.connect().await.unwrap();

    let err = pair
        .a
        .send("fail", json!({}), SendOptions::default())
        .await
        .unwrap_err();
    match err {
        ParleyError::ErrorReply {
            code,
            message,
            details,
        } => {
            assert_eq!(code, "HANDLER_ERROR");
            assert_eq!(message, "boom");
            assert_eq!(details, Some(json!({"line": 3})));
        }
        other => panic!("expected ErrorReply, got {other:?}"),
    }
}

// Inbound request schemas are enforced on the responder and surface to the
// caller as VALIDATION_FAILED.
#[tokio::test]
async fn request_schema_rejections_reach_the_caller() {
    let pair = TestPair::new();
    pair.b.on_with_schemas(
        "sum",
        HandlerSchemas {
            request: Some(json!({
                "type": "object",
                "required": ["values"],
                "properties": {"values": {"type": "array", "items": {"type": "number"}}}
            })),
            response: None,
        },
        |payload, _meta| async move {
            let total: f64 = payload["values"]
                .as_array()
                .map(|values| values.iter().filter_map(|v| v.as_f64()).sum())
                .unwrap_or(0.0);
            Ok(json!(total))
        },
    );
    pair.connect().await.unwrap();

    let err = pair
        .a
        .send("sum", json!({"values": "nope"}), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");

    let value = pair
        .a
        .send("sum", json!({"values": [1, 2, 3.5]}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!(6.5));
}

// Outbound schemas reject locally, before anything is posted.
#[tokio::test]
async fn outbound_schema_rejects_before_posting() {
    let pair = TestPair::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    pair.b.on("op", move |payload, _meta| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move { Ok(payload) }
    });
    pair.connect().await.unwrap();

    let err = pair
        .a
        .send(
            "op",
            json!("a string"),
            SendOptions {
                timeout_ms: 1_000,
                schema: Some(json!({"type": "number"})),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Validation { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

// `fire` posts a request without a pending entry; the peer's response is
// discarded silently.
#[tokio::test]
async fn fire_discards_the_response() {
    let pair = TestPair::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    pair.b.on("notify", move |_payload, _meta| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!("acknowledged")) }
    });
    pair.connect().await.unwrap();

    pair.a.fire("notify", json!({"level": "info"})).unwrap();

    pair.a_events.wait_for(EventKind::ResponseReceived).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(pair.a.state(), ConnectionState::Connected);
}

// Invariant 6: N disconnect calls, exactly one `disconnected` event; the
// peer sees exactly one peer-reason disconnect as well. Invariant 4: sends
// afterwards reject with NOT_CONNECTED.
#[tokio::test]
async fn disconnect_is_idempotent() {
    let pair = TestPair::new();
    pair.connect().await.unwrap();

    pair.a.disconnect().await;
    pair.a.disconnect().await;
    pair.a.disconnect().await;

    assert_eq!(pair.a.state(), ConnectionState::Disconnected);
    assert_eq!(pair.a_events.count(EventKind::Disconnected), 1);

    let err = pair
        .a
        .send("anything", json!({}), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_CONNECTED");

    pair.b_events.wait_for(EventKind::Disconnected).await;
    assert_eq!(pair.b.state(), ConnectionState::Disconnected);
    assert!(pair.b_events.events().iter().any(|event| matches!(
        event,
        EngineEvent::Disconnected {
            reason: DisconnectReason::Peer
        }
    )));
}

// Peer disconnect sweeps the other side's in-flight calls.
#[tokio::test]
async fn peer_disconnect_rejects_in_flight_calls() {
    let pair = TestPair::new();
    pair.b.on("slow", |_payload, _meta| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!(null))
    });
    pair.connect().await.unwrap();

    let pair = Arc::new(pair);
    let in_flight = tokio::spawn({
        let pair = Arc::clone(&pair);
        async move {
            pair.a
                .send("slow", json!({}), SendOptions::timeout_ms(30_000))
                .await
        }
    });
    pair.a_events.wait_for(EventKind::MessageSent).await;

    pair.b.disconnect().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ParleyError::Connection {
            code: ErrorCode::Disconnected,
            ..
        }
    ));
}

// Shared-endpoint policy: a response from the wrong source endpoint never
// settles a call, even with a matching correlation id.
#[tokio::test]
async fn responses_from_foreign_endpoints_are_ignored() {
    let ScriptedSetup {
        engine,
        peer,
        target,
        engine_transport,
        ..
    } = ScriptedSetup::with_defaults();
    let engine = Arc::new(engine);

    let responder = tokio::spawn({
        let peer = peer.clone();
        async move { peer.complete_handshake().await }
    });
    engine.connect(target).await.unwrap();
    responder.await.unwrap();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .send("query", json!({}), SendOptions::timeout_ms(5_000))
                .await
        }
    });
    let request = peer.expect_kind(FrameKind::Request).await;

    // Forged response: matching correlation id, wrong source endpoint.
    engine_transport.inject(InboundMessage {
        data: Frame::response(request.id, "query", &ReplyPayload::ok(json!("forged"))).to_wire(),
        origin: ORIGIN_B.into(),
        source: EndpointId::next(),
    });
    // The genuine peer answers afterwards and wins.
    peer.send(&Frame::response(
        request.id,
        "query",
        &ReplyPayload::ok(json!("genuine")),
    ));

    let value = in_flight.await.unwrap().unwrap();
    assert_eq!(value, json!("genuine"));
}

// Version-incompatible frames surface one protocol error per peer, then go
// quiet.
#[tokio::test]
async fn version_mismatch_is_reported_once() {
    let ScriptedSetup {
        engine,
        peer,
        events,
        target,
        engine_transport,
    } = ScriptedSetup::with_defaults();
    let engine = Arc::new(engine);

    let responder = tokio::spawn({
        let peer = peer.clone();
        async move { peer.complete_handshake().await }
    });
    engine.connect(target).await.unwrap();
    let _syn = responder.await.unwrap();

    for _ in 0..3 {
        let mut wire = Frame::heartbeat_ping().to_wire();
        wire["version"] = json!(99);
        engine_transport.inject(InboundMessage {
            data: wire,
            origin: ORIGIN_B.into(),
            source: engine_transport.peer_endpoint(),
        });
    }
    events.wait_for(EventKind::Error).await;
    tokio::task::yield_now().await;

    let protocol_errors = events
        .events()
        .iter()
        .filter(|event| {
            matches!(
                event,
                EngineEvent::Error {
                    error: ParleyError::Connection {
                        code: ErrorCode::ProtocolMismatch,
                        ..
                    }
                }
            )
        })
        .count();
    assert_eq!(protocol_errors, 1);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

// The engine can connect again after an explicit close.
#[tokio::test]
async fn reconnect_after_disconnect() {
    let pair = TestPair::new();
    pair.b.on("echo", |payload, _meta| async move { Ok(payload) });

    pair.connect().await.unwrap();
    pair.a.disconnect().await;
    pair.b_events.wait_for(EventKind::Disconnected).await;

    pair.connect().await.unwrap();
    assert_eq!(pair.a.state(), ConnectionState::Connected);
    let value = pair
        .a
        .send("echo", json!("again"), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!("again"));
}

// Requests and responses interleave freely; correlation is by id only.
#[tokio::test]
async fn concurrent_sends_correlate_correctly() {
    let pair = TestPair::new();
    pair.b.on("double", |payload, _meta| async move {
        let n = payload.as_i64().unwrap_or(0);
        Ok(json!(n * 2))
    });
    pair.connect().await.unwrap();

    let pair = Arc::new(pair);
    let mut calls = Vec::new();
    for n in 0..8i64 {
        let pair = Arc::clone(&pair);
        calls.push(tokio::spawn(async move {
            pair.a
                .send("double", json!(n), SendOptions::default())
                .await
        }));
    }
    for (n, call) in calls.into_iter().enumerate() {
        let value = call.await.unwrap().unwrap();
        assert_eq!(value, json!((n as i64) * 2));
    }
}

// Both sides can serve requests: the channel is symmetric once connected.
#[tokio::test]
async fn requests_flow_in_both_directions() {
    let pair = TestPair::new();
    pair.a.on("whoami", |_payload, _meta| async move { Ok(json!("a")) });
    pair.b.on("whoami", |_payload, _meta| async move { Ok(json!("b")) });
    pair.connect().await.unwrap();

    let from_b = pair
        .a
        .send("whoami", json!(null), SendOptions::default())
        .await
        .unwrap();
    let from_a = pair
        .b
        .send("whoami", json!(null), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(from_b, json!("b"));
    assert_eq!(from_a, json!("a"));
}
