mod common;

use common::{ack_for, deliver, welcome, FakeRelay, WAIT};
use relay_agent::connection::{ClientEvent, ConnectionError, ConnectionState, RelayClient, SyncOptions};
use relay_agent::protocol::{Envelope, FrameType, FramingMode, HelloPayload};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn next_event<F>(events: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test]
async fn test_handshake_reaches_ready() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    let hello = peer.handshake("s1", Some("tok-1")).await;

    let payload: HelloPayload = hello.payload_as().unwrap();
    assert_eq!(payload.agent, "Alice");
    assert!(payload.capabilities.ack);
    assert!(payload.capabilities.resume);
    assert!(payload.session.is_none());

    client.wait_until_ready(WAIT).await.unwrap();
    match next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await {
        ClientEvent::Connected {
            session_id,
            resumed,
        } => {
            assert_eq!(session_id, "s1");
            assert!(!resumed);
        }
        _ => unreachable!(),
    }
    assert_eq!(client.session().resume_token.as_deref(), Some("tok-1"));
    client.destroy().await;
}

#[tokio::test]
async fn test_ping_is_answered_with_echoed_pong() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;

    peer.send(&Envelope::new(FrameType::Ping, json!({ "nonce": 7 })))
        .await;
    let pong = peer.recv_kind(FrameType::Pong).await;
    assert_eq!(pong.payload, json!({ "nonce": 7 }));
    client.destroy().await;
}

#[tokio::test]
async fn test_redelivery_is_acked_but_emitted_once() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;

    peer.send(&deliver("m1", "Lead", "hi", 1)).await;
    peer.send(&deliver("m1", "Lead", "hi", 1)).await;

    for _ in 0..2 {
        let ack = peer.recv_kind(FrameType::Ack).await;
        assert_eq!(ack.payload["ack_id"], "m1");
        assert_eq!(ack.payload["seq"], 1);
    }

    let mut messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Message(msg) = event {
            messages.push(msg);
        }
    }
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from, "Lead");
    assert_eq!(messages[0].body, "hi");
    client.destroy().await;
}

#[tokio::test]
async fn test_send_and_wait_resolves_on_matching_ack() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;
    client.wait_until_ready(WAIT).await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_and_wait("Bob", "ready?", SyncOptions::default())
                .await
        })
    };

    let send = peer.recv_kind(FrameType::Send).await;
    assert_eq!(send.to.as_deref(), Some("Bob"));
    let sync = send
        .payload_meta
        .as_ref()
        .and_then(|m| m.sync.clone())
        .expect("blocking send carries sync metadata");
    assert!(sync.blocking);

    // An unrelated ACK first must not resolve the request
    peer.send(&ack_for(&send, "someone-else", false)).await;
    peer.send(&ack_for(&send, &sync.correlation_id, true)).await;

    let ack = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(ack.correlation_id, sync.correlation_id);
    assert_eq!(ack.response, Some(true));
    assert_eq!(ack.response_data, Some(json!({ "ok": true })));
    client.destroy().await;
}

#[tokio::test]
async fn test_send_and_wait_times_out() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;
    client.wait_until_ready(WAIT).await.unwrap();

    let options = SyncOptions {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let started = Instant::now();
    let result = client.send_and_wait("Bob", "anyone?", options).await;
    let elapsed = started.elapsed();
    match result {
        Err(ConnectionError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
        other => panic!("expected timeout, got {:?}", other),
    }
    // Honors the per-call timeout rather than the configured default
    assert!(elapsed >= Duration::from_millis(50), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);

    // A late ACK is ignored and the link stays up
    let send = peer.recv_kind(FrameType::Send).await;
    let correlation_id = send.payload_meta.as_ref().unwrap().sync.as_ref().unwrap().correlation_id.clone();
    peer.send(&ack_for(&send, &correlation_id, true)).await;
    peer.send(&Envelope::new(FrameType::Ping, json!({}))).await;
    peer.recv_kind(FrameType::Pong).await;
    assert_eq!(client.state(), ConnectionState::Ready);
    client.destroy().await;
}

#[tokio::test]
async fn test_pending_sync_rejected_when_link_drops() {
    let relay = FakeRelay::bind();
    let mut config = relay.config("Alice");
    config.reconnect = false;
    let client = RelayClient::new(config);
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;
    client.wait_until_ready(WAIT).await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.send_and_wait("Bob", "hello?", SyncOptions::default()).await })
    };
    peer.recv_kind(FrameType::Send).await;
    drop(peer);

    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), ConnectionError::Disconnected);
    client.destroy().await;
}

#[tokio::test]
async fn test_reconnect_resumes_session() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    let mut events = client.subscribe();
    client.connect().await.unwrap();

    let mut peer = relay.accept().await;
    peer.handshake("s1", Some("tok-1")).await;
    client.wait_until_ready(WAIT).await.unwrap();
    drop(peer);

    let mut peer = relay.accept().await;
    let hello = peer.handshake("s1", Some("tok-2")).await;
    let payload: HelloPayload = hello.payload_as().unwrap();
    assert_eq!(
        payload.session.map(|s| s.resume_token).as_deref(),
        Some("tok-1")
    );

    let resumed = next_event(&mut events, |e| {
        matches!(e, ClientEvent::Connected { resumed: true, .. })
    })
    .await;
    assert!(matches!(resumed, ClientEvent::Connected { .. }));
    assert_eq!(client.session().resume_token.as_deref(), Some("tok-2"));
    client.destroy().await;
}

#[tokio::test]
async fn test_resume_too_old_starts_fresh_session() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();

    let mut peer = relay.accept().await;
    peer.handshake("s1", Some("tok-1")).await;
    client.wait_until_ready(WAIT).await.unwrap();
    drop(peer);

    // Second attempt offers the stale token and gets refused
    let mut peer = relay.accept().await;
    let hello = peer.recv_kind(FrameType::Hello).await;
    assert!(hello.payload.get("session").is_some());
    peer.send(&Envelope::new(
        FrameType::Error,
        json!({ "code": "RESUME_TOO_OLD", "message": "session expired", "fatal": true }),
    ))
    .await;

    // Third attempt starts over without a resume token
    let mut peer = relay.accept().await;
    let hello = peer.handshake("s2", None).await;
    assert!(hello.payload.get("session").is_none());
    client.wait_until_ready(WAIT).await.unwrap();
    assert_eq!(client.session().session_id.as_deref(), Some("s2"));
    client.destroy().await;
}

#[tokio::test]
async fn test_welcome_switches_to_modern_framing() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();

    let mut peer = relay.accept().await;
    let hello = peer.recv_kind(FrameType::Hello).await;
    assert_eq!(hello.payload["capabilities"]["framing"], "legacy");
    peer.send(&welcome("s1", None, json!({ "framing": "modern" })))
        .await;
    peer.set_mode(FramingMode::Modern);
    client.wait_until_ready(WAIT).await.unwrap();

    peer.send(&Envelope::new(FrameType::Ping, json!({ "n": 1 })))
        .await;
    let pong = peer.recv_kind(FrameType::Pong).await;
    assert_eq!(pong.payload, json!({ "n": 1 }));
    client.destroy().await;
}

#[tokio::test]
async fn test_disconnect_sends_bye_and_stays_down() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;
    client.wait_until_ready(WAIT).await.unwrap();

    client.disconnect().await;
    let bye = peer.recv_kind(FrameType::Bye).await;
    assert_eq!(bye.payload["reason"], "client disconnect");
    assert!(peer.read_frame().await.is_none());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client
        .send_message("Bob", "still there?", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::NotReady(ConnectionState::Disconnected));
    client.destroy().await;
}

#[tokio::test]
async fn test_sends_resolve_after_write() {
    let relay = FakeRelay::bind();
    let client = RelayClient::new(relay.config("Alice"));
    client.connect().await.unwrap();
    let mut peer = relay.accept().await;
    peer.handshake("s1", None).await;
    client.wait_until_ready(WAIT).await.unwrap();

    let (a, b, c) = tokio::join!(
        client.send_message("Bob", "one", Default::default()),
        client.broadcast("two", Default::default()),
        client.join_channel("#general"),
    );
    let ids = [a.unwrap(), b.unwrap(), c.unwrap()];

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let env = peer.recv().await;
        seen.push((env.kind, env.id));
    }
    for id in &ids {
        assert!(seen.iter().any(|(_, seen_id)| seen_id == id));
    }
    assert!(seen.iter().any(|(kind, _)| *kind == FrameType::ChannelJoin));
    client.destroy().await;
}
