mod common;

use common::{deliver, FakeRelay, WAIT};
use futures::future::BoxFuture;
use relay_agent::config::{Config, IdleConfig, InjectionConfig};
use relay_agent::protocol::{FrameType, PayloadMeta, SyncMeta};
use relay_agent::{AgentBackend, AgentSession, RelayClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Hands every injected text to the test, which plays the terminal
struct EchoBackend {
    tx: mpsc::UnboundedSender<String>,
}

impl AgentBackend for EchoBackend {
    fn requires_verification(&self) -> bool {
        true
    }

    fn perform_injection<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.tx
                .send(text.to_string())
                .map_err(|_| anyhow::anyhow!("terminal gone"))
        })
    }
}

fn config(relay: &FakeRelay, injection: InjectionConfig) -> Config {
    Config {
        connection: relay.config("Alice"),
        idle: IdleConfig {
            min_silence: Duration::ZERO,
            ..Default::default()
        },
        injection,
        ..Default::default()
    }
}

fn fast_injection() -> InjectionConfig {
    InjectionConfig {
        idle_wait_timeout: Duration::from_millis(200),
        idle_poll: Duration::from_millis(10),
        verification_timeout: Duration::from_millis(500),
        verification_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

struct Harness {
    relay: FakeRelay,
    session: AgentSession,
    client: RelayClient,
    injected: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    async fn start(injection: InjectionConfig) -> (Self, common::RelayPeer) {
        let relay = FakeRelay::bind();
        let (tx, injected) = mpsc::unbounded_channel();
        let client = RelayClient::new(relay.config("Alice"));
        let mut session = AgentSession::new(
            config(&relay, injection),
            client.clone(),
            Arc::new(EchoBackend { tx }),
        );
        session.start();

        client.connect().await.unwrap();
        let mut peer = relay.accept().await;
        peer.handshake("s1", None).await;
        client.wait_until_ready(WAIT).await.unwrap();
        (
            Self {
                relay,
                session,
                client,
                injected,
            },
            peer,
        )
    }

    /// Next injected text, echoed back as terminal output
    async fn echo_next(&mut self) -> String {
        let text = timeout(WAIT, self.injected.recv())
            .await
            .expect("nothing injected")
            .unwrap();
        self.session.on_output(format!("{}\r\n", text).as_bytes());
        text
    }

    async fn wait_delivered(&self, count: u64) {
        let deadline = Instant::now() + WAIT;
        loop {
            let metrics = self.session.metrics();
            if metrics.success_first_try + metrics.success_with_retry >= count {
                return;
            }
            assert!(Instant::now() < deadline, "delivery never confirmed: {:?}", metrics);
            sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn test_delivery_is_acked_and_injected_once() {
    let (mut h, mut peer) = Harness::start(fast_injection()).await;

    peer.send(&deliver("m1", "Lead", "hi", 1)).await;
    let ack = peer.recv_kind(FrameType::Ack).await;
    assert_eq!(ack.payload["ack_id"], "m1");

    let text = h.echo_next().await;
    assert_eq!(text, "Relay message from Lead [m1]: hi");
    h.wait_delivered(1).await;

    // Redelivery after a lost ACK: acknowledged again, never re-injected
    peer.send(&deliver("m1", "Lead", "hi", 1)).await;
    let ack = peer.recv_kind(FrameType::Ack).await;
    assert_eq!(ack.payload["ack_id"], "m1");
    assert!(timeout(Duration::from_millis(300), h.injected.recv())
        .await
        .is_err());
    assert_eq!(h.session.metrics().total_attempts, 1);

    h.client.destroy().await;
    drop(h.relay);
}

#[tokio::test]
async fn test_sync_delivery_is_answered_after_injection() {
    let (mut h, mut peer) = Harness::start(fast_injection()).await;

    let mut env = deliver("m2", "Lead", "status?", 2);
    env.payload_meta = Some(PayloadMeta {
        sync: Some(SyncMeta {
            correlation_id: "corr-1".to_string(),
            timeout_ms: Some(5000),
            blocking: true,
        }),
        ..Default::default()
    });
    peer.send(&env).await;

    h.echo_next().await;
    loop {
        let ack = peer.recv_kind(FrameType::Ack).await;
        if ack.payload["correlation_id"] == "corr-1" {
            assert_eq!(ack.payload["response"], true);
            break;
        }
    }
    h.client.destroy().await;
}

#[tokio::test]
async fn test_failed_injection_notifies_sender() {
    let injection = InjectionConfig {
        max_attempts: 2,
        retry_backoff: Duration::from_millis(10),
        verification_timeout: Duration::from_millis(50),
        ..fast_injection()
    };
    let (mut h, mut peer) = Harness::start(injection).await;

    peer.send(&deliver("m3", "Lead", "are you there", 3)).await;

    // Swallow both attempts without echoing anything
    for _ in 0..2 {
        timeout(WAIT, h.injected.recv()).await.unwrap().unwrap();
    }

    let notice = peer.recv_kind(FrameType::Send).await;
    assert_eq!(notice.to.as_deref(), Some("Lead"));
    let body = notice.payload["body"].as_str().unwrap();
    assert!(body.contains("m3"), "{}", body);
    assert!(body.contains("could not be delivered"), "{}", body);
    assert_eq!(h.session.metrics().failed, 1);
    h.client.destroy().await;
}

#[tokio::test]
async fn test_agent_output_commands_reach_relay_in_order() {
    let (mut h, mut peer) = Harness::start(fast_injection()).await;

    h.session
        .on_output(b"->relay:Bob first\r\n->relay:Bob second\r\n");
    h.session.on_output(b"->relay:#general [thread:t1] to the channel\r\n");

    let first = peer.recv_kind(FrameType::Send).await;
    let second = peer.recv_kind(FrameType::Send).await;
    assert_eq!(first.payload["body"], "first");
    assert_eq!(second.payload["body"], "second");
    assert_eq!(second.to.as_deref(), Some("Bob"));

    let channel = peer.recv_kind(FrameType::ChannelMessage).await;
    assert_eq!(channel.payload["channel"], "#general");
    assert_eq!(channel.payload["thread"], "t1");
    assert_eq!(channel.payload["body"], "to the channel");
    h.client.destroy().await;
}

#[tokio::test]
async fn test_rejected_delivery_notifies_sender() {
    let injection = InjectionConfig {
        queue_max: 1,
        max_attempts: 1,
        verification_timeout: Duration::from_secs(3),
        ..fast_injection()
    };
    let (mut h, mut peer) = Harness::start(injection).await;

    // m4 occupies the only slot while its verification is pending
    peer.send(&deliver("m4", "Lead", "first", 4)).await;
    timeout(WAIT, h.injected.recv()).await.unwrap().unwrap();
    peer.send(&deliver("m5", "Lead", "second", 5)).await;

    peer.recv_kind(FrameType::Busy).await;
    let notice = peer.recv_kind(FrameType::Send).await;
    assert_eq!(notice.to.as_deref(), Some("Lead"));
    let body = notice.payload["body"].as_str().unwrap();
    assert!(body.contains("m5"), "{}", body);
    assert!(body.contains("queue full"), "{}", body);
    h.client.destroy().await;
}
