//! In-process fake relay listening on a Unix socket in a temp dir.

#![allow(dead_code)]

use relay_agent::codec::FrameCodec;
use relay_agent::config::ConnectionConfig;
use relay_agent::protocol::{DeliveryInfo, Envelope, FrameType, FramingMode, SendPayload};
use relay_agent::transport::TransportAddr;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakeRelay {
    listener: UnixListener,
    pub path: PathBuf,
    _dir: TempDir,
}

impl FakeRelay {
    pub fn bind() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            listener,
            path,
            _dir: dir,
        }
    }

    /// Client settings tuned for tests: quick reconnects, no jitter surprises
    pub fn config(&self, agent: &str) -> ConnectionConfig {
        ConnectionConfig {
            agent_name: agent.to_string(),
            address: TransportAddr::Unix(self.path.clone()),
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub async fn accept(&self) -> RelayPeer {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        RelayPeer {
            stream,
            codec: FrameCodec::new(FramingMode::Legacy),
            inbox: VecDeque::new(),
        }
    }
}

/// Relay side of one client connection
pub struct RelayPeer {
    stream: UnixStream,
    codec: FrameCodec,
    inbox: VecDeque<Envelope>,
}

impl RelayPeer {
    pub fn set_mode(&mut self, mode: FramingMode) {
        self.codec.set_mode(mode);
    }

    /// Next frame from the client
    pub async fn recv(&mut self) -> Envelope {
        timeout(WAIT, self.read_frame())
            .await
            .expect("no frame from client")
            .expect("client closed the connection")
    }

    /// Next frame of `kind`, skipping anything else
    pub async fn recv_kind(&mut self, kind: FrameType) -> Envelope {
        loop {
            let env = self.recv().await;
            if env.kind == kind {
                return env;
            }
        }
    }

    /// None once the client closed its side
    pub async fn read_frame(&mut self) -> Option<Envelope> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(env) = self.inbox.pop_front() {
                return Some(env);
            }
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.inbox.extend(self.codec.push(&buf[..n]).unwrap());
        }
    }

    pub async fn send(&mut self, env: &Envelope) {
        let frame = self.codec.encode(env).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Answer the client's HELLO with a WELCOME; returns the HELLO.
    pub async fn handshake(&mut self, session_id: &str, resume_token: Option<&str>) -> Envelope {
        let hello = self.recv_kind(FrameType::Hello).await;
        self.send(&welcome(session_id, resume_token, json!({}))).await;
        hello
    }
}

pub fn welcome(session_id: &str, resume_token: Option<&str>, server_extra: Value) -> Envelope {
    let mut server = json!({ "max_frame_bytes": 1_048_576, "heartbeat_ms": 0 });
    if let (Some(server), Some(extra)) = (server.as_object_mut(), server_extra.as_object()) {
        server.extend(extra.clone());
    }
    let mut payload = json!({ "session_id": session_id, "server": server });
    if let Some(token) = resume_token {
        payload["resume_token"] = json!(token);
    }
    Envelope::new(FrameType::Welcome, payload)
}

pub fn deliver(id: &str, from: &str, body: &str, seq: u64) -> Envelope {
    let mut env = Envelope::new(FrameType::Deliver, SendPayload::message(body))
        .with_from(from)
        .with_to("Alice");
    env.id = id.to_string();
    env.delivery = Some(DeliveryInfo {
        seq,
        session_id: "s1".to_string(),
        original_to: None,
    });
    env
}

pub fn ack_for(env: &Envelope, correlation_id: &str, response: bool) -> Envelope {
    Envelope::new(
        FrameType::Ack,
        json!({
            "ack_id": env.id,
            "correlation_id": correlation_id,
            "response": response,
            "response_data": { "ok": response },
        }),
    )
}
