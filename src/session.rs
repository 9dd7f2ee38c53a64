//! Agent session: glue between the wrapped agent, the relay and the
//! injection machinery.
//!
//! - agent output feeds the idle/stuck detectors, the verification buffer
//!   and the command parser
//! - parsed commands go out through the relay client, in order
//! - relay deliveries go into the injection pipeline
//! - pipeline and stuck events turn into ACKs, BUSY frames, logs and
//!   failure notices

use crate::config::Config;
use crate::connection::{ChannelOptions, ClientEvent, ConnectionError, RelayClient, SendOptions};
use crate::continuity::{ContinuityStore, FileContinuityStore};
use crate::idle::IdleDetector;
use crate::inject::{AgentBackend, InjectionPipeline, MetricsSnapshot, PipelineEvent};
use crate::parser::{OutputParser, ParseResult};
use crate::protocol::{
    next_id, ContinuityAction, ContinuityCommand, ParsedRelayCommand, QueuedMessage,
    SpawnPayload, BROADCAST_TARGET,
};
use crate::stuck::{StuckDetector, StuckEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sender name of injected continuity summaries
pub const CONTINUITY_SENDER: &str = "continuity";

/// Importance of injected continuity summaries (most urgent)
const CONTINUITY_IMPORTANCE: u8 = 0;

/// Hint sent with BUSY frames
const BUSY_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Work for the outgoing forwarder, kept in output order
enum Outgoing {
    Relay(ParsedRelayCommand),
    Continuity(ContinuityCommand),
}

/// Wiring that lives as long as the wrapped agent
pub struct AgentSession {
    config: Config,
    client: RelayClient,
    idle: Arc<IdleDetector>,
    stuck: Arc<StuckDetector>,
    pipeline: Arc<InjectionPipeline>,
    continuity: Option<Arc<dyn ContinuityStore>>,
    parser: OutputParser,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentSession {
    pub fn new(config: Config, client: RelayClient, backend: Arc<dyn AgentBackend>) -> Self {
        let idle = Arc::new(IdleDetector::new(config.idle.clone()));
        idle.set_pid(backend.process_id());
        let stuck = StuckDetector::new(config.stuck.clone());
        let pipeline = Arc::new(InjectionPipeline::new(
            config.injection.clone(),
            backend,
            Arc::clone(&idle),
            Some(Arc::clone(&stuck)),
        ));

        let mut parser = OutputParser::new(
            config.agent_name().to_string(),
            &config.idle.prompt_pattern,
        );
        if let Some(outbox) = &config.outbox {
            if let Err(e) = std::fs::create_dir_all(outbox) {
                warn!("Failed to create outbox directory {:?}: {}", outbox, e);
            }
            info!("File-based relay enabled, outbox: {:?}", outbox);
            parser = parser.with_outbox(outbox.clone());
        }

        let continuity = config.continuity_dir.as_ref().map(|dir| {
            Arc::new(FileContinuityStore::new(dir.clone())) as Arc<dyn ContinuityStore>
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            config,
            client,
            idle,
            stuck,
            pipeline,
            continuity,
            parser,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            tasks: Vec::new(),
        }
    }

    /// Replace the file-backed continuity store.
    pub fn with_continuity_store(mut self, store: Arc<dyn ContinuityStore>) -> Self {
        self.continuity = Some(store);
        self
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn pipeline(&self) -> &Arc<InjectionPipeline> {
        &self.pipeline
    }

    pub fn idle(&self) -> &Arc<IdleDetector> {
        &self.idle
    }

    pub fn stuck(&self) -> &Arc<StuckDetector> {
        &self.stuck
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics()
    }

    /// Spawn the background tasks. Call once, inside a tokio runtime.
    pub fn start(&mut self) {
        let Some(outgoing_rx) = self.outgoing_rx.take() else {
            warn!("Session already started");
            return;
        };

        // Subscribe before anything can fire
        let client_events = self.client.subscribe();
        let pipeline_events = self.pipeline.subscribe();
        let stuck_events = self.stuck.subscribe();

        self.stuck.start();

        let pipeline = Arc::clone(&self.pipeline);
        self.tasks.push(tokio::spawn(async move { pipeline.run().await }));

        self.tasks.push(tokio::spawn(route_client_events(
            client_events,
            Arc::clone(&self.pipeline),
            self.config.agent_name().to_string(),
        )));

        self.tasks.push(tokio::spawn(route_pipeline_events(
            pipeline_events,
            self.client.clone(),
            self.config.clone(),
        )));

        self.tasks.push(tokio::spawn(route_stuck_events(
            stuck_events,
            self.client.clone(),
            self.config.json_output,
        )));

        self.tasks.push(tokio::spawn(forward_outgoing(
            outgoing_rx,
            self.client.clone(),
            Arc::clone(&self.pipeline),
            self.continuity.clone(),
            self.config.clone(),
        )));

        info!("Session started for {}", self.config.agent_name());
    }

    /// Feed a chunk of agent output. Parsed commands are forwarded in order.
    pub fn on_output(&mut self, data: &[u8]) -> ParseResult {
        let text = String::from_utf8_lossy(data);
        self.idle.on_output(&text);
        self.stuck.on_output(&text);
        self.pipeline.record_output(&text);

        let result = self.parser.process(data);
        if result.is_ready() {
            self.idle.mark_ready();
        }

        for cmd in &result.commands {
            if self.config.json_output {
                emit_json_line(cmd);
            }
            let _ = self.outgoing_tx.send(Outgoing::Relay(cmd.clone()));
        }
        for cmd in &result.continuity_commands {
            if self.config.json_output {
                emit_json_line(cmd);
            }
            let _ = self.outgoing_tx.send(Outgoing::Continuity(cmd.clone()));
        }
        result
    }

    /// Stop background work and leave the relay gracefully.
    pub async fn shutdown(mut self) {
        self.stuck.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.client.disconnect().await;
        let metrics = self.pipeline.metrics();
        info!(
            "Session closed: {} delivered, {} failed, {} attempts",
            metrics.success_first_try + metrics.success_with_retry,
            metrics.failed,
            metrics.total_attempts
        );
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn route_client_events(
    mut events: broadcast::Receiver<ClientEvent>,
    pipeline: Arc<InjectionPipeline>,
    agent_name: String,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} relay events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ClientEvent::Message(msg) => {
                debug!("Delivery {} from {}", msg.id, msg.from);
                pipeline.handle_incoming_message(QueuedMessage::from_inbound(msg));
            }
            ClientEvent::ChannelMessage(msg) => {
                if msg.from == agent_name {
                    continue;
                }
                pipeline.handle_incoming_message(QueuedMessage::from_channel(msg));
            }
            ClientEvent::Connected {
                session_id,
                resumed,
            } => {
                info!("Relay session {} ({})", session_id, if resumed { "resumed" } else { "new" });
            }
            ClientEvent::Disconnected { reason } => warn!("Relay disconnected: {}", reason),
            ClientEvent::ReconnectExhausted { attempts } => {
                error!("Gave up reconnecting to relay after {} attempts", attempts);
            }
            ClientEvent::Error(err) => warn!("Relay error {}: {}", err.code, err.message),
            ClientEvent::Busy(busy) => {
                debug!("Relay busy, retry after {}ms", busy.retry_after_ms)
            }
            ClientEvent::StateChanged { from, to } => debug!("Relay state {:?} -> {:?}", from, to),
        }
    }
    debug!("Client event router exiting");
}

async fn route_pipeline_events(
    mut events: broadcast::Receiver<PipelineEvent>,
    client: RelayClient,
    config: Config,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} pipeline events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if config.json_output {
            emit_json_line(&event);
        }

        let sent = match &event {
            PipelineEvent::Delivered {
                sync: Some(sync), ..
            } => client.ack_sync(&sync.correlation_id, true, None).await,
            PipelineEvent::InjectionFailed {
                id, from, error, ..
            } => notify_sender(&client, &config, id, from, error).await,
            PipelineEvent::Rejected {
                id,
                from,
                queue_length,
            } => {
                let busy = client
                    .send_busy(BUSY_RETRY_AFTER.as_millis() as u64, *queue_length)
                    .await;
                let reason = format!("injection queue full ({} messages)", queue_length);
                let notified = notify_sender(&client, &config, id, from, &reason).await;
                busy.and(notified)
            }
            PipelineEvent::Backpressure {
                queue_length,
                accept: false,
            } => {
                client
                    .send_busy(BUSY_RETRY_AFTER.as_millis() as u64, *queue_length)
                    .await
            }
            PipelineEvent::Backpressure {
                queue_length,
                accept: true,
            } => {
                client
                    .send_log(&format!("injection queue drained to {} messages", queue_length))
                    .await
            }
            _ => continue,
        };
        if let Err(e) = sent {
            warn!("Could not report {:?} to relay: {}", event, e);
        }
    }
    debug!("Pipeline event router exiting");
}

/// Tell the sender of `id` that it never reached the agent
async fn notify_sender(
    client: &RelayClient,
    config: &Config,
    id: &str,
    from: &str,
    reason: &str,
) -> Result<String, ConnectionError> {
    if !config.injection.notify_on_failure || from == CONTINUITY_SENDER {
        return Ok(String::new());
    }
    let notice = format!(
        "[relay] Message {} could not be delivered to {}: {}",
        id,
        config.agent_name(),
        reason
    );
    client.send_message(from, &notice, SendOptions::default()).await
}

async fn route_stuck_events(
    mut events: broadcast::Receiver<StuckEvent>,
    client: RelayClient,
    json_output: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if json_output {
            emit_json_line(&event);
        }
        let line = match serde_json::to_string(&event) {
            Ok(line) => format!("stuck: {}", line),
            Err(e) => {
                warn!("Could not encode stuck event: {}", e);
                continue;
            }
        };
        if let Err(e) = client.send_log(&line).await {
            warn!("Could not report stuck agent to relay: {}", e);
        }
    }
}

async fn forward_outgoing(
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    client: RelayClient,
    pipeline: Arc<InjectionPipeline>,
    continuity: Option<Arc<dyn ContinuityStore>>,
    config: Config,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Relay(cmd) => {
                if let Err(e) = send_command(&client, &config, cmd).await {
                    warn!("Failed to forward relay command: {}", e);
                }
            }
            Outgoing::Continuity(cmd) => {
                handle_continuity(continuity.as_deref(), &pipeline, config.agent_name(), cmd);
            }
        }
    }
}

async fn send_command(
    client: &RelayClient,
    config: &Config,
    cmd: ParsedRelayCommand,
) -> Result<String, ConnectionError> {
    match cmd.kind.as_str() {
        "spawn" => {
            let request = SpawnPayload {
                name: cmd.spawn_name.unwrap_or_default(),
                cli: cmd.spawn_cli.unwrap_or_default(),
                task: cmd.spawn_task.unwrap_or_default(),
                cwd: config.connection.working_directory.clone(),
            };
            info!("Requesting spawn of {} ({})", request.name, request.cli);
            client.spawn(request).await
        }
        "release" => {
            let name = cmd.release_name.unwrap_or_default();
            info!("Requesting release of {}", name);
            client.release(&name).await
        }
        _ if cmd.to.starts_with('#') => {
            let options = ChannelOptions {
                thread: cmd.thread,
                mentions: Vec::new(),
                data: cmd.data,
            };
            client.send_channel_message(&cmd.to, &cmd.body, options).await
        }
        _ => {
            let options = SendOptions {
                thread: cmd.thread,
                data: cmd.data,
                ..Default::default()
            };
            if cmd.to == BROADCAST_TARGET {
                client.broadcast(&cmd.body, options).await
            } else {
                client.send_message(&cmd.to, &cmd.body, options).await
            }
        }
    }
}

fn handle_continuity(
    store: Option<&dyn ContinuityStore>,
    pipeline: &InjectionPipeline,
    agent: &str,
    cmd: ContinuityCommand,
) {
    let Some(store) = store else {
        debug!("Continuity {:?} ignored, no store configured", cmd.action);
        return;
    };
    match cmd.action {
        ContinuityAction::Save => {
            if let Err(e) = store.save(agent, &cmd.content) {
                warn!("Failed to save continuity for {}: {:#}", agent, e);
            }
        }
        ContinuityAction::Uncertain => {
            if let Err(e) = store.add_uncertainty(agent, &cmd.content) {
                warn!("Failed to record uncertainty for {}: {:#}", agent, e);
            }
        }
        ContinuityAction::Load => match store.load(agent) {
            Ok(Some(record)) => {
                let msg = QueuedMessage::new(
                    next_id(),
                    CONTINUITY_SENDER.to_string(),
                    record.render(),
                    CONTINUITY_IMPORTANCE,
                );
                pipeline.handle_incoming_message(msg);
            }
            Ok(None) => info!("No saved continuity for {}", agent),
            Err(e) => warn!("Failed to load continuity for {}: {:#}", agent, e),
        },
    }
}

/// One JSON object per line on stderr
fn emit_json_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => eprintln!("{}", json),
        Err(e) => debug!("Could not encode JSON line: {}", e),
    }
}
