//! relay-agent: connects an agent CLI to an agent relay.
//!
//! The library half holds the relay connection engine and everything needed
//! to get relay messages into a running agent reliably: idle and stuck
//! detection, a prioritized injection queue with verification and retries,
//! and the parser that turns agent output back into relay commands.

pub mod codec;
pub mod config;
pub mod connection;
pub mod continuity;
pub mod dedup;
pub mod idle;
pub mod inject;
pub mod parser;
pub mod protocol;
pub mod pty;
pub mod queue;
pub mod session;
pub mod stuck;
pub mod transport;

pub use config::Config;
pub use connection::{ClientEvent, ConnectionError, ConnectionState, RelayClient};
pub use inject::{AgentBackend, InjectionPipeline, PipelineEvent};
pub use session::AgentSession;
