//! Transport connectors for the relay connection.

use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Byte stream the connection engine runs over
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

pub type BoxedStream = Box<dyn RelayStream>;

/// Opens a fresh transport connection on every (re)connect attempt
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>>;
}

/// Where the relay listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddr {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP `host:port`
    Tcp(String),
}

impl TransportAddr {
    /// Parse `tcp://host:port`, `unix:///path`, or a bare socket path.
    pub fn parse(addr: &str) -> Self {
        if let Some(rest) = addr.strip_prefix("tcp://") {
            TransportAddr::Tcp(rest.to_string())
        } else if let Some(rest) = addr.strip_prefix("unix://") {
            TransportAddr::Unix(PathBuf::from(rest))
        } else {
            TransportAddr::Unix(PathBuf::from(addr))
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            TransportAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl Connector for TransportAddr {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream: BoxedStream = match self {
                TransportAddr::Unix(path) => Box::new(UnixStream::connect(path).await?),
                TransportAddr::Tcp(addr) => {
                    let stream = TcpStream::connect(addr.as_str()).await?;
                    stream.set_nodelay(true)?;
                    Box::new(stream)
                }
            };
            Ok(stream)
        })
    }
}
