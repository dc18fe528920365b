//! Transport layer
//!
//! The controller reaches this process over a duplex byte pipe. The concrete
//! endpoint is pluggable — only the duplex-byte-stream semantics matter —
//! so the pipe server is written against the [`Acceptor`] trait:
//!
//! * Unix domain socket bound to a well-known path (the POSIX equivalent of
//!   a named pipe; the path defaults to the executable's name)
//! * TCP listener (remote-accept mode, also what the tests use)

mod pipe;

pub use pipe::{InstanceToken, PipeEvent, PipeServer};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("bind failed on {path}: {source}")]
    Bind { path: String, source: io::Error },

    #[error("transport closed")]
    Closed,
}

/// One accepted pipe instance: any duplex byte stream.
pub trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PipeStream for T {}

/// Source of pipe instances. The pipe server re-arms `accept` after every
/// returned instance.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<Box<dyn PipeStream>>;
}

/// TCP-backed acceptor (remote connections allowed).
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            TransportError::Bind { path: addr.to_string(), source }
        })?;
        Ok(Self { listener })
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<Box<dyn PipeStream>> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "pipe instance accepted (tcp)");
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Accept a plain stream into the trait object form. Used by tests that
/// drive the server over in-memory duplex pipes.
pub fn boxed_stream<S>(stream: S) -> Box<dyn PipeStream>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Box::new(stream)
}

/// Acceptor fed from a channel of pre-made streams. This is the seam the
/// integration tests use: `tokio::io::duplex` halves are pushed in and come
/// out as pipe instances.
pub struct ChannelAcceptor {
    rx: tokio::sync::mpsc::UnboundedReceiver<Box<dyn PipeStream>>,
}

impl ChannelAcceptor {
    pub fn new() -> (tokio::sync::mpsc::UnboundedSender<Box<dyn PipeStream>>, Self) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> io::Result<Box<dyn PipeStream>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "acceptor closed"))
    }
}

/// Unix-domain-socket acceptor bound to a filesystem path.
#[cfg(unix)]
pub struct UnixAcceptor {
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl UnixAcceptor {
    /// Bind the socket path. An `AddrInUse` here usually means another
    /// instance of this process owns the path already.
    pub fn bind(path: &std::path::Path) -> Result<Self, TransportError> {
        let listener = tokio::net::UnixListener::bind(path).map_err(|source| {
            TransportError::Bind { path: path.display().to_string(), source }
        })?;
        Ok(Self { listener })
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&mut self) -> io::Result<Box<dyn PipeStream>> {
        let (stream, _) = self.listener.accept().await?;
        tracing::debug!("pipe instance accepted (unix)");
        Ok(Box::new(stream))
    }
}
