//! # pipesocks
//!
//! Server half of a SOCKS-over-pipe tunnel. A remote controller opens one or
//! more duplex pipe instances to this process and multiplexes arbitrary
//! SOCKS5/TCP sessions over them using a framed binary protocol. Every
//! outgoing TCP connection to a target is made here, on the controller's
//! behalf.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Pipe listener                        │
//! │   (instance pool, per-instance I/O, output queues)   │
//! ├─────────────────────────────────────────────────────┤
//! │                 Worker (multiplexer)                 │
//! │   (frame decode, channel/client maps, dispatch)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 SOCKS engine                         │
//! │   (per-session state machine, bounded connect)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Socket reactor                       │
//! │   (registered TCP sockets, FIFO write queues)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Data flows controller → target as
//! `pipe bytes → channel buffer → frame decoder → worker → SOCKS engine →
//! reactor socket → Internet`, and back the same way in reverse.

pub mod config;
pub mod protocol;
pub mod reactor;
pub mod socks;
pub mod transport;
pub mod worker;

pub use config::Config;

use std::sync::Arc;
use tokio::sync::watch;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("SOCKS error: {0}")]
    Socks(#[from] socks::SocksError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Process-wide stop signal.
///
/// The only truly process-wide object. Cloned into every long-running task;
/// `trigger()` releases every pending wait so the process can unwind
/// cooperatively.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal every observer to stop. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errs when the sender is gone, and we hold an Arc to it
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_signal_releases_waiters() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());

        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };

        stop.trigger();
        waiter.await.unwrap();
        assert!(stop.is_triggered());
    }
}
