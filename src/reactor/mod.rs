//! TCP socket reactor
//!
//! Owns a dynamic pool of connected target sockets and shuttles bytes
//! between them and the SOCKS engine. Each registered socket gets a read
//! task and a write task draining a per-socket FIFO queue; readiness
//! multiplexing is the runtime's job. Incoming bytes and disconnects are
//! delivered to the owner as [`ReactorEvent`]s over a channel, never from
//! under a lock.
//!
//! Contract highlights:
//! * `send` never blocks the caller and returns `false` for unknown sockets
//! * per-socket write order is FIFO; a partially-written packet completes
//!   before the next one starts
//! * every broken-peer condition surfaces as exactly one `Disconnected`
//! * errors are never propagated synchronously to callers

use crate::StopSignal;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Read buffer size per socket.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-write deadline; a peer that stays unwritable this long is broken.
const WRITE_TIMEOUT: Duration = Duration::from_secs(4);

/// Grace period between shutdown and close on explicit disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(50);

/// Stable identity of a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketToken(u64);

impl SocketToken {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Event delivered to the reactor's owner.
#[derive(Debug)]
pub enum ReactorEvent {
    /// Bytes received from a registered socket; the slice is an exact copy
    /// of what the read returned.
    Data { token: SocketToken, bytes: Bytes },
    /// The peer closed or the socket broke. The socket is already
    /// unregistered when this fires.
    Disconnected { token: SocketToken },
}

struct SocketHandle {
    out_tx: mpsc::UnboundedSender<Bytes>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

struct Inner {
    sockets: HashMap<SocketToken, SocketHandle>,
}

/// The reactor. Cheap to clone; all clones share the socket table.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<ReactorEvent>,
    stop: StopSignal,
}

impl Reactor {
    pub fn new(event_tx: mpsc::UnboundedSender<ReactorEvent>, stop: StopSignal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { sockets: HashMap::new() })),
            event_tx,
            stop,
        }
    }

    /// Register a connected socket and start relaying on it. The returned
    /// token stays valid until a disconnect (explicit or observed).
    pub fn register(&self, stream: TcpStream) -> SocketToken {
        let token = SocketToken::next();
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();

        // the map entry must exist before either task can observe a
        // disconnect, so the tasks are spawned under the lock they would
        // need to remove it
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let read_task = tokio::spawn(read_loop(
                token,
                read_half,
                self.inner.clone(),
                self.event_tx.clone(),
                self.stop.clone(),
            ));
            let write_task = tokio::spawn(write_loop(
                token,
                write_half,
                out_rx,
                self.inner.clone(),
                self.event_tx.clone(),
                self.stop.clone(),
            ));
            inner.sockets.insert(
                token,
                SocketHandle { out_tx, read_task, write_task },
            );
        }
        trace!(?token, "socket registered");
        token
    }

    /// Queue bytes for delivery to the socket. Returns `false` if the token
    /// is unknown. Never blocks.
    pub fn send(&self, token: SocketToken, bytes: Bytes) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.sockets.get(&token) {
            Some(handle) => handle.out_tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Shut the socket down and remove it. No `Disconnected` is emitted:
    /// the caller initiated the teardown and already knows.
    pub fn disconnect_and_unregister(&self, token: SocketToken) {
        if let Some(handle) = self.take(token) {
            // dropping out_tx lets the write task drain, shut down with a
            // short grace and close; the read task is cut immediately
            handle.read_task.abort();
            drop(handle.out_tx);
            trace!(?token, "socket disconnected and unregistered");
        }
    }

    /// Remove a socket without touching it (the peer is already gone).
    pub fn unregister(&self, token: SocketToken) {
        if let Some(handle) = self.take(token) {
            handle.read_task.abort();
            handle.write_task.abort();
        }
    }

    /// Abort every socket. Used on process stop.
    pub fn shutdown_all(&self) {
        let handles: Vec<SocketHandle> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.sockets.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.read_task.abort();
            handle.write_task.abort();
        }
    }

    pub fn socket_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sockets.len()
    }

    fn take(&self, token: SocketToken) -> Option<SocketHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sockets.remove(&token)
    }
}

/// Remove the socket from the table and report the disconnect. The map
/// removal doubles as a once-guard: whichever task loses the race finds the
/// entry gone and stays silent.
fn report_disconnect(
    token: SocketToken,
    inner: &Arc<Mutex<Inner>>,
    event_tx: &mpsc::UnboundedSender<ReactorEvent>,
) {
    let removed = {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sockets.remove(&token)
    };
    if let Some(handle) = removed {
        handle.read_task.abort();
        handle.write_task.abort();
        debug!(?token, "socket disconnected");
        let _ = event_tx.send(ReactorEvent::Disconnected { token });
    }
}

async fn read_loop(
    token: SocketToken,
    mut read_half: OwnedReadHalf,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<ReactorEvent>,
    stop: StopSignal,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = stop.wait() => return,
            res = read_half.read(&mut buffer) => match res {
                Ok(0) | Err(_) => {
                    report_disconnect(token, &inner, &event_tx);
                    return;
                }
                Ok(n) => {
                    let bytes = Bytes::copy_from_slice(&buffer[..n]);
                    if event_tx.send(ReactorEvent::Data { token, bytes }).is_err() {
                        return; // owner gone
                    }
                }
            },
        }
    }
}

async fn write_loop(
    token: SocketToken,
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<ReactorEvent>,
    stop: StopSignal,
) {
    loop {
        let packet = tokio::select! {
            _ = stop.wait() => return,
            packet = out_rx.recv() => packet,
        };
        match packet {
            Some(packet) => {
                match tokio::time::timeout(WRITE_TIMEOUT, write_half.write_all(&packet)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        report_disconnect(token, &inner, &event_tx);
                        return;
                    }
                }
            }
            None => {
                // explicit disconnect: queue drained, part gracefully
                let _ = write_half.shutdown().await;
                tokio::time::sleep(DISCONNECT_GRACE).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(event_tx, StopSignal::new());

        let (registered, mut peer) = pair().await;
        let token = reactor.register(registered);

        assert!(reactor.send(token, Bytes::from_static(b"hello ")));
        assert!(reactor.send(token, Bytes::from_static(b"world")));

        let mut got = vec![0u8; 11];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");

        peer.write_all(b"reply").await.unwrap();
        match event_rx.recv().await.unwrap() {
            ReactorEvent::Data { token: t, bytes } => {
                assert_eq!(t, token);
                assert_eq!(&bytes[..], b"reply");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fifo_write_order() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(event_tx, StopSignal::new());

        let (registered, mut peer) = pair().await;
        let token = reactor.register(registered);

        let mut expected = Vec::new();
        for i in 0..100u32 {
            let chunk = i.to_be_bytes().to_vec();
            expected.extend_from_slice(&chunk);
            assert!(reactor.send(token, chunk.into()));
        }

        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnected_once() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(event_tx, StopSignal::new());

        let (registered, peer) = pair().await;
        let token = reactor.register(registered);
        drop(peer);

        match event_rx.recv().await.unwrap() {
            ReactorEvent::Disconnected { token: t } => assert_eq!(t, token),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(reactor.socket_count(), 0);

        // the token is dead from the caller's perspective
        assert!(!reactor.send(token, Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_send_to_unknown_token_fails() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(event_tx, StopSignal::new());

        let (registered, _peer) = pair().await;
        let token = reactor.register(registered);
        reactor.disconnect_and_unregister(token);

        assert!(!reactor.send(token, Bytes::from_static(b"x")));
        assert_eq!(reactor.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_silent() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(event_tx, StopSignal::new());

        let (registered, mut peer) = pair().await;
        let token = reactor.register(registered);
        reactor.disconnect_and_unregister(token);

        // the peer observes EOF
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

        // no Disconnected event for a caller-initiated teardown
        let got = tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await;
        assert!(got.is_err());
    }
}
