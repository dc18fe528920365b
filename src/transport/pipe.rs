//! Pipe instance server
//!
//! Maintains an unbounded pool of accepted pipe instances over any
//! [`Acceptor`]. Every instance gets a stable token, a read loop feeding
//! `Recv` events and a write loop draining a FIFO output queue. The queue
//! depth travels with each `Sent` event so the owner can observe
//! back-pressure per instance.
//!
//! External threads only ever enqueue output or request a disconnect; all
//! instance I/O stays on the instance's own tasks, and events are emitted
//! without any server lock held.

use super::Acceptor;
use crate::StopSignal;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Size of the per-instance input buffer.
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Back-off between accept attempts after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Stable identity of one pipe instance, valid for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceToken(u64);

impl InstanceToken {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Event delivered to the pipe server's owner.
#[derive(Debug)]
pub enum PipeEvent {
    /// A new instance was accepted.
    Connected(InstanceToken),
    /// Bytes arrived on an instance.
    Recv(InstanceToken, Bytes),
    /// One queued packet finished writing; `usize` is the remaining output
    /// queue depth for the instance.
    Sent(InstanceToken, usize),
    /// The instance is gone (peer close, I/O error or explicit disconnect).
    Closed(InstanceToken),
}

struct InstanceHandle {
    out_tx: mpsc::UnboundedSender<Bytes>,
    queue_depth: Arc<AtomicUsize>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

struct Inner {
    // BTreeMap so "first" is the oldest live instance
    instances: BTreeMap<InstanceToken, InstanceHandle>,
}

/// The pipe server. Cheap to clone; all clones share the instance pool.
#[derive(Clone)]
pub struct PipeServer {
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<PipeEvent>,
    stop: StopSignal,
}

impl PipeServer {
    pub fn new(event_tx: mpsc::UnboundedSender<PipeEvent>, stop: StopSignal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { instances: BTreeMap::new() })),
            event_tx,
            stop,
        }
    }

    /// Start the accept loop. Re-arms after every accepted instance and
    /// backs off briefly on accept errors.
    pub fn launch<A: Acceptor + 'static>(&self, mut acceptor: A) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.stop.wait() => break,
                    res = acceptor.accept() => match res {
                        Ok(stream) => server.add_instance(stream),
                        Err(e) => {
                            warn!(error = %e, "pipe accept failed");
                            tokio::select! {
                                _ = server.stop.wait() => break,
                                _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                            }
                        }
                    },
                }
            }
            debug!("pipe accept loop stopped");
        })
    }

    fn add_instance(&self, stream: Box<dyn super::PipeStream>) {
        let token = InstanceToken::next();
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
        let queue_depth = Arc::new(AtomicUsize::new(0));

        // Connected goes out before the read task exists so no Recv or
        // Closed can overtake it on the event channel
        debug!(?token, "pipe instance connected");
        let _ = self.event_tx.send(PipeEvent::Connected(token));

        // the map entry must exist before either task can observe a close,
        // so the tasks are spawned under the lock they would need to
        // remove it
        {
            let mut inner = self.lock();
            let read_task = tokio::spawn(instance_read_loop(
                token,
                read_half,
                self.inner.clone(),
                self.event_tx.clone(),
                self.stop.clone(),
            ));
            let write_task = tokio::spawn(instance_write_loop(
                token,
                write_half,
                out_rx,
                queue_depth.clone(),
                self.inner.clone(),
                self.event_tx.clone(),
                self.stop.clone(),
            ));
            inner.instances.insert(
                token,
                InstanceHandle { out_tx, queue_depth, read_task, write_task },
            );
        }
    }

    /// Queue bytes on one instance. Returns `false` if the token is unknown.
    /// Never blocks.
    pub fn send(&self, token: InstanceToken, packet: Bytes) -> bool {
        let inner = self.lock();
        match inner.instances.get(&token) {
            Some(handle) => {
                handle.queue_depth.fetch_add(1, Ordering::Relaxed);
                if handle.out_tx.send(packet).is_ok() {
                    true
                } else {
                    handle.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    false
                }
            }
            None => false,
        }
    }

    /// Queue bytes on every live instance; returns how many took it.
    pub fn broadcast(&self, packet: Bytes) -> usize {
        let tokens: Vec<InstanceToken> = {
            let inner = self.lock();
            inner.instances.keys().copied().collect()
        };
        tokens
            .into_iter()
            .filter(|&t| self.send(t, packet.clone()))
            .count()
    }

    /// Queue bytes on the oldest live instance.
    pub fn send_to_first(&self, packet: Bytes) -> bool {
        let first = {
            let inner = self.lock();
            inner.instances.keys().next().copied()
        };
        match first {
            Some(token) => self.send(token, packet),
            None => false,
        }
    }

    /// Output queue depth of one instance, or `None` for unknown tokens.
    pub fn output_queue_size(&self, token: InstanceToken) -> Option<usize> {
        let inner = self.lock();
        inner
            .instances
            .get(&token)
            .map(|h| h.queue_depth.load(Ordering::Relaxed))
    }

    /// Drop one instance. Fires `Closed` for it. Returns `false` if the
    /// token is unknown.
    pub fn disconnect_instance(&self, token: InstanceToken) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.instances.remove(&token)
        };
        match removed {
            Some(handle) => {
                handle.read_task.abort();
                // the write task drains what is queued, then shuts down
                drop(handle.out_tx);
                debug!(?token, "pipe instance disconnected");
                let _ = self.event_tx.send(PipeEvent::Closed(token));
                true
            }
            None => false,
        }
    }

    /// Drop every instance without emitting events. Used on process stop.
    pub fn stop_all(&self) {
        let handles: Vec<InstanceHandle> = {
            let mut inner = self.lock();
            let tokens: Vec<InstanceToken> = inner.instances.keys().copied().collect();
            tokens
                .into_iter()
                .filter_map(|t| inner.instances.remove(&t))
                .collect()
        };
        for handle in handles {
            handle.read_task.abort();
            handle.write_task.abort();
        }
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Remove the instance and fire `Closed`. Map removal doubles as the
/// exactly-once guard between the read task, the write task and explicit
/// disconnects.
fn report_closed(
    token: InstanceToken,
    inner: &Arc<Mutex<Inner>>,
    event_tx: &mpsc::UnboundedSender<PipeEvent>,
) {
    let removed = {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.instances.remove(&token)
    };
    if let Some(handle) = removed {
        handle.read_task.abort();
        handle.write_task.abort();
        debug!(?token, "pipe instance closed");
        let _ = event_tx.send(PipeEvent::Closed(token));
    }
}

async fn instance_read_loop(
    token: InstanceToken,
    mut read_half: ReadHalf<Box<dyn super::PipeStream>>,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<PipeEvent>,
    stop: StopSignal,
) {
    let mut buffer = vec![0u8; IO_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = stop.wait() => return,
            res = read_half.read(&mut buffer) => match res {
                Ok(0) | Err(_) => {
                    report_closed(token, &inner, &event_tx);
                    return;
                }
                Ok(n) => {
                    trace!(?token, bytes = n, "pipe instance recv");
                    let packet = Bytes::copy_from_slice(&buffer[..n]);
                    if event_tx.send(PipeEvent::Recv(token, packet)).is_err() {
                        return; // owner gone
                    }
                }
            },
        }
    }
}

async fn instance_write_loop(
    token: InstanceToken,
    mut write_half: WriteHalf<Box<dyn super::PipeStream>>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    queue_depth: Arc<AtomicUsize>,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<PipeEvent>,
    stop: StopSignal,
) {
    loop {
        let packet = tokio::select! {
            _ = stop.wait() => return,
            packet = out_rx.recv() => packet,
        };
        match packet {
            Some(packet) => {
                if write_half.write_all(&packet).await.is_err() {
                    report_closed(token, &inner, &event_tx);
                    return;
                }
                let depth = queue_depth
                    .fetch_sub(1, Ordering::Relaxed)
                    .saturating_sub(1);
                trace!(?token, bytes = packet.len(), depth, "pipe instance sent");
                let _ = event_tx.send(PipeEvent::Sent(token, depth));
            }
            None => {
                // explicit disconnect, queue fully drained
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}
