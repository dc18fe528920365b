//! The worker: bridge between the pipe listener and the SOCKS engine
//!
//! Owns the only copies of the channel and client maps and all protocol
//! logic. One pipe instance is one *channel*; a *client* is the logical
//! session formed by up to two channels sharing a 64-bit client id (one
//! carrying reads, one carrying writes — a single duplex channel may carry
//! both). Per client, controller-chosen `socks_id`s map to server-chosen
//! engine tokens, and never leak across clients.
//!
//! Everything runs on one task: pipe events and engine events are drained
//! from their channels in arrival order, frames are decoded per channel and
//! dispatched, and teardown of a configured channel always takes its parent
//! client (both channels, every SOCKS session) with it.

use crate::protocol::{
    extract_next_packet, generate_client_id, make_channel_setup_ack, make_socks,
    make_socks_close, make_socks_disconnected, make_status, DecodeError, FrameBody, SetupFlags,
    INVALID_CLIENT_ID, INVALID_SOCKS_ID, STATUS_OK, STATUS_UNSUPPORTED,
};
use crate::socks::{SocksEngine, SocksEvent, SocksToken};
use crate::transport::{InstanceToken, PipeEvent, PipeServer};
use crate::StopSignal;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Server-side role of a channel: the inverse of the controller's declared
/// setup flags (controller-read means the server writes there).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChannelConfig {
    read: bool,
    write: bool,
}

impl ChannelConfig {
    fn from_peer_flags(flags: SetupFlags) -> Self {
        Self {
            read: flags.write(),
            write: flags.read(),
        }
    }

    fn is_none(&self) -> bool {
        !self.read && !self.write
    }
}

/// One pipe instance as seen by the protocol.
struct Channel {
    client_id: u64,
    config: ChannelConfig,
    input: BytesMut,
    /// Hook for an optional idle-disconnect policy; not acted on.
    #[allow(dead_code)]
    last_recv: Instant,
}

impl Channel {
    fn new() -> Self {
        Self {
            client_id: INVALID_CLIENT_ID,
            config: ChannelConfig::default(),
            input: BytesMut::new(),
            last_recv: Instant::now(),
        }
    }

    /// A channel stays "just connected" until its setup frame lands.
    fn is_just_connected(&self) -> bool {
        self.client_id == INVALID_CLIENT_ID || self.config.is_none()
    }
}

/// The logical client session: up to one read channel, up to one write
/// channel, and the per-client SOCKS session map.
struct Client {
    chan_read: Option<InstanceToken>,
    chan_write: Option<InstanceToken>,
    socks_id_to_token: HashMap<u64, SocksToken>,
}

impl Client {
    fn find_socks_id_by_token(&self, token: SocksToken) -> Option<u64> {
        self.socks_id_to_token
            .iter()
            .find(|(_, &t)| t == token)
            .map(|(&id, _)| id)
    }
}

enum SessionEnd {
    Close,
    Disconnected,
}

/// The multiplexer task state.
pub struct Worker {
    pipe: PipeServer,
    engine: SocksEngine,
    pipe_rx: mpsc::UnboundedReceiver<PipeEvent>,
    socks_rx: mpsc::UnboundedReceiver<SocksEvent>,
    stop: StopSignal,

    channels: HashMap<InstanceToken, Channel>,
    clients: HashMap<u64, Client>,
    token_to_client: HashMap<SocksToken, u64>,

    /// External uninstall procedure, when the environment provides one.
    uninstall_hook: Option<Box<dyn Fn() + Send>>,
}

impl Worker {
    pub fn new(
        pipe: PipeServer,
        pipe_rx: mpsc::UnboundedReceiver<PipeEvent>,
        engine: SocksEngine,
        socks_rx: mpsc::UnboundedReceiver<SocksEvent>,
        stop: StopSignal,
    ) -> Self {
        Self {
            pipe,
            engine,
            pipe_rx,
            socks_rx,
            stop,
            channels: HashMap::new(),
            clients: HashMap::new(),
            token_to_client: HashMap::new(),
            uninstall_hook: None,
        }
    }

    /// Install the external uninstall procedure invoked on UNINSTALL_SELF.
    pub fn set_uninstall_hook(&mut self, hook: Box<dyn Fn() + Send>) {
        self.uninstall_hook = Some(hook);
    }

    /// Drive the multiplexer until the stop signal fires.
    pub async fn run(mut self) {
        info!("worker running");
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                ev = self.pipe_rx.recv() => match ev {
                    Some(ev) => self.on_pipe_event(ev),
                    None => break,
                },
                ev = self.socks_rx.recv() => match ev {
                    Some(ev) => self.on_socks_event(ev),
                    None => break,
                },
            }
        }

        self.pipe.stop_all();
        self.channels.clear();
        self.clients.clear();
        self.token_to_client.clear();
        info!("worker stopped");
    }

    fn on_pipe_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Connected(token) => {
                trace!(?token, "pipe instance connected");
                // a stale channel under this token means a leaked teardown
                self.erase_channel_and_client(token, false);
                self.channels.insert(token, Channel::new());
            }
            PipeEvent::Recv(token, bytes) => {
                let channel = self.channels.entry(token).or_insert_with(Channel::new);
                channel.input.extend_from_slice(&bytes);
                channel.last_recv = Instant::now();
                self.drain_channel(token);
            }
            PipeEvent::Sent(token, queue_depth) => {
                trace!(?token, queue_depth, "pipe instance wrote");
            }
            PipeEvent::Closed(token) => {
                trace!(?token, "pipe instance closed");
                self.erase_channel_and_client(token, true);
            }
        }
    }

    /// Decode and dispatch every complete frame buffered on the channel.
    /// Any decode error or dispatch rejection is fatal to the channel.
    fn drain_channel(&mut self, token: InstanceToken) {
        loop {
            let extracted = match self.channels.get_mut(&token) {
                Some(channel) => extract_next_packet(&mut channel.input),
                None => return,
            };

            match extracted {
                Err(DecodeError::Incomplete) => return,
                Err(e) => {
                    debug!(?token, error = %e, "channel decode error");
                    self.erase_channel_and_client(token, true);
                    return;
                }
                Ok(frame) => {
                    if !self.dispatch_frame(token, frame.uid, frame.body) {
                        self.erase_channel_and_client(token, true);
                        return;
                    }
                }
            }
        }
    }

    /// Returns `false` when the frame is fatal to its channel.
    fn dispatch_frame(&mut self, token: InstanceToken, uid: u32, body: FrameBody) -> bool {
        let just_connected = match self.channels.get(&token) {
            Some(channel) => channel.is_just_connected(),
            None => return false,
        };

        // the first frame must be the channel setup, and only the first
        if just_connected {
            return match body {
                FrameBody::ChannelSetup { client_id, flags } => {
                    self.on_channel_setup(token, uid, client_id, flags)
                }
                _ => {
                    debug!(?token, "first frame was not a channel setup");
                    false
                }
            };
        }

        match body {
            FrameBody::ChannelSetup { .. } => {
                debug!(?token, "second channel setup");
                false
            }
            // the peer must never send these to the server side
            FrameBody::ChannelSetupAck { .. } | FrameBody::Status { .. } => false,
            FrameBody::Ping => self.on_ping(token, uid),
            FrameBody::Socks { socks_id, payload } => self.on_socks_frame(token, socks_id, payload),
            FrameBody::SocksClose { socks_id } => {
                self.on_socks_close_frame(token, uid, socks_id)
            }
            FrameBody::SocksDisconnected { socks_id } => {
                self.on_socks_close_frame(token, uid, socks_id)
            }
            FrameBody::UninstallSelf => {
                self.on_uninstall();
                true
            }
            FrameBody::Unknown { opcode } => self.on_unknown(token, uid, opcode),
        }
    }

    fn on_channel_setup(
        &mut self,
        token: InstanceToken,
        uid: u32,
        requested_id: u64,
        flags: SetupFlags,
    ) -> bool {
        let config = ChannelConfig::from_peer_flags(flags);
        if config.is_none() {
            debug!(?token, "channel setup with no role");
            return false;
        }

        let client_id = if requested_id == INVALID_CLIENT_ID {
            // new client, assign a fresh id
            let mut id = generate_client_id();
            while self.clients.contains_key(&id) {
                id = generate_client_id();
            }
            self.clients.insert(
                id,
                Client {
                    chan_read: config.read.then_some(token),
                    chan_write: config.write.then_some(token),
                    socks_id_to_token: HashMap::new(),
                },
            );
            id
        } else {
            // second channel attaching to an existing client: the
            // complementary role slot must still be free
            let Some(client) = self.clients.get_mut(&requested_id) else {
                debug!(?token, "channel setup for unknown client");
                return false;
            };
            if (config.write && client.chan_write.is_some())
                || (config.read && client.chan_read.is_some())
            {
                debug!(?token, "channel setup role collision");
                return false;
            }
            if config.read {
                client.chan_read = Some(token);
            }
            if config.write {
                client.chan_write = Some(token);
            }
            requested_id
        };

        if let Some(channel) = self.channels.get_mut(&token) {
            channel.client_id = client_id;
            channel.config = config;
        }

        // sent on this channel regardless of its configured role: the
        // requester expects the ack here (one-frame bootstrap exception)
        self.pipe.send(token, make_channel_setup_ack(uid, client_id));
        info!(client_id, ?token, read = config.read, write = config.write, "channel configured");
        true
    }

    fn on_ping(&mut self, token: InstanceToken, uid: u32) -> bool {
        match self.write_channel_of(token) {
            Some(write_token) => {
                self.pipe.send(write_token, make_status(uid, STATUS_OK));
                true
            }
            None => false,
        }
    }

    fn on_socks_frame(&mut self, token: InstanceToken, socks_id: u64, payload: Bytes) -> bool {
        if socks_id == INVALID_SOCKS_ID {
            return true; // reserved sentinel, ignore
        }

        let Some(client_id) = self.client_id_of(token) else {
            return false;
        };
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };

        // socks_id is the controller's name for the session, scoped to this
        // client; the engine token is ours and globally unique, so the same
        // socks_id used by two clients never collides
        let socks_token = match client.socks_id_to_token.get(&socks_id) {
            Some(&existing) => existing,
            None => {
                let fresh = match self.engine.create_client() {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        debug!(client_id, socks_id, error = %e, "engine refused a new session");
                        return false;
                    }
                };
                client.socks_id_to_token.insert(socks_id, fresh);
                self.token_to_client.insert(fresh, client_id);
                trace!(client_id, socks_id, ?fresh, "socks session opened");
                fresh
            }
        };

        // a dead session here is a race with its teardown, not a protocol
        // violation; the frame is dropped
        if let Err(e) = self.engine.push_request(socks_token, payload) {
            debug!(client_id, socks_id, error = %e, "socks request dropped");
        }
        true
    }

    fn on_socks_close_frame(&mut self, token: InstanceToken, uid: u32, socks_id: u64) -> bool {
        let Some(client_id) = self.client_id_of(token) else {
            return false;
        };

        // ack first: the peer must observe the status before any effect of
        // the disconnect
        if let Some(write_token) = self.clients.get(&client_id).and_then(|c| c.chan_write) {
            self.pipe.send(write_token, make_status(uid, STATUS_OK));
        }

        let removed = self
            .clients
            .get_mut(&client_id)
            .and_then(|c| c.socks_id_to_token.remove(&socks_id));
        if let Some(socks_token) = removed {
            self.token_to_client.remove(&socks_token);
            self.engine.disconnect_client(socks_token);
            trace!(client_id, socks_id, "socks session closed by controller");
        }
        true
    }

    fn on_unknown(&mut self, token: InstanceToken, uid: u32, opcode: u8) -> bool {
        debug!(?token, opcode, "unsupported opcode");
        match self.write_channel_of(token) {
            Some(write_token) => {
                self.pipe.send(write_token, make_status(uid, STATUS_UNSUPPORTED));
                true
            }
            None => false,
        }
    }

    fn on_uninstall(&mut self) {
        info!("uninstall requested by controller");
        if let Some(hook) = &self.uninstall_hook {
            hook();
        }
        self.stop.trigger();
    }

    fn on_socks_event(&mut self, event: SocksEvent) {
        match event {
            SocksEvent::Response { token, bytes } => self.on_socks_response(token, bytes),
            SocksEvent::CloseSession { token } => {
                self.propagate_session_end(token, SessionEnd::Close)
            }
            SocksEvent::TargetDisconnected { token } => {
                self.propagate_session_end(token, SessionEnd::Disconnected)
            }
        }
    }

    fn on_socks_response(&mut self, socks_token: SocksToken, bytes: Bytes) {
        let Some(client) = self
            .token_to_client
            .get(&socks_token)
            .and_then(|id| self.clients.get(id))
        else {
            // nobody to route to: tear the orphaned session down
            self.token_to_client.remove(&socks_token);
            self.engine.disconnect_client(socks_token);
            return;
        };

        let Some(socks_id) = client.find_socks_id_by_token(socks_token) else {
            self.token_to_client.remove(&socks_token);
            self.engine.disconnect_client(socks_token);
            return;
        };

        if !bytes.is_empty() {
            if let Some(write_token) = client.chan_write {
                self.pipe.send(write_token, make_socks(socks_id, &bytes));
            }
        }
    }

    /// The engine is done with a session: tell the controller and drop the
    /// mapping so a reused socks_id starts a fresh session.
    fn propagate_session_end(&mut self, socks_token: SocksToken, kind: SessionEnd) {
        let Some(client_id) = self.token_to_client.remove(&socks_token) else {
            return;
        };
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let Some(socks_id) = client.find_socks_id_by_token(socks_token) else {
            return;
        };
        client.socks_id_to_token.remove(&socks_id);

        if let Some(write_token) = client.chan_write {
            let frame = match kind {
                SessionEnd::Close => make_socks_close(socks_id),
                SessionEnd::Disconnected => make_socks_disconnected(socks_id),
            };
            self.pipe.send(write_token, frame);
        }
        trace!(client_id, socks_id, "socks session ended");
    }

    fn client_id_of(&self, token: InstanceToken) -> Option<u64> {
        self.channels
            .get(&token)
            .map(|c| c.client_id)
            .filter(|&id| id != INVALID_CLIENT_ID)
    }

    /// The channel the server may write to for this channel's client. A
    /// not-yet-configured channel answers for itself.
    fn write_channel_of(&self, token: InstanceToken) -> Option<InstanceToken> {
        let channel = self.channels.get(&token)?;
        if channel.client_id == INVALID_CLIENT_ID {
            return Some(token);
        }
        self.clients.get(&channel.client_id)?.chan_write
    }

    /// Drop a channel. Before the handshake only the channel dies; after it,
    /// the whole parent client goes — both channels and every SOCKS session.
    fn erase_channel_and_client(&mut self, token: InstanceToken, disconnect: bool) {
        let Some(channel) = self.channels.remove(&token) else {
            return;
        };

        if channel.client_id == INVALID_CLIENT_ID {
            if disconnect {
                self.pipe.disconnect_instance(token);
            }
        } else {
            self.erase_client(channel.client_id, disconnect);
        }
    }

    fn erase_client(&mut self, client_id: u64, disconnect: bool) {
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        debug!(client_id, "client erased");

        let mut channel_tokens = Vec::new();
        for t in [client.chan_read, client.chan_write].into_iter().flatten() {
            if !channel_tokens.contains(&t) {
                channel_tokens.push(t);
            }
        }
        for t in &channel_tokens {
            self.channels.remove(t);
        }
        if disconnect {
            for t in channel_tokens {
                self.pipe.disconnect_instance(t);
            }
        }

        for (_, socks_token) in client.socks_id_to_token {
            self.token_to_client.remove(&socks_token);
            self.engine.disconnect_client(socks_token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_inverts_peer_flags() {
        // controller reads ⇒ server writes, and vice versa
        let cfg = ChannelConfig::from_peer_flags(SetupFlags::new(SetupFlags::READ));
        assert!(cfg.write && !cfg.read);

        let cfg = ChannelConfig::from_peer_flags(SetupFlags::new(SetupFlags::WRITE));
        assert!(cfg.read && !cfg.write);

        let cfg = ChannelConfig::from_peer_flags(SetupFlags::duplex());
        assert!(cfg.read && cfg.write);

        assert!(ChannelConfig::from_peer_flags(SetupFlags::new(0)).is_none());
    }

    #[test]
    fn test_channel_setup_state() {
        let mut channel = Channel::new();
        assert!(channel.is_just_connected());

        channel.client_id = 42;
        channel.config = ChannelConfig { read: true, write: true };
        assert!(!channel.is_just_connected());
    }

    #[test]
    fn test_client_reverse_session_lookup() {
        let mut client = Client {
            chan_read: None,
            chan_write: None,
            socks_id_to_token: HashMap::new(),
        };
        assert_eq!(client.find_socks_id_by_token(fake_token(1)), None);

        client.socks_id_to_token.insert(7, fake_token(1));
        client.socks_id_to_token.insert(8, fake_token(2));
        assert_eq!(client.find_socks_id_by_token(fake_token(1)), Some(7));
        assert_eq!(client.find_socks_id_by_token(fake_token(2)), Some(8));
    }

    fn fake_token(raw: u64) -> SocksToken {
        SocksToken::from_raw(raw)
    }
}
