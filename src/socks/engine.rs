//! Packet-driven SOCKS5 engine
//!
//! Sessions are fed one packet at a time through [`SocksEngine::push_request`]
//! and walk the usual SOCKS5 ladder:
//!
//! ```text
//! NEW ──greeting──▶ NEED_AUTH or NEED_CMD
//! NEED_AUTH ──user/pass (accepted unconditionally)──▶ NEED_CMD
//! NEED_CMD ──CONNECT──▶ CONNECTED
//! CONNECTED ──relay──▶ CONNECTED
//! any ──error/close──▶ torn down, owner notified
//! ```
//!
//! Two tasks drive the engine: one drains queued requests in FIFO order
//! (including the bounded-time connect, which intentionally serializes
//! session setup), the other relays target-side reactor events so
//! established sessions keep flowing while a connect is in progress.

use super::{
    Address, AuthMethod, Reply, SocksError, ADDR_DOMAIN, ADDR_IPV4, ADDR_IPV6, CMD_CONNECT,
    SOCKS_VERSION,
};
use crate::reactor::{Reactor, ReactorEvent, SocketToken};
use crate::StopSignal;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Server-chosen identity of one SOCKS session. Globally unique within the
/// engine; never exposed across clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocksToken(u64);

#[cfg(test)]
impl SocksToken {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Engine timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded wait for the non-blocking connect to a target.
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(6),
        }
    }
}

/// Event delivered to the engine's owner (the worker).
#[derive(Debug)]
pub enum SocksEvent {
    /// A SOCKS-layer response or relayed target bytes for the session.
    Response { token: SocksToken, bytes: Bytes },
    /// The engine gave up on the session (malformed packet, failed
    /// connect); the owner should propagate a close to the controller.
    CloseSession { token: SocksToken },
    /// The target side of an established session disconnected.
    TargetDisconnected { token: SocksToken },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    NewClient,
    NeedAuth,
    NeedCmd,
    Connected,
}

struct Session {
    state: SessionState,
    socket: Option<SocketToken>,
    remote_label: String,
}

struct State {
    sessions: HashMap<SocksToken, Session>,
    by_socket: HashMap<SocketToken, SocksToken>,
}

struct Request {
    token: SocksToken,
    packet: Bytes,
}

/// The SOCKS engine handle. Cheap to clone; all clones share one session
/// table and one request queue.
#[derive(Clone)]
pub struct SocksEngine {
    state: Arc<Mutex<State>>,
    req_tx: mpsc::UnboundedSender<Request>,
    reactor: Reactor,
}

impl SocksEngine {
    /// Create the engine and start its tasks. SOCKS-layer output and session
    /// lifecycle notifications arrive on `event_tx`.
    pub fn new(
        event_tx: mpsc::UnboundedSender<SocksEvent>,
        config: EngineConfig,
        stop: StopSignal,
    ) -> Self {
        let (reactor_tx, reactor_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(reactor_tx, stop.clone());

        let state = Arc::new(Mutex::new(State {
            sessions: HashMap::new(),
            by_socket: HashMap::new(),
        }));

        let (req_tx, req_rx) = mpsc::unbounded_channel();

        let engine = Self {
            state,
            req_tx,
            reactor,
        };

        tokio::spawn(request_task(
            engine.clone(),
            event_tx.clone(),
            config,
            req_rx,
            stop.clone(),
        ));
        tokio::spawn(reactor_event_task(engine.clone(), event_tx, reactor_rx, stop));

        engine
    }

    /// Allocate a fresh session in the NEW state. Fails only when the
    /// session table is saturated, which is effectively never.
    pub fn create_client(&self) -> Result<SocksToken, SocksError> {
        let mut state = self.lock();

        // paranoid check
        if state.sessions.len() >= (u32::MAX as usize) {
            return Err(SocksError::TableSaturated);
        }

        let mut rng = rand::thread_rng();
        let token = loop {
            let raw: u64 = rng.gen();
            if raw == 0 || raw == u64::MAX {
                continue;
            }
            let token = SocksToken(raw);
            if !state.sessions.contains_key(&token) {
                break token;
            }
        };

        state.sessions.insert(
            token,
            Session {
                state: SessionState::NewClient,
                socket: None,
                remote_label: String::new(),
            },
        );
        trace!(?token, "socks session created");
        Ok(token)
    }

    /// Queue one SOCKS-layer input packet for the session. Consumed in FIFO
    /// order by the engine task. Never blocks; fails when the token names
    /// no live session.
    pub fn push_request(&self, token: SocksToken, packet: Bytes) -> Result<(), SocksError> {
        if !self.lock().sessions.contains_key(&token) {
            return Err(SocksError::UnknownSession);
        }
        let _ = self.req_tx.send(Request { token, packet });
        Ok(())
    }

    /// Tear the session down. No notification is emitted: the caller
    /// initiated this and already knows.
    pub fn disconnect_client(&self, token: SocksToken) {
        self.erase_session(token);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the session and disconnect its target socket, if any. The
    /// reactor call happens after the lock is released.
    fn erase_session(&self, token: SocksToken) {
        let session = {
            let mut state = self.lock();
            match state.sessions.remove(&token) {
                Some(session) => {
                    if let Some(sock) = session.socket {
                        state.by_socket.remove(&sock);
                    }
                    session
                }
                None => return,
            }
        };
        if let Some(sock) = session.socket {
            self.reactor.disconnect_and_unregister(sock);
        }
        debug!(?token, remote = %session.remote_label, "socks session erased");
    }

    fn session_state(&self, token: SocksToken) -> Option<SessionState> {
        self.lock().sessions.get(&token).map(|s| s.state)
    }

    fn set_session_state(&self, token: SocksToken, new_state: SessionState) {
        if let Some(session) = self.lock().sessions.get_mut(&token) {
            session.state = new_state;
        }
    }

    fn session_socket(&self, token: SocksToken) -> Option<SocketToken> {
        self.lock().sessions.get(&token).and_then(|s| s.socket)
    }
}

/// Drain queued session inputs in arrival order.
async fn request_task(
    engine: SocksEngine,
    event_tx: mpsc::UnboundedSender<SocksEvent>,
    config: EngineConfig,
    mut req_rx: mpsc::UnboundedReceiver<Request>,
    stop: StopSignal,
) {
    loop {
        let request = tokio::select! {
            _ = stop.wait() => break,
            req = req_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let token = request.token;
        let Some(session_state) = engine.session_state(token) else {
            // session erased while the request sat in the queue
            continue;
        };

        let keep = match session_state {
            SessionState::NewClient => on_greeting(&engine, &event_tx, token, &request.packet),
            SessionState::NeedAuth => on_auth(&engine, &event_tx, token, &request.packet),
            SessionState::NeedCmd => {
                on_connect_cmd(&engine, &event_tx, &config, token, &request.packet).await
            }
            SessionState::Connected => on_relay(&engine, token, request.packet),
        };

        if !keep {
            // reply already sent where one applies; ask the owner to
            // propagate the close, then drop the session
            let _ = event_tx.send(SocksEvent::CloseSession { token });
            engine.erase_session(token);
        }
    }
}

/// Relay target-side reactor events. Runs independently of the request task
/// so established sessions are not stalled by an in-flight connect.
async fn reactor_event_task(
    engine: SocksEngine,
    event_tx: mpsc::UnboundedSender<SocksEvent>,
    mut reactor_rx: mpsc::UnboundedReceiver<ReactorEvent>,
    stop: StopSignal,
) {
    loop {
        let event = tokio::select! {
            _ = stop.wait() => break,
            ev = reactor_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        match event {
            ReactorEvent::Data { token: sock, bytes } => {
                let session = { engine.lock().by_socket.get(&sock).copied() };
                match session {
                    Some(token) => {
                        let _ = event_tx.send(SocksEvent::Response { token, bytes });
                    }
                    None => {
                        // session already gone, drop the orphaned socket
                        engine.reactor.disconnect_and_unregister(sock);
                    }
                }
            }
            ReactorEvent::Disconnected { token: sock } => {
                let session = { engine.lock().by_socket.get(&sock).copied() };
                if let Some(token) = session {
                    engine.erase_session(token);
                    let _ = event_tx.send(SocksEvent::TargetDisconnected { token });
                }
            }
        }
    }
}

fn send_response(
    event_tx: &mpsc::UnboundedSender<SocksEvent>,
    token: SocksToken,
    bytes: Vec<u8>,
) {
    let _ = event_tx.send(SocksEvent::Response {
        token,
        bytes: Bytes::from(bytes),
    });
}

/// The fixed CONNECT reply: always IPv4-form with a zeroed address and
/// port, regardless of the requested address type. Controllers depend on
/// this exact 10-byte layout.
fn make_reply(code: Reply) -> Vec<u8> {
    vec![SOCKS_VERSION, code as u8, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Method-selection greeting. Favors no-auth, supports user/pass.
fn on_greeting(
    engine: &SocksEngine,
    event_tx: &mpsc::UnboundedSender<SocksEvent>,
    token: SocksToken,
    packet: &[u8],
) -> bool {
    if packet.len() >= 3 && packet[0] == SOCKS_VERSION {
        let offered = packet[1] as usize;
        let methods = &packet[2..packet.len().min(2 + offered)];

        if methods.contains(&(AuthMethod::NoAuth as u8)) {
            engine.set_session_state(token, SessionState::NeedCmd);
            send_response(event_tx, token, vec![SOCKS_VERSION, AuthMethod::NoAuth as u8]);
            return true;
        }
        if methods.contains(&(AuthMethod::UsernamePassword as u8)) {
            engine.set_session_state(token, SessionState::NeedAuth);
            send_response(
                event_tx,
                token,
                vec![SOCKS_VERSION, AuthMethod::UsernamePassword as u8],
            );
            return true;
        }
    }

    send_response(
        event_tx,
        token,
        vec![SOCKS_VERSION, AuthMethod::NoAcceptable as u8],
    );
    false
}

/// Username/password subnegotiation. Parsed for well-formedness, accepted
/// unconditionally.
fn on_auth(
    engine: &SocksEngine,
    event_tx: &mpsc::UnboundedSender<SocksEvent>,
    token: SocksToken,
    packet: &[u8],
) -> bool {
    if packet.len() >= 5 && packet[0] == 1 && packet[1] >= 1 {
        let user_len = packet[1] as usize;
        if packet.len() >= 4 + user_len {
            let pass_len = packet[2 + user_len] as usize;
            if packet.len() == 3 + user_len + pass_len {
                let user = String::from_utf8_lossy(&packet[2..2 + user_len]);
                let pass = String::from_utf8_lossy(&packet[3 + user_len..3 + user_len + pass_len]);
                debug!(%user, %pass, "socks auth accepted");

                engine.set_session_state(token, SessionState::NeedCmd);
                send_response(event_tx, token, vec![1, 0]);
                return true;
            }
        }
    }

    send_response(event_tx, token, vec![1, 1]);
    false
}

/// CONNECT command: parse the target, resolve, connect with a bounded wait,
/// then hand the socket to the reactor.
async fn on_connect_cmd(
    engine: &SocksEngine,
    event_tx: &mpsc::UnboundedSender<SocksEvent>,
    config: &EngineConfig,
    token: SocksToken,
    packet: &[u8],
) -> bool {
    let addr = match parse_connect(packet) {
        Ok(addr) => addr,
        Err(code) => {
            send_response(event_tx, token, make_reply(code));
            return false;
        }
    };

    debug!(%addr, "socks CONNECT");

    match connect_target(&addr, config).await {
        Ok(stream) => {
            let sock = engine.reactor.register(stream);

            let attached = {
                let mut guard = engine.lock();
                let state = &mut *guard;
                match state.sessions.get_mut(&token) {
                    Some(session) => {
                        session.socket = Some(sock);
                        session.state = SessionState::Connected;
                        session.remote_label = addr.to_string();
                        state.by_socket.insert(sock, token);
                        true
                    }
                    None => false,
                }
            };

            if !attached {
                // session erased while we were connecting
                engine.reactor.disconnect_and_unregister(sock);
                return true;
            }

            send_response(event_tx, token, make_reply(Reply::Succeeded));
            true
        }
        Err(code) => {
            warn!(%addr, ?code, "socks CONNECT failed");
            send_response(event_tx, token, make_reply(code));
            false
        }
    }
}

/// Established session: every inbound packet is a blind send to the target.
fn on_relay(engine: &SocksEngine, token: SocksToken, packet: Bytes) -> bool {
    match engine.session_socket(token) {
        Some(sock) => engine.reactor.send(sock, packet),
        None => false,
    }
}

/// Parse a CONNECT request into a target address.
fn parse_connect(packet: &[u8]) -> Result<Address, Reply> {
    if packet.len() < 10 || packet[0] != SOCKS_VERSION || packet[2] != 0 {
        return Err(Reply::GeneralFailure);
    }
    if packet[1] != CMD_CONNECT {
        return Err(Reply::CommandNotSupported);
    }

    match packet[3] {
        ADDR_IPV4 => {
            let required = 10;
            if packet.len() < required {
                return Err(Reply::GeneralFailure);
            }
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&packet[4..8]);
            let port = u16::from_be_bytes([packet[required - 2], packet[required - 1]]);
            Ok(Address::Ipv4(ip, port))
        }
        ADDR_IPV6 => {
            let required = 22;
            if packet.len() < required {
                return Err(Reply::GeneralFailure);
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&packet[4..20]);
            let port = u16::from_be_bytes([packet[required - 2], packet[required - 1]]);
            Ok(Address::Ipv6(ip, port))
        }
        ADDR_DOMAIN => {
            let name_len = packet[4] as usize;
            let required = 7 + name_len;
            if name_len == 0 || packet.len() < required {
                return Err(Reply::GeneralFailure);
            }
            let name = String::from_utf8_lossy(&packet[5..5 + name_len]).to_string();
            let port = u16::from_be_bytes([packet[required - 2], packet[required - 1]]);
            Ok(Address::Domain(name, port))
        }
        _ => Err(Reply::AddressTypeNotSupported),
    }
}

/// Resolve the target (stream sockets, any family) and try each candidate
/// address in turn with a bounded connect. The first failure's reply code
/// is kept if every candidate fails.
async fn connect_target(addr: &Address, config: &EngineConfig) -> Result<TcpStream, Reply> {
    let candidates: Vec<SocketAddr> = match addr {
        Address::Ipv4(ip, port) => vec![SocketAddr::from((Ipv4Addr::from(*ip), *port))],
        Address::Ipv6(ip, port) => vec![SocketAddr::from((Ipv6Addr::from(*ip), *port))],
        Address::Domain(name, port) => {
            match tokio::net::lookup_host((name.as_str(), *port)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    debug!(%name, error = %e, "name resolution failed");
                    return Err(Reply::GeneralFailure);
                }
            }
        }
    };

    let mut status: Option<Reply> = None;

    for candidate in candidates {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%candidate, error = %e, "connect failed");
                status.get_or_insert(io_error_to_reply(&e));
            }
            Err(_) => {
                debug!(%candidate, "connect timed out");
                status.get_or_insert(Reply::TtlExpired);
            }
        }
    }

    Err(status.unwrap_or(Reply::GeneralFailure))
}

fn io_error_to_reply(e: &std::io::Error) -> Reply {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NetworkDown | ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
        ErrorKind::HostUnreachable => Reply::HostUnreachable,
        ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
        ErrorKind::Unsupported => Reply::AddressTypeNotSupported,
        ErrorKind::TimedOut => Reply::TtlExpired,
        _ => Reply::GeneralFailure,
    }
}
