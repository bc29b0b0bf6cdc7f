//! Per-tunnel protocol state: the identification handshake, liveness timers,
//! reconnect policy, and the DATA flow-control dance between one TCP connection
//! and the local sockets multiplexed over it.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace, warn};
use tunsock_reactor::{ConnEvent, Connection, Tag};

use crate::error::TunnelError;
use crate::frame::{
    encode_bye, encode_connect, encode_data_header, encode_hello, encode_ident, encode_ping,
    encode_pong, DecodedItem, FrameDecoder, Role,
};
use crate::registry::{ClientRegistry, ClientSpec};

/// Ticks (at the reactor's tick interval, nominally 5000 ms) before an
/// unacknowledged IDENT handshake is abandoned.
pub const IDENTTICKS: u32 = 4;
/// Ticks of silence before a PING is sent.
pub const PINGTICKS: u32 = 18;
/// Ticks of silence before an unresponsive tunnel is closed.
pub const CLOSETICKS: u32 = 20;
/// Ticks to wait before retrying a failed dial.
pub const RECONNTICKS: u32 = 6;
/// Ticks a reverse-DNS lookup for a peer's remote-address label is given
/// before the connection falls back to keeping only the numeric form.
pub const RESOLVTICKS: u32 = 4;

/// Completion tag for writes that carry no forwarding obligation: IDENT, PING,
/// PONG, HELLO, CONNECT, BYE frames. Chosen out of the `u16` range any real
/// client number can occupy, so it never collides with one.
const CONTROL_TAG: Tag = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingIdent,
    Established,
}

/// What to do after feeding a batch of inbound bytes or dispatching a tick —
/// the caller (the [`crate::engine`] glue) is the one holding the reactor and
/// the local-socket dialer, so state-machine decisions that need either are
/// surfaced here instead of being acted on directly.
#[derive(Debug)]
pub enum Action {
    /// Dial a new local connection for this client id (socket-client side,
    /// reacting to a HELLO).
    DialLocal(u16),
    /// The peer confirmed CONNECT for this client id (socket-server side): the
    /// local connection's own mode has already moved past `Wait`, but read
    /// dispatch for its fd still needs to be armed by whoever owns the
    /// reactor registration.
    ActivateLocal(u16),
    /// The tunnel wants to be torn down: log, unregister, drop.
    CloseTunnel,
}

pub struct TunnelEngine {
    own_role: Role,
    /// True if this peer is the socket-server (listens on the domain socket
    /// and emits HELLO/expects CONNECT); false if it is the socket-client
    /// (receives HELLO, dials locally, emits CONNECT).
    is_socket_server: bool,
    ident_sent: bool,
    phase: Phase,
    decoder: FrameDecoder,
    registry: ClientRegistry,
    idle_ticks: u32,
    nwriteconns: u32,
    tcp: Rc<RefCell<Connection>>,
}

impl TunnelEngine {
    /// `send_ident_immediately` is true for the accepting side of a TCP
    /// connection, false for the dialing side (which waits silently for the
    /// peer's IDENT first, per the handshake rule).
    pub fn new(
        own_role: Role,
        is_socket_server: bool,
        tcp: Rc<RefCell<Connection>>,
        send_ident_immediately: bool,
    ) -> Self {
        let mut engine = Self {
            own_role,
            is_socket_server,
            ident_sent: false,
            phase: Phase::AwaitingIdent,
            decoder: FrameDecoder::new(),
            registry: ClientRegistry::new(),
            idle_ticks: 0,
            nwriteconns: 0,
            tcp,
        };
        if send_ident_immediately {
            engine.send_ident();
        }
        engine
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    pub fn tcp(&self) -> &Rc<RefCell<Connection>> {
        &self.tcp
    }

    fn send_ident(&mut self) {
        let frame = encode_ident(self.own_role);
        let _ = self
            .tcp
            .borrow_mut()
            .write(Rc::from(&frame[..]), CONTROL_TAG);
        self.ident_sent = true;
    }

    /// Drain and act on whatever the TCP [`Connection`] has queued since the
    /// last call: readable bytes are fed to the decoder, `DataSent` completions
    /// close out forwarding accounting, `Closed` tears the tunnel down.
    pub fn drain_tcp_events(&mut self) -> Result<Vec<Action>, TunnelError> {
        let events: Vec<ConnEvent> = self.tcp.borrow_mut().drain_events().collect();
        let mut actions = Vec::new();
        for event in events {
            match event {
                ConnEvent::Connected => {
                    trace!("tcp tunnel connected");
                }
                ConnEvent::Closed => {
                    actions.push(Action::CloseTunnel);
                }
                ConnEvent::DataReceived { offset, size } => {
                    self.idle_ticks = 0;
                    let bytes = self.tcp.borrow().read_buf_as_rc(offset, size);
                    self.handle_inbound(&bytes, &mut actions)?;
                }
                ConnEvent::DataSent { tag } => {
                    if tag == CONTROL_TAG {
                        continue;
                    }
                    // A local->tcp forwarded slice finished writing; un-gate
                    // the local socket that produced it.
                    self.confirm_local_forward(tag as u16);
                }
            }
        }
        // Inbound reads that forwarded no DATA to a local socket (IDENT,
        // PING/PONG, HELLO/CONNECT/BYE) never increment nwriteconns, so
        // nothing else would clear the read gate on_readable just set.
        if self.nwriteconns == 0 {
            self.tcp.borrow_mut().confirm_data_received();
        }
        Ok(actions)
    }

    fn handle_inbound(&mut self, bytes: &[u8], actions: &mut Vec<Action>) -> Result<(), TunnelError> {
        let registry = &mut self.registry;
        let tcp = &self.tcp;
        let phase = &mut self.phase;
        let own_role = self.own_role;
        let is_socket_server = self.is_socket_server;
        let ident_sent = &mut self.ident_sent;
        let idle_ticks = &mut self.idle_ticks;
        let nwriteconns = &mut self.nwriteconns;
        let mut pending_err = None;

        self.decoder.feed(bytes, |item| {
            if pending_err.is_some() {
                return;
            }
            match item {
                DecodedItem::Ident(peer_role) => {
                    if peer_role == own_role {
                        pending_err = Some(TunnelError::RoleMismatch);
                        return;
                    }
                    *phase = Phase::Established;
                    *idle_ticks = 0;
                    if !*ident_sent {
                        let frame = encode_ident(own_role);
                        let _ = tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
                        *ident_sent = true;
                    }
                }
                DecodedItem::Ping => {
                    let frame = encode_pong();
                    let _ = tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
                }
                DecodedItem::Pong => {}
                DecodedItem::Hello(id) => {
                    if is_socket_server {
                        warn!("HELLO received on the socket-server side, closing tunnel");
                        pending_err = Some(TunnelError::HelloOnServerSide);
                        return;
                    }
                    actions.push(Action::DialLocal(id));
                }
                DecodedItem::Connect(id) => {
                    if !is_socket_server {
                        warn!("CONNECT received on the socket-client side, closing tunnel");
                        pending_err = Some(TunnelError::ConnectOnClientSide);
                        return;
                    }
                    if let Some(spec) = registry.get_mut(id) {
                        spec.connected = true;
                        spec.sock_conn.borrow_mut().activate();
                        actions.push(Action::ActivateLocal(id));
                    }
                }
                DecodedItem::Bye(id) => {
                    if let Some(spec) = registry.release(id) {
                        spec.sock_conn.borrow_mut().close();
                    }
                }
                DecodedItem::DataChunk { id, chunk } => {
                    if chunk.is_empty() {
                        return;
                    }
                    if let Some(spec) = registry.get(id) {
                        let copy: Rc<[u8]> = Rc::from(chunk);
                        if spec.sock_conn.borrow_mut().write(copy, id as Tag).is_ok() {
                            *nwriteconns += 1;
                        }
                    }
                }
            }
        })?;

        if let Some(err) = pending_err {
            return Err(err);
        }
        Ok(())
    }

    /// Called once per reactor tick. Advances liveness and reconnect timers.
    pub fn on_tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.idle_ticks += 1;
        match self.phase {
            Phase::AwaitingIdent => {
                if self.idle_ticks >= IDENTTICKS {
                    debug!("IDENT handshake timed out");
                    actions.push(Action::CloseTunnel);
                }
            }
            Phase::Established => {
                if self.idle_ticks == PINGTICKS {
                    let frame = encode_ping();
                    let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
                } else if self.idle_ticks >= CLOSETICKS {
                    warn!("tunnel unresponsive, closing");
                    actions.push(Action::CloseTunnel);
                }
            }
        }
        actions
    }

    /// A local socket multiplexed over this tunnel produced `size` bytes at
    /// `offset` in its own read buffer (`offset` equal to the 5-byte framing
    /// prefix reserved for it). Prepends the `DATA` header and forwards the
    /// combined buffer on the tunnel, tagged by the originating client id.
    pub fn forward_local_data(&mut self, conn: &Rc<RefCell<Connection>>, id: u16, offset: usize, size: usize) {
        let combined = {
            let mut c = conn.borrow_mut();
            let header = encode_data_header(id, size as u16);
            c.read_buf_prefix_mut(offset).copy_from_slice(&header);
            c.read_buf_as_rc(0, offset + size)
        };
        if self.tcp.borrow_mut().write(combined, id as Tag).is_err() {
            warn!("tunnel write queue full, dropping forwarded slice for client {id}");
        }
    }

    /// The tunnel's combined write carrying a local socket's slice finished;
    /// un-gate that socket's read path so it can produce more.
    pub fn confirm_local_forward(&mut self, id: u16) {
        if let Some(spec) = self.registry.get_mut(id) {
            spec.sock_conn.borrow_mut().confirm_data_received();
        }
    }

    /// A local socket finished writing out a slice forwarded from TCP (its
    /// `DataSent` carried the client id as tag). Once every socket a DATA
    /// frame touched has reported back, un-gate the tunnel's read path.
    pub fn on_local_data_sent(&mut self, _id: u16) {
        self.nwriteconns = self.nwriteconns.saturating_sub(1);
        if self.nwriteconns == 0 {
            self.tcp.borrow_mut().confirm_data_received();
        }
    }

    /// Allocate a slot for a freshly accepted local connection (socket-server
    /// side) and announce it on the tunnel with HELLO.
    pub fn hello_new_local(&mut self, sock_conn: Rc<RefCell<Connection>>) -> u16 {
        let id = self.registry.allocate(|id| ClientSpec {
            clientno: id,
            sock_conn,
            connected: true,
        });
        let frame = encode_hello(id);
        let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
        id
    }

    /// The local dial triggered by an inbound HELLO finished. On success,
    /// register the connection and announce CONNECT; on failure, send BYE and
    /// free the slot.
    pub fn complete_local_dial(&mut self, id: u16, dialed: Result<Rc<RefCell<Connection>>, std::io::Error>) {
        match dialed {
            Ok(sock_conn) => {
                let spec = ClientSpec {
                    clientno: id,
                    sock_conn,
                    connected: true,
                };
                if self.registry.register_at(id, |_| spec).is_err() {
                    warn!("peer reused live client slot {id}");
                    let frame = encode_bye(id);
                    let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
                    return;
                }
                let frame = encode_connect(id);
                let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
            }
            Err(e) => {
                debug!("local dial for client {id} failed: {e}");
                let frame = encode_bye(id);
                let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
            }
        }
    }

    /// A local socket we're multiplexing closed on its own (not by peer BYE);
    /// free its slot and tell the peer.
    pub fn local_closed(&mut self, id: u16) {
        if self.registry.release(id).is_some() {
            let frame = encode_bye(id);
            let _ = self.tcp.borrow_mut().write(Rc::from(&frame[..]), CONTROL_TAG);
        }
    }

    /// The TCP tunnel is gone: close every local socket it was carrying.
    pub fn teardown_locals(&mut self) {
        for spec in self.registry.iter() {
            spec.sock_conn.borrow_mut().close();
        }
    }
}

/// Write the fixed `"busy.\n"` rejection onto a second inbound TCP peer while
/// one tunnel is already active, tagged so the caller can close once it's
/// flushed.
pub fn reject_busy(conn: &Rc<RefCell<Connection>>) {
    let _ = conn.borrow_mut().write(Rc::from(&b"busy.\n"[..]), CONTROL_TAG);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use tunsock_reactor::Mode;

    fn tcp_pair() -> (Rc<RefCell<Connection>>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::new(tunsock_reactor::Transport::Unix(a), Mode::Normal, 0).unwrap();
        (Rc::new(RefCell::new(conn)), b)
    }

    fn local_pair() -> (Rc<RefCell<Connection>>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::new(tunsock_reactor::Transport::Unix(a), Mode::Normal, 5).unwrap();
        (Rc::new(RefCell::new(conn)), b)
    }

    fn drain_wire(peer: &mut UnixStream) -> Vec<u8> {
        use std::io::Read;
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 256];
        let mut out = Vec::new();
        loop {
            match peer.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    #[test]
    fn accepting_side_sends_ident_immediately_and_completes_handshake() {
        let (tcp, mut peer) = tcp_pair();
        let mut engine = TunnelEngine::new(Role::Server, true, tcp.clone(), true);
        tcp.borrow_mut().on_writable();
        assert_eq!(drain_wire(&mut peer), vec![0x49, 0x53]);

        use std::io::Write;
        peer.write_all(&[0x49, 0x43]).unwrap();
        tcp.borrow_mut().on_readable();
        let actions = engine.drain_tcp_events().unwrap();
        assert!(actions.is_empty());
        assert_eq!(engine.phase, Phase::Established);
    }

    #[test]
    fn hello_then_connect_marks_slot_connected_and_activates_local() {
        let (tcp, mut peer) = tcp_pair();
        let (local, _local_peer) = local_pair();
        local.borrow_mut().mode();
        let mut engine = TunnelEngine::new(Role::Client, true, tcp.clone(), false);
        let id = engine.hello_new_local(local.clone());
        tcp.borrow_mut().on_writable();
        assert_eq!(drain_wire(&mut peer)[0], 0x48);

        use std::io::Write;
        peer.write_all(&encode_connect(id)).unwrap();
        tcp.borrow_mut().on_readable();
        engine.drain_tcp_events().unwrap();
        assert!(engine.registry().get(id).unwrap().connected);
    }

    #[test]
    fn bye_releases_slot_and_closes_local_socket() {
        let (tcp, mut peer) = tcp_pair();
        let (local, _local_peer) = local_pair();
        let mut engine = TunnelEngine::new(Role::Client, true, tcp.clone(), false);
        let id = engine.hello_new_local(local.clone());
        tcp.borrow_mut().on_writable();
        drain_wire(&mut peer);

        use std::io::Write;
        peer.write_all(&encode_bye(id)).unwrap();
        tcp.borrow_mut().on_readable();
        engine.drain_tcp_events().unwrap();

        assert!(engine.registry().get(id).is_none());
        assert!(local.borrow().is_closed());
    }

    #[test]
    fn ping_triggers_immediate_pong() {
        let (tcp, mut peer) = tcp_pair();
        let mut engine = TunnelEngine::new(Role::Server, true, tcp.clone(), false);
        use std::io::Write;
        peer.write_all(&[0x3f]).unwrap();
        tcp.borrow_mut().on_readable();
        engine.drain_tcp_events().unwrap();
        tcp.borrow_mut().on_writable();
        assert_eq!(drain_wire(&mut peer), vec![0x21]);
    }

    #[test]
    fn idle_ticks_reach_pingticks_then_closeticks() {
        let (tcp, _peer) = tcp_pair();
        let mut engine = TunnelEngine::new(Role::Server, true, tcp, false);
        engine.phase = Phase::Established;
        for _ in 0..PINGTICKS - 1 {
            assert!(engine.on_tick().is_empty());
        }
        assert!(engine.on_tick().is_empty()); // PING sent, no Action
        for _ in PINGTICKS..CLOSETICKS {
            let actions = engine.on_tick();
            if !actions.is_empty() {
                assert!(matches!(actions[0], Action::CloseTunnel));
                return;
            }
        }
        panic!("expected CloseTunnel by CLOSETICKS");
    }

    #[test]
    fn data_chunk_forwards_to_registered_local_socket() {
        let (tcp, mut peer) = tcp_pair();
        let (local, mut local_peer) = local_pair();
        let mut engine = TunnelEngine::new(Role::Server, true, tcp.clone(), false);
        engine.registry_mut().register_at(3, |id| ClientSpec {
            clientno: id,
            sock_conn: local.clone(),
            connected: true,
        }).unwrap();

        use std::io::Write;
        let mut frame = vec![0x44];
        frame.extend(3u16.to_be_bytes());
        frame.extend(4u16.to_be_bytes());
        frame.extend(b"ping");
        peer.write_all(&frame).unwrap();
        tcp.borrow_mut().on_readable();
        engine.drain_tcp_events().unwrap();

        local.borrow_mut().on_writable();
        let mut buf = [0u8; 4];
        use std::io::Read;
        local_peer.set_nonblocking(true).unwrap();
        local_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
