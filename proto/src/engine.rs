//! Wires reactor dispatch into [`TunnelEngine`]: the small per-role handler
//! types the [`tunsock_reactor::Reactor`] actually calls, and the local-socket
//! bookkeeping (dialing, accepting) that the engine itself stays decoupled
//! from so this crate never has to know how a local socket is addressed.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use log::{info, warn};
use tunsock_reactor::{ConnEvent, Connection, IoHandler, Reactor};

use crate::tunnel::{reject_busy, Action, TunnelEngine};

/// Dials a fresh local connection for a client id announced by the peer's
/// HELLO. Implemented by whatever owns the local socket address (a unix path,
/// typically) — this crate only needs the result.
pub trait LocalDialer {
    fn dial(&mut self) -> std::io::Result<Connection>;
}

/// Dispatches readiness for the single TCP tunnel connection into the engine:
/// pump the connection's own mechanics, then drain and act on whatever events
/// that produced.
pub struct TcpIo {
    engine: Rc<RefCell<TunnelEngine>>,
    reactor: Rc<RefCell<Reactor>>,
    dialer: Option<Rc<RefCell<dyn LocalDialer>>>,
    tunnel_slot: Option<TunnelSlot>,
    on_close: Option<Box<dyn FnMut()>>,
}

impl TcpIo {
    pub fn new(
        engine: Rc<RefCell<TunnelEngine>>,
        reactor: Rc<RefCell<Reactor>>,
        dialer: Option<Rc<RefCell<dyn LocalDialer>>>,
    ) -> Self {
        Self {
            engine,
            reactor,
            dialer,
            tunnel_slot: None,
            on_close: None,
        }
    }

    /// Publish this engine into a shared [`TunnelSlot`] so the local listener
    /// can find it, and clear the slot again once this tunnel closes.
    pub fn publish_to(&mut self, slot: TunnelSlot) {
        *slot.borrow_mut() = Some(self.engine.clone());
        self.tunnel_slot = Some(slot);
    }

    /// Set a callback fired once, from [`Action::CloseTunnel`] handling, so
    /// the daemon can arm its [`Reconnector`] without this type needing to
    /// know about reconnect policy at all.
    pub fn set_on_close(&mut self, on_close: impl FnMut() + 'static) {
        self.on_close = Some(Box::new(on_close));
    }

    fn pump(&mut self) {
        let tcp = self.engine.borrow().tcp().clone();
        tcp.borrow_mut().on_readable();
        tcp.borrow_mut().on_writable();
        let actions = match self.engine.borrow_mut().drain_tcp_events() {
            Ok(actions) => actions,
            Err(e) => {
                warn!("tunnel protocol error: {e}");
                vec![Action::CloseTunnel]
            }
        };
        for action in actions {
            self.apply(action);
        }
        sync_write_interest(&tcp, &self.reactor);
    }

    /// Advance this tunnel's liveness timers by one reactor tick (IDENT
    /// handshake timeout, PING/PONG keepalive, unresponsive-peer close) and
    /// apply whatever falls out. Meant to be registered on the reactor's
    /// `tick` bus by whoever spins this pair up.
    pub fn on_tick(&mut self) {
        let actions = self.engine.borrow_mut().on_tick();
        for action in actions {
            self.apply(action);
        }
        let tcp = self.engine.borrow().tcp().clone();
        sync_write_interest(&tcp, &self.reactor);
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::DialLocal(id) => {
                let Some(dialer) = self.dialer.as_ref() else {
                    warn!("HELLO received with no local dialer configured");
                    return;
                };
                let result = dialer.borrow_mut().dial();
                match result {
                    Ok(conn) => {
                        let fd = conn.as_raw_fd();
                        let conn = Rc::new(RefCell::new(conn));
                        self.engine
                            .borrow_mut()
                            .complete_local_dial(id, Ok(conn.clone()));
                        let handler: Rc<RefCell<dyn IoHandler>> = Rc::new(RefCell::new(LocalIo {
                            engine: self.engine.clone(),
                            reactor: self.reactor.clone(),
                            conn,
                            id,
                        }));
                        let mut reactor = self.reactor.borrow_mut();
                        reactor.register(fd, handler);
                        reactor.register_read(fd);
                    }
                    Err(e) => {
                        self.engine.borrow_mut().complete_local_dial(id, Err(e));
                    }
                }
            }
            Action::ActivateLocal(id) => {
                let fd = self
                    .engine
                    .borrow()
                    .registry()
                    .get(id)
                    .map(|spec| spec.sock_conn.borrow().as_raw_fd());
                if let Some(fd) = fd {
                    self.reactor.borrow_mut().register_read(fd);
                } else {
                    warn!("CONNECT confirmed for unknown client {id}");
                }
            }
            Action::CloseTunnel => {
                let fd = self.engine.borrow().tcp().borrow().as_raw_fd();
                self.engine.borrow_mut().teardown_locals();
                self.reactor.borrow_mut().unregister(fd);
                info!("tunnel closed");
                if let Some(slot) = &self.tunnel_slot {
                    let is_us = match slot.borrow().as_ref() {
                        Some(e) => Rc::ptr_eq(e, &self.engine),
                        None => false,
                    };
                    if is_us {
                        *slot.borrow_mut() = None;
                    }
                }
                if let Some(cb) = self.on_close.as_mut() {
                    cb();
                }
            }
        }
    }
}

/// Arm or disarm write readiness on `conn`'s fd to match whether it actually
/// has something queued, so the reactor doesn't spin on a writable fd with
/// nothing to send.
fn sync_write_interest(conn: &Rc<RefCell<Connection>>, reactor: &Rc<RefCell<Reactor>>) {
    let fd = conn.borrow().as_raw_fd();
    if conn.borrow().wants_write() {
        reactor.borrow_mut().register_write(fd);
    } else {
        reactor.borrow_mut().unregister_write(fd);
    }
}

impl IoHandler for TcpIo {
    fn on_readable(&mut self) {
        self.pump();
    }

    fn on_writable(&mut self) {
        self.pump();
    }
}

/// Dispatches readiness for one local socket multiplexed over the tunnel.
struct LocalIo {
    engine: Rc<RefCell<TunnelEngine>>,
    reactor: Rc<RefCell<Reactor>>,
    conn: Rc<RefCell<Connection>>,
    id: u16,
}

impl IoHandler for LocalIo {
    fn on_readable(&mut self) {
        self.conn.borrow_mut().on_readable();
        self.drain();
        sync_write_interest(&self.conn, &self.reactor);
    }

    fn on_writable(&mut self) {
        self.conn.borrow_mut().on_writable();
        self.drain();
        sync_write_interest(&self.conn, &self.reactor);
    }
}

impl LocalIo {
    fn drain(&mut self) {
        let events: Vec<ConnEvent> = self.conn.borrow_mut().drain_events().collect();
        for event in events {
            match event {
                ConnEvent::Connected => {}
                ConnEvent::Closed => {
                    self.engine.borrow_mut().local_closed(self.id);
                    self.reactor
                        .borrow_mut()
                        .unregister(self.conn.borrow().as_raw_fd());
                }
                ConnEvent::DataReceived { offset, size } => {
                    self.engine
                        .borrow_mut()
                        .forward_local_data(&self.conn, self.id, offset, size);
                }
                ConnEvent::DataSent { tag } => {
                    if tag == self.id as u64 {
                        self.engine.borrow_mut().on_local_data_sent(self.id);
                    }
                }
            }
        }
    }
}

/// A slot holding the currently-live tunnel, if any. Populated once the TCP
/// connection for it exists and cleared on [`Action::CloseTunnel`] — the local
/// listener itself is bound for the lifetime of the process (clients can
/// always connect to the filesystem path) independent of whether a tunnel is
/// currently up to carry their traffic.
pub type TunnelSlot = Rc<RefCell<Option<Rc<RefCell<TunnelEngine>>>>>;

/// Dispatches the socket-server side's local listener: every freshly accepted
/// local connection gets a HELLO and its own [`LocalIo`] registration, or is
/// dropped if no tunnel is currently up to carry it.
pub struct ServerListenerIo {
    server: Rc<RefCell<tunsock_reactor::Server>>,
    tunnel: TunnelSlot,
    reactor: Rc<RefCell<Reactor>>,
}

impl ServerListenerIo {
    pub fn new(
        server: Rc<RefCell<tunsock_reactor::Server>>,
        tunnel: TunnelSlot,
        reactor: Rc<RefCell<Reactor>>,
    ) -> Self {
        Self {
            server,
            tunnel,
            reactor,
        }
    }

    pub fn listener_fds(&self) -> Vec<std::os::unix::io::RawFd> {
        self.server.borrow().listener_fds()
    }
}

impl IoHandler for ServerListenerIo {
    fn on_readable(&mut self) {
        for fd in self.server.borrow().listener_fds() {
            self.server.borrow_mut().on_listener_readable(fd);
        }
        let events: Vec<_> = self.server.borrow_mut().drain_events().collect();
        for event in events {
            let tunsock_reactor::ServerEvent::ClientConnected(conn) = event else {
                continue;
            };
            let Some(engine) = self.tunnel.borrow().clone() else {
                warn!("local client connected with no tunnel up, dropping");
                conn.borrow_mut().close();
                continue;
            };
            let fd = conn.borrow().as_raw_fd();
            let id = engine.borrow_mut().hello_new_local(conn.clone());
            let handler: Rc<RefCell<dyn IoHandler>> = Rc::new(RefCell::new(LocalIo {
                engine: engine.clone(),
                reactor: self.reactor.clone(),
                conn,
                id,
            }));
            // Registered for dispatch now, but read is armed only once the
            // peer's CONNECT arrives (`Action::ActivateLocal`) — this
            // connection starts in `Mode::Wait` precisely to avoid forwarding
            // anything the local client sends before the peer even knows
            // about it.
            self.reactor.borrow_mut().register(fd, handler);
            let tcp = engine.borrow().tcp().clone();
            sync_write_interest(&tcp, &self.reactor);
        }
    }
}

/// Rejects a second inbound TCP tunnel while one is already active: writes
/// `"busy.\n"` and closes once it flushes. Registered with its own tiny
/// [`IoHandler`] rather than routed through [`TunnelEngine`], since it never
/// reaches the protocol proper.
pub struct BusyRejectIo {
    conn: Rc<RefCell<Connection>>,
}

impl BusyRejectIo {
    pub fn new(conn: Rc<RefCell<Connection>>) -> Self {
        reject_busy(&conn);
        Self { conn }
    }
}

impl IoHandler for BusyRejectIo {
    fn on_writable(&mut self) {
        self.conn.borrow_mut().on_writable();
        let done = self
            .conn
            .borrow_mut()
            .drain_events()
            .any(|e| matches!(e, ConnEvent::DataSent { .. }));
        if done {
            self.conn.borrow_mut().close();
        }
    }
}

/// Tracks the tick countdown to the next reconnect attempt for the side that
/// owns dialing duty. A fresh [`TunnelEngine`] (and [`TcpIo`]) is built from
/// scratch on each successful dial, since the old one's TCP connection is
/// gone; this type only owns the "when do we try again" decision, driven by
/// the daemon's tick handler.
#[derive(Default)]
pub struct Reconnector {
    ticks_left: Option<u32>,
}

impl Reconnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the countdown: 1 tick after a clean loss, `RECONNTICKS` after a
    /// failed dial attempt.
    pub fn schedule(&mut self, ticks: u32) {
        self.ticks_left = Some(ticks.max(1));
    }

    pub fn cancel(&mut self) {
        self.ticks_left = None;
    }

    /// Advance one tick; returns `true` exactly once the countdown reaches
    /// zero, at which point the caller should attempt a dial and either
    /// `cancel` (on success) or `schedule(RECONNTICKS)` (on failure).
    pub fn on_tick(&mut self) -> bool {
        match self.ticks_left {
            Some(1) => {
                self.ticks_left = None;
                true
            }
            Some(n) => {
                self.ticks_left = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use tunsock_reactor::Mode;

    #[test]
    fn busy_reject_writes_and_closes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let conn = Connection::new(tunsock_reactor::Transport::Unix(a), Mode::Normal, 0).unwrap();
        let conn = Rc::new(RefCell::new(conn));
        let mut io = BusyRejectIo::new(conn.clone());
        io.on_writable();

        use std::io::Read;
        let mut buf = [0u8; 6];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"busy.\n");
        assert!(conn.borrow().is_closed());
    }

    #[test]
    fn reconnector_fires_once_after_scheduled_ticks() {
        let mut r = Reconnector::new();
        r.schedule(3);
        assert!(!r.on_tick());
        assert!(!r.on_tick());
        assert!(r.on_tick());
        assert!(!r.on_tick());
    }

    #[test]
    fn reconnector_cancel_stops_countdown() {
        let mut r = Reconnector::new();
        r.schedule(2);
        r.cancel();
        assert!(!r.on_tick());
    }
}
