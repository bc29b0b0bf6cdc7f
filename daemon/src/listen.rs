//! TCP-side orchestration: either binds a listening endpoint (plain or TLS,
//! rejecting a second inbound tunnel peer while one is already active) or
//! dials out and re-dials on loss, wiring whichever connection comes up into
//! a fresh [`TunnelEngine`]/[`TcpIo`] pair.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};
use rustls::{ClientConfig, ServerConfig};
use tunsock_proto::{
    BusyRejectIo, LocalDialer, Reconnector, Role, TcpIo, TunnelEngine, TunnelSlot, RECONNTICKS,
    RESOLVTICKS,
};
use tunsock_reactor::{Connection, IoHandler, Mode, Reactor, Server, ServerEvent, Transport};
use tunsock_workers::PoolResolver;

use crate::dial;

/// Which TLS role, if any, the TCP side plays.
pub enum TlsRole {
    Plain,
    Server(Arc<ServerConfig>),
    Client(Arc<ClientConfig>),
}

struct RoleContext {
    own_role: Role,
    is_socket_server: bool,
    dialer: Option<Rc<RefCell<dyn LocalDialer>>>,
    tunnel_slot: Option<TunnelSlot>,
}

/// Wraps a freshly connected TCP (or TLS) stream in a new `TunnelEngine`/
/// `TcpIo` pair and registers it with the reactor.
fn spin_up(
    tcp: Rc<RefCell<Connection>>,
    ctx: &RoleContext,
    send_ident_immediately: bool,
    reactor: &Rc<RefCell<Reactor>>,
    active: Option<Rc<RefCell<bool>>>,
    reconnector: Option<Rc<RefCell<Reconnector>>>,
) {
    let fd = tcp.borrow().as_raw_fd();
    let engine = Rc::new(RefCell::new(TunnelEngine::new(
        ctx.own_role,
        ctx.is_socket_server,
        tcp.clone(),
        send_ident_immediately,
    )));
    let io = Rc::new(RefCell::new(TcpIo::new(engine, reactor.clone(), ctx.dialer.clone())));
    if let Some(slot) = ctx.tunnel_slot.clone() {
        io.borrow_mut().publish_to(slot);
    }
    if let Some(active) = &active {
        *active.borrow_mut() = true;
    }

    // Liveness (IDENT timeout, PING/PONG, unresponsive close) rides the
    // reactor's own tick bus rather than a timer this type owns itself.
    let tick_id = {
        let io = io.clone();
        reactor.borrow_mut().tick.register(move |_| {
            io.borrow_mut().on_tick();
        })
    };

    let reactor_for_close = reactor.clone();
    io.borrow_mut().set_on_close(move || {
        reactor_for_close.borrow_mut().tick.unregister(tick_id);
        if let Some(active) = &active {
            *active.borrow_mut() = false;
        }
        if let Some(r) = &reconnector {
            r.borrow_mut().schedule(1);
        }
    });

    let handler: Rc<RefCell<dyn IoHandler>> = io;
    let mut reactor_mut = reactor.borrow_mut();
    reactor_mut.register(fd, handler);
    reactor_mut.register_read(fd);
    reactor_mut.register_write(fd);
}

/// Dials out immediately and arms a [`Reconnector`] on the reactor's `tick`
/// bus so loss or dial failure is retried without the caller's involvement.
#[allow(clippy::too_many_arguments)]
pub fn setup_dial(
    reactor: &Rc<RefCell<Reactor>>,
    host: String,
    port: u16,
    tls: TlsRole,
    own_role: Role,
    is_socket_server: bool,
    dialer: Option<Rc<RefCell<dyn LocalDialer>>>,
    tunnel_slot: Option<TunnelSlot>,
) {
    let ctx = Rc::new(RoleContext {
        own_role,
        is_socket_server,
        dialer,
        tunnel_slot,
    });
    let client_tls = match tls {
        TlsRole::Client(cfg) => Some(cfg),
        _ => None,
    };
    let reconnector = Rc::new(RefCell::new(Reconnector::new()));

    fn attempt(host: &str, port: u16, tls: &Option<Arc<ClientConfig>>) -> io::Result<Connection> {
        match tls {
            Some(cfg) => dial::dial_tls(host, port, cfg.clone()),
            None => dial::dial_tcp(host, port),
        }
    }

    let try_dial = {
        let reactor = reactor.clone();
        let ctx = ctx.clone();
        let reconnector = reconnector.clone();
        let host = host.clone();
        move || match attempt(&host, port, &client_tls) {
            Ok(conn) => {
                info!("dialing {host}:{port}");
                let conn = Rc::new(RefCell::new(conn));
                spin_up(conn, &ctx, false, &reactor, None, Some(reconnector.clone()));
            }
            Err(e) => {
                warn!("dial to {host}:{port} failed: {e}, retrying in {RECONNTICKS} ticks");
                reconnector.borrow_mut().schedule(RECONNTICKS);
            }
        }
    };

    try_dial();

    reactor.borrow_mut().tick.register(move |_| {
        if reconnector.borrow_mut().on_tick() {
            try_dial();
        }
    });
}

enum Listeners {
    Plain(Rc<RefCell<Server>>),
    Tls(RawListeners, Arc<ServerConfig>),
}

/// A minimal hand-rolled listener set for the TLS-listening case: `Server`
/// hardcodes plain `Transport::Tcp` on accept, so TLS wrapping of a freshly
/// accepted stream has to happen here instead, before a `Connection` exists.
struct RawListeners {
    listeners: Vec<TcpListener>,
}

impl RawListeners {
    fn bind(addrs: &[SocketAddr]) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            if addr.is_ipv6() {
                set_v6_only(&listener)?;
            }
            listeners.push(listener);
        }
        Ok(Self { listeners })
    }

    fn fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(TcpListener::as_raw_fd).collect()
    }

    fn accept_all(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut out = Vec::new();
        for listener in &self.listeners {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nonblocking(true);
                        out.push((stream, addr));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        out
    }
}

fn set_v6_only(listener: &TcpListener) -> io::Result<()> {
    let fd = listener.as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct TcpListenerIo {
    listeners: Listeners,
    reactor: Rc<RefCell<Reactor>>,
    ctx: RoleContext,
    active: Rc<RefCell<bool>>,
    resolver: Option<Rc<RefCell<PoolResolver>>>,
    numeric_hosts: bool,
}

impl TcpListenerIo {
    fn accept_into_connection(&self, stream: TcpStream, addr: SocketAddr) -> io::Result<Connection> {
        let Listeners::Tls(_, config) = &self.listeners else {
            unreachable!("accept_into_connection is only used on the TLS listening path");
        };
        let session = rustls::ServerConnection::new(config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let tls = tunsock_reactor::TlsStream::new(stream, rustls::Connection::Server(session));
        let mut conn = Connection::new(Transport::Tls(Box::new(tls)), Mode::Normal, 0)?;
        conn.set_numeric_label(addr.to_string());
        Ok(conn)
    }

    /// Kick off a reverse lookup for a freshly labeled connection, if enabled,
    /// so its log lines carry a hostname once the worker pool resolves one.
    fn maybe_resolve_host(&self, conn: &Rc<RefCell<Connection>>) {
        if self.numeric_hosts {
            return;
        }
        let Some(resolver) = &self.resolver else {
            return;
        };
        let Ok(addr) = conn.borrow().numeric_label().parse::<SocketAddr>() else {
            return;
        };
        let conn = conn.clone();
        resolver.borrow_mut().resolve_with(addr, RESOLVTICKS, move |host| {
            conn.borrow_mut().set_host_label(host);
        });
    }

    fn handle_accepted(&mut self, conn: Rc<RefCell<Connection>>) {
        self.maybe_resolve_host(&conn);
        if *self.active.borrow() {
            let fd = conn.borrow().as_raw_fd();
            let handler: Rc<RefCell<dyn IoHandler>> =
                Rc::new(RefCell::new(BusyRejectIo::new(conn)));
            let mut reactor = self.reactor.borrow_mut();
            reactor.register(fd, handler);
            reactor.register_write(fd);
            return;
        }
        info!("accepted inbound tunnel connection");
        spin_up(conn, &self.ctx, true, &self.reactor, Some(self.active.clone()), None);
    }
}

impl IoHandler for TcpListenerIo {
    fn on_readable(&mut self) {
        let accepted = match &self.listeners {
            Listeners::Plain(server) => {
                for fd in server.borrow().listener_fds() {
                    server.borrow_mut().on_listener_readable(fd);
                }
                let events: Vec<_> = server.borrow_mut().drain_events().collect();
                let conns: Vec<_> = events
                    .into_iter()
                    .filter_map(|event| match event {
                        ServerEvent::ClientConnected(conn) => Some(conn),
                        _ => None,
                    })
                    .collect();
                for conn in conns {
                    self.handle_accepted(conn);
                }
                return;
            }
            Listeners::Tls(raw, _) => raw.accept_all(),
        };
        for (stream, addr) in accepted {
            match self.accept_into_connection(stream, addr) {
                Ok(conn) => self.handle_accepted(Rc::new(RefCell::new(conn))),
                Err(e) => warn!("failed to accept TLS connection from {addr}: {e}"),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn setup_listen(
    reactor: &Rc<RefCell<Reactor>>,
    binds: &[SocketAddr],
    tls: TlsRole,
    own_role: Role,
    is_socket_server: bool,
    dialer: Option<Rc<RefCell<dyn LocalDialer>>>,
    tunnel_slot: Option<TunnelSlot>,
    resolver: Option<Rc<RefCell<PoolResolver>>>,
    numeric_hosts: bool,
) -> io::Result<()> {
    let ctx = RoleContext {
        own_role,
        is_socket_server,
        dialer,
        tunnel_slot,
    };
    let listeners = match tls {
        TlsRole::Server(config) => Listeners::Tls(RawListeners::bind(binds)?, config),
        TlsRole::Plain | TlsRole::Client(_) => {
            Listeners::Plain(Rc::new(RefCell::new(Server::bind_tcp(binds, 0, Mode::Normal)?)))
        }
    };

    let fds = match &listeners {
        Listeners::Plain(server) => server.borrow().listener_fds(),
        Listeners::Tls(raw, _) => raw.fds(),
    };

    let handler = Rc::new(RefCell::new(TcpListenerIo {
        listeners,
        reactor: reactor.clone(),
        ctx,
        active: Rc::new(RefCell::new(false)),
        resolver,
        numeric_hosts,
    }));

    let mut reactor_mut = reactor.borrow_mut();
    for fd in fds {
        reactor_mut.register(fd, handler.clone());
        reactor_mut.register_read(fd);
    }
    Ok(())
}
