//! Concrete dialers: the local unix-domain-socket dialer the socket-client
//! role uses to satisfy each inbound HELLO, and the TCP/TLS dialer for `-r`.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, ServerName};
use socket2::{Domain, Protocol, Socket, Type};
use tunsock_proto::{LocalDialer, DATA_HEADER_LEN};
use tunsock_reactor::{Connection, Mode, Transport};

/// Dials the local filesystem socket path once per HELLO, as the socket-client
/// role's [`LocalDialer`].
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl LocalDialer for UnixDialer {
    fn dial(&mut self) -> std::io::Result<Connection> {
        let stream = std::os::unix::net::UnixStream::connect(&self.path)?;
        Connection::new(Transport::Unix(stream), Mode::Normal, DATA_HEADER_LEN)
    }
}

fn resolve_one(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))
}

/// Starts a non-blocking connect to `addr` and returns the stream regardless
/// of whether it completed immediately, so the caller can wrap it in
/// [`Mode::Connecting`] and let the reactor finish the handshake.
fn connect_nonblocking(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Dials the remote TCP endpoint for `-r`. The connection starts in
/// [`Mode::Connecting`] so the reactor drives the async connect to completion
/// before anything is read or written.
pub fn dial_tcp(host: &str, port: u16) -> std::io::Result<Connection> {
    let addr = resolve_one(host, port)?;
    let stream = connect_nonblocking(addr)?;
    Connection::new(Transport::Tcp(stream), Mode::Connecting, 0)
}

/// Like [`dial_tcp`] but layers a rustls client session over the stream
/// before handing it to [`Connection`]; the TLS handshake then rides the same
/// non-blocking read/write path every other connection uses. TLS record
/// traffic can't start until the TCP connect itself finishes, so this still
/// starts in [`Mode::Connecting`] the same as the plaintext dialer.
pub fn dial_tls(host: &str, port: u16, config: Arc<ClientConfig>) -> std::io::Result<Connection> {
    let addr = resolve_one(host, port)?;
    let stream = connect_nonblocking(addr)?;

    let server_name = ServerName::try_from(host)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name"))?;
    let session = ClientConnection::new(config, server_name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let tls = tunsock_reactor::TlsStream::new(stream, rustls::Connection::Client(session));
    Connection::new(Transport::Tls(Box::new(tls)), Mode::Connecting, 0)
}
