//! Passive listening endpoints: one filesystem-socket listener, or up to
//! [`MAXBINDS`] TCP bind points spanning both address families.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::connection::{Connection, Mode};
use crate::transport::Transport;


pub const MAXBINDS: usize = 4;

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

pub enum ServerEvent {
    ClientConnected(Rc<std::cell::RefCell<Connection>>),
    ClientDisconnected(Rc<std::cell::RefCell<Connection>>),
}

pub struct Server {
    listeners: Vec<Listener>,
    mode: Mode,
    read_offset: usize,
    accepted: Vec<Rc<std::cell::RefCell<Connection>>>,
    socket_path: Option<PathBuf>,
    pending: Vec<ServerEvent>,
}

impl Server {
    pub fn bind_unix(
        path: &Path,
        mode_bits: u32,
        read_offset: usize,
        mode: Mode,
    ) -> std::io::Result<Self> {
        if path.exists() && !path_is_live_socket(path) {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode_bits))?;

        Ok(Self {
            listeners: vec![Listener::Unix(listener)],
            mode,
            read_offset,
            accepted: Vec::new(),
            socket_path: Some(path.to_path_buf()),
            pending: Vec::new(),
        })
    }

    pub fn bind_tcp(
        addrs: &[SocketAddr],
        read_offset: usize,
        mode: Mode,
    ) -> std::io::Result<Self> {
        assert!(!addrs.is_empty() && addrs.len() <= MAXBINDS);
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            if addr.is_ipv6() {
                set_v6_only(&listener)?;
            }
            listeners.push(Listener::Tcp(listener));
        }
        Ok(Self {
            listeners,
            mode,
            read_offset,
            accepted: Vec::new(),
            socket_path: None,
            pending: Vec::new(),
        })
    }

    pub fn listener_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(AsRawFd::as_raw_fd).collect()
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, ServerEvent> {
        self.pending.drain(..)
    }

    /// Accept every pending connection on the listener identified by `fd`, looping
    /// until it would block.
    pub fn on_listener_readable(&mut self, fd: RawFd) {
        let Some(idx) = self.listeners.iter().position(|l| l.as_raw_fd() == fd) else {
            return;
        };
        loop {
            let accepted = match &self.listeners[idx] {
                Listener::Unix(l) => l
                    .accept()
                    .map(|(s, _)| (Transport::Unix(s), self.socket_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default())),
                Listener::Tcp(l) => l.accept().map(|(s, addr)| {
                    let label = addr.to_string();
                    (Transport::Tcp(s), label)
                }),
            };
            match accepted {
                Ok((transport, label)) => {
                    let conn = match Connection::new(transport, self.mode, self.read_offset) {
                        Ok(mut c) => {
                            c.set_numeric_label(label);
                            c
                        }
                        Err(_) => continue,
                    };
                    let conn = Rc::new(std::cell::RefCell::new(conn));
                    self.accepted.push(conn.clone());
                    self.pending.push(ServerEvent::ClientConnected(conn));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    /// Called by the owner once it has observed `ConnEvent::Closed` on one of our
    /// accepted connections and wants it forgotten. Raises `ClientDisconnected`.
    pub fn note_disconnected(&mut self, conn: &Rc<std::cell::RefCell<Connection>>) {
        let before = self.accepted.len();
        self.accepted.retain(|c| !Rc::ptr_eq(c, conn));
        if self.accepted.len() != before {
            self.pending
                .push(ServerEvent::ClientDisconnected(conn.clone()));
        }
    }

    /// Raise `ClientDisconnected` for every still-live accepted connection and unlink
    /// the filesystem path this server created, if any.
    pub fn destroy(&mut self) {
        for conn in self.accepted.drain(..) {
            self.pending.push(ServerEvent::ClientDisconnected(conn));
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Probe whether `path` is a live listening socket by attempting a non-blocking
/// connect with a 300 ms wait. A stale socket file (listener process long gone)
/// fails to connect and is safe to unlink and rebind.
fn path_is_live_socket(path: &Path) -> bool {
    let stream = match UnixStream::connect(path) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let fd = stream.as_raw_fd();
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 300) };
    rc > 0 && (pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP)) == libc::POLLOUT
}

fn set_v6_only(listener: &TcpListener) -> std::io::Result<()> {
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
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_accepts_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let mut server = Server::bind_unix(&path, 0o600, 0, Mode::Normal).unwrap();

        let _client = UnixStream::connect(&path).unwrap();
        // Give the kernel a moment to queue the connection in the accept backlog.
        std::thread::sleep(Duration::from_millis(20));
        server.on_listener_readable(server.listener_fds()[0]);

        let events: Vec<_> = server.drain_events().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::ClientConnected(_)));
    }

    #[test]
    fn destroy_unlinks_path_and_raises_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock2");
        let mut server = Server::bind_unix(&path, 0o600, 0, Mode::Normal).unwrap();
        server.destroy();
        assert!(!path.exists());
    }
}
