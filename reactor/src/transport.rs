//! The concrete byte-stream kinds a [`crate::connection::Connection`] can wrap.
//!
//! A `Connection` only needs `Read + Write + AsRawFd`; this enum picks between the
//! three underlying stream types without forcing callers to parameterize the
//! connection type itself, and gives the TLS variant somewhere to keep its
//! non-blocking handshake driver.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
    Tls(Box<TlsStream>),
}

impl Transport {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Transport::Unix(s) => s.set_nonblocking(nonblocking),
            Transport::Tcp(s) => s.set_nonblocking(nonblocking),
            Transport::Tls(t) => t.tcp.set_nonblocking(nonblocking),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Transport::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Transport::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Transport::Tls(t) => {
                let _ = t.tcp.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// The socket error recorded by the kernel for a connect-in-progress fd, as
    /// consulted once on the first writable event. `None` for transports that are
    /// never constructed in a connecting state.
    pub fn take_connect_error(&self) -> io::Result<i32> {
        let fd = self.as_raw_fd();
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(err)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(s) => s.read(buf),
            Transport::Tcp(s) => s.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(s) => s.write(buf),
            Transport::Tcp(s) => s.write(buf),
            Transport::Tls(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Unix(s) => s.flush(),
            Transport::Tcp(s) => s.flush(),
            Transport::Tls(t) => t.flush(),
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Unix(s) => s.as_raw_fd(),
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Tls(t) => t.tcp.as_raw_fd(),
        }
    }
}

/// A non-blocking rustls session layered over a `TcpStream`.
///
/// rustls itself performs no I/O; this drives its `read_tls`/`write_tls`/
/// `process_new_packets` cycle against the underlying non-blocking socket on every
/// call, surfacing `WouldBlock` the same way a plain socket would so the reactor's
/// readiness-driven read/write paths don't need to know TLS is involved.
pub struct TlsStream {
    tcp: TcpStream,
    conn: rustls::Connection,
}

impl TlsStream {
    pub fn new(tcp: TcpStream, conn: rustls::Connection) -> Self {
        Self { tcp, conn }
    }

    fn pump(&mut self) -> io::Result<()> {
        loop {
            let wants_write = self.conn.wants_write();
            let wants_read = self.conn.wants_read();
            if !wants_write && !wants_read {
                return Ok(());
            }
            if wants_write {
                match self.conn.write_tls(&mut self.tcp) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            if wants_read {
                match self.conn.read_tls(&mut self.tcp) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tls eof")),
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pump()?;
        match self.conn.reader().read(buf) {
            Ok(0) if self.conn.wants_read() => Err(io::ErrorKind::WouldBlock.into()),
            other => other,
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.pump()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.pump()
    }
}
