//! The non-blocking byte-stream endpoint.
//!
//! A `Connection` owns exactly one file descriptor (wrapped in a [`Transport`]) and
//! knows nothing about the framed protocol carried over it: it only manages the
//! mechanics common to every stream in this system — queued writes with completion
//! tags, a single gated read buffer, and the connect-in-progress dance. Everything
//! frame-shaped lives one layer up, reacting to the [`ConnEvent`] values this type
//! produces.

use std::any::Any;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use tunsock_common::ring::BoundedQueue;

use crate::transport::Transport;

pub const READ_BUF_SIZE: usize = 4096;
pub const WRITE_QUEUE_CAPACITY: usize = 16;

/// How long a connect-in-progress fd is given to become writable before it's
/// abandoned. Expressed in reactor ticks, like every other timeout in this system.
pub const DEFAULT_CONNECT_TICKS: u32 = 6;

/// An opaque value the caller attaches to a queued write and receives back with
/// [`ConnEvent::DataSent`]. The protocol engine uses this to correlate a completed
/// TCP write with the local socket (or tunnel) that produced the bytes.
pub type Tag = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The fd is already connected; register for read immediately.
    Normal,
    /// An async connect is in progress; register for write and watch for `SO_ERROR`.
    Connecting,
    /// Don't register for read until [`Connection::activate`] is called.
    Wait,
}

struct WriteRecord {
    buf: std::rc::Rc<[u8]>,
    pos: usize,
    tag: Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// A pending connect finished successfully.
    Connected,
    /// The connection is gone; no further events follow except drained `DataSent`
    /// tags for writes that were still queued at the moment of closing.
    Closed,
    /// `size` bytes landed in the read buffer starting at `offset`.
    DataReceived { offset: usize, size: usize },
    /// The queued write tagged `tag` has been fully flushed to the transport.
    DataSent { tag: Tag },
}

pub struct Connection {
    transport: Transport,
    mode: Mode,
    connect_ticks_left: u32,
    writes: BoundedQueue<WriteRecord>,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
    read_offset: usize,
    handling: bool,
    closed: bool,
    destroy_scheduled: bool,
    numeric_label: String,
    host_label: Option<String>,
    user_data: Option<Box<dyn Any>>,
    pending: Vec<ConnEvent>,
}

impl Connection {
    pub fn new(transport: Transport, mode: Mode, read_offset: usize) -> io::Result<Self> {
        transport.set_nonblocking(true)?;
        Ok(Self {
            transport,
            mode,
            connect_ticks_left: DEFAULT_CONNECT_TICKS,
            writes: BoundedQueue::new(WRITE_QUEUE_CAPACITY),
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
            read_offset,
            handling: false,
            closed: false,
            destroy_scheduled: false,
            numeric_label: String::new(),
            host_label: None,
            user_data: None,
            pending: Vec::new(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn destroy_scheduled(&self) -> bool {
        self.destroy_scheduled
    }

    pub fn mark_destroy_scheduled(&mut self) {
        self.destroy_scheduled = true;
    }

    pub fn handling(&self) -> bool {
        self.handling
    }

    pub fn user_data(&self) -> Option<&(dyn Any)> {
        self.user_data.as_deref()
    }

    pub fn user_data_mut(&mut self) -> Option<&mut (dyn Any)> {
        self.user_data.as_deref_mut()
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }

    pub fn wants_write(&self) -> bool {
        self.mode == Mode::Connecting || !self.writes.is_empty()
    }

    pub fn activate(&mut self) {
        if self.mode == Mode::Wait {
            self.mode = Mode::Normal;
        }
    }

    /// Bring up the front `offset` bytes of the read buffer for the caller to fill
    /// with a framing prefix (e.g. the 5-byte `DATA id len` header) before the
    /// buffer's tail is handed to [`Connection::write`] as one combined record.
    pub fn read_buf_prefix_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.read_buf[..len]
    }

    pub fn read_buf_as_rc(&self, offset: usize, size: usize) -> std::rc::Rc<[u8]> {
        std::rc::Rc::from(&self.read_buf[offset..offset + size])
    }

    pub fn numeric_label(&self) -> &str {
        &self.numeric_label
    }

    pub fn host_label(&self) -> Option<&str> {
        self.host_label.as_deref()
    }

    /// The label used in log lines: the resolved host if we have one, else the
    /// numeric address.
    pub fn display_label(&self) -> &str {
        self.host_label.as_deref().unwrap_or(&self.numeric_label)
    }

    pub fn set_numeric_label(&mut self, label: String) {
        self.numeric_label = label;
    }

    pub fn set_host_label(&mut self, label: String) {
        self.host_label = Some(label);
    }

    /// Queue `buf` for writing, tagged `tag`. Fails without mutating state if the
    /// queue already holds [`WRITE_QUEUE_CAPACITY`] records. The buffer is not
    /// copied: the caller must keep it alive until `DataSent(tag)` is drained.
    pub fn write(&mut self, buf: std::rc::Rc<[u8]>, tag: Tag) -> Result<(), std::rc::Rc<[u8]>> {
        self.writes
            .try_push_back(WriteRecord { buf, pos: 0, tag })
            .map_err(|rec| rec.buf)
    }

    /// Re-enable inbound delivery after a handler that set `handling=true` has
    /// finished forwarding the last `DataReceived` payload.
    pub fn confirm_data_received(&mut self) {
        self.handling = false;
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.push(ConnEvent::Closed);
    }

    /// Drain and return every event raised since the last call.
    pub fn drain_events(&mut self) -> std::vec::Drain<'_, ConnEvent> {
        self.pending.drain(..)
    }

    /// Called once on the first writable readiness notification while `mode ==
    /// Connecting`. Inspects `SO_ERROR`; on success the connection becomes `Normal`
    /// and `ConnEvent::Connected` is raised, on failure it's closed.
    pub fn on_connect_writable(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.mode, Mode::Connecting);
        match self.transport.take_connect_error()? {
            0 => {
                self.mode = Mode::Normal;
                self.pending.push(ConnEvent::Connected);
            }
            errno => {
                self.close();
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        Ok(())
    }

    /// Decrement the connect watchdog; returns `true` once it reaches zero with no
    /// connect having completed, at which point the caller should close and destroy.
    pub fn tick_connect_timeout(&mut self) -> bool {
        if self.mode != Mode::Connecting {
            return false;
        }
        self.connect_ticks_left = self.connect_ticks_left.saturating_sub(1);
        self.connect_ticks_left == 0
    }

    /// Read once from the transport into the gated buffer. Raises `DataReceived` on
    /// success, `Closed` on EOF. `WouldBlock` is swallowed: the reactor only calls
    /// this when the fd claimed readiness, but poll is level-triggered and spurious
    /// wakeups are harmless.
    pub fn on_readable(&mut self) {
        if self.handling {
            return;
        }
        match self.transport.read(&mut self.read_buf[self.read_offset..]) {
            Ok(0) => self.close(),
            Ok(size) => {
                self.handling = true;
                self.pending.push(ConnEvent::DataReceived {
                    offset: self.read_offset,
                    size,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.close(),
        }
    }

    /// Flush as much of the front of the write queue as the transport will accept.
    /// Raises `DataSent(tag)` for each record that completes.
    pub fn on_writable(&mut self) {
        if self.mode == Mode::Connecting {
            if self.on_connect_writable().is_err() {
                return;
            }
        }
        loop {
            let Some(record) = self.writes.front_mut() else {
                break;
            };
            match self.transport.write(&record.buf[record.pos..]) {
                Ok(0) => break,
                Ok(n) => {
                    record.pos += n;
                    if record.pos == record.buf.len() {
                        let tag = record.tag;
                        self.writes.pop_front();
                        self.pending.push(ConnEvent::DataSent { tag });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.close();
                    break;
                }
            }
        }
    }

    /// Unregister I/O, flush completion tags for anything still queued, and close
    /// the underlying fd. Called exactly once, from the deferred-deletion path.
    pub fn finalize(&mut self) -> Vec<Tag> {
        self.transport.shutdown();
        let mut tags = Vec::with_capacity(self.writes.len());
        while let Some(record) = self.writes.pop_front() {
            tags.push(record.tag);
        }
        tags
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::new(Transport::Unix(a), Mode::Normal, 0).unwrap();
        (conn, b)
    }

    #[test]
    fn write_queue_rejects_past_capacity() {
        let (mut conn, _peer) = pair();
        for i in 0..WRITE_QUEUE_CAPACITY {
            let buf: std::rc::Rc<[u8]> = std::rc::Rc::from(&b"x"[..]);
            assert!(conn.write(buf, i as Tag).is_ok());
        }
        let overflow: std::rc::Rc<[u8]> = std::rc::Rc::from(&b"y"[..]);
        assert!(conn.write(overflow, 99).is_err());
    }

    #[test]
    fn readable_then_handling_gate_blocks_further_reads() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"hi").unwrap();

        conn.on_readable();
        let events: Vec<_> = conn.drain_events().collect();
        assert_eq!(
            events,
            vec![ConnEvent::DataReceived { offset: 0, size: 2 }]
        );
        assert!(conn.handling());

        peer.write_all(b"more").unwrap();
        conn.on_readable();
        assert!(conn.drain_events().next().is_none());

        conn.confirm_data_received();
        conn.on_readable();
        assert!(matches!(
            conn.drain_events().next(),
            Some(ConnEvent::DataReceived { .. })
        ));
    }

    #[test]
    fn write_then_peer_read_raises_data_sent() {
        let (mut conn, mut peer) = pair();
        let buf: std::rc::Rc<[u8]> = std::rc::Rc::from(&b"payload"[..]);
        conn.write(buf, 42).unwrap();
        conn.on_writable();

        let events: Vec<_> = conn.drain_events().collect();
        assert_eq!(events, vec![ConnEvent::DataSent { tag: 42 }]);

        let mut out = [0u8; 7];
        peer.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, _peer) = pair();
        conn.close();
        conn.close();
        let events: Vec<_> = conn.drain_events().collect();
        assert_eq!(events, vec![ConnEvent::Closed]);
    }

    #[test]
    fn peer_hangup_raises_closed() {
        let (mut conn, peer) = pair();
        drop(peer);
        conn.on_readable();
        assert_eq!(conn.drain_events().next(), Some(ConnEvent::Closed));
    }
}
