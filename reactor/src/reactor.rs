//! The single-threaded readiness loop that drives every other component.
//!
//! Registration is keyed directly on the raw file descriptor rather than on a
//! domain-specific `Source` enum (contrast the peer-address-keyed sources in the
//! poll reactor this grew out of): this reactor's callers already have an fd-shaped
//! handle to every object they register (a [`crate::connection::Connection`], a
//! worker-pool completion pipe, a listening socket) and want no intermediate key.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use log::trace;
use tunsock_common::{LocalDuration, LocalTime};

use crate::bus::Bus;
use crate::error::{ReactorError, Result};
use crate::tick::TickTimer;

/// Upper bound on how long a single readiness wait blocks when no tick is armed.
const MAX_WAIT: LocalDuration = LocalDuration::from_mins(60);

pub trait IoHandler {
    fn on_readable(&mut self) {}
    fn on_writable(&mut self) {}
}

struct Registration {
    handler: Rc<std::cell::RefCell<dyn IoHandler>>,
    read: bool,
    write: bool,
}

pub struct Reactor {
    sources: popol::Sources<RawFd>,
    handlers: HashMap<RawFd, Registration>,
    tick_timer: TickTimer,
    quit: bool,
    pub tick: Bus<()>,
    pub events_done: Bus<()>,
    pub shutdown: Bus<()>,
    sigterm_pipe: [RawFd; 2],
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let mut sigterm_pipe = [0; 2];
        if unsafe { libc::pipe(sigterm_pipe.as_mut_ptr()) } != 0 {
            return Err(ReactorError::Signal(io::Error::last_os_error()));
        }
        for fd in sigterm_pipe {
            set_nonblocking(fd);
        }
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGTERM, sigterm_pipe[1])
            .map_err(ReactorError::Signal)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, sigterm_pipe[1])
            .map_err(ReactorError::Signal)?;

        let mut sources = popol::Sources::new();
        sources.register(sigterm_pipe[0], &FdRef(sigterm_pipe[0]), popol::interest::READ);

        Ok(Self {
            sources,
            handlers: HashMap::new(),
            tick_timer: TickTimer::default(),
            quit: false,
            tick: Bus::new(),
            events_done: Bus::new(),
            shutdown: Bus::new(),
            sigterm_pipe,
        })
    }

    pub fn set_tick_interval(&mut self, interval_ms: u64) {
        let interval = if interval_ms == 0 {
            None
        } else {
            Some(LocalDuration::from_millis(interval_ms))
        };
        self.tick_timer.set_interval(interval, LocalTime::now());
    }

    /// Register `fd` behind `handler` without arming either direction yet.
    pub fn register(&mut self, fd: RawFd, handler: Rc<std::cell::RefCell<dyn IoHandler>>) {
        self.sources.register(fd, &FdRef(fd), popol::interest::ALL);
        if let Some(source) = self.sources.get_mut(&fd) {
            source.unset(popol::interest::ALL);
        }
        self.handlers.insert(
            fd,
            Registration {
                handler,
                read: false,
                write: false,
            },
        );
    }

    pub fn unregister(&mut self, fd: RawFd) {
        self.sources.unregister(&fd);
        self.handlers.remove(&fd);
    }

    pub fn register_read(&mut self, fd: RawFd) {
        self.set_interest(fd, true, None);
    }

    pub fn unregister_read(&mut self, fd: RawFd) {
        self.set_interest(fd, false, None);
    }

    pub fn register_write(&mut self, fd: RawFd) {
        self.set_interest(fd, None, true);
    }

    pub fn unregister_write(&mut self, fd: RawFd) {
        self.set_interest(fd, None, false);
    }

    fn set_interest(&mut self, fd: RawFd, read: Option<bool>, write: Option<bool>) {
        let Some(reg) = self.handlers.get_mut(&fd) else {
            return;
        };
        if let Some(read) = read {
            reg.read = read;
        }
        if let Some(write) = write {
            reg.write = write;
        }
        if let Some(source) = self.sources.get_mut(&fd) {
            if let Some(read) = read {
                if read {
                    source.set(popol::interest::READ);
                } else {
                    source.unset(popol::interest::READ);
                }
            }
            if let Some(write) = write {
                if write {
                    source.set(popol::interest::WRITE);
                } else {
                    source.unset(popol::interest::WRITE);
                }
            }
        }
    }

    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Run until `quit()` is called or `SIGTERM`/`SIGINT` is observed.
    pub fn run(&mut self) -> Result<()> {
        let mut events = popol::Events::new();

        while !self.quit {
            self.events_done.raise(&());

            let now = LocalTime::now();
            let timeout = self
                .tick_timer
                .wait_timeout(now)
                .unwrap_or(MAX_WAIT)
                .into();

            match self.sources.wait_timeout(&mut events, timeout) {
                Ok(()) => {
                    trace!("reactor woke with {} source(s) ready", events.len());
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(ReactorError::Wait(err)),
            }

            let mut writable = Vec::new();
            let mut readable = Vec::new();
            let mut sigterm_seen = false;

            for (fd, ev) in events.iter() {
                if *fd == self.sigterm_pipe[0] {
                    sigterm_seen = true;
                    continue;
                }
                if ev.writable {
                    writable.push(*fd);
                }
                if ev.readable {
                    readable.push(*fd);
                }
            }

            for fd in writable {
                if let Some(reg) = self.handlers.get(&fd) {
                    reg.handler.borrow_mut().on_writable();
                }
            }
            for fd in readable {
                if let Some(reg) = self.handlers.get(&fd) {
                    reg.handler.borrow_mut().on_readable();
                }
            }

            if sigterm_seen {
                drain_sigterm_pipe(self.sigterm_pipe[0]);
                self.quit = true;
            }

            if self.tick_timer.poll(LocalTime::now()) {
                self.tick.raise(&());
            }
        }

        self.shutdown.raise(&());
        Ok(())
    }
}

/// A thin `AsRawFd` wrapper for registering a bare fd (the self-pipe read end) that
/// has no owning stream type of its own.
struct FdRef(RawFd);

impl AsRawFd for FdRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn drain_sigterm_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sigterm_pipe[0]);
            libc::close(self.sigterm_pipe[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;

    struct Counter(Rc<RefCell<u32>>);

    impl IoHandler for Counter {
        fn on_readable(&mut self) {
            *self.0.borrow_mut() += 1;
        }
    }

    #[test]
    fn register_read_arms_interest_for_dispatch() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let count = Rc::new(RefCell::new(0u32));
        let handler: Rc<RefCell<dyn IoHandler>> = Rc::new(RefCell::new(Counter(count.clone())));
        reactor.register(a.as_raw_fd(), handler);
        reactor.register_read(a.as_raw_fd());

        use std::io::Write;
        b.write_all(b"x").unwrap();

        let mut events = popol::Events::new();
        reactor
            .sources
            .wait_timeout(&mut events, std::time::Duration::from_millis(200))
            .unwrap();
        for (fd, ev) in events.iter() {
            if *fd == a.as_raw_fd() && ev.readable {
                reactor.handlers.get(fd).unwrap().handler.borrow_mut().on_readable();
            }
        }
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn tick_timer_reprogram_disables_wakeups() {
        let mut reactor = Reactor::new().unwrap();
        reactor.set_tick_interval(0);
        assert!(reactor
            .tick_timer
            .wait_timeout(LocalTime::now())
            .is_none());
    }
}
