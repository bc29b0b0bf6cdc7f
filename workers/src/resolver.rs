//! Reverse-DNS resolution dispatched onto the worker pool, implementing
//! [`tunsock_reactor::Resolver`] so connections never block the reactor thread on a
//! `getnameinfo` call.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tunsock_reactor::resolver::{ResolveHandle, Resolver};

use crate::pool::WorkerPool;

/// Dispatches reverse lookups to a shared [`WorkerPool`]. Lives on the reactor
/// thread; only the blocking `getnameinfo` call itself runs on a worker.
pub struct PoolResolver {
    pool: Rc<std::cell::RefCell<WorkerPool>>,
    next_handle: u64,
}

impl PoolResolver {
    pub fn new(pool: Rc<std::cell::RefCell<WorkerPool>>) -> Self {
        Self {
            pool,
            next_handle: 1,
        }
    }

    /// Enqueue a lookup, invoking `on_done` on the reactor thread with the resolved
    /// host, or leaving it uncalled if the lookup fails or times out.
    pub fn resolve_with(
        &mut self,
        addr: SocketAddr,
        timeout_ticks: u32,
        on_done: impl FnOnce(String) + 'static,
    ) -> ResolveHandle {
        let id = self.next_handle;
        self.next_handle += 1;

        let result = Arc::new(Mutex::new(None::<String>));
        let worker_result = result.clone();

        let proc: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(host) = reverse_lookup(addr) {
                *worker_result.lock().unwrap() = Some(host);
            }
        });

        let on_finished = Box::new(move |completed: bool| {
            if completed {
                if let Some(host) = result.lock().unwrap().take() {
                    on_done(host);
                }
            }
        });

        let _ = self
            .pool
            .borrow_mut()
            .enqueue(proc, timeout_ticks, on_finished);

        ResolveHandle(id)
    }
}

impl Resolver for PoolResolver {
    fn resolve(&mut self, addr: SocketAddr, timeout_ticks: u32) -> ResolveHandle {
        self.resolve_with(addr, timeout_ticks, |_| {})
    }
}

/// Blocking reverse lookup via `getnameinfo(3)`. Runs on a worker thread; if
/// `SIGUSR1` lands mid-call the pool has already marked this job not-completed, so
/// whatever `getnameinfo` returns here is discarded by the caller regardless.
fn reverse_lookup(addr: SocketAddr) -> Option<String> {
    let (sockaddr, len) = sockaddr_of(addr);
    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];

    let rc = unsafe {
        libc::getnameinfo(
            &sockaddr as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            0,
        )
    };
    if rc != 0 {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) };
    cstr.to_str().ok().map(str::to_owned)
}

fn sockaddr_of(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
