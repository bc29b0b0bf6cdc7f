//! The hook through which [`crate::connection::Connection`] obtains a reverse-DNS
//! label without ever blocking the reactor thread itself.
//!
//! This crate only defines the contract; the worker pool crate provides the
//! implementation that actually dispatches a blocking `getnameinfo` call to a pooled
//! thread and reports back through the reactor's job-completion path.

use std::net::SocketAddr;

pub trait Resolver {
    /// Enqueue a reverse lookup for `addr`. Implementations must not block; the
    /// result, if any, arrives later through whatever completion path the
    /// implementation wires up (a worker job `finished` event in practice).
    /// `timeout_ticks` bounds how long the caller is willing to wait before giving up
    /// on a hostname and keeping only the numeric label.
    fn resolve(&mut self, addr: SocketAddr, timeout_ticks: u32) -> ResolveHandle;
}

/// An in-flight resolution. Dropping it does not cancel the job; callers that care
/// about cancellation hold on to the id and call back into the worker pool directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveHandle(pub u64);
