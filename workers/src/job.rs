//! A single unit of blocking work dispatched to the pool.

use std::cell::Cell;

thread_local! {
    /// Set by the `SIGUSR1` handler installed on each worker thread. Mirrors the
    /// `volatile __thread sig_atomic_t` cancellation flag this pool is modeled on:
    /// a worker's running procedure polls [`canceled`] at points where it can bail
    /// out early, and any blocking syscall it's inside gets `EINTR` when the signal
    /// lands, since worker threads install the handler without `SA_RESTART`.
    static CANCELED: Cell<bool> = Cell::new(false);
}

/// Whether the job currently executing on this worker thread has been interrupted.
/// Only meaningful when called from inside a job's procedure.
pub fn canceled() -> bool {
    CANCELED.with(Cell::get)
}

pub(crate) fn reset_canceled() {
    CANCELED.with(|c| c.set(false));
}

pub(crate) fn mark_canceled() {
    CANCELED.with(|c| c.set(true));
}

pub type Proc = Box<dyn FnOnce() + Send + 'static>;

/// A queued or executing job. `timeout_ticks == 0` means no timeout is enforced.
pub struct Job {
    pub(crate) id: u64,
    pub(crate) proc: Proc,
    pub(crate) timeout_ticks: u32,
}

impl Job {
    pub fn new(proc: Proc, timeout_ticks: u32) -> Self {
        Self {
            id: 0,
            proc,
            timeout_ticks,
        }
    }
}
