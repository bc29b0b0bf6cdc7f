//! Fixed bank of OS threads executing blocking jobs dispatched from the reactor
//! thread, with per-job tick-based timeout and `SIGUSR1` cancellation.
//!
//! Grounded on the dispatch/cancellation shape of a hand-rolled C threadpool (one
//! pthread per slot, a completion pipe per thread, `pthread_kill(SIGUSR1)` to
//! interrupt a blocking syscall) but built from `std::thread` and `std::sync::mpsc`
//! rather than raw condition variables, since nothing here needs the pool's own
//! dispatch lock visible outside this module.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::warn;
use thiserror::Error;

use crate::job::{self, Proc};

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_QUEUE_SIZE: usize = 64;

pub type OnFinished = Box<dyn FnOnce(bool)>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is inactive and its job queue is full")]
    Unavailable,
}

struct QueuedJob {
    id: u64,
    proc: Proc,
    timeout_ticks: u32,
    on_finished: OnFinished,
}

struct Pending {
    id: u64,
    timeout_ticks: u32,
    completed: bool,
    on_finished: OnFinished,
}

struct WorkerSlot {
    tx: Option<mpsc::Sender<(u64, Proc)>>,
    pipe_read: RawFd,
    pipe_write: RawFd,
    pthread: Arc<Mutex<Option<libc::pthread_t>>>,
    failed: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    current: Option<Pending>,
}

pub struct WorkerPool {
    workers: Vec<WorkerSlot>,
    queue: VecDeque<QueuedJob>,
    queue_capacity: usize,
    next_id: u64,
}

impl WorkerPool {
    pub fn new(size: usize, queue_capacity: usize) -> io::Result<Self> {
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            workers.push(spawn_worker()?);
        }
        Ok(Self {
            workers,
            queue: VecDeque::new(),
            queue_capacity,
            next_id: 1,
        })
    }

    /// The pool has been initialized and has at least one live (non-failed) worker.
    pub fn active(&self) -> bool {
        self.workers.iter().any(|w| !w.failed.load(Ordering::SeqCst))
    }

    /// The read end of every worker's completion pipe, for registering with a
    /// reactor. `on_pipe_readable` dispatches whichever one fires.
    pub fn pipe_fds(&self) -> Vec<RawFd> {
        self.workers.iter().map(|w| w.pipe_read).collect()
    }

    pub fn enqueue(
        &mut self,
        proc: Proc,
        timeout_ticks: u32,
        on_finished: OnFinished,
    ) -> Result<u64, PoolError> {
        let id = self.next_id;
        self.next_id += 1;

        if let Some(idx) = self.idle_worker() {
            self.dispatch(idx, id, proc, timeout_ticks, on_finished);
            return Ok(id);
        }
        if !self.active() {
            return Err(PoolError::Unavailable);
        }
        if self.queue.len() >= self.queue_capacity {
            return Err(PoolError::Unavailable);
        }
        self.queue.push_back(QueuedJob {
            id,
            proc,
            timeout_ticks,
            on_finished,
        });
        Ok(id)
    }

    /// Cancel a job by id. If queued, it's removed and `finished` fires synchronously
    /// with `has_completed=false`. If executing, `SIGUSR1` is sent to its worker and
    /// it is marked not-completed; the normal completion path still runs once the
    /// procedure actually returns.
    pub fn cancel(&mut self, id: u64) {
        if let Some(pos) = self.queue.iter().position(|j| j.id == id) {
            let job = self.queue.remove(pos).unwrap();
            (job.on_finished)(false);
            return;
        }
        for worker in &mut self.workers {
            if let Some(pending) = worker.current.as_mut() {
                if pending.id == id {
                    pending.completed = false;
                    signal_worker(&worker.pthread);
                    return;
                }
            }
        }
    }

    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.current.is_none() && !w.failed.load(Ordering::SeqCst))
    }

    fn dispatch(
        &mut self,
        idx: usize,
        id: u64,
        proc: Proc,
        timeout_ticks: u32,
        on_finished: OnFinished,
    ) {
        let worker = &mut self.workers[idx];
        worker.current = Some(Pending {
            id,
            timeout_ticks,
            completed: true,
            on_finished,
        });
        let sent = match &worker.tx {
            Some(tx) => tx.send((id, proc)).is_ok(),
            None => false,
        };
        if !sent {
            worker.failed.store(true, Ordering::SeqCst);
            if let Some(pending) = worker.current.take() {
                (pending.on_finished)(false);
            }
        }
    }

    /// Decrement every executing job's timeout. A job reaching zero ticks is sent
    /// `SIGUSR1` and marked not-completed, but `finished` still waits for the
    /// procedure to actually return.
    pub fn on_tick(&mut self) {
        for worker in &mut self.workers {
            let expired = if let Some(pending) = worker.current.as_mut() {
                if pending.timeout_ticks > 0 {
                    pending.timeout_ticks -= 1;
                    pending.timeout_ticks == 0
                } else {
                    false
                }
            } else {
                false
            };
            if expired {
                if let Some(pending) = worker.current.as_mut() {
                    pending.completed = false;
                }
                signal_worker(&worker.pthread);
            }
        }
    }

    /// Called once the reactor observes `fd` (one of [`pipe_fds`]) readable.
    pub fn on_pipe_readable(&mut self, fd: RawFd) {
        let Some(idx) = self.workers.iter().position(|w| w.pipe_read == fd) else {
            return;
        };
        let mut buf = [0u8; 1];
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n <= 0 {
            return;
        }

        let worker_failed = buf[0] == b'1';
        if worker_failed {
            self.workers[idx].failed.store(true, Ordering::SeqCst);
            warn!("worker thread died unexpectedly, restarting");
            self.restart(idx);
            return;
        }

        let Some(pending) = self.workers[idx].current.take() else {
            return;
        };
        (pending.on_finished)(pending.completed);

        if let Some(next) = self.queue.pop_front() {
            self.dispatch(idx, next.id, next.proc, next.timeout_ticks, next.on_finished);
        }
    }

    fn restart(&mut self, idx: usize) {
        if let Some(join) = self.workers[idx].join.take() {
            let _ = join.join();
        }
        match spawn_worker() {
            Ok(fresh) => self.workers[idx] = fresh,
            Err(_) => warn!("failed to restart worker thread, slot stays dead"),
        }
    }

    /// Close every worker's channel so its thread's blocking `recv` returns,
    /// then join it. Called once during graceful shutdown, after the reactor
    /// loop has already stopped dispatching new work. Takes `&mut self` rather
    /// than consuming the pool since callers hold it behind `Rc<RefCell<_>>`
    /// alongside the resolver and reactor registrations that reference it.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.tx.take();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn signal_worker(pthread: &Arc<Mutex<Option<libc::pthread_t>>>) {
    if let Some(handle) = *pthread.lock().unwrap() {
        unsafe {
            libc::pthread_kill(handle, libc::SIGUSR1);
        }
    }
}

extern "C" fn worker_interrupt(_signum: libc::c_int) {
    job::mark_canceled();
}

fn install_sigusr1_handler() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = worker_interrupt as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        if libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn spawn_worker() -> io::Result<WorkerSlot> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (pipe_read, pipe_write) = (fds[0], fds[1]);
    let (tx, rx) = mpsc::channel::<(u64, Proc)>();
    let pthread = Arc::new(Mutex::new(None));
    let failed = Arc::new(AtomicBool::new(false));

    let thread_pthread = pthread.clone();
    let thread_failed = failed.clone();
    let join = std::thread::Builder::new()
        .name("tunsock-worker".into())
        .spawn(move || {
            *thread_pthread.lock().unwrap() = Some(unsafe { libc::pthread_self() });
            if install_sigusr1_handler().is_err() {
                thread_failed.store(true, Ordering::SeqCst);
                let _ = unsafe {
                    libc::write(pipe_write, b"1".as_ptr() as *const libc::c_void, 1)
                };
                return;
            }
            while let Ok((_id, proc)) = rx.recv() {
                job::reset_canceled();
                proc();
                let _ = unsafe {
                    libc::write(pipe_write, b"0".as_ptr() as *const libc::c_void, 1)
                };
            }
        })
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to spawn worker thread"))?;

    Ok(WorkerSlot {
        tx: Some(tx),
        pipe_read,
        pipe_write,
        pthread,
        failed,
        join: Some(join),
        current: None,
    })
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatches_to_idle_worker_and_reports_completion() {
        let mut pool = WorkerPool::new(2, 4).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        pool.enqueue(
            Box::new(move || ran2.store(true, Ordering::SeqCst)),
            0,
            Box::new(move |completed| {
                done2.store(completed, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let fd = pool.pipe_fds()[0];
        wait_readable(fd);
        pool.on_pipe_readable(fd);

        assert!(ran.load(Ordering::SeqCst));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn queue_rejects_beyond_capacity_while_worker_is_busy() {
        let mut pool = WorkerPool::new(1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.enqueue(
            Box::new(move || {
                let _ = release_rx.recv();
            }),
            0,
            Box::new(|_| {}),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let r1 = pool.enqueue(Box::new(|| {}), 0, Box::new(|_| {}));
        assert!(r1.is_ok());
        let r2 = pool.enqueue(Box::new(|| {}), 0, Box::new(|_| {}));
        assert!(r2.is_err());

        release_tx.send(()).unwrap();
    }

    #[test]
    fn canceling_queued_job_reports_not_completed_without_running() {
        let mut pool = WorkerPool::new(1, 4).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.enqueue(
            Box::new(move || {
                let _ = release_rx.recv();
            }),
            0,
            Box::new(|_| {}),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let completed = Arc::new(AtomicBool::new(true));
        let completed2 = completed.clone();

        let id = pool
            .enqueue(
                Box::new(move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                }),
                0,
                Box::new(move |ok| completed2.store(ok, Ordering::SeqCst)),
            )
            .unwrap();

        pool.cancel(id);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!completed.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
    }

    fn wait_readable(fd: RawFd) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe {
            libc::poll(&mut pfd, 1, 2000);
        }
    }
}
