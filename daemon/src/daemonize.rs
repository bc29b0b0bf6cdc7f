//! Forks into the background unless `-f` was given: classic double-detach via
//! `fork` + `setsid`, chdir to `/`, and stdio redirected to `/dev/null`.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::unistd::{chdir, close, dup2, fork, setsid, ForkResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonizeError {
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("setsid failed: {0}")]
    Setsid(#[source] nix::Error),
    #[error("chdir failed: {0}")]
    Chdir(#[source] nix::Error),
    #[error("redirecting stdio failed: {0}")]
    Stdio(#[source] nix::Error),
}

/// Forks once and exits the parent; the child calls `setsid`, chdirs to `/`,
/// and redirects stdin/stdout/stderr to `/dev/null`. Returns once running as
/// the detached child. The caller should finish acquiring any resources
/// (pidfile, listeners) that must be reported back through stderr before
/// calling this, since stderr is gone afterward.
pub fn daemonize() -> Result<(), DaemonizeError> {
    match unsafe { fork() }.map_err(DaemonizeError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(DaemonizeError::Setsid)?;
    chdir("/").map_err(DaemonizeError::Chdir)?;
    redirect_stdio_to_devnull().map_err(DaemonizeError::Stdio)?;

    Ok(())
}

fn redirect_stdio_to_devnull() -> nix::Result<()> {
    let path = CString::new("/dev/null").unwrap();
    let devnull = nix::fcntl::open(
        path.as_c_str(),
        nix::fcntl::OFlag::O_RDWR,
        nix::sys::stat::Mode::empty(),
    )?;
    for fd in [0 as RawFd, 1, 2] {
        dup2(devnull, fd)?;
    }
    if devnull > 2 {
        close(devnull)?;
    }
    Ok(())
}
