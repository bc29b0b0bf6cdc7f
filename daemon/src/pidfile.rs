//! Exclusive PID file locking, following the filesystem-socket stale-handle
//! idiom: an `flock` that still succeeds identifies a file left behind by a
//! crashed prior instance and is safely reused; an `flock` that fails means a
//! live instance genuinely holds it, which is always fatal.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("opening pidfile {path}: {source}")]
    Open { path: String, #[source] source: io::Error },
    #[error("pidfile {path} is locked by a running instance (recorded pid: {held_pid})")]
    Locked { path: String, held_pid: String },
    #[error("writing pidfile {path}: {source}")]
    Write { path: String, #[source] source: io::Error },
}

/// Holds the locked pidfile open for the process lifetime; dropping it closes
/// the fd, which releases the `flock` automatically.
pub struct PidFile {
    file: std::fs::File,
    path: std::path::PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| PidFileError::Open {
                path: path.display().to_string(),
                source,
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let mut contents = String::new();
            let _ = file.read_to_string(&mut contents);
            return Err(PidFileError::Locked {
                path: path.display().to_string(),
                held_pid: contents.trim().to_string(),
            });
        }

        file.set_len(0).map_err(|source| PidFileError::Write {
            path: path.display().to_string(),
            source,
        })?;
        file.seek(SeekFrom::Start(0)).map_err(|source| PidFileError::Write {
            path: path.display().to_string(),
            source,
        })?;
        write!(file, "{}", std::process::id()).map_err(|source| PidFileError::Write {
            path: path.display().to_string(),
            source,
        })?;
        file.flush().map_err(|source| PidFileError::Write {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Rewrite the recorded pid. Called after `fork()` in the daemonizing path,
    /// since the locking parent's pid is no longer the running process.
    pub fn rewrite_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{}", std::process::id())?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunsockd.pid");
        let pidfile = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn second_acquire_on_live_instance_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunsockd.pid");
        let _first = PidFile::acquire(&path).unwrap();
        let second = PidFile::acquire(&path);
        assert!(matches!(second, Err(PidFileError::Locked { .. })));
    }

    #[test]
    fn stale_pidfile_left_by_crashed_instance_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunsockd.pid");
        std::fs::write(&path, "999999").unwrap();
        let pidfile = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
