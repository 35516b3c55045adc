//! Exclusive lock on a working directory.
//!
//! The lock is an advisory `flock` on `<work>/.lock`, so it goes away with
//! the process holding it. The file itself stays behind and only carries
//! metadata for the contention message.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LockError;
use crate::fingerprint::now;

pub(crate) const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub started_at: u64,
    pub work: Utf8PathBuf,
}

/// Held while a dispatcher works in a directory. Dropping it closes the
/// file, which releases the lock.
#[derive(Debug)]
pub struct WorkLock {
    _file: File,
    lock_path: Utf8PathBuf,
}

impl WorkLock {
    pub fn acquire(work: &Utf8Path) -> Result<Self, LockError> {
        fs::create_dir_all(work).map_err(LockError::Create)?;

        let lock_path = work.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(LockError::Create)?;

        if let Err(err) = try_lock(&file) {
            return Err(match err.kind() {
                io::ErrorKind::WouldBlock => read_contention_error(&lock_path),
                _ => LockError::Create(err),
            });
        }

        let metadata = LockMetadata {
            pid: std::process::id(),
            started_at: now(),
            work: work.to_owned(),
        };

        file.set_len(0)
            .and_then(|_| serde_json::to_writer_pretty(&mut file, &metadata).map_err(io::Error::other))
            .and_then(|_| file.flush())
            .map_err(LockError::Create)?;

        debug!(path = %lock_path, "acquired lock");
        Ok(WorkLock {
            _file: file,
            lock_path,
        })
    }

    pub fn lock_path(&self) -> &Utf8Path {
        &self.lock_path
    }

    pub fn read_metadata(&self) -> io::Result<LockMetadata> {
        let contents = fs::read_to_string(&self.lock_path)?;
        serde_json::from_str(&contents).map_err(io::Error::other)
    }
}

/// Whether some process currently holds the lock on `work`. A lock file
/// left behind by a dead process doesn't count.
pub fn is_locked(work: &Utf8Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(work.join(LOCK_FILE)) else {
        return false;
    };

    matches!(try_lock(&file), Err(err) if err.kind() == io::ErrorKind::WouldBlock)
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use rustix::fs::{FlockOperation, flock};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock(file: &File) -> io::Result<()> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(fs::TryLockError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
        Err(fs::TryLockError::Error(err)) => Err(err),
    }
}

fn read_contention_error(lock_path: &Utf8Path) -> LockError {
    if let Ok(contents) = fs::read_to_string(lock_path)
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
        return LockError::Contention {
            pid: metadata.pid,
            started_at: metadata.started_at,
            lock_path: lock_path.to_owned(),
        };
    }

    LockError::ContentionUnknown {
        lock_path: lock_path.to_owned(),
    }
}
