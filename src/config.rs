use std::io;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::Dispatcher;
use crate::hash::{self, Hash32};
use crate::utils::as_overhead;

/// Builder for a [`Dispatcher`].
///
/// ```ignore
/// let dispatcher = Dispatcher::config("target/work")
///     .salt_file(std::env::current_exe()?)?
///     .locking(true)
///     .finish();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    work: Utf8PathBuf,
    salts: Vec<Hash32>,
    locking: bool,
}

impl Config {
    pub fn new(work: impl Into<Utf8PathBuf>) -> Self {
        Self {
            work: work.into(),
            salts: Vec::new(),
            locking: false,
        }
    }

    /// Mixes `bytes` into every fingerprint. Changing the salt invalidates
    /// every action at once, which is how a new version of the tooling forces
    /// a full rebuild.
    pub fn salt(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.salts.push(Hash32::hash(bytes));
        self
    }

    /// Like [`Config::salt`], with the content of a file, usually the running
    /// executable.
    pub fn salt_file(mut self, path: impl AsRef<Utf8Path>) -> io::Result<Self> {
        let s = Instant::now();
        let path = path.as_ref();

        self.salts.push(hash::hash_file(path)?);
        tracing::debug!("hashed salt {path} {}", as_overhead(s));
        Ok(self)
    }

    /// Take an exclusive lock on the working directory for each dispatch.
    pub fn locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }

    pub fn finish(self) -> Dispatcher {
        let salt = match self.salts.as_slice() {
            [] => None,
            salts => Some(hash::hash_many(salts.iter().copied())),
        };

        Dispatcher::from_parts(self.work, salt, self.locking)
    }
}
