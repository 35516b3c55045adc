use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Action '{0}' has already been registered")]
    DuplicateActionName(String),

    #[error("Handle {0} is provided and cannot be an output of action '{1}'")]
    ProvidedAsOutput(String, String),

    #[error("Handle {handle} is already produced by action '{owner}'")]
    MultipleProducers { handle: String, owner: String },

    #[error("Output name '{name}' of action '{action}' {reason}")]
    InvalidOutputName {
        name: String,
        action: String,
        reason: &'static str,
    },

    #[error("No producer or provider for handle {0}")]
    NoProducer(String),

    #[error("Cyclic dependency between actions: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Action '{0}':\n{1}")]
    ActionFailed(String, ActionError),

    #[error("Couldn't prepare the working directory.\n{0}")]
    WorkDir(io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl DispatchError {
    /// Name of the failed action, if this error came from one.
    pub fn action(&self) -> Option<&str> {
        match self {
            DispatchError::ActionFailed(name, _) => Some(name),
            _ => None,
        }
    }
}

/// Reasons a single action failed during `dispatch`.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Execute(anyhow::Error),

    #[error("Action panicked: {0}")]
    Panic(String),

    #[error("Couldn't hash {handle}.\n{source}")]
    Hash { handle: String, source: io::Error },

    #[error("Declared output {0} was not written by the action")]
    MissingOutput(String),

    #[error("Couldn't prepare the action directory.\n{0}")]
    Prepare(io::Error),

    #[error("Couldn't persist the fingerprint.\n{0}")]
    Persist(io::Error),
}

/// Errors raised while resolving a handle to its data.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Output '{0}' is not bound to an action yet")]
    Unbound(String),

    #[error("Couldn't access '{path}'.\n{source}")]
    Io { path: Utf8PathBuf, source: io::Error },

    #[error(transparent)]
    Glob(#[from] glob::GlobError),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "Working directory is locked by another process (PID {pid}, started at unix time {started_at})\n\
         If you're sure no dispatcher is running, remove the lock file:\n  {lock_path}"
    )]
    Contention {
        pid: u32,
        started_at: u64,
        lock_path: Utf8PathBuf,
    },

    #[error(
        "Working directory is locked (couldn't read lock metadata)\n\
         If you're sure no dispatcher is running, remove the lock file:\n  {lock_path}"
    )]
    ContentionUnknown { lock_path: Utf8PathBuf },

    #[error("Failed to create lock file: {0}")]
    Create(#[source] io::Error),
}

#[derive(Debug, Error)]
pub(crate) enum FingerprintError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}
