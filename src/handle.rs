//! Handles wire actions together before any data exists.
//!
//! A handle is a lightweight token naming one piece of data: a literal value,
//! a file, a directory, or a set of files matched by a glob. Actions declare
//! the handles they read and write, and the dispatcher derives the graph from
//! those declarations.
//!
//! Handles compare by *identity*, never by content. Two handles created by
//! separate factory calls are different even when they currently point at
//! identical bytes; content is only ever compared through digests computed by
//! the [`hash`](crate::hash) module.
//!
//! Output handles start out *unbound*: [`Dispatcher::output_file`] only
//! reserves a name. The path becomes fixed when the handle is declared as an
//! output of a registered action, at `<work>/<action>/<name>`. Since action
//! names are unique, the same logical output maps to the same path on every
//! run.
//!
//! [`Dispatcher::output_file`]: crate::Dispatcher::output_file

use std::fmt::{Debug, Display};
use std::fs;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::HandleError;
use crate::fingerprint::FINGERPRINT_FILE;
use crate::hash::{self, Digestible, Hash32};

/// Identity of a handle. Unique within the process, so handles created by
/// different dispatchers never alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub(crate) u32);

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

impl HandleId {
    pub(crate) fn next() -> Self {
        HandleId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Output names must stay inside the action directory and must not collide
/// with the fingerprint sidecar.
pub(crate) fn check_output_name(name: &str) -> Result<(), &'static str> {
    let path = Utf8Path::new(name);
    let mut components = path.components().peekable();

    if components.peek().is_none() {
        return Err("is empty");
    }

    for component in components {
        match component {
            Utf8Component::Normal(_) => {}
            Utf8Component::ParentDir => return Err("must not contain '..'"),
            Utf8Component::CurDir => return Err("must not contain '.'"),
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err("must be a relative path");
            }
        }
    }

    if let Some(Utf8Component::Normal(first)) = path.components().next()
        && first.strip_prefix(FINGERPRINT_FILE).is_some_and(|rest| matches!(rest, "" | ".tmp"))
    {
        return Err("is reserved for the fingerprint");
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Value,
    File,
    Directory,
    FileSet,
}

impl Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandleKind::Value => "value",
            HandleKind::File => "file",
            HandleKind::Directory => "dir",
            HandleKind::FileSet => "glob",
        })
    }
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub owner: String,
    pub path: Utf8PathBuf,
}

#[derive(Debug)]
pub(crate) enum Source {
    /// Literal supplied by the caller, hashed once at creation.
    Literal {
        label: &'static str,
        digest: Hash32,
    },
    /// Existing file or directory supplied by the caller.
    Path(Utf8PathBuf),
    /// Glob pattern supplied by the caller.
    Glob(String),
    /// Slot written by exactly one action.
    Output {
        name: String,
        bound: OnceLock<Binding>,
    },
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub kind: HandleKind,
    pub source: Source,
}

/// Type-erased handle, as stored in action declarations and in the graph.
#[derive(Clone)]
pub struct AnyHandle {
    id: HandleId,
    slot: Arc<Slot>,
}

impl AnyHandle {
    pub(crate) fn new(id: HandleId, kind: HandleKind, source: Source) -> Self {
        Self {
            id,
            slot: Arc::new(Slot { kind, source }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.slot.kind
    }

    /// Whether this handle was supplied externally rather than produced.
    pub fn is_provided(&self) -> bool {
        !matches!(self.slot.source, Source::Output { .. })
    }

    /// Name of the action producing this handle, once bound.
    pub fn owner(&self) -> Option<&str> {
        match &self.slot.source {
            Source::Output { bound, .. } => bound.get().map(|b| b.owner.as_str()),
            _ => None,
        }
    }

    /// Filesystem location, if the handle has one and it is known.
    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.slot.source {
            Source::Path(path) => Some(path),
            Source::Output { bound, .. } => bound.get().map(|b| b.path.as_path()),
            Source::Literal { .. } | Source::Glob(_) => None,
        }
    }

    pub(crate) fn require_path(&self) -> Result<&Utf8Path, HandleError> {
        match &self.slot.source {
            Source::Output { name, bound } => bound
                .get()
                .map(|b| b.path.as_path())
                .ok_or_else(|| HandleError::Unbound(name.clone())),
            _ => self.path().ok_or_else(|| HandleError::Unbound(self.describe())),
        }
    }

    /// Stable, human readable identity. This is what fingerprints record next
    /// to each digest.
    pub fn describe(&self) -> String {
        let kind = self.slot.kind;

        match &self.slot.source {
            Source::Literal { label, .. } => format!("{kind}:{label}"),
            Source::Path(path) => format!("{kind}:{path}"),
            Source::Glob(pattern) => format!("{kind}:{pattern}"),
            Source::Output { name, bound } => match bound.get() {
                Some(binding) => format!("{kind}:{}/{name}", binding.owner),
                None => format!("{kind}:?/{name}"),
            },
        }
    }

    /// Requested name of an output slot.
    pub(crate) fn output_name(&self) -> Option<&str> {
        match &self.slot.source {
            Source::Output { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Fix the path of an output slot. Returns the current owner when the slot
    /// has already been claimed.
    pub(crate) fn bind(&self, owner: &str, dir: &Utf8Path) -> Result<(), String> {
        match &self.slot.source {
            Source::Output { name, bound } => {
                let binding = Binding {
                    owner: owner.to_string(),
                    path: dir.join(name),
                };

                bound
                    .set(binding)
                    .map_err(|_| bound.get().map(|b| b.owner.clone()).unwrap_or_default())
            }
            _ => Err(String::new()),
        }
    }

    /// Current state of the data behind this handle. `None` means the file or
    /// directory does not exist, which is a state of its own.
    pub(crate) fn digest(&self) -> io::Result<Option<Hash32>> {
        match (&self.slot.source, self.slot.kind) {
            (Source::Literal { digest, .. }, _) => Ok(Some(*digest)),
            (Source::Glob(pattern), _) => digest_glob(pattern).map(Some),
            (_, kind) => {
                let Some(path) = self.path() else {
                    return Err(io::Error::other(format!(
                        "handle {} is not bound",
                        self.describe()
                    )));
                };

                match kind {
                    HandleKind::Directory => {
                        if path.is_dir() {
                            hash::hash_dir(path).map(Some)
                        } else {
                            Ok(None)
                        }
                    }
                    _ => hash::absent_as_none(hash::hash_file(path)),
                }
            }
        }
    }
}

fn glob_matches(pattern: &str) -> Result<Vec<Utf8PathBuf>, HandleError> {
    let paths = glob::glob(pattern).map_err(|err| HandleError::Io {
        path: Utf8PathBuf::from(pattern),
        source: io::Error::new(io::ErrorKind::InvalidInput, err),
    })?;

    let mut files = Vec::new();
    for path in paths {
        let path = path?;
        let path = Utf8PathBuf::from_path_buf(path).map_err(|p| HandleError::Io {
            path: Utf8PathBuf::from(p.to_string_lossy().into_owned()),
            source: io::Error::new(io::ErrorKind::InvalidData, "non UTF-8 path"),
        })?;
        files.push(path);
    }

    files.sort();
    Ok(files)
}

fn digest_glob(pattern: &str) -> io::Result<Hash32> {
    let files = glob_matches(pattern).map_err(|err| match err {
        HandleError::Io { source, .. } => source,
        HandleError::Glob(err) => err.into(),
        other => io::Error::other(other),
    })?;

    let mut digests = Vec::with_capacity(files.len());
    for file in files {
        let content = if file.is_dir() {
            hash::hash_dir(&file)?
        } else {
            hash::hash_file(&file)?
        };
        digests.push(hash::hash_many([hash::hash_value(file.as_str()), content]));
    }

    Ok(hash::hash_set(digests))
}

impl PartialEq for AnyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.slot.kind == other.slot.kind
    }
}

impl Eq for AnyHandle {}

impl Hash for AnyHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for AnyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyHandle({}, {})", self.id.0, self.describe())
    }
}

impl Display for AnyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Things that can be used where the dispatcher expects a handle.
pub trait Handle {
    fn raw(&self) -> &AnyHandle;

    fn erase(&self) -> AnyHandle {
        self.raw().clone()
    }
}

impl Handle for AnyHandle {
    fn raw(&self) -> &AnyHandle {
        self
    }
}

pub(crate) fn erase_all(handles: &[&dyn Handle]) -> Vec<AnyHandle> {
    handles.iter().map(|handle| handle.erase()).collect()
}

/// A literal value supplied to the graph.
pub struct ValueHandle<T> {
    raw: AnyHandle,
    value: Arc<T>,
}

impl<T: Digestible + 'static> ValueHandle<T> {
    pub(crate) fn new(id: HandleId, value: T) -> Self {
        let digest = value.digest();
        let source = Source::Literal {
            label: T::LABEL,
            digest,
        };

        Self {
            raw: AnyHandle::new(id, HandleKind::Value, source),
            value: Arc::new(value),
        }
    }
}

impl<T> ValueHandle<T> {
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for ValueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T> Handle for ValueHandle<T> {
    fn raw(&self) -> &AnyHandle {
        &self.raw
    }
}

impl<T: Debug> Debug for ValueHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueHandle({:?})", self.value)
    }
}

/// A single file, either supplied or produced by an action.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle {
    raw: AnyHandle,
}

impl FileHandle {
    pub(crate) fn new(raw: AnyHandle) -> Self {
        Self { raw }
    }

    pub fn path(&self) -> Result<&Utf8Path, HandleError> {
        self.raw.require_path()
    }

    pub fn exists(&self) -> bool {
        self.path().map(|path| path.is_file()).unwrap_or(false)
    }

    pub fn read_to_string(&self) -> Result<String, HandleError> {
        let path = self.path()?;
        fs::read_to_string(path).map_err(|source| HandleError::Io {
            path: path.to_owned(),
            source,
        })
    }

    pub fn read(&self) -> Result<Vec<u8>, HandleError> {
        let path = self.path()?;
        fs::read(path).map_err(|source| HandleError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Replaces the file with `contents`, creating parent directories.
    pub fn write(&self, contents: impl AsRef<[u8]>) -> Result<(), HandleError> {
        let path = self.path()?;
        let io = |source| HandleError::Io {
            path: path.to_owned(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        fs::write(path, contents).map_err(io)
    }
}

impl Handle for FileHandle {
    fn raw(&self) -> &AnyHandle {
        &self.raw
    }
}

/// A directory tree, either supplied or produced by an action.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirHandle {
    raw: AnyHandle,
}

impl DirHandle {
    pub(crate) fn new(raw: AnyHandle) -> Self {
        Self { raw }
    }

    pub fn path(&self) -> Result<&Utf8Path, HandleError> {
        self.raw.require_path()
    }

    pub fn exists(&self) -> bool {
        self.path().map(|path| path.is_dir()).unwrap_or(false)
    }

    /// Removes any previous content and returns the path of the now empty
    /// directory.
    pub fn create_clean(&self) -> Result<&Utf8Path, HandleError> {
        let path = self.path()?;
        let io = |source| HandleError::Io {
            path: path.to_owned(),
            source,
        };

        if path.exists() {
            fs::remove_dir_all(path).map_err(io)?;
        }

        fs::create_dir_all(path).map_err(io)?;
        Ok(path)
    }
}

impl Handle for DirHandle {
    fn raw(&self) -> &AnyHandle {
        &self.raw
    }
}

/// A set of files matched by a glob pattern at the time it is hashed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GlobHandle {
    raw: AnyHandle,
    pattern: String,
}

impl GlobHandle {
    pub(crate) fn new(id: HandleId, pattern: String) -> Self {
        Self {
            raw: AnyHandle::new(id, HandleKind::FileSet, Source::Glob(pattern.clone())),
            pattern,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Currently matching paths, sorted.
    pub fn files(&self) -> Result<Vec<Utf8PathBuf>, HandleError> {
        glob_matches(&self.pattern)
    }
}

impl Handle for GlobHandle {
    fn raw(&self) -> &AnyHandle {
        &self.raw
    }
}
