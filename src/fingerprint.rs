//! Persisted record of the last successful execution of an action.
//!
//! Every action owns a directory under the working directory. Its outputs
//! live there, next to a JSON sidecar describing the state of the world the
//! last time the action ran: the digest of every input as consumed and of
//! every output as produced. An action is up to date when recomputing those
//! digests yields exactly the same record.

use std::fs;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::FingerprintError;
use crate::hash::Hash32;

pub(crate) const FINGERPRINT_FILE: &str = ".fingerprint.json";

/// Digest of one declared handle. `None` records an absent file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub handle: String,
    pub digest: Option<Hash32>,
}

/// Caller supplied digest standing for everything a target depends on.
/// Recorded by the producers of the dispatch targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Terminal {
    pub hash: Hash32,
    /// Directory names of every action the producer depends on. They are
    /// skipped while the producer is up to date, so cleanup must keep them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Fingerprint {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Hash32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Terminal>,
    pub inputs: Vec<Entry>,
    pub outputs: Vec<Entry>,
    pub last_used: u64,
}

impl Fingerprint {
    pub fn new(action: &str, salt: Option<Hash32>, inputs: Vec<Entry>, outputs: Vec<Entry>) -> Self {
        Self {
            action: action.to_string(),
            salt,
            terminal: None,
            inputs,
            outputs,
            last_used: now(),
        }
    }

    pub fn with_terminal(mut self, terminal: Option<Terminal>) -> Self {
        self.terminal = terminal;
        self
    }

    fn terminal_hash(&self) -> Option<Hash32> {
        self.terminal.as_ref().map(|terminal| terminal.hash)
    }

    /// Whether this record vouches for `outputs` under the terminal `hash`,
    /// without looking at the inputs at all.
    pub fn matches_terminal(&self, hash: Hash32, current: &Fingerprint) -> bool {
        self.terminal_hash() == Some(hash)
            && self.action == current.action
            && self.salt == current.salt
            && self.outputs == current.outputs
    }

    /// Equal up to the usage timestamp.
    pub fn same_state(&self, other: &Fingerprint) -> bool {
        self.action == other.action
            && self.salt == other.salt
            && self.terminal_hash() == other.terminal_hash()
            && self.inputs == other.inputs
            && self.outputs == other.outputs
    }

    pub fn path(dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(FINGERPRINT_FILE)
    }

    /// `Ok(None)` when no sidecar exists.
    pub fn read(dir: &Utf8Path) -> Result<Option<Fingerprint>, FingerprintError> {
        let data = match fs::read(Self::path(dir)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes the sidecar through a temporary file so a crash never leaves a
    /// half written record behind.
    pub fn write(&self, dir: &Utf8Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let path = Self::path(dir);
        let temp = dir.join(format!("{FINGERPRINT_FILE}.tmp"));

        fs::write(&temp, data)?;
        fs::rename(&temp, &path)
    }

    pub fn remove(dir: &Utf8Path) -> io::Result<()> {
        match fs::remove_file(Self::path(dir)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = now();
    }
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Directory name for an action. Names that aren't safe as a single path
/// component get sanitized and suffixed with a short digest so that distinct
/// names never collide.
pub(crate) fn action_dir_name(name: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');

    if !name.is_empty() && !name.starts_with('.') && name.chars().all(safe) {
        return name.to_string();
    }

    let cleaned: String = name
        .chars()
        .map(|c| if safe(c) { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let digest = Hash32::hash(name).to_hex();

    format!("{cleaned}-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: &str, bytes: Option<&str>) -> Entry {
        Entry {
            handle: handle.to_string(),
            digest: bytes.map(Hash32::hash),
        }
    }

    fn sample() -> Fingerprint {
        Fingerprint::new(
            "combine",
            None,
            vec![entry("file:double/f2", Some("a")), entry("value:&str", Some("b"))],
            vec![entry("file:combine/f4", None)],
        )
    }

    #[test]
    fn test_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(temp.path()).unwrap();

        assert!(Fingerprint::read(dir).unwrap().is_none());

        let fingerprint = sample();
        fingerprint.write(dir).unwrap();

        let read = Fingerprint::read(dir).unwrap().unwrap();
        assert!(read.same_state(&fingerprint));
        assert_eq!(read.last_used, fingerprint.last_used);
        assert!(!dir.join(format!("{FINGERPRINT_FILE}.tmp")).exists());

        Fingerprint::remove(dir).unwrap();
        Fingerprint::remove(dir).unwrap();
        assert!(Fingerprint::read(dir).unwrap().is_none());
    }

    #[test]
    fn test_same_state_ignores_timestamp() {
        let a = sample();
        let mut b = sample();
        b.last_used += 1000;
        assert!(a.same_state(&b));

        b.outputs[0].digest = Some(Hash32::hash("x"));
        assert!(!a.same_state(&b));

        let mut c = sample();
        c.salt = Some(Hash32::hash("salt"));
        assert!(!a.same_state(&c));
    }

    #[test]
    fn test_terminal_match_ignores_inputs() {
        let hash = Hash32::hash("bundle");
        let terminal = Terminal {
            hash,
            protects: vec!["upstream".into()],
        };

        let stored = sample().with_terminal(Some(terminal.clone()));
        let mut current = sample();
        current.inputs.clear();

        assert!(stored.matches_terminal(hash, &current));
        assert!(!stored.matches_terminal(Hash32::hash("other"), &current));
        assert!(!stored.same_state(&sample()));

        current.outputs[0].digest = Some(Hash32::hash("changed"));
        assert!(!stored.matches_terminal(hash, &current));

        let with_protects: Fingerprint =
            serde_json::from_slice(&serde_json::to_vec(&stored).unwrap()).unwrap();
        assert_eq!(with_protects.terminal, Some(terminal));
    }

    #[test]
    fn test_order_matters() {
        let a = sample();
        let mut b = sample();
        b.inputs.reverse();
        assert!(!a.same_state(&b));
    }

    #[test]
    fn test_corrupt_sidecar() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(temp.path()).unwrap();
        fs::write(Fingerprint::path(dir), "{ not json").unwrap();

        assert!(matches!(Fingerprint::read(dir), Err(FingerprintError::Parse(_))));
    }

    #[test]
    fn test_action_dir_name() {
        assert_eq!(action_dir_name("double-1"), "double-1");
        assert_eq!(action_dir_name("a.b_c"), "a.b_c");

        let nested = action_dir_name("a/b");
        assert!(nested.starts_with("a_b-"));
        assert_ne!(nested, action_dir_name("a_b"));
        assert_ne!(action_dir_name("a/b"), action_dir_name("a:b"));

        assert!(!action_dir_name("..").starts_with('.'));
        assert!(!action_dir_name("").is_empty());
    }
}
