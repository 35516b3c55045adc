//! Content addressing.
//!
//! Every staleness decision in the dispatcher is made by comparing [`Hash32`]
//! digests. This module computes them for the things a handle can point at:
//! literal values, single files, whole directory trees and sets of files.
//!
//! Two rules govern how digests are combined:
//!
//! * **Sequences** (the declared inputs of an action, the elements of a
//!   `Vec`) are combined with [`hash_many`], which is order sensitive.
//! * **Incidental collections** (the listing of a directory, the files matched
//!   by a glob, a `BTreeSet`) are sorted first, see [`hash_set`].

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use walkdir::WalkDir;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid digest '{0}', expected 64 hex characters")]
pub struct ParseHashError(String);

impl FromStr for Hash32 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn nibble(c: u8) -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                b'A'..=b'F' => Some(c - b'A' + 10),
                _ => None,
            }
        }

        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            match (nibble(pair[0]), nibble(pair[1])) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => return Err(ParseHashError(s.to_string())),
            }
        }

        Ok(Hash32(out))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash of the UTF-8 bytes of a string.
pub fn hash_value(value: &str) -> Hash32 {
    Hash32::hash(value.as_bytes())
}

/// Hash of the bytes of a single file.
pub fn hash_file(path: impl AsRef<Utf8Path>) -> io::Result<Hash32> {
    Hash32::hash_file(path.as_ref())
}

/// Order sensitive combination of digests. The element count is hashed first,
/// so `[a, b]` and `[a, b, c]` can never collide by truncation.
pub fn hash_many<I>(items: I) -> Hash32
where
    I: IntoIterator<Item = Hash32>,
{
    let mut hasher = blake3::Hasher::new();
    let mut count: u64 = 0;
    let mut body = blake3::Hasher::new();

    for item in items {
        body.update(item.as_bytes());
        count += 1;
    }

    hasher.update(&count.to_le_bytes());
    hasher.update(body.finalize().as_bytes());
    hasher.finalize().into()
}

/// Order independent combination of digests.
pub fn hash_set<I>(items: I) -> Hash32
where
    I: IntoIterator<Item = Hash32>,
{
    let mut items: Vec<_> = items.into_iter().collect();
    items.sort_unstable();
    hash_many(items)
}

enum TreeEntry {
    File(String, Utf8PathBuf),
    Dir(String),
    Link(String, String),
}

impl TreeEntry {
    fn digest(&self) -> io::Result<Hash32> {
        let mut hasher = blake3::Hasher::new();

        match self {
            TreeEntry::File(rel, path) => {
                hasher.update(b"F\0");
                hasher.update(rel.as_bytes());
                hasher.update(b"\0");
                hasher.update(Hash32::hash_file(path)?.as_bytes());
            }
            TreeEntry::Dir(rel) => {
                hasher.update(b"D\0");
                hasher.update(rel.as_bytes());
            }
            TreeEntry::Link(rel, target) => {
                hasher.update(b"L\0");
                hasher.update(rel.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.as_bytes());
            }
        }

        Ok(hasher.finalize().into())
    }
}

/// Hash of a directory tree.
///
/// The digest covers the relative path of every entry, the content of every
/// regular file and the target of every symlink. Timestamps and permissions
/// are ignored, and entries are visited in sorted order, so two trees with
/// the same layout and bytes always share a digest.
pub fn hash_dir(path: impl AsRef<Utf8Path>) -> io::Result<Hash32> {
    let root = path.as_ref();
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;

        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        // root itself
        if rel.is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            entries.push(TreeEntry::Link(rel, target.to_string_lossy().into_owned()));
        } else if file_type.is_dir() {
            entries.push(TreeEntry::Dir(rel));
        } else if file_type.is_file() {
            let path = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()).map_err(|p| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non UTF-8 path {}", p.display()),
                )
            })?;
            entries.push(TreeEntry::File(rel, path));
        }
    }

    let digests = entries
        .par_iter()
        .map(TreeEntry::digest)
        .collect::<io::Result<Vec<_>>>()?;

    Ok(hash_many(digests))
}

/// Turns `NotFound` into `None`, so that absence becomes a distinct state
/// instead of an error.
pub(crate) fn absent_as_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Values that can be supplied to the dispatcher as literal inputs.
pub trait Digestible {
    /// Recorded in fingerprints next to the digest, so it has to stay the
    /// same across builds.
    const LABEL: &'static str = "value";

    fn digest(&self) -> Hash32;
}

impl Digestible for str {
    const LABEL: &'static str = "str";

    fn digest(&self) -> Hash32 {
        hash_value(self)
    }
}

impl Digestible for String {
    const LABEL: &'static str = "string";

    fn digest(&self) -> Hash32 {
        hash_value(self)
    }
}

impl Digestible for Utf8Path {
    const LABEL: &'static str = "path";

    fn digest(&self) -> Hash32 {
        hash_value(self.as_str())
    }
}

impl Digestible for Utf8PathBuf {
    const LABEL: &'static str = "path";

    fn digest(&self) -> Hash32 {
        hash_value(self.as_str())
    }
}

impl Digestible for bool {
    const LABEL: &'static str = "bool";

    fn digest(&self) -> Hash32 {
        Hash32::hash([*self as u8])
    }
}

macro_rules! impl_digestible_int {
    ($($T:ty),*) => {
        $(
            impl Digestible for $T {
                const LABEL: &'static str = stringify!($T);

                fn digest(&self) -> Hash32 {
                    Hash32::hash(self.to_le_bytes())
                }
            }
        )*
    };
}

impl_digestible_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Digestible for usize {
    const LABEL: &'static str = "usize";

    fn digest(&self) -> Hash32 {
        (*self as u64).digest()
    }
}

impl<T: Digestible> Digestible for Option<T> {
    const LABEL: &'static str = "option";

    fn digest(&self) -> Hash32 {
        match self {
            Some(value) => hash_many([Hash32::hash([1u8]), value.digest()]),
            None => hash_many([Hash32::hash([0u8])]),
        }
    }
}

impl<T: Digestible> Digestible for [T] {
    const LABEL: &'static str = "list";

    fn digest(&self) -> Hash32 {
        hash_many(self.iter().map(Digestible::digest))
    }
}

impl<T: Digestible> Digestible for Vec<T> {
    const LABEL: &'static str = "list";

    fn digest(&self) -> Hash32 {
        self.as_slice().digest()
    }
}

impl<T: Digestible> Digestible for BTreeSet<T> {
    const LABEL: &'static str = "set";

    fn digest(&self) -> Hash32 {
        hash_set(self.iter().map(Digestible::digest))
    }
}

impl<T: Digestible + ?Sized> Digestible for &T {
    const LABEL: &'static str = T::LABEL;

    fn digest(&self) -> Hash32 {
        (**self).digest()
    }
}
