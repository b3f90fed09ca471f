// Normalized, slash-delimited storage keys
use super::error::{StorageError, StorageResult};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A normalized absolute key such as `/dir/1`.
///
/// Keys always start with a single `/`, never end with one (except the root)
/// and never contain empty, `.` or `..` segments. Two inputs that address the
/// same node (`/anotherdir/`, `anotherdir`, `//anotherdir`) normalize to the
/// same `Key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// The root key `/`
    pub fn root() -> Self {
        Key("/".to_string())
    }

    /// Normalize a raw key string
    pub fn parse(raw: &str) -> StorageResult<Self> {
        if raw.contains('\0') {
            return Err(StorageError::InvalidKey {
                key: raw.escape_default().to_string(),
                reason: "contains a NUL byte",
            });
        }

        let mut normalized = String::with_capacity(raw.len() + 1);
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(StorageError::InvalidKey {
                    key: raw.to_string(),
                    reason: "relative segments are not allowed",
                });
            }
            normalized.push('/');
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            return Ok(Self::root());
        }
        Ok(Key(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, root has none
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, `None` for the root
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Parent key, `None` for the root
    pub fn parent(&self) -> Option<Key> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Key(self.0[..idx].to_string())),
        }
    }

    /// Ancestors from the nearest parent upward, excluding the root.
    ///
    /// `/a/b/c` yields `/a/b` then `/a`.
    pub fn ancestors(&self) -> Vec<Key> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(key) = current {
            if key.is_root() {
                break;
            }
            current = key.parent();
            out.push(key);
        }
        out
    }

    /// Key one level below this one
    pub fn child(&self, name: &str) -> StorageResult<Key> {
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::InvalidKey {
                key: name.to_string(),
                reason: "child name must be a single segment",
            });
        }
        if self.is_root() {
            Key::parse(name)
        } else {
            Key::parse(&format!("{}/{}", self.0, name))
        }
    }

    /// True if `self` equals `prefix` or is nested anywhere below it
    pub fn is_within(&self, prefix: &Key) -> bool {
        if prefix.is_root() || self == prefix {
            return true;
        }
        self.0
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Relative filesystem path (`/dir/1` -> `dir/1`, root -> empty)
    pub fn to_relative_path(&self) -> PathBuf {
        self.segments().collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Key {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        Key::parse(s)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Key {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Key {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}
