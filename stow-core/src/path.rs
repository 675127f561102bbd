// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend-relative and storage-qualified paths

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{StowError, StowResult};

const URI_SCHEME: &str = "stow://";

/// Slash-separated path relative to a backend root.
///
/// Never contains `..` segments; construction rejects them instead of
/// resolving them, so a path can never climb above its backend root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath {
    segments: Vec<String>,
}

impl StoragePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: impl AsRef<str>) -> StowResult<Self> {
        let path = path.as_ref();
        let mut segments = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(StowError::InvalidPath(path.to_string())),
                seg if seg.contains('\0') => return Err(StowError::InvalidPath(path.to_string())),
                seg => segments.push(seg.to_string()),
            }
        }
        Ok(Self { segments })
    }

    /// Normalize a path taken from an archive entry.
    ///
    /// Backslashes count as separators and `a/../b` folds to `b`. Anything that
    /// is absolute or climbs above the extraction root is `Corrupt`.
    pub fn from_archive_entry(raw: &str) -> StowResult<Self> {
        let unified = raw.replace('\\', "/");
        let has_drive = unified.len() >= 2
            && unified.as_bytes()[1] == b':'
            && unified.as_bytes()[0].is_ascii_alphabetic();
        if unified.starts_with('/') || has_drive {
            return Err(StowError::Corrupt(format!("absolute entry path: {raw}")));
        }

        let mut segments: Vec<String> = Vec::new();
        for part in unified.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(StowError::Corrupt(format!(
                            "entry escapes extraction root: {raw}"
                        )));
                    }
                }
                seg if seg.contains('\0') => {
                    return Err(StowError::Corrupt(format!("entry path contains NUL: {raw}")))
                }
                seg => segments.push(seg.to_string()),
            }
        }
        Ok(Self { segments })
    }

    /// Append a relative path. Fails on `..` like [`StoragePath::parse`].
    pub fn join(&self, rel: impl AsRef<str>) -> StowResult<Self> {
        let tail = Self::parse(rel)?;
        Ok(self.join_path(&tail))
    }

    pub fn join_path(&self, tail: &StoragePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(tail.segments.iter().cloned());
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            None
        } else {
            let mut segments = self.segments.clone();
            segments.pop();
            Some(Self { segments })
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.name().and_then(|n| n.rsplit_once('.')).map(|(_, ext)| ext)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` equals `prefix` or lies underneath it.
    pub fn starts_with(&self, prefix: &StoragePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    pub fn strip_prefix(&self, prefix: &StoragePath) -> Option<Self> {
        if self.starts_with(prefix) {
            Some(Self {
                segments: self.segments[prefix.segments.len()..].to_vec(),
            })
        } else {
            None
        }
    }

    /// Object-store style key: `a/b/c`, empty for the root.
    pub fn as_key(&self) -> String {
        self.segments.join("/")
    }

    pub fn to_path_string(&self) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.segments.join("/"))
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path_string())
    }
}

impl TryFrom<String> for StoragePath {
    type Error = StowError;

    fn try_from(value: String) -> StowResult<Self> {
        Self::parse(value)
    }
}

impl From<StoragePath> for String {
    fn from(path: StoragePath) -> Self {
        path.to_path_string()
    }
}

/// A path qualified by the storage it lives on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedPath {
    pub storage: String,
    pub path: StoragePath,
}

impl QualifiedPath {
    pub fn new(storage: impl Into<String>, path: StoragePath) -> Self {
        Self {
            storage: storage.into(),
            path,
        }
    }

    pub fn parse(storage: impl Into<String>, path: impl AsRef<str>) -> StowResult<Self> {
        Ok(Self::new(storage, StoragePath::parse(path)?))
    }

    pub fn to_uri(&self) -> String {
        format!("{}{}{}", URI_SCHEME, self.storage, self.path.to_path_string())
    }

    pub fn parse_uri(uri: &str) -> StowResult<Self> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| StowError::InvalidPath(uri.to_string()))?;
        let (storage, path) = rest.split_once('/').unwrap_or((rest, ""));
        if storage.is_empty() {
            return Err(StowError::InvalidPath(uri.to_string()));
        }
        Self::parse(storage, path)
    }

    pub fn join(&self, rel: impl AsRef<str>) -> StowResult<Self> {
        Ok(Self::new(self.storage.clone(), self.path.join(rel)?))
    }
}

impl fmt::Display for QualifiedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let path = StoragePath::parse("/home/user/docs").unwrap();
        assert_eq!(path.segments(), ["home", "user", "docs"]);
    }

    #[test]
    fn test_parse_handles_empty_segments() {
        let path = StoragePath::parse("//home//./user//").unwrap();
        assert_eq!(path.segments(), ["home", "user"]);
    }

    #[test]
    fn test_parse_rejects_dotdot() {
        assert!(matches!(
            StoragePath::parse("/home/../etc"),
            Err(StowError::InvalidPath(_))
        ));
        assert!(StoragePath::root().join("../x").is_err());
    }

    #[test]
    fn test_root() {
        let path = StoragePath::parse("/").unwrap();
        assert!(path.is_root());
        assert!(path.parent().is_none());
        assert!(path.name().is_none());
        assert_eq!(path.to_path_string(), "/");
        assert_eq!(path.as_key(), "");
    }

    #[test]
    fn test_join_and_parent() {
        let path = StoragePath::root().join("home").unwrap().join("user/file.txt").unwrap();
        assert_eq!(path.to_path_string(), "/home/user/file.txt");
        assert_eq!(path.parent().unwrap().to_path_string(), "/home/user");
        assert_eq!(path.name(), Some("file.txt"));
        assert_eq!(path.extension(), Some("txt"));
    }

    #[test]
    fn test_prefix_relations() {
        let base = StoragePath::parse("a/b").unwrap();
        let inner = StoragePath::parse("a/b/c/d").unwrap();
        let sibling = StoragePath::parse("a/bc").unwrap();
        assert!(inner.starts_with(&base));
        assert!(!sibling.starts_with(&base));
        assert_eq!(inner.strip_prefix(&base).unwrap().as_key(), "c/d");
        assert!(sibling.strip_prefix(&base).is_none());
    }

    #[test]
    fn test_archive_entry_normalization() {
        let path = StoragePath::from_archive_entry("./dir/sub/../file.txt").unwrap();
        assert_eq!(path.as_key(), "dir/file.txt");

        let path = StoragePath::from_archive_entry("dir\\nested\\file").unwrap();
        assert_eq!(path.as_key(), "dir/nested/file");

        assert!(StoragePath::from_archive_entry("./").unwrap().is_root());
    }

    #[test]
    fn test_archive_entry_traversal_is_corrupt() {
        for raw in ["../../evil", "a/../../evil", "/etc/passwd", "C:\\evil", "..\\evil"] {
            assert!(
                matches!(StoragePath::from_archive_entry(raw), Err(StowError::Corrupt(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_uri_round_trip() {
        let qp = QualifiedPath::parse_uri("stow://s3-main/bucket/key.bin").unwrap();
        assert_eq!(qp.storage, "s3-main");
        assert_eq!(qp.path.as_key(), "bucket/key.bin");
        assert_eq!(qp.to_uri(), "stow://s3-main/bucket/key.bin");

        let root = QualifiedPath::parse_uri("stow://local").unwrap();
        assert!(root.path.is_root());
        assert_eq!(root.to_string(), "stow://local/");
    }

    #[test]
    fn test_uri_invalid() {
        assert!(QualifiedPath::parse_uri("http://example.com").is_err());
        assert!(QualifiedPath::parse_uri("stow:///x").is_err());
        assert!(QualifiedPath::parse_uri("stow://local/../x").is_err());
    }

    #[test]
    fn test_string_conversion() {
        let path = StoragePath::parse("a/b").unwrap();
        assert_eq!(String::from(path), "/a/b");
        assert!(StoragePath::try_from("x/../y".to_string()).is_err());
    }
}
