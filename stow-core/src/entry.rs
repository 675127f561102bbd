// SPDX-License-Identifier: AGPL-3.0-or-later
//! File system entries as seen through a backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::StoragePath;

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One entry on a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub path: StoragePath,
    pub kind: EntryKind,
    /// Byte length; zero and meaningless for directories
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Opaque etag or revision id when the backend has one
    pub revision: Option<String>,
}

impl EntryMeta {
    pub fn file(path: StoragePath, size: u64) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            size,
            modified: None,
            revision: None,
        }
    }

    pub fn directory(path: StoragePath) -> Self {
        Self {
            path,
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            revision: None,
        }
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }
}
