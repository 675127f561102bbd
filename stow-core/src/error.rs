// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Stowage

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias
pub type StowResult<T> = Result<T, StowError>;

/// Main error type
#[derive(Error, Debug)]
pub enum StowError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage already registered: {0}")]
    Duplicate(String),

    #[error("Storage in use by a running job: {0}")]
    InUse(String),

    #[error("Endpoint blocked: {reason} (matched {matched_range})")]
    EndpointBlocked { reason: String, matched_range: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("{failed} of {total} items failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Storage unavailable ({id}): {reason}")]
    Unavailable { id: String, reason: String },

    #[error("Storage not found: {0}")]
    StorageNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider API error ({provider}): {message}")]
    ProviderApi { provider: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl StowError {
    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(err: io::Error, path: impl Into<String>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => StowError::NotFound(path),
            io::ErrorKind::PermissionDenied => StowError::PermissionDenied(path),
            io::ErrorKind::AlreadyExists => StowError::AlreadyExists(path),
            io::ErrorKind::TimedOut => StowError::Timeout(path),
            _ if err.raw_os_error() == Some(STORAGE_FULL_ERRNO) => StowError::StorageFull(path),
            _ => StowError::Io(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StowError::Network(_) | StowError::Timeout(_))
    }

    /// Classify with the failing end of a transfer known. A missing parent
    /// or a refusal is the destination's problem when the destination raised it.
    pub fn class_at(&self, side: Side) -> FailureClass {
        match (self, side) {
            (
                StowError::NotFound(_) | StowError::NotADirectory(_) | StowError::NotAFile(_),
                Side::Destination,
            ) => FailureClass::DestinationDenied,
            (StowError::PermissionDenied(_) | StowError::Io(_), Side::Source) => {
                FailureClass::SourceUnreadable
            }
            _ => self.class(),
        }
    }

    /// The remediation bucket a user-facing report falls into, when the
    /// failing side is unknown.
    pub fn class(&self) -> FailureClass {
        match self {
            StowError::NotFound(_) | StowError::NotADirectory(_) | StowError::NotAFile(_) => {
                FailureClass::SourceMissing
            }
            StowError::PermissionDenied(_) => FailureClass::DestinationDenied,
            StowError::StorageFull(_) => FailureClass::DestinationFull,
            StowError::AlreadyExists(_) | StowError::Duplicate(_) | StowError::InUse(_) => {
                FailureClass::Conflict
            }
            StowError::EndpointBlocked { .. } => FailureClass::EndpointBlocked,
            StowError::Corrupt(_) => FailureClass::CorruptArchive,
            StowError::Timeout(_) => FailureClass::Timeout,
            StowError::Network(_) | StowError::ProviderApi { .. } | StowError::Unavailable { .. } => {
                FailureClass::Network
            }
            StowError::Cancelled => FailureClass::Cancelled,
            _ => FailureClass::Internal,
        }
    }
}

#[cfg(unix)]
const STORAGE_FULL_ERRNO: i32 = 28; // ENOSPC
#[cfg(windows)]
const STORAGE_FULL_ERRNO: i32 = 112; // ERROR_DISK_FULL
#[cfg(not(any(unix, windows)))]
const STORAGE_FULL_ERRNO: i32 = -1;

/// Which end of a transfer raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// What a failure means for the person who has to fix it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// The source vanished or was never there
    SourceMissing,
    /// The source exists but refused to be read
    SourceUnreadable,
    /// The destination refused the write
    DestinationDenied,
    DestinationFull,
    /// Something already occupies the destination
    Conflict,
    EndpointBlocked,
    /// The archive is damaged or crafted to escape its root
    CorruptArchive,
    Timeout,
    Network,
    Cancelled,
    Internal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::SourceMissing => "source-missing",
            FailureClass::SourceUnreadable => "source-unreadable",
            FailureClass::DestinationDenied => "destination-denied",
            FailureClass::DestinationFull => "destination-full",
            FailureClass::Conflict => "conflict",
            FailureClass::EndpointBlocked => "endpoint-blocked",
            FailureClass::CorruptArchive => "corrupt-archive",
            FailureClass::Timeout => "timeout",
            FailureClass::Network => "network",
            FailureClass::Cancelled => "cancelled",
            FailureClass::Internal => "internal",
        }
    }
}

/// A serializable failure record, detached from the error value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub class: FailureClass,
    pub message: String,
}

impl From<&StowError> for ErrorReport {
    fn from(err: &StowError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}
