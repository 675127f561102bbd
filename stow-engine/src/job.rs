// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job requests, identities and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use stow_core::{FailureClass, QualifiedPath, Side, StorageDescriptor, StowError, StowResult};

use crate::archive::ArchiveFormat;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StowError::JobNotFound(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Copy,
    Move,
    Delete,
    Mkdir,
    Compress,
    Extract,
    Upload,
    Download,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Copy => "copy",
            JobKind::Move => "move",
            JobKind::Delete => "delete",
            JobKind::Mkdir => "mkdir",
            JobKind::Compress => "compress",
            JobKind::Extract => "extract",
            JobKind::Upload => "upload",
            JobKind::Download => "download",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who tripped a job's cancellation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelCause {
    User,
    Timeout,
}

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Fail,
    Overwrite,
    Skip,
}

impl FromStr for ConflictPolicy {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        match s {
            "fail" => Ok(ConflictPolicy::Fail),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip" => Ok(ConflictPolicy::Skip),
            other => Err(StowError::InvalidConfig(format!("unknown conflict policy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Succeeded,
    SucceededWithWarning,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::SucceededWithWarning => "succeeded-with-warning",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
        }
    }
}

/// Outcome of one file or directory within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub source: Option<QualifiedPath>,
    pub destination: Option<QualifiedPath>,
    pub status: ItemStatus,
    pub bytes: u64,
    pub failure: Option<FailureClass>,
    /// Error text for failures, warning text for degraded successes
    pub message: Option<String>,
}

impl ItemOutcome {
    pub(crate) fn succeeded(source: Option<QualifiedPath>, destination: Option<QualifiedPath>, bytes: u64) -> Self {
        Self {
            source,
            destination,
            status: ItemStatus::Succeeded,
            bytes,
            failure: None,
            message: None,
        }
    }

    pub(crate) fn failed(source: Option<QualifiedPath>, destination: Option<QualifiedPath>, err: &StowError) -> Self {
        Self {
            source,
            destination,
            status: ItemStatus::Failed,
            bytes: 0,
            failure: Some(err.class()),
            message: Some(err.to_string()),
        }
    }

    /// A failure raised by one known end of a transfer
    pub(crate) fn failed_at(
        side: Side,
        source: Option<QualifiedPath>,
        destination: Option<QualifiedPath>,
        err: &StowError,
    ) -> Self {
        Self {
            failure: Some(err.class_at(side)),
            ..Self::failed(source, destination, err)
        }
    }

    pub(crate) fn skipped(source: Option<QualifiedPath>, destination: Option<QualifiedPath>, why: impl Into<String>) -> Self {
        Self {
            source,
            destination,
            status: ItemStatus::Skipped,
            bytes: 0,
            failure: None,
            message: Some(why.into()),
        }
    }

    pub(crate) fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.status = ItemStatus::SucceededWithWarning;
        self.message = Some(warning.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == ItemStatus::Failed
    }
}

/// An error tagged with the end of the transfer that raised it
#[derive(Debug)]
pub(crate) struct SidedError {
    pub side: Side,
    pub error: StowError,
}

impl SidedError {
    pub(crate) fn source(error: StowError) -> Self {
        Self {
            side: Side::Source,
            error,
        }
    }

    pub(crate) fn destination(error: StowError) -> Self {
        Self {
            side: Side::Destination,
            error,
        }
    }

    pub(crate) fn is_cancel(&self) -> bool {
        matches!(self.error, StowError::Cancelled)
    }

    pub(crate) fn outcome(&self, source: Option<QualifiedPath>, destination: Option<QualifiedPath>) -> ItemOutcome {
        ItemOutcome::failed_at(self.side, source, destination, &self.error)
    }
}

impl From<SidedError> for StowError {
    fn from(err: SidedError) -> Self {
        err.error
    }
}

/// A request for one of the storage-side operations
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub sources: Vec<QualifiedPath>,
    pub destination: Option<QualifiedPath>,
    pub conflict: ConflictPolicy,
    /// Archive format for compress/extract; inferred from the path when unset
    pub format: Option<ArchiveFormat>,
    /// Connect the destination from this descriptor instead of the registry
    pub unregistered_destination: Option<StorageDescriptor>,
}

impl JobRequest {
    fn new(kind: JobKind, sources: Vec<QualifiedPath>, destination: Option<QualifiedPath>) -> Self {
        Self {
            kind,
            sources,
            destination,
            conflict: ConflictPolicy::default(),
            format: None,
            unregistered_destination: None,
        }
    }

    /// Copy each source into the destination directory
    pub fn copy(sources: Vec<QualifiedPath>, destination_dir: QualifiedPath) -> Self {
        Self::new(JobKind::Copy, sources, Some(destination_dir))
    }

    /// Move each source into the destination directory
    pub fn move_to(sources: Vec<QualifiedPath>, destination_dir: QualifiedPath) -> Self {
        Self::new(JobKind::Move, sources, Some(destination_dir))
    }

    pub fn delete(sources: Vec<QualifiedPath>) -> Self {
        Self::new(JobKind::Delete, sources, None)
    }

    pub fn mkdir(path: QualifiedPath) -> Self {
        Self::new(JobKind::Mkdir, Vec::new(), Some(path))
    }

    /// Pack the sources into the archive at `archive`
    pub fn compress(sources: Vec<QualifiedPath>, archive: QualifiedPath) -> Self {
        Self::new(JobKind::Compress, sources, Some(archive))
    }

    /// Unpack `archive` into the destination directory
    pub fn extract(archive: QualifiedPath, destination_dir: QualifiedPath) -> Self {
        Self::new(JobKind::Extract, vec![archive], Some(destination_dir))
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_format(mut self, format: ArchiveFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Send the output to a storage that is not registered. The destination's
    /// storage id must match `descriptor.id`.
    pub fn to_unregistered(mut self, descriptor: StorageDescriptor) -> Self {
        self.unregistered_destination = Some(descriptor);
        self
    }

    pub(crate) fn check(&self) -> StowResult<()> {
        let invalid = |msg: &str| Err(StowError::InvalidConfig(format!("{} job: {msg}", self.kind)));
        let needs_sources = !matches!(self.kind, JobKind::Mkdir | JobKind::Upload);
        let needs_destination = !matches!(self.kind, JobKind::Delete | JobKind::Download);
        if needs_sources && self.sources.is_empty() {
            return invalid("no sources");
        }
        if needs_destination && self.destination.is_none() {
            return invalid("no destination");
        }
        if self.kind == JobKind::Extract && self.sources.len() != 1 {
            return invalid("exactly one archive expected");
        }
        if self.kind == JobKind::Compress {
            let storage = &self.sources[0].storage;
            if self.sources.iter().any(|s| &s.storage != storage) {
                return invalid("all sources must be on one storage");
            }
        }
        if let (Some(descriptor), Some(dest)) = (&self.unregistered_destination, &self.destination) {
            if descriptor.id != dest.storage {
                return invalid("unregistered destination id does not match");
            }
        }
        Ok(())
    }
}

/// Point-in-time copy of a job's record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub sources: Vec<QualifiedPath>,
    pub destination: Option<QualifiedPath>,
    pub status: JobStatus,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub items: Vec<ItemOutcome>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_cause: Option<CancelCause>,
    /// Job-level failure, when the job failed as a whole
    pub error: Option<String>,
    pub failure: Option<FailureClass>,
}

impl JobSnapshot {
    pub fn items_failed(&self) -> usize {
        self.items.iter().filter(|i| i.is_failure()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str, p: &str) -> QualifiedPath {
        QualifiedPath::parse(s, p).unwrap()
    }

    #[test]
    fn test_request_shapes() {
        assert!(JobRequest::copy(vec![q("a", "x")], q("b", "/")).check().is_ok());
        assert!(JobRequest::copy(vec![], q("b", "/")).check().is_err());
        assert!(JobRequest::delete(vec![q("a", "x")]).check().is_ok());
        assert!(JobRequest::mkdir(q("a", "new")).check().is_ok());
        assert!(JobRequest::compress(vec![q("a", "x"), q("b", "y")], q("a", "out.zip"))
            .check()
            .is_err());

        let other = StorageDescriptor::new("elsewhere", stow_core::StorageKind::Memory, "X");
        assert!(JobRequest::copy(vec![q("a", "x")], q("b", "/"))
            .to_unregistered(other)
            .check()
            .is_err());
    }

    #[test]
    fn test_job_id_round_trip() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!(matches!("nope".parse::<JobId>(), Err(StowError::JobNotFound(_))));
    }

    #[test]
    fn test_conflict_policy_parse() {
        assert_eq!("skip".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Skip);
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }
}
