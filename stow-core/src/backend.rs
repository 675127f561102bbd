// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage driver capability interface

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::{
    descriptor::StorageKind,
    entry::EntryMeta,
    error::StowResult,
    path::StoragePath,
};

/// Byte stream type
pub type ByteStream = Pin<Box<dyn Stream<Item = StowResult<Bytes>> + Send>>;

/// Boxed write handle returned by [`StorageDriver::open_write`]
pub type BoxSink = Box<dyn ByteSink>;

/// Optional behaviour a driver supports, so callers can pick algorithms
/// without inspecting the concrete type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `move_native` can succeed
    pub native_move: bool,
    /// `open_read` honours a non-zero offset without reading the prefix
    pub range_reads: bool,
    /// Written content becomes visible only on `commit`
    pub atomic_writes: bool,
    /// Directories exist independently of their contents
    pub real_directories: bool,
}

impl Capabilities {
    pub fn local_filesystem() -> Self {
        Self {
            native_move: true,
            range_reads: true,
            atomic_writes: true,
            real_directories: true,
        }
    }

    pub fn object_store() -> Self {
        Self {
            native_move: false,
            range_reads: true,
            atomic_writes: true,
            real_directories: false,
        }
    }
}

/// Destination of a streamed write.
///
/// Nothing is guaranteed about the destination until `commit` returns; a sink
/// dropped or aborted mid-way may leave backend-defined partial content.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()>;

    /// Publish the written bytes and return the resulting entry
    async fn commit(self: Box<Self>) -> StowResult<EntryMeta>;

    /// Best-effort cleanup of an unfinished write
    async fn abort(self: Box<Self>) -> StowResult<()>;
}

/// One storage technology behind the common operation set.
///
/// Implementations must be safe for concurrent calls from several jobs.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> StorageKind;
    fn capabilities(&self) -> Capabilities;

    /// Cheap round trip proving the backend is reachable and authorised
    async fn health_check(&self) -> StowResult<()>;

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>>;
    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta>;
    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream>;
    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink>;
    async fn mkdir(&self, path: &StoragePath) -> StowResult<()>;
    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()>;

    /// Move in one backend-native step. `Ok(false)` means the caller has to
    /// fall back to copy + delete.
    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool>;
}
