// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process scratch storage with object-store semantics
//!
//! Directories are implied by key prefixes or explicit markers, the way an
//! S3 bucket behaves. Nothing survives the process.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use stow_core::{
    BoxSink, ByteSink, ByteStream, Capabilities, EntryMeta, StorageDriver, StorageKind,
    StoragePath, StowError, StowResult,
};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct Object {
    data: Bytes,
    modified: DateTime<Utc>,
    revision: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Object>,
    markers: BTreeSet<String>,
}

impl State {
    fn has_children(&self, key: &str) -> bool {
        let prefix = dir_prefix(key);
        self.objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
            || self
                .markers
                .range(prefix.clone()..)
                .next()
                .is_some_and(|k| k.starts_with(&prefix))
    }

    fn is_directory(&self, key: &str) -> bool {
        key.is_empty() || self.markers.contains(key) || self.has_children(key)
    }

    fn file_ancestor(&self, path: &StoragePath) -> Option<StoragePath> {
        let mut current = path.parent();
        while let Some(p) = current {
            if self.objects.contains_key(&p.as_key()) {
                return Some(p);
            }
            current = p.parent();
        }
        None
    }
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

/// In-memory backend
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn used_bytes(&self) -> u64 {
        self.state.read().objects.values().map(|o| o.data.len() as u64).sum()
    }

    fn entry(path: StoragePath, object: &Object) -> EntryMeta {
        EntryMeta::file(path, object.data.len() as u64)
            .with_modified(Some(object.modified))
            .with_revision(Some(object.revision.clone()))
    }
}

#[async_trait]
impl StorageDriver for MemoryBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::object_store()
    }

    async fn health_check(&self) -> StowResult<()> {
        Ok(())
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let key = path.as_key();
        let state = self.state.read();
        if state.objects.contains_key(&key) {
            return Err(StowError::NotADirectory(path.to_string()));
        }
        if !state.is_directory(&key) {
            return Err(StowError::NotFound(path.to_string()));
        }

        let prefix = dir_prefix(&key);
        let mut children: BTreeMap<String, EntryMeta> = BTreeMap::new();
        let object_keys = state
            .objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix));
        for (k, object) in object_keys {
            let rest = &k[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if !children.contains_key(dir) {
                        children.insert(dir.to_string(), EntryMeta::directory(path.join(dir)?));
                    }
                }
                None => {
                    children.insert(rest.to_string(), Self::entry(path.join(rest)?, object));
                }
            }
        }
        let marker_keys = state
            .markers
            .range(prefix.clone()..)
            .take_while(|k| k.starts_with(&prefix));
        for k in marker_keys {
            let rest = &k[prefix.len()..];
            let dir = rest.split_once('/').map_or(rest, |(d, _)| d);
            if !children.contains_key(dir) {
                children.insert(dir.to_string(), EntryMeta::directory(path.join(dir)?));
            }
        }
        Ok(children.into_values().collect())
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        let key = path.as_key();
        let state = self.state.read();
        if let Some(object) = state.objects.get(&key) {
            return Ok(Self::entry(path.clone(), object));
        }
        if state.is_directory(&key) {
            return Ok(EntryMeta::directory(path.clone()));
        }
        Err(StowError::NotFound(path.to_string()))
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let key = path.as_key();
        let data = {
            let state = self.state.read();
            match state.objects.get(&key) {
                Some(object) => object.data.clone(),
                None if state.is_directory(&key) => return Err(StowError::NotAFile(path.to_string())),
                None => return Err(StowError::NotFound(path.to_string())),
            }
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let rest = data.slice(start..);
        let chunks: Vec<StowResult<Bytes>> = (0..rest.len())
            .step_by(READ_CHUNK)
            .map(|at| Ok(rest.slice(at..(at + READ_CHUNK).min(rest.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        if path.is_root() {
            return Err(StowError::NotAFile(path.to_string()));
        }
        {
            let state = self.state.read();
            if let Some(ancestor) = state.file_ancestor(path) {
                return Err(StowError::NotADirectory(ancestor.to_string()));
            }
            let key = path.as_key();
            if !state.objects.contains_key(&key) && state.is_directory(&key) {
                return Err(StowError::NotAFile(path.to_string()));
            }
        }
        Ok(Box::new(MemorySink {
            state: Arc::clone(&self.state),
            path: path.clone(),
            buffer: BytesMut::new(),
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        let key = path.as_key();
        if key.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.objects.contains_key(&key) {
            return Err(StowError::AlreadyExists(path.to_string()));
        }
        if let Some(ancestor) = state.file_ancestor(path) {
            return Err(StowError::NotADirectory(ancestor.to_string()));
        }
        state.markers.insert(key);
        Ok(())
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let key = path.as_key();
        let mut state = self.state.write();
        if state.objects.remove(&key).is_some() {
            return Ok(());
        }
        if !state.is_directory(&key) {
            return Err(StowError::NotFound(path.to_string()));
        }
        if !recursive && state.has_children(&key) {
            return Err(StowError::Other(format!("directory not empty: {path}")));
        }

        let prefix = dir_prefix(&key);
        state.objects.retain(|k, _| !k.starts_with(&prefix));
        state.markers.retain(|k| k != &key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn move_native(&self, _src: &StoragePath, _dst: &StoragePath) -> StowResult<bool> {
        Ok(false)
    }
}

struct MemorySink {
    state: Arc<RwLock<State>>,
    path: StoragePath,
    buffer: BytesMut,
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StowResult<EntryMeta> {
        let data = self.buffer.freeze();
        let object = Object {
            revision: blake3::hash(&data).to_hex().to_string(),
            modified: Utc::now(),
            data,
        };
        let entry = MemoryBackend::entry(self.path.clone(), &object);
        self.state.write().objects.insert(self.path.as_key(), object);
        Ok(entry)
    }

    async fn abort(self: Box<Self>) -> StowResult<()> {
        Ok(())
    }
}
