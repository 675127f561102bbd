// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drivers and fixtures for engine tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use stow_core::{
    stream, BackendFactory, BoxSink, ByteStream, Capabilities, EntryMeta, ResolvedEndpoint,
    StorageDescriptor, StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};
use stow_providers::MemoryBackend;

use crate::engine::{Engine, EngineConfig};
use crate::registry::StorageRegistry;
use crate::security::SecurityGate;
use crate::store::MemoryDescriptorStore;

fn p(path: &str) -> StoragePath {
    StoragePath::parse(path).unwrap()
}

/// Memory storage that fails, stalls or panics on chosen paths
#[derive(Clone, Default)]
pub(crate) struct FaultyDriver {
    inner: MemoryBackend,
    fail_reads: HashSet<StoragePath>,
    fail_writes: HashSet<StoragePath>,
    fail_removes: HashSet<StoragePath>,
    panic_on: HashSet<StoragePath>,
    read_delay: Option<Duration>,
    native_move: bool,
}

impl FaultyDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub(crate) fn fail_reads(mut self, path: &str) -> Self {
        self.fail_reads.insert(p(path));
        self
    }

    pub(crate) fn fail_writes(mut self, path: &str) -> Self {
        self.fail_writes.insert(p(path));
        self
    }

    pub(crate) fn fail_removes(mut self, path: &str) -> Self {
        self.fail_removes.insert(p(path));
        self
    }

    pub(crate) fn panic_on(mut self, path: &str) -> Self {
        self.panic_on.insert(p(path));
        self
    }

    /// Sleep before every chunk handed out by `open_read`
    pub(crate) fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Claim native move support and implement it as rename-by-copy
    pub(crate) fn with_native_move(mut self) -> Self {
        self.native_move = true;
        self
    }
}

#[async_trait]
impl StorageDriver for FaultyDriver {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_move: self.native_move,
            ..self.inner.capabilities()
        }
    }

    async fn health_check(&self) -> StowResult<()> {
        Ok(())
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        self.inner.list(path).await
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        self.inner.stat(path).await
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        if self.panic_on.contains(path) {
            panic!("injected panic reading {path}");
        }
        if self.fail_reads.contains(path) {
            return Err(StowError::PermissionDenied(path.to_string()));
        }
        let reader = self.inner.open_read(path, offset).await?;
        match self.read_delay {
            Some(delay) => Ok(Box::pin(reader.then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                chunk
            }))),
            None => Ok(reader),
        }
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        if self.fail_writes.contains(path) {
            return Err(StowError::PermissionDenied(path.to_string()));
        }
        self.inner.open_write(path).await
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        self.inner.mkdir(path).await
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        if self.fail_removes.contains(path) {
            return Err(StowError::PermissionDenied(path.to_string()));
        }
        self.inner.remove(path, recursive).await
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        if !self.native_move {
            return Ok(false);
        }
        let data = stream::collect(self.inner.open_read(src, 0).await?).await?;
        let mut sink = self.inner.open_write(dst).await?;
        sink.write(data).await?;
        sink.commit().await?;
        self.inner.remove(src, false).await?;
        Ok(true)
    }
}

/// Hands out pre-built drivers by storage id
#[derive(Default)]
pub(crate) struct FixedFactory {
    drivers: Mutex<HashMap<String, Arc<dyn StorageDriver>>>,
}

#[async_trait]
impl BackendFactory for FixedFactory {
    fn endpoints(&self, descriptor: &StorageDescriptor) -> StowResult<Vec<String>> {
        Ok(descriptor.endpoint().into_iter().collect())
    }

    async fn build(
        &self,
        descriptor: &StorageDescriptor,
        _endpoints: &[ResolvedEndpoint],
    ) -> StowResult<Arc<dyn StorageDriver>> {
        self.drivers
            .lock()
            .get(&descriptor.id)
            .cloned()
            .ok_or_else(|| StowError::InvalidConfig(format!("no test driver for {}", descriptor.id)))
    }
}

/// An engine whose registry holds exactly `storages`
pub(crate) async fn engine_with(
    storages: Vec<(&str, Arc<dyn StorageDriver>)>,
    config: EngineConfig,
) -> Engine {
    engine_with_spares(storages, Vec::new(), config).await
}

/// Like [`engine_with`], with `spares` left unregistered but buildable, for
/// requests that carry their own destination descriptor
pub(crate) async fn engine_with_spares(
    storages: Vec<(&str, Arc<dyn StorageDriver>)>,
    spares: Vec<(&str, Arc<dyn StorageDriver>)>,
    config: EngineConfig,
) -> Engine {
    let factory = Arc::new(FixedFactory::default());
    for (id, driver) in storages.iter().chain(spares.iter()) {
        factory.drivers.lock().insert(id.to_string(), Arc::clone(driver));
    }
    let registry = Arc::new(StorageRegistry::new(
        factory,
        Arc::new(SecurityGate::default()),
        Arc::new(MemoryDescriptorStore::new()),
    ));
    for (id, _) in &storages {
        registry
            .add(StorageDescriptor::new(*id, StorageKind::Memory, id.to_uppercase()))
            .await
            .unwrap();
    }
    Engine::new(registry, config)
}

pub(crate) async fn put(driver: &dyn StorageDriver, path: &str, data: &[u8]) {
    let mut sink = driver.open_write(&p(path)).await.unwrap();
    sink.write(Bytes::copy_from_slice(data)).await.unwrap();
    sink.commit().await.unwrap();
}

pub(crate) async fn read(driver: &dyn StorageDriver, path: &str) -> Vec<u8> {
    let reader = driver.open_read(&p(path), 0).await.unwrap();
    stream::collect(reader).await.unwrap().to_vec()
}

pub(crate) fn storage<D: StorageDriver + 'static>(id: &str, driver: D) -> (&str, Arc<dyn StorageDriver>) {
    (id, Arc::new(driver))
}
