// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage registry: descriptors, their live drivers, and usage leases
//!
//! Mutations are serialized by one async mutex. Driver construction happens
//! while only that mutex is held; the descriptor table itself is locked just
//! long enough to swap entries, so readers never wait on a handshake.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use stow_core::{
    BackendFactory, StorageDescriptor, StorageDriver, StowError, StowResult,
};

use crate::security::SecurityGate;
use crate::store::DescriptorStore;

struct Entry {
    descriptor: StorageDescriptor,
    /// The live driver, or why it could not be built
    driver: Result<Arc<dyn StorageDriver>, String>,
    /// One strong reference per outstanding lease, plus the entry's own
    users: Arc<()>,
}

impl Entry {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.users) > 1
    }
}

/// A driver checked out for the duration of a job.
///
/// While any lease on a storage is alive, removing that storage fails with
/// `InUse`.
#[derive(Clone)]
pub struct StorageLease {
    id: String,
    driver: Arc<dyn StorageDriver>,
    _users: Option<Arc<()>>,
}

impl StorageLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// A lease on a driver the registry does not track
    pub fn unregistered(id: impl Into<String>, driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            id: id.into(),
            driver,
            _users: None,
        }
    }
}

/// Descriptor plus whether its driver is currently usable
#[derive(Debug, Clone)]
pub struct StorageStatus {
    pub descriptor: StorageDescriptor,
    pub unavailable: Option<String>,
    pub in_use: bool,
}

pub struct StorageRegistry {
    entries: RwLock<Vec<Entry>>,
    mutation: Mutex<()>,
    factory: Arc<dyn BackendFactory>,
    security: Arc<SecurityGate>,
    store: Arc<dyn DescriptorStore>,
}

impl StorageRegistry {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        security: Arc<SecurityGate>,
        store: Arc<dyn DescriptorStore>,
    ) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            mutation: Mutex::new(()),
            factory,
            security,
            store,
        }
    }

    pub fn security(&self) -> &Arc<SecurityGate> {
        &self.security
    }

    /// Validate every endpoint of `descriptor` and build its driver
    async fn connect(&self, descriptor: &StorageDescriptor) -> StowResult<Arc<dyn StorageDriver>> {
        descriptor.validate()?;
        let endpoints = self.factory.endpoints(descriptor)?;
        if descriptor.kind.is_remote() && endpoints.is_empty() {
            return Err(StowError::InvalidConfig(format!(
                "{} storage needs an endpoint",
                descriptor.kind
            )));
        }
        let mut resolved = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            resolved.push(self.security.validate(endpoint).await?);
        }
        self.factory.build(descriptor, &resolved).await
    }

    async fn connect_checked(&self, descriptor: &StorageDescriptor) -> StowResult<Arc<dyn StorageDriver>> {
        let driver = self.connect(descriptor).await?;
        driver.health_check().await?;
        Ok(driver)
    }

    fn persist(&self) -> StowResult<()> {
        let descriptors: Vec<StorageDescriptor> =
            self.entries.read().iter().map(|e| e.descriptor.clone()).collect();
        self.store.save(&descriptors)
    }

    /// Reload the persisted descriptor set. Storages whose driver cannot be
    /// built stay registered but report `Unavailable`. Returns how many loaded.
    pub async fn load(&self) -> StowResult<usize> {
        let _guard = self.mutation.lock().await;
        let descriptors = self.store.load()?;

        let mut loaded = Vec::with_capacity(descriptors.len());
        let mut seen_default = false;
        for mut descriptor in descriptors {
            if descriptor.is_default {
                if seen_default {
                    warn!(id = %descriptor.id, "second default storage in state, clearing flag");
                    descriptor.is_default = false;
                }
                seen_default = true;
            }
            let driver = match self.connect(&descriptor).await {
                Ok(driver) => Ok(driver),
                Err(e) => {
                    warn!(id = %descriptor.id, error = %e, "storage unavailable");
                    Err(e.to_string())
                }
            };
            loaded.push(Entry {
                descriptor,
                driver,
                users: Arc::new(()),
            });
        }

        let count = loaded.len();
        *self.entries.write() = loaded;
        info!(count, "storages loaded");
        Ok(count)
    }

    /// Register a new storage. The driver is built and health-checked before
    /// anything is committed.
    pub async fn add(&self, descriptor: StorageDescriptor) -> StowResult<()> {
        let _guard = self.mutation.lock().await;
        if self.entries.read().iter().any(|e| e.descriptor.id == descriptor.id) {
            return Err(StowError::Duplicate(descriptor.id));
        }

        let driver = self.connect_checked(&descriptor).await?;

        let mut descriptor = descriptor;
        let previous_default = {
            let mut entries = self.entries.write();
            if entries.is_empty() {
                descriptor.is_default = true;
            }
            let previous = if descriptor.is_default {
                entries.iter_mut().find(|e| e.descriptor.is_default).map(|e| {
                    e.descriptor.is_default = false;
                    e.descriptor.id.clone()
                })
            } else {
                None
            };
            entries.push(Entry {
                descriptor: descriptor.clone(),
                driver: Ok(driver),
                users: Arc::new(()),
            });
            previous
        };

        if let Err(e) = self.persist() {
            let mut entries = self.entries.write();
            entries.retain(|e| e.descriptor.id != descriptor.id);
            if let Some(previous) = previous_default {
                if let Some(entry) = entries.iter_mut().find(|e| e.descriptor.id == previous) {
                    entry.descriptor.is_default = true;
                }
            }
            return Err(e);
        }
        info!(id = %descriptor.id, kind = %descriptor.kind, "storage added");
        Ok(())
    }

    /// Unregister a storage. Fails with `InUse` while a job holds a lease.
    pub async fn remove(&self, id: &str) -> StowResult<StorageDescriptor> {
        let _guard = self.mutation.lock().await;
        let (index, removed) = {
            let mut entries = self.entries.write();
            let index = entries
                .iter()
                .position(|e| e.descriptor.id == id)
                .ok_or_else(|| StowError::StorageNotFound(id.to_string()))?;
            if entries[index].in_use() {
                return Err(StowError::InUse(id.to_string()));
            }
            (index, entries.remove(index))
        };

        if let Err(e) = self.persist() {
            self.entries.write().insert(index, removed);
            return Err(e);
        }
        info!(id, "storage removed");
        Ok(removed.descriptor)
    }

    /// The live driver for `id`
    pub fn get(&self, id: &str) -> StowResult<Arc<dyn StorageDriver>> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.descriptor.id == id)
            .ok_or_else(|| StowError::StorageNotFound(id.to_string()))?;
        match &entry.driver {
            Ok(driver) => Ok(Arc::clone(driver)),
            Err(reason) => Err(StowError::Unavailable {
                id: id.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Check out the driver for `id`, blocking removal until the lease drops
    pub fn lease(&self, id: &str) -> StowResult<StorageLease> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.descriptor.id == id)
            .ok_or_else(|| StowError::StorageNotFound(id.to_string()))?;
        match &entry.driver {
            Ok(driver) => Ok(StorageLease {
                id: id.to_string(),
                driver: Arc::clone(driver),
                _users: Some(Arc::clone(&entry.users)),
            }),
            Err(reason) => Err(StowError::Unavailable {
                id: id.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    pub fn descriptor(&self, id: &str) -> StowResult<StorageDescriptor> {
        self.entries
            .read()
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| StowError::StorageNotFound(id.to_string()))
    }

    /// Descriptors in registration order
    pub fn list(&self) -> Vec<StorageDescriptor> {
        self.entries.read().iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn statuses(&self) -> Vec<StorageStatus> {
        self.entries
            .read()
            .iter()
            .map(|e| StorageStatus {
                descriptor: e.descriptor.clone(),
                unavailable: e.driver.as_ref().err().cloned(),
                in_use: e.in_use(),
            })
            .collect()
    }

    pub fn default_storage(&self) -> Option<StorageDescriptor> {
        self.entries
            .read()
            .iter()
            .find(|e| e.descriptor.is_default)
            .map(|e| e.descriptor.clone())
    }

    /// Make `id` the only default storage
    pub async fn set_default(&self, id: &str) -> StowResult<()> {
        let _guard = self.mutation.lock().await;
        let previous = {
            let mut entries = self.entries.write();
            if !entries.iter().any(|e| e.descriptor.id == id) {
                return Err(StowError::StorageNotFound(id.to_string()));
            }
            let previous = entries
                .iter()
                .find(|e| e.descriptor.is_default)
                .map(|e| e.descriptor.id.clone());
            for entry in entries.iter_mut() {
                entry.descriptor.is_default = entry.descriptor.id == id;
            }
            previous
        };

        if let Err(e) = self.persist() {
            let mut entries = self.entries.write();
            for entry in entries.iter_mut() {
                entry.descriptor.is_default = Some(&entry.descriptor.id) == previous.as_ref();
            }
            return Err(e);
        }
        info!(id, "default storage set");
        Ok(())
    }

    /// Replace a storage's config. A new driver is built and swapped in;
    /// jobs already holding the old driver keep using it.
    pub async fn update_config(&self, id: &str, config: BTreeMap<String, String>) -> StowResult<()> {
        let _guard = self.mutation.lock().await;
        let mut updated = self.descriptor(id)?;
        updated.config = config;

        let driver = self.connect_checked(&updated).await?;

        let previous = {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.descriptor.id == id)
                .ok_or_else(|| StowError::StorageNotFound(id.to_string()))?;
            let old_descriptor = std::mem::replace(&mut entry.descriptor, updated);
            let old_driver = std::mem::replace(&mut entry.driver, Ok(driver));
            (old_descriptor, old_driver)
        };

        if let Err(e) = self.persist() {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.iter_mut().find(|e| e.descriptor.id == id) {
                entry.descriptor = previous.0;
                entry.driver = previous.1;
            }
            return Err(e);
        }
        info!(id, "storage config updated");
        Ok(())
    }

    /// Validate, build and health-check a descriptor without registering it
    pub async fn test_connection(&self, descriptor: &StorageDescriptor) -> StowResult<()> {
        self.connect_checked(descriptor).await.map(|_| ())
    }

    /// Build a driver for an unregistered one-off destination
    pub async fn connect_ephemeral(&self, descriptor: &StorageDescriptor) -> StowResult<Arc<dyn StorageDriver>> {
        self.connect(descriptor).await
    }

    pub fn is_in_use(&self, id: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.descriptor.id == id && e.in_use())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityPolicy, StaticResolver};
    use crate::store::MemoryDescriptorStore;
    use stow_core::StorageKind;
    use stow_providers::ProviderFactory;

    fn registry_with(store: Arc<MemoryDescriptorStore>) -> StorageRegistry {
        let resolver = StaticResolver::new()
            .with_host("metadata.internal", ["169.254.169.254".parse().unwrap()]);
        let security = SecurityGate::with_resolver(SecurityPolicy::default(), Arc::new(resolver));
        StorageRegistry::new(Arc::new(ProviderFactory::new()), Arc::new(security), store)
    }

    fn registry() -> (StorageRegistry, Arc<MemoryDescriptorStore>) {
        let store = Arc::new(MemoryDescriptorStore::new());
        (registry_with(Arc::clone(&store)), store)
    }

    fn memory(id: &str) -> StorageDescriptor {
        StorageDescriptor::new(id, StorageKind::Memory, id.to_uppercase())
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let (registry, store) = registry();
        registry.add(memory("a")).await.unwrap();
        assert_eq!(registry.get("a").unwrap().kind(), StorageKind::Memory);
        assert_eq!(store.snapshot().len(), 1);

        assert!(matches!(registry.add(memory("a")).await, Err(StowError::Duplicate(_))));

        registry.remove("a").await.unwrap();
        assert!(matches!(registry.get("a"), Err(StowError::StorageNotFound(_))));
        assert!(matches!(registry.remove("a").await, Err(StowError::StorageNotFound(_))));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_single_default() {
        let (registry, _) = registry();
        registry.add(memory("x")).await.unwrap();
        registry.add(memory("y")).await.unwrap();
        // First storage becomes the default automatically
        assert_eq!(registry.default_storage().unwrap().id, "x");

        registry.set_default("x").await.unwrap();
        registry.set_default("y").await.unwrap();
        let defaults: Vec<_> = registry.list().into_iter().filter(|d| d.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, "y");

        assert!(registry.set_default("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let (registry, _) = registry();
        for id in ["c", "a", "b"] {
            registry.add(memory(id)).await.unwrap();
        }
        let ids: Vec<_> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_lease_blocks_remove() {
        let (registry, _) = registry();
        registry.add(memory("busy")).await.unwrap();
        let lease = registry.lease("busy").unwrap();
        assert!(registry.is_in_use("busy"));
        assert!(matches!(registry.remove("busy").await, Err(StowError::InUse(_))));
        drop(lease);
        registry.remove("busy").await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_endpoint_not_registered() {
        let (registry, store) = registry();
        let dav = StorageDescriptor::new("dav", StorageKind::Webdav, "DAV")
            .with_config("url", "http://metadata.internal/dav");
        assert!(matches!(
            registry.add(dav.clone()).await,
            Err(StowError::EndpointBlocked { .. })
        ));
        assert!(matches!(
            registry.test_connection(&dav).await,
            Err(StowError::EndpointBlocked { .. })
        ));
        assert!(registry.list().is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_failed_health_check_not_committed() {
        let (registry, _) = registry();
        let missing = StorageDescriptor::new("gone", StorageKind::Local, "Gone")
            .with_config("root", "/definitely/not/here/stowage");
        assert!(registry.add(missing).await.is_err());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_load_marks_broken_storages_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let good = StorageDescriptor::new("disk", StorageKind::Local, "Disk")
            .with_config("root", dir.path().to_string_lossy());
        let blocked = StorageDescriptor::new("dav", StorageKind::Webdav, "DAV")
            .with_config("url", "http://10.0.0.8/dav");
        let store = Arc::new(MemoryDescriptorStore::with_descriptors(vec![good, blocked]));
        let registry = registry_with(store);

        assert_eq!(registry.load().await.unwrap(), 2);
        assert!(registry.get("disk").is_ok());
        assert!(matches!(registry.get("dav"), Err(StowError::Unavailable { .. })));
        let statuses = registry.statuses();
        assert!(statuses[1].unavailable.is_some());

        // A config that still cannot connect is rejected and changes nothing
        let fixed: BTreeMap<String, String> =
            [("root".to_string(), dir.path().to_string_lossy().into_owned())].into();
        assert!(registry.update_config("dav", fixed).await.is_err());
        assert!(matches!(registry.get("dav"), Err(StowError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_update_config_swaps_driver() {
        let (registry, store) = registry();
        registry.add(memory("scratch")).await.unwrap();
        let old = registry.get("scratch").unwrap();
        registry
            .update_config("scratch", [("note".to_string(), "v2".to_string())].into())
            .await
            .unwrap();
        let new = registry.get("scratch").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(store.snapshot()[0].config.get("note").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn test_persistence_failure_rolls_back() {
        let (registry, store) = registry();
        registry.add(memory("keep")).await.unwrap();
        store.set_fail_saves(true);
        assert!(matches!(registry.add(memory("new")).await, Err(StowError::Persistence(_))));
        assert_eq!(registry.list().len(), 1);
        assert!(registry.remove("keep").await.is_err());
        assert!(registry.get("keep").is_ok());
    }
}
