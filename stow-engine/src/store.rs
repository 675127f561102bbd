// SPDX-License-Identifier: AGPL-3.0-or-later
//! Descriptor persistence

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use stow_core::{StorageDescriptor, StowError, StowResult};

/// Where the registry keeps its descriptor set
pub trait DescriptorStore: Send + Sync {
    fn load(&self) -> StowResult<Vec<StorageDescriptor>>;
    fn save(&self, descriptors: &[StorageDescriptor]) -> StowResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, rename = "storage")]
    storages: Vec<StorageDescriptor>,
}

/// TOML file of `[[storage]]` tables, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct TomlDescriptorStore {
    path: PathBuf,
}

impl TomlDescriptorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> StowError {
    StowError::Persistence(format!("{}: {err}", path.display()))
}

impl DescriptorStore for TomlDescriptorStore {
    fn load(&self) -> StowResult<Vec<StorageDescriptor>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence(&self.path, e)),
        };
        let state: StateFile = toml::from_str(&content).map_err(|e| persistence(&self.path, e))?;

        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(state.storages.len());
        for descriptor in state.storages {
            if !seen.insert(descriptor.id.clone()) {
                warn!(id = %descriptor.id, "duplicate storage id in state file, keeping the first");
                continue;
            }
            descriptors.push(descriptor);
        }
        debug!(path = %self.path.display(), count = descriptors.len(), "loaded descriptors");
        Ok(descriptors)
    }

    fn save(&self, descriptors: &[StorageDescriptor]) -> StowResult<()> {
        let state = StateFile {
            storages: descriptors.to_vec(),
        };
        let content = toml::to_string_pretty(&state).map_err(|e| persistence(&self.path, e))?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| persistence(dir, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| persistence(dir, e))?;
        temp.write_all(content.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| persistence(&self.path, e))?;
        temp.persist(&self.path)
            .map_err(|e| persistence(&self.path, e.error))?;
        Ok(())
    }
}

/// Keeps descriptors in memory; for tests and throwaway sessions
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    saved: Mutex<Vec<StorageDescriptor>>,
    fail_saves: Mutex<bool>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptors(descriptors: Vec<StorageDescriptor>) -> Self {
        Self {
            saved: Mutex::new(descriptors),
            fail_saves: Mutex::new(false),
        }
    }

    /// What the last save wrote
    pub fn snapshot(&self) -> Vec<StorageDescriptor> {
        self.saved.lock().clone()
    }

    /// Make subsequent saves fail, to exercise rollback paths
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn load(&self) -> StowResult<Vec<StorageDescriptor>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, descriptors: &[StorageDescriptor]) -> StowResult<()> {
        if *self.fail_saves.lock() {
            return Err(StowError::Persistence("store is read-only".into()));
        }
        *self.saved.lock() = descriptors.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stow_core::StorageKind;

    fn sample() -> Vec<StorageDescriptor> {
        let mut disk = StorageDescriptor::new("disk", StorageKind::Local, "Disk")
            .with_config("root", "/srv/files")
            .with_icon("hdd");
        disk.is_default = true;
        let bucket = StorageDescriptor::new("bucket", StorageKind::ObjectStore, "Bucket")
            .with_config("endpoint", "https://s3.example.com")
            .with_config("secret_access_key", "env:BUCKET_SECRET");
        vec![disk, bucket]
    }

    #[test]
    fn test_toml_store_persists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDescriptorStore::new(dir.path().join("state").join("storages.toml"));
        assert!(store.load().unwrap().is_empty());

        store.save(&sample()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, sample());

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("[[storage]]"));
        assert!(text.contains("kind = \"object-store\""));
    }

    #[test]
    fn test_toml_store_skips_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storages.toml");
        std::fs::write(
            &path,
            "[[storage]]\nid = \"a\"\nkind = \"memory\"\nname = \"First\"\n\n\
             [[storage]]\nid = \"a\"\nkind = \"memory\"\nname = \"Second\"\n",
        )
        .unwrap();
        let loaded = TomlDescriptorStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "First");
    }

    #[test]
    fn test_toml_store_reports_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storages.toml");
        std::fs::write(&path, "this is [not toml").unwrap();
        assert!(matches!(
            TomlDescriptorStore::new(&path).load(),
            Err(StowError::Persistence(_))
        ));
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let store = MemoryDescriptorStore::new();
        store.save(&sample()).unwrap();
        store.set_fail_saves(true);
        assert!(store.save(&[]).is_err());
        assert_eq!(store.snapshot().len(), 2);
    }
}
