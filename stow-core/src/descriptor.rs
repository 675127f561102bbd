// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage descriptors: the registry's identity and config records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{StowError, StowResult};

const MAX_ID_LEN: usize = 64;
const ENV_PREFIX: &str = "env:";
const REDACTED: &str = "********";

/// Storage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    Local,
    ObjectStore,
    Webdav,
    Ftp,
    Sftp,
    CloudDrive,
    NetworkShare,
    Memory,
}

impl StorageKind {
    pub const ALL: [StorageKind; 8] = [
        StorageKind::Local,
        StorageKind::ObjectStore,
        StorageKind::Webdav,
        StorageKind::Ftp,
        StorageKind::Sftp,
        StorageKind::CloudDrive,
        StorageKind::NetworkShare,
        StorageKind::Memory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::ObjectStore => "object-store",
            StorageKind::Webdav => "webdav",
            StorageKind::Ftp => "ftp",
            StorageKind::Sftp => "sftp",
            StorageKind::CloudDrive => "cloud-drive",
            StorageKind::NetworkShare => "network-share",
            StorageKind::Memory => "memory",
        }
    }

    /// Whether connecting requires reaching a network endpoint
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            StorageKind::ObjectStore
                | StorageKind::Webdav
                | StorageKind::Ftp
                | StorageKind::Sftp
                | StorageKind::CloudDrive
        )
    }

    /// Config keys that name the endpoint, in lookup order
    fn endpoint_keys(&self) -> &'static [&'static str] {
        match self {
            StorageKind::ObjectStore => &["endpoint"],
            StorageKind::Webdav => &["url"],
            StorageKind::Ftp | StorageKind::Sftp => &["host"],
            StorageKind::CloudDrive => &["api_url"],
            StorageKind::NetworkShare => &["host"],
            StorageKind::Local | StorageKind::Memory => &[],
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        StorageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StowError::InvalidConfig(format!("unknown storage kind: {s}")))
    }
}

/// Identity and connection facts for one backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub id: String,
    pub kind: StorageKind,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl StorageDescriptor {
    pub fn new(id: impl Into<String>, kind: StorageKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            icon: String::new(),
            is_default: false,
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn validate(&self) -> StowResult<()> {
        let valid = !self.id.is_empty()
            && self.id.len() <= MAX_ID_LEN
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StowError::InvalidConfig(format!(
                "storage id must be 1-{MAX_ID_LEN} characters of [A-Za-z0-9_-]: {:?}",
                self.id
            )));
        }
        Ok(())
    }

    /// The host or URL that must pass endpoint validation, if any
    pub fn endpoint(&self) -> Option<String> {
        self.kind
            .endpoint_keys()
            .iter()
            .find_map(|key| self.config.get(*key))
            .map(|value| resolve_value(value).unwrap_or_else(|_| value.clone()))
            .filter(|value| !value.is_empty())
    }

    /// Config with `env:NAME` references replaced by their values
    pub fn resolved_config(&self) -> StowResult<BTreeMap<String, String>> {
        self.config
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(v)?)))
            .collect()
    }

    /// Copy safe to display: secret-looking values are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for (key, value) in copy.config.iter_mut() {
            if is_secret_key(key) && !value.starts_with(ENV_PREFIX) {
                *value = REDACTED.to_string();
            }
        }
        copy
    }
}

fn resolve_value(value: &str) -> StowResult<String> {
    match value.strip_prefix(ENV_PREFIX) {
        Some(name) => std::env::var(name).map_err(|_| {
            StowError::InvalidConfig(format!("environment variable {name} is not set"))
        }),
        None => Ok(value.to_string()),
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    if key == "access_key_id" {
        return false;
    }
    ["password", "secret", "token", "key"]
        .iter()
        .any(|needle| key.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in StorageKind::ALL {
            assert_eq!(kind.as_str().parse::<StorageKind>().unwrap(), kind);
        }
        assert!("floppy".parse::<StorageKind>().is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(StorageDescriptor::new("s3-main_1", StorageKind::Memory, "x")
            .validate()
            .is_ok());
        assert!(StorageDescriptor::new("", StorageKind::Memory, "x").validate().is_err());
        assert!(StorageDescriptor::new("a/b", StorageKind::Memory, "x").validate().is_err());
        assert!(StorageDescriptor::new("x".repeat(65), StorageKind::Memory, "x")
            .validate()
            .is_err());
    }

    #[test]
    fn test_endpoint_per_kind() {
        let dav = StorageDescriptor::new("dav", StorageKind::Webdav, "dav")
            .with_config("url", "https://cloud.example.com/dav");
        assert_eq!(dav.endpoint().as_deref(), Some("https://cloud.example.com/dav"));

        let local = StorageDescriptor::new("disk", StorageKind::Local, "disk")
            .with_config("root", "/srv");
        assert!(local.endpoint().is_none());
        assert!(!local.kind.is_remote());
    }

    #[test]
    fn test_env_references_resolve() {
        std::env::set_var("STOW_TEST_SECRET_VALUE", "hunter2");
        let desc = StorageDescriptor::new("s3", StorageKind::ObjectStore, "s3")
            .with_config("secret_access_key", "env:STOW_TEST_SECRET_VALUE");
        let resolved = desc.resolved_config().unwrap();
        assert_eq!(resolved["secret_access_key"], "hunter2");

        let missing = StorageDescriptor::new("s3", StorageKind::ObjectStore, "s3")
            .with_config("token", "env:STOW_TEST_DEFINITELY_UNSET");
        assert!(matches!(missing.resolved_config(), Err(StowError::InvalidConfig(_))));
    }

    #[test]
    fn test_redacted_masks_secrets_only() {
        let desc = StorageDescriptor::new("s3", StorageKind::ObjectStore, "s3")
            .with_config("access_key_id", "AKIA123")
            .with_config("secret_access_key", "abc")
            .with_config("password", "env:FTP_PASS")
            .with_config("bucket", "media");
        let shown = desc.redacted();
        assert_eq!(shown.config["access_key_id"], "AKIA123");
        assert_eq!(shown.config["secret_access_key"], REDACTED);
        assert_eq!(shown.config["password"], "env:FTP_PASS");
        assert_eq!(shown.config["bucket"], "media");
    }
}
