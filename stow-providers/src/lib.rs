// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage drivers for Stowage
//!
//! Local disks, network-share mounts and in-memory scratch space are always
//! available. Remote protocols sit behind cargo features.

mod backend;
mod config;
mod local;
mod memory;

#[cfg(feature = "http")]
mod http;
#[cfg(any(feature = "s3", feature = "webdav"))]
mod xml;

#[cfg(feature = "dropbox")]
pub mod dropbox;

#[cfg(feature = "ftp")]
pub mod ftp;

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "webdav")]
pub mod webdav;

pub use backend::Backend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;

#[cfg(feature = "dropbox")]
pub use dropbox::{DropboxBackend, DropboxConfig};

#[cfg(feature = "ftp")]
pub use ftp::{FtpBackend, FtpConfig};

#[cfg(feature = "s3")]
pub use s3::{S3Backend, S3Config};

#[cfg(feature = "webdav")]
pub use webdav::{WebDavAuth, WebDavBackend, WebDavConfig};

use async_trait::async_trait;
use std::sync::Arc;

use stow_core::{
    BackendFactory, ResolvedEndpoint, StorageDescriptor, StorageDriver, StorageKind, StowResult,
};

use config::Settings;

/// Builds drivers for every storage kind compiled into this crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn new() -> Self {
        Self
    }

    /// Whether a driver for `kind` is compiled in
    pub fn supports(kind: StorageKind) -> bool {
        match kind {
            StorageKind::Local | StorageKind::NetworkShare | StorageKind::Memory => true,
            StorageKind::ObjectStore => cfg!(feature = "s3"),
            StorageKind::Webdav => cfg!(feature = "webdav"),
            StorageKind::Ftp => cfg!(feature = "ftp"),
            StorageKind::CloudDrive => cfg!(feature = "dropbox"),
            StorageKind::Sftp => false,
        }
    }
}

#[async_trait]
impl BackendFactory for ProviderFactory {
    fn endpoints(&self, descriptor: &StorageDescriptor) -> StowResult<Vec<String>> {
        match descriptor.kind {
            #[cfg(feature = "dropbox")]
            StorageKind::CloudDrive => {
                let settings = Settings::from_descriptor(descriptor)?;
                Ok(vec![
                    settings
                        .optional("api_url")
                        .unwrap_or(dropbox::DEFAULT_API_URL)
                        .to_string(),
                    settings
                        .optional("content_url")
                        .unwrap_or(dropbox::DEFAULT_CONTENT_URL)
                        .to_string(),
                ])
            }
            // Virtual-hosted buckets put the bucket in the hostname
            #[cfg(feature = "s3")]
            StorageKind::ObjectStore => {
                let settings = Settings::from_descriptor(descriptor)?;
                Ok(vec![S3Config::from_settings(&settings)?.request_base()])
            }
            _ => Ok(descriptor.endpoint().into_iter().collect()),
        }
    }

    async fn build(
        &self,
        descriptor: &StorageDescriptor,
        endpoints: &[ResolvedEndpoint],
    ) -> StowResult<Arc<dyn StorageDriver>> {
        Ok(Arc::new(Backend::connect(descriptor, endpoints)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stow_core::StowError;

    #[tokio::test]
    async fn test_build_local_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ProviderFactory::new();

        let local = StorageDescriptor::new("disk", StorageKind::Local, "Disk")
            .with_config("root", dir.path().to_string_lossy());
        let driver = factory.build(&local, &[]).await.unwrap();
        assert_eq!(driver.kind(), StorageKind::Local);
        driver.health_check().await.unwrap();

        let memory = StorageDescriptor::new("scratch", StorageKind::Memory, "Scratch");
        assert_eq!(factory.build(&memory, &[]).await.unwrap().kind(), StorageKind::Memory);
    }

    #[tokio::test]
    async fn test_missing_root_is_invalid_config() {
        let desc = StorageDescriptor::new("disk", StorageKind::Local, "Disk");
        let result = ProviderFactory::new().build(&desc, &[]).await;
        assert!(matches!(result, Err(StowError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_sftp_unsupported() {
        let desc = StorageDescriptor::new("box", StorageKind::Sftp, "Box").with_config("host", "example.com");
        assert!(!ProviderFactory::supports(StorageKind::Sftp));
        let result = ProviderFactory::new().build(&desc, &[]).await;
        assert!(matches!(result, Err(StowError::Unsupported(_))));
    }

    #[cfg(feature = "s3")]
    #[test]
    fn test_object_store_endpoint_is_request_base() {
        let desc = StorageDescriptor::new("bucket", StorageKind::ObjectStore, "Bucket")
            .with_config("endpoint", "https://s3.example.com")
            .with_config("bucket", "photos")
            .with_config("path_style", "false")
            .with_config("access_key_id", "AK")
            .with_config("secret_access_key", "SK");
        let endpoints = ProviderFactory::new().endpoints(&desc).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].contains("photos.s3.example.com"));
    }

    #[cfg(feature = "dropbox")]
    #[test]
    fn test_cloud_drive_validates_both_hosts() {
        let desc = StorageDescriptor::new("dbx", StorageKind::CloudDrive, "Dropbox")
            .with_config("access_token", "t");
        let endpoints = ProviderFactory::new().endpoints(&desc).unwrap();
        assert_eq!(endpoints, [dropbox::DEFAULT_API_URL, dropbox::DEFAULT_CONTENT_URL]);
    }

    #[test]
    fn test_default_endpoints_follow_descriptor() {
        let desc = StorageDescriptor::new("dav", StorageKind::Webdav, "DAV")
            .with_config("url", "https://dav.example.com/files");
        assert_eq!(
            ProviderFactory::new().endpoints(&desc).unwrap(),
            ["https://dav.example.com/files"]
        );
    }
}
