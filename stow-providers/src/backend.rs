// SPDX-License-Identifier: AGPL-3.0-or-later
//! The closed set of drivers behind one enum

use async_trait::async_trait;
use tracing::debug;

use stow_core::{
    BoxSink, ByteStream, Capabilities, EntryMeta, ResolvedEndpoint, StorageDescriptor,
    StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};

use crate::config::Settings;
use crate::{LocalBackend, MemoryBackend};

#[cfg(feature = "dropbox")]
use crate::dropbox::{DropboxBackend, DropboxConfig};
#[cfg(feature = "ftp")]
use crate::ftp::{FtpBackend, FtpConfig};
#[cfg(feature = "s3")]
use crate::s3::{S3Backend, S3Config};
#[cfg(feature = "webdav")]
use crate::webdav::{WebDavBackend, WebDavConfig};

/// One connected driver of any compiled-in kind
pub enum Backend {
    /// Local disk or a mounted network share
    Local(LocalBackend),
    Memory(MemoryBackend),
    #[cfg(feature = "s3")]
    ObjectStore(S3Backend),
    #[cfg(feature = "webdav")]
    WebDav(WebDavBackend),
    #[cfg(feature = "ftp")]
    Ftp(FtpBackend),
    #[cfg(feature = "dropbox")]
    CloudDrive(DropboxBackend),
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $call:expr) => {
        match $self {
            Backend::Local($driver) => $call,
            Backend::Memory($driver) => $call,
            #[cfg(feature = "s3")]
            Backend::ObjectStore($driver) => $call,
            #[cfg(feature = "webdav")]
            Backend::WebDav($driver) => $call,
            #[cfg(feature = "ftp")]
            Backend::Ftp($driver) => $call,
            #[cfg(feature = "dropbox")]
            Backend::CloudDrive($driver) => $call,
        }
    };
}

#[allow(dead_code)]
fn first(kind: StorageKind, endpoints: &[ResolvedEndpoint]) -> StowResult<&ResolvedEndpoint> {
    endpoints
        .first()
        .ok_or_else(|| StowError::InvalidConfig(format!("{kind} storage has no validated endpoint")))
}

impl Backend {
    /// Construct the driver for `descriptor`. `endpoints` are the validated
    /// forms of the strings the factory reported for it.
    pub fn connect(descriptor: &StorageDescriptor, endpoints: &[ResolvedEndpoint]) -> StowResult<Self> {
        let settings = Settings::from_descriptor(descriptor)?;
        debug!(id = %descriptor.id, kind = %descriptor.kind, "building driver");

        let backend = match descriptor.kind {
            StorageKind::Local => Backend::Local(LocalBackend::new(settings.required("root")?)),
            StorageKind::NetworkShare => {
                Backend::Local(LocalBackend::network_share(settings.required("mount_path")?))
            }
            StorageKind::Memory => Backend::Memory(MemoryBackend::new()),

            #[cfg(feature = "s3")]
            StorageKind::ObjectStore => Backend::ObjectStore(S3Backend::new(
                S3Config::from_settings(&settings)?,
                first(descriptor.kind, endpoints)?,
            )?),
            #[cfg(feature = "webdav")]
            StorageKind::Webdav => Backend::WebDav(WebDavBackend::new(
                WebDavConfig::from_settings(&settings)?,
                first(descriptor.kind, endpoints)?,
            )?),
            #[cfg(feature = "ftp")]
            StorageKind::Ftp => Backend::Ftp(FtpBackend::new(
                FtpConfig::from_settings(&settings)?,
                first(descriptor.kind, endpoints)?,
            )?),
            #[cfg(feature = "dropbox")]
            StorageKind::CloudDrive => Backend::CloudDrive(DropboxBackend::new(
                DropboxConfig::from_settings(&settings)?,
                endpoints,
            )?),

            StorageKind::Sftp => {
                return Err(StowError::Unsupported("sftp storage is not implemented".into()))
            }
            #[allow(unreachable_patterns)]
            kind => {
                return Err(StowError::Unsupported(format!(
                    "{kind} storage support is not compiled in"
                )))
            }
        };
        Ok(backend)
    }
}

#[async_trait]
impl StorageDriver for Backend {
    fn kind(&self) -> StorageKind {
        dispatch!(self, d => d.kind())
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, d => d.capabilities())
    }

    async fn health_check(&self) -> StowResult<()> {
        dispatch!(self, d => d.health_check().await)
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        dispatch!(self, d => d.list(path).await)
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        dispatch!(self, d => d.stat(path).await)
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        dispatch!(self, d => d.open_read(path, offset).await)
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        dispatch!(self, d => d.open_write(path).await)
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        dispatch!(self, d => d.mkdir(path).await)
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        dispatch!(self, d => d.remove(path, recursive).await)
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        dispatch!(self, d => d.move_native(src, dst).await)
    }
}
