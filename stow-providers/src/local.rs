// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local filesystem backend
//!
//! Also serves network shares, which are reached through a mount point.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::debug;

use stow_core::{
    BoxSink, ByteSink, ByteStream, Capabilities, EntryKind, EntryMeta, StorageDriver, StorageKind,
    StoragePath, StowError, StowResult,
};

const READ_BUFFER: usize = 256 * 1024;

#[cfg(unix)]
const CROSS_DEVICE_ERRNO: i32 = 18; // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_ERRNO: i32 = 17; // ERROR_NOT_SAME_DEVICE
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE_ERRNO: i32 = -1;

/// Local filesystem backend
pub struct LocalBackend {
    kind: StorageKind,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            kind: StorageKind::Local,
            root: root.as_ref().to_path_buf(),
        }
    }

    /// A share mounted at `mount_path`
    pub fn network_share(mount_path: impl AsRef<Path>) -> Self {
        Self {
            kind: StorageKind::NetworkShare,
            root: mount_path.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn to_real_path(&self, path: &StoragePath) -> PathBuf {
        let mut real = self.root.clone();
        for seg in path.segments() {
            real.push(seg);
        }
        real
    }

    async fn entry_at(&self, path: &StoragePath, real: &Path) -> StowResult<EntryMeta> {
        let meta = fs::symlink_metadata(real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;
        Ok(entry_from_metadata(path.clone(), &meta))
    }
}

fn entry_from_metadata(path: StoragePath, meta: &std::fs::Metadata) -> EntryMeta {
    let modified = meta.modified().ok().map(Into::into);
    let entry = if meta.file_type().is_symlink() {
        EntryMeta {
            kind: EntryKind::Symlink,
            ..EntryMeta::file(path, 0)
        }
    } else if meta.is_dir() {
        EntryMeta::directory(path)
    } else {
        EntryMeta::file(path, meta.len())
    };
    entry.with_modified(modified)
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.stow-{}.part", name, uuid::Uuid::new_v4().simple()))
}

#[async_trait]
impl StorageDriver for LocalBackend {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::local_filesystem()
    }

    async fn health_check(&self) -> StowResult<()> {
        let display = self.root.display().to_string();
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| StowError::from_io(e, display.clone()))?;
        if !meta.is_dir() {
            return Err(StowError::NotADirectory(display));
        }
        Ok(())
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let real = self.to_real_path(path);
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;
        if !meta.is_dir() {
            return Err(StowError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = path.join(&name)?;
            // DirEntry metadata does not follow symlinks
            match entry.metadata().await {
                Ok(meta) => entries.push(entry_from_metadata(child, &meta)),
                // Raced with a delete
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StowError::from_io(e, child.to_string())),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        let real = self.to_real_path(path);
        self.entry_at(path, &real).await
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let real = self.to_real_path(path);
        if fs::metadata(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?
            .is_dir()
        {
            return Err(StowError::NotAFile(path.to_string()));
        }

        let mut file = fs::File::open(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| StowError::from_io(e, path.to_string()))?;
        }

        let shown = path.to_string();
        debug!(path = %shown, offset, "local read");
        let stream = ReaderStream::with_capacity(file, READ_BUFFER)
            .map(move |chunk| chunk.map_err(|e| StowError::from_io(e, shown.clone())));
        Ok(Box::pin(stream))
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        if path.is_root() {
            return Err(StowError::NotAFile(path.to_string()));
        }
        let target = self.to_real_path(path);
        if let Ok(meta) = fs::metadata(&target).await {
            if meta.is_dir() {
                return Err(StowError::NotAFile(path.to_string()));
            }
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StowError::from_io(e, path.to_string()))?;
        }

        let temp = temp_sibling(&target);
        let file = fs::File::create(&temp)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;

        Ok(Box::new(LocalSink {
            path: path.clone(),
            target,
            temp: Some(temp),
            file: Some(BufWriter::new(file)),
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        let real = self.to_real_path(path);
        match fs::metadata(&real).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => return Err(StowError::AlreadyExists(path.to_string())),
            Err(_) => {}
        }
        fs::create_dir_all(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let real = self.to_real_path(path);
        let meta = fs::symlink_metadata(&real)
            .await
            .map_err(|e| StowError::from_io(e, path.to_string()))?;

        if !meta.is_dir() {
            return fs::remove_file(&real)
                .await
                .map_err(|e| StowError::from_io(e, path.to_string()));
        }
        if !recursive {
            return fs::remove_dir(&real)
                .await
                .map_err(|e| StowError::from_io(e, path.to_string()));
        }
        match remove_tree(&real, path).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        let from = self.to_real_path(src);
        let to = self.to_real_path(dst);

        fs::symlink_metadata(&from)
            .await
            .map_err(|e| StowError::from_io(e, src.to_string()))?;
        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(StowError::AlreadyExists(dst.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StowError::from_io(e, dst.to_string()))?;
        }

        match fs::rename(&from, &to).await {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
                debug!(src = %src, dst = %dst, "rename crosses devices, falling back");
                Ok(false)
            }
            Err(e) => Err(StowError::from_io(e, src.to_string())),
        }
    }
}

/// Delete everything under `dir`, continuing past failures. Returns the
/// first error encountered.
async fn remove_tree(dir: &Path, display_root: &StoragePath) -> Option<StowError> {
    remove_tree_with(dir, display_root, |file| async move { fs::remove_file(file).await }).await
}

async fn remove_tree_with<F, Fut>(
    dir: &Path,
    display_root: &StoragePath,
    remove_file: F,
) -> Option<StowError>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    fn record(first: &mut Option<StowError>, err: std::io::Error, at: &Path) {
        if first.is_none() {
            *first = Some(StowError::from_io(err, at.display().to_string()));
        }
    }

    let mut first_error = None;
    let mut pending = vec![dir.to_path_buf()];
    let mut dirs = Vec::new();
    while let Some(current) = pending.pop() {
        let mut read_dir = match fs::read_dir(&current).await {
            Ok(rd) => rd,
            Err(e) => {
                record(&mut first_error, e, &current);
                continue;
            }
        };
        dirs.push(current.clone());
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let child = entry.path();
                    match entry.file_type().await {
                        Ok(ft) if ft.is_dir() => pending.push(child),
                        Ok(_) => {
                            if let Err(e) = remove_file(child.clone()).await {
                                record(&mut first_error, e, &child);
                            }
                        }
                        Err(e) => record(&mut first_error, e, &child),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    record(&mut first_error, e, &current);
                    break;
                }
            }
        }
    }

    // Children were pushed after their parents
    for d in dirs.iter().rev() {
        if let Err(e) = fs::remove_dir(d).await {
            if first_error.is_none() {
                first_error = Some(StowError::from_io(e, display_root.to_string()));
            }
        }
    }
    first_error
}

struct LocalSink {
    path: StoragePath,
    target: PathBuf,
    temp: Option<PathBuf>,
    file: Option<BufWriter<fs::File>>,
}

impl LocalSink {
    fn io_err(&self, err: std::io::Error) -> StowError {
        StowError::from_io(err, self.path.to_string())
    }
}

#[async_trait]
impl ByteSink for LocalSink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StowError::Other("write after close".into()))?;
        match file.write_all(&chunk).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn commit(mut self: Box<Self>) -> StowResult<EntryMeta> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StowError::Other("sink already closed".into()))?;
        if let Err(e) = file.flush().await {
            return Err(self.io_err(e));
        }
        if let Err(e) = file.get_mut().sync_all().await {
            return Err(self.io_err(e));
        }
        drop(file);

        let Some(temp) = self.temp.take() else {
            return Err(StowError::Other("sink already closed".into()));
        };
        if let Err(e) = fs::rename(&temp, &self.target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(self.io_err(e));
        }

        let meta = fs::metadata(&self.target).await.map_err(|e| self.io_err(e))?;
        Ok(entry_from_metadata(self.path.clone(), &meta))
    }

    async fn abort(mut self: Box<Self>) -> StowResult<()> {
        self.file.take();
        if let Some(temp) = self.temp.take() {
            match fs::remove_file(&temp).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_err(e)),
            }
        }
        Ok(())
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            let _ = std::fs::remove_file(temp);
        }
    }
}
