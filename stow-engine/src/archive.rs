// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive engine: compress storage trees into zip/tar/tar.gz and extract
//! them back
//!
//! The `tar`, `flate2` and `zip` codecs are synchronous, so each runs on a
//! blocking thread joined to the async side by bounded channels. tar and
//! tar.gz stream end to end; zip needs its central directory, so zip goes
//! through an anonymous temporary file in both directions.

use bytes::{Buf, Bytes};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use stow_core::{
    BoxSink, EntryKind, QualifiedPath, Side, StorageDriver, StoragePath, StowError, StowResult,
};

use crate::engine::JobCtx;
use crate::job::ItemOutcome;

/// Messages buffered between the async side and a codec thread
const CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Infer from `.zip`, `.tar`, `.tar.gz` or `.tgz`
    pub fn from_path(path: &StoragePath) -> Option<Self> {
        let name = path.name()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    fn resolve(explicit: Option<Self>, path: &QualifiedPath) -> StowResult<Self> {
        explicit.or_else(|| Self::from_path(&path.path)).ok_or_else(|| {
            StowError::InvalidConfig(format!("cannot tell the archive format of {path}"))
        })
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "tar.gz" | "tgz" | "targz" => Ok(ArchiveFormat::TarGz),
            other => Err(StowError::InvalidConfig(format!("unknown archive format: {other}"))),
        }
    }
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer stopped")
}

/// Codec failures read as a damaged archive; anything else is plain I/O
fn codec_error(err: io::Error) -> StowError {
    match err.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Other => {
            StowError::Corrupt(err.to_string())
        }
        _ => StowError::Io(err),
    }
}

fn joined<T>(result: Result<io::Result<T>, tokio::task::JoinError>) -> StowResult<io::Result<T>> {
    result.map_err(|e| StowError::Other(format!("archive codec thread failed: {e}")))
}

// ---------------------------------------------------------------------------
// Compress
// ---------------------------------------------------------------------------

/// Input handed to the archive writer thread
enum Feed {
    Dir { name: String, mtime: u64 },
    File { name: String, size: u64, mtime: u64 },
    Chunk(Bytes),
    End,
}

/// One entry of the archive being built
struct Planned {
    name: String,
    path: StoragePath,
    /// `None` for directories
    size: Option<u64>,
    mtime: u64,
}

/// Collects written bytes into chunk-sized blocks for the async side
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    buf: Vec<u8>,
    chunk: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Bytes>, chunk: usize) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(chunk),
            chunk,
        }
    }

    fn send(&mut self) -> io::Result<()> {
        let block = Bytes::from(std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk)));
        self.tx.blocking_send(block).map_err(|_| stopped())
    }

    fn finish(mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.send()?;
        }
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The body of one file entry, read off the feed until `End`
struct FeedReader<'a> {
    feed: &'a mut mpsc::Receiver<Feed>,
    current: Bytes,
    done: bool,
}

impl<'a> FeedReader<'a> {
    fn new(feed: &'a mut mpsc::Receiver<Feed>) -> Self {
        Self {
            feed,
            current: Bytes::new(),
            done: false,
        }
    }
}

impl Read for FeedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.feed.blocking_recv() {
                Some(Feed::Chunk(chunk)) => self.current = chunk,
                Some(Feed::End) => self.done = true,
                Some(_) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "entry cut short"))
                }
                None => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive input closed"))
                }
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

fn tar_header(kind: tar::EntryType, size: u64, mtime: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mtime(mtime);
    header.set_mode(if kind.is_dir() { 0o755 } else { 0o644 });
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn write_tar<W: Write>(feed: &mut mpsc::Receiver<Feed>, out: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(out);
    while let Some(item) = feed.blocking_recv() {
        match item {
            Feed::Dir { name, mtime } => {
                let mut header = tar_header(tar::EntryType::Directory, 0, mtime);
                builder.append_data(&mut header, format!("{name}/"), io::empty())?;
            }
            Feed::File { name, size, mtime } => {
                let mut header = tar_header(tar::EntryType::Regular, size, mtime);
                builder.append_data(&mut header, &name, FeedReader::new(feed))?;
            }
            Feed::Chunk(_) | Feed::End => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "file data outside an entry"))
            }
        }
    }
    builder.into_inner()
}

fn zip_options(size: u64) -> zip::write::SimpleFileOptions {
    zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(size >= u64::from(u32::MAX))
}

fn write_zip(feed: &mut mpsc::Receiver<Feed>, mut out: ChannelWriter) -> io::Result<()> {
    let mut zip = zip::ZipWriter::new(tempfile::tempfile()?);
    while let Some(item) = feed.blocking_recv() {
        match item {
            Feed::Dir { name, .. } => zip.add_directory(name, zip_options(0)).map_err(zip_error)?,
            Feed::File { name, size, .. } => {
                zip.start_file(name, zip_options(size)).map_err(zip_error)?;
                io::copy(&mut FeedReader::new(feed), &mut zip)?;
            }
            Feed::Chunk(_) | Feed::End => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "file data outside an entry"))
            }
        }
    }
    let mut spool = zip.finish().map_err(zip_error)?;
    spool.seek(SeekFrom::Start(0))?;
    io::copy(&mut spool, &mut out)?;
    out.finish()
}

/// Runs on a blocking thread until the feed closes
fn write_archive(format: ArchiveFormat, mut feed: mpsc::Receiver<Feed>, out: ChannelWriter) -> io::Result<()> {
    match format {
        ArchiveFormat::Tar => write_tar(&mut feed, out)?.finish(),
        ArchiveFormat::TarGz => {
            let gz = write_tar(&mut feed, GzEncoder::new(out, Compression::default()))?;
            gz.finish()?.finish()
        }
        ArchiveFormat::Zip => write_zip(&mut feed, out),
    }
}

fn source_changed(path: &StoragePath) -> StowError {
    StowError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("source changed during archiving: {path}"),
    ))
}

/// List the entries of one source, depth-first with directories first
async fn plan_entries(
    ctx: &JobCtx,
    driver: &Arc<dyn StorageDriver>,
    source: &QualifiedPath,
    exclude: Option<&StoragePath>,
    planned: &mut Vec<Planned>,
) -> StowResult<()> {
    let root_name = source
        .path
        .name()
        .ok_or_else(|| StowError::InvalidPath(format!("cannot archive the root of {}", source.storage)))?
        .to_string();
    let meta = ctx.call("stat", driver.stat(&source.path)).await?;

    let mut stack = vec![(meta, root_name)];
    while let Some((meta, name)) = stack.pop() {
        ctx.check_cancelled()?;
        let mtime = meta.modified.map_or(0, |m| m.timestamp().max(0) as u64);
        match meta.kind {
            EntryKind::File => planned.push(Planned {
                name,
                path: meta.path,
                size: Some(meta.size),
                mtime,
            }),
            EntryKind::Symlink => ctx.record(ItemOutcome::skipped(
                Some(QualifiedPath::new(source.storage.clone(), meta.path)),
                None,
                "symlinks are not archived",
            )),
            EntryKind::Directory => {
                let mut children = ctx.call("list", driver.list(&meta.path)).await?;
                children.sort_by(|a, b| a.path.cmp(&b.path));
                for child in children.into_iter().rev() {
                    if exclude == Some(&child.path) {
                        continue;
                    }
                    let Some(child_name) = child.name().map(|n| format!("{name}/{n}")) else {
                        continue;
                    };
                    stack.push((child, child_name));
                }
                planned.push(Planned {
                    name,
                    path: meta.path,
                    size: None,
                    mtime,
                });
            }
        }
    }
    Ok(())
}

async fn feed_send(ctx: &JobCtx, tx: &mpsc::Sender<Feed>, item: Feed) -> StowResult<bool> {
    ctx.call("archive feed", async { Ok::<_, StowError>(tx.send(item).await.is_ok()) })
        .await
}

/// Stream every planned entry through the codec thread into `sink`
async fn write_entries(
    ctx: &JobCtx,
    driver: &Arc<dyn StorageDriver>,
    planned: &[Planned],
    format: ArchiveFormat,
    sink: &mut BoxSink,
) -> StowResult<()> {
    let (feed_tx, feed_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    let chunk = ctx.chunk_size();
    let writer =
        tokio::task::spawn_blocking(move || write_archive(format, feed_rx, ChannelWriter::new(out_tx, chunk)));

    let feed = async move {
        let feed_tx = feed_tx;
        for entry in planned {
            ctx.check_cancelled()?;
            let Some(size) = entry.size else {
                let dir = Feed::Dir {
                    name: entry.name.clone(),
                    mtime: entry.mtime,
                };
                if !feed_send(ctx, &feed_tx, dir).await? {
                    return Ok(());
                }
                continue;
            };

            let header = Feed::File {
                name: entry.name.clone(),
                size,
                mtime: entry.mtime,
            };
            if !feed_send(ctx, &feed_tx, header).await? {
                return Ok(());
            }
            let mut reader = ctx.call("open", driver.open_read(&entry.path, 0)).await?;
            let mut read = 0u64;
            while let Some(chunk) = ctx
                .call("read", async { Ok::<_, StowError>(reader.next().await) })
                .await?
            {
                let chunk = chunk?;
                read += chunk.len() as u64;
                if read > size {
                    return Err(source_changed(&entry.path));
                }
                ctx.add_bytes(chunk.len() as u64);
                if !feed_send(ctx, &feed_tx, Feed::Chunk(chunk)).await? {
                    return Ok(());
                }
            }
            if read != size {
                return Err(source_changed(&entry.path));
            }
            if !feed_send(ctx, &feed_tx, Feed::End).await? {
                return Ok(());
            }
        }
        Ok::<_, StowError>(())
    };

    let drain = async move {
        let mut out_rx = out_rx;
        while let Some(block) = ctx
            .call("archive output", async { Ok::<_, StowError>(out_rx.recv().await) })
            .await?
        {
            ctx.call("write", sink.write(block)).await?;
        }
        Ok::<_, StowError>(())
    };

    let (fed, drained) = tokio::join!(feed, drain);
    let written = joined(writer.await)?;
    fed?;
    drained?;
    written.map_err(StowError::Io)
}

/// Pack `sources` (all on one storage) into the archive at `archive`
pub(crate) async fn compress(
    ctx: &JobCtx,
    sources: &[QualifiedPath],
    archive: &QualifiedPath,
    format: Option<ArchiveFormat>,
) -> StowResult<()> {
    let format = ArchiveFormat::resolve(format, archive)?;
    let src = ctx.driver(&sources[0].storage)?;
    let dst = ctx.driver(&archive.storage)?;
    if archive.path.is_root() {
        return Err(StowError::InvalidPath(format!("{archive} is a storage root")));
    }

    let exclude = (archive.storage == sources[0].storage).then_some(&archive.path);
    let mut planned = Vec::new();
    for source in sources {
        plan_entries(ctx, src, source, exclude, &mut planned).await?;
    }
    debug!(entries = planned.len(), format = %format, "archive planned");

    if !ctx.claim_destination(dst, archive).await? {
        ctx.record(ItemOutcome::skipped(None, Some(archive.clone()), "destination exists"));
        return Ok(());
    }
    ctx.add_total(planned.iter().filter_map(|e| e.size).sum());
    if let Some(parent) = archive.path.parent().filter(|p| !p.is_root()) {
        ctx.call("mkdir", dst.mkdir(&parent)).await?;
    }

    let mut sink = ctx.call("create", dst.open_write(&archive.path)).await?;
    match write_entries(ctx, src, &planned, format, &mut sink).await {
        Ok(()) => {
            let meta = ctx.call("commit", sink.commit()).await?;
            ctx.record(ItemOutcome::succeeded(None, Some(archive.clone()), meta.size));
            Ok(())
        }
        Err(e) => {
            ctx.abort(sink).await;
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

/// What the reader thread found, in archive order
#[derive(Debug)]
enum Event {
    Dir(String),
    File(String),
    Chunk(Bytes),
    End,
    Unsupported { name: String, what: String },
}

/// Archive bytes arriving from the async side
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

fn emit(events: &mpsc::Sender<Event>, event: Event) -> io::Result<()> {
    events.blocking_send(event).map_err(|_| stopped())
}

fn emit_body(reader: &mut impl Read, events: &mpsc::Sender<Event>, chunk: usize) -> io::Result<()> {
    let mut buf = vec![0u8; chunk];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return emit(events, Event::End);
        }
        emit(events, Event::Chunk(Bytes::copy_from_slice(&buf[..n])))?;
    }
}

fn read_tar(reader: impl Read, events: &mpsc::Sender<Event>, chunk: usize) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            emit(events, Event::Dir(name))?;
        } else if kind.is_file() {
            emit(events, Event::File(name))?;
            emit_body(&mut entry, events, chunk)?;
        } else {
            emit(
                events,
                Event::Unsupported {
                    name,
                    what: format!("{kind:?}"),
                },
            )?;
        }
    }
    Ok(())
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn read_zip(mut reader: impl Read, events: &mpsc::Sender<Event>, chunk: usize) -> io::Result<()> {
    let mut spool = tempfile::tempfile()?;
    io::copy(&mut reader, &mut spool)?;
    spool.seek(SeekFrom::Start(0))?;

    let mut archive = zip::ZipArchive::new(spool).map_err(zip_error)?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(zip_error)?;
        let name = file.name().to_string();
        if file.unix_mode().is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            emit(
                events,
                Event::Unsupported {
                    name,
                    what: "Symlink".into(),
                },
            )?;
        } else if file.is_dir() {
            emit(events, Event::Dir(name))?;
        } else {
            emit(events, Event::File(name))?;
            emit_body(&mut file, events, chunk)?;
        }
    }
    Ok(())
}

/// Runs on a blocking thread until the archive is exhausted
fn read_archive(
    format: ArchiveFormat,
    input: ChannelReader,
    events: mpsc::Sender<Event>,
    chunk: usize,
) -> io::Result<()> {
    let result = match format {
        ArchiveFormat::Tar => read_tar(input, &events, chunk),
        ArchiveFormat::TarGz => read_tar(GzDecoder::new(input), &events, chunk),
        ArchiveFormat::Zip => read_zip(input, &events, chunk),
    };
    match result {
        // The consumer stopped on purpose and reports its own reason
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe && events.is_closed() => Ok(()),
        other => other,
    }
}

/// Normalize an entry name relative to the extraction root
fn entry_path(name: &str) -> StowResult<StoragePath> {
    if name.is_empty() {
        return Err(StowError::Corrupt("archive entry with an empty name".into()));
    }
    StoragePath::from_archive_entry(name)
}

/// The file entry currently being written
struct OpenEntry {
    target: QualifiedPath,
    sink: Option<BoxSink>,
    bytes: u64,
    /// Set once the entry is known to be skipped or failed
    outcome: Option<ItemOutcome>,
}

/// Applies reader events to the destination storage
struct Unpacker<'a> {
    ctx: &'a JobCtx,
    driver: &'a Arc<dyn StorageDriver>,
    dest: &'a QualifiedPath,
    created: HashSet<StoragePath>,
    current: Option<OpenEntry>,
}

impl<'a> Unpacker<'a> {
    fn new(ctx: &'a JobCtx, driver: &'a Arc<dyn StorageDriver>, dest: &'a QualifiedPath) -> Self {
        let mut created = HashSet::new();
        created.insert(dest.path.clone());
        Self {
            ctx,
            driver,
            dest,
            created,
            current: None,
        }
    }

    fn target(&self, rel: &StoragePath) -> QualifiedPath {
        QualifiedPath::new(self.dest.storage.clone(), self.dest.path.join_path(rel))
    }

    async fn run(mut self, mut events: mpsc::Receiver<Event>) -> StowResult<()> {
        let result = self.consume(&mut events).await;
        // Closing the receiver first lets the reader thread stop on error
        drop(events);
        if let Some(open) = self.current.take() {
            if let Some(sink) = open.sink {
                self.ctx.abort(sink).await;
            }
        }
        result
    }

    async fn consume(&mut self, events: &mut mpsc::Receiver<Event>) -> StowResult<()> {
        let ctx = self.ctx;
        while let Some(event) = ctx
            .call("archive read", async { Ok::<_, StowError>(events.recv().await) })
            .await?
        {
            match event {
                Event::Dir(name) => self.directory(&name).await?,
                Event::File(name) => self.open_file(&name).await?,
                Event::Chunk(data) => self.write(data).await?,
                Event::End => self.close_file().await?,
                Event::Unsupported { name, what } => {
                    let target = self.target(&entry_path(&name)?);
                    ctx.record(ItemOutcome::skipped(
                        None,
                        Some(target),
                        format!("{what} entries are not extracted"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Create `dir` and any missing ancestors below the destination
    async fn ensure_dir(&mut self, dir: &StoragePath) -> StowResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir.clone());
        while let Some(path) = cursor {
            if path.is_root() || self.created.contains(&path) {
                break;
            }
            cursor = path.parent();
            missing.push(path);
        }
        for path in missing.into_iter().rev() {
            self.ctx.call("mkdir", self.driver.mkdir(&path)).await?;
            self.created.insert(path);
        }
        Ok(())
    }

    async fn directory(&mut self, name: &str) -> StowResult<()> {
        let rel = entry_path(name)?;
        if rel.is_root() {
            return Ok(());
        }
        let target = self.target(&rel);
        match self.ensure_dir(&target.path).await {
            Ok(()) => self.ctx.record(ItemOutcome::succeeded(None, Some(target), 0)),
            Err(StowError::Cancelled) => return Err(StowError::Cancelled),
            Err(e) => self.ctx.record(ItemOutcome::failed_at(Side::Destination, None, Some(target), &e)),
        }
        Ok(())
    }

    async fn open_file(&mut self, name: &str) -> StowResult<()> {
        let rel = entry_path(name)?;
        if rel.is_root() {
            return Err(StowError::Corrupt(format!("file entry without a name: {name}")));
        }
        let target = self.target(&rel);
        let mut open = OpenEntry {
            target: target.clone(),
            sink: None,
            bytes: 0,
            outcome: None,
        };
        match self.prepare(&target).await {
            Ok(Some(sink)) => open.sink = Some(sink),
            Ok(None) => {
                open.outcome = Some(ItemOutcome::skipped(None, Some(target), "destination exists"))
            }
            Err(StowError::Cancelled) => return Err(StowError::Cancelled),
            Err(e) => open.outcome = Some(ItemOutcome::failed_at(Side::Destination, None, Some(target), &e)),
        }
        self.current = Some(open);
        Ok(())
    }

    async fn prepare(&mut self, target: &QualifiedPath) -> StowResult<Option<BoxSink>> {
        if let Some(parent) = target.path.parent() {
            self.ensure_dir(&parent).await?;
        }
        if !self.ctx.claim_destination(self.driver, target).await? {
            return Ok(None);
        }
        let sink = self.ctx.call("create", self.driver.open_write(&target.path)).await?;
        Ok(Some(sink))
    }

    async fn write(&mut self, data: Bytes) -> StowResult<()> {
        let ctx = self.ctx;
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        let Some(sink) = open.sink.as_mut() else {
            return Ok(());
        };
        let len = data.len() as u64;
        match ctx.call("write", sink.write(data)).await {
            Ok(()) => open.bytes += len,
            Err(StowError::Cancelled) => return Err(StowError::Cancelled),
            Err(e) => {
                if let Some(sink) = open.sink.take() {
                    ctx.abort(sink).await;
                }
                open.outcome = Some(ItemOutcome::failed_at(Side::Destination, None, Some(open.target.clone()), &e));
            }
        }
        Ok(())
    }

    async fn close_file(&mut self) -> StowResult<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let outcome = match (open.outcome, open.sink) {
            (Some(outcome), _) => outcome,
            (None, Some(sink)) => match self.ctx.call("commit", sink.commit()).await {
                Ok(_) => ItemOutcome::succeeded(None, Some(open.target), open.bytes),
                Err(StowError::Cancelled) => return Err(StowError::Cancelled),
                Err(e) => ItemOutcome::failed_at(Side::Destination, None, Some(open.target), &e),
            },
            (None, None) => return Ok(()),
        };
        self.ctx.record(outcome);
        Ok(())
    }
}

/// Unpack `archive` into `dest_dir`. Any entry that would land outside
/// `dest_dir` fails the whole job as `Corrupt`.
pub(crate) async fn extract(
    ctx: &JobCtx,
    archive: &QualifiedPath,
    dest_dir: &QualifiedPath,
    format: Option<ArchiveFormat>,
) -> StowResult<()> {
    let format = ArchiveFormat::resolve(format, archive)?;
    let src = ctx.driver(&archive.storage)?;
    let dst = ctx.driver(&dest_dir.storage)?;

    let meta = ctx.call("stat", src.stat(&archive.path)).await?;
    if !meta.is_file() {
        return Err(StowError::NotAFile(archive.to_string()));
    }
    ctx.add_total(meta.size);
    if !dest_dir.path.is_root() {
        ctx.call("mkdir", dst.mkdir(&dest_dir.path)).await?;
    }

    let mut reader = ctx.call("open", src.open_read(&archive.path, 0)).await?;
    let (data_tx, data_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
    let chunk = ctx.chunk_size();
    let input = ChannelReader {
        rx: data_rx,
        current: Bytes::new(),
    };
    let parser = tokio::task::spawn_blocking(move || read_archive(format, input, event_tx, chunk));

    let feed = async move {
        let data_tx = data_tx;
        while let Some(chunk) = ctx
            .call("read", async { Ok::<_, StowError>(reader.next().await) })
            .await?
        {
            let chunk = chunk?;
            ctx.add_bytes(chunk.len() as u64);
            let accepted = ctx
                .call("archive feed", async { Ok::<_, StowError>(data_tx.send(chunk).await.is_ok()) })
                .await?;
            if !accepted {
                // The reader reached the end of the archive before the end of the file
                break;
            }
        }
        Ok::<_, StowError>(())
    };
    let unpack = Unpacker::new(ctx, dst, dest_dir).run(event_rx);

    let (unpacked, fed) = tokio::join!(unpack, feed);
    let parsed = joined(parser.await)?;
    unpacked?;
    fed?;
    parsed.map_err(codec_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::job::{ItemStatus, JobRequest, JobStatus};
    use crate::testing::{engine_with, put, read, storage};
    use stow_core::FailureClass;
    use stow_providers::MemoryBackend;

    fn q(storage: &str, path: &str) -> QualifiedPath {
        QualifiedPath::parse(storage, path).unwrap()
    }

    fn sp(path: &str) -> StoragePath {
        StoragePath::parse(path).unwrap()
    }

    async fn sample_tree(mem: &MemoryBackend) {
        put(mem, "proj/readme.txt", b"read me").await;
        put(mem, "proj/src/main.rs", b"fn main() {}").await;
        put(mem, "proj/src/deep/lib.rs", &vec![b'L'; 300_000]).await;
        mem.mkdir(&sp("proj/empty")).await.unwrap();
        let long = format!("proj/{}/file.txt", "n".repeat(120));
        put(mem, &long, b"long name").await;
    }

    async fn round_trip(format_name: &str) {
        let mem = MemoryBackend::new();
        sample_tree(&mem).await;
        let config = EngineConfig {
            chunk_size: 64 * 1024,
            ..EngineConfig::default()
        };
        let engine = engine_with(vec![storage("m", mem.clone())], config).await;

        let archive = format!("out/proj.{format_name}");
        let id = engine
            .submit(JobRequest::compress(vec![q("m", "proj")], q("m", &archive)))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded, "{job:?}");
        assert_eq!(job.bytes_done, job.bytes_total);

        let id = engine
            .submit(JobRequest::extract(q("m", &archive), q("m", "restored")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded, "{job:?}");

        for path in ["readme.txt", "src/main.rs", "src/deep/lib.rs"] {
            assert_eq!(
                read(&mem, &format!("restored/proj/{path}")).await,
                read(&mem, &format!("proj/{path}")).await,
                "{path}"
            );
        }
        let long = format!("restored/proj/{}/file.txt", "n".repeat(120));
        assert_eq!(read(&mem, &long).await, b"long name");
        assert!(mem.stat(&sp("restored/proj/empty")).await.unwrap().is_directory());
    }

    #[tokio::test]
    async fn test_tar_round_trip() {
        round_trip("tar").await;
    }

    #[tokio::test]
    async fn test_tar_gz_round_trip() {
        round_trip("tar.gz").await;
    }

    #[tokio::test]
    async fn test_zip_round_trip() {
        round_trip("zip").await;
    }

    fn evil_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut ok = tar::Header::new_gnu();
        ok.set_size(2);
        ok.set_mode(0o644);
        ok.set_cksum();
        builder.append_data(&mut ok, "fine.txt", &b"ok"[..]).unwrap();

        // Builder refuses `..`, so write the name field by hand
        let mut evil = tar::Header::new_gnu();
        let name = b"../../evil";
        evil.as_old_mut().name[..name.len()].copy_from_slice(name);
        evil.set_size(4);
        evil.set_mode(0o644);
        evil.set_cksum();
        builder.append(&evil, &b"evil"[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_traversal_entry_is_corrupt() {
        let mem = MemoryBackend::new();
        put(&mem, "bad.tar", &evil_tar()).await;
        let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;

        let id = engine
            .submit(JobRequest::extract(q("m", "bad.tar"), q("m", "a/b/c")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(FailureClass::CorruptArchive));

        assert!(mem.stat(&sp("evil")).await.is_err());
        assert!(mem.stat(&sp("a/evil")).await.is_err());
        assert!(mem.stat(&sp("a/b/c/evil")).await.is_err());
    }

    #[tokio::test]
    async fn test_zip_absolute_and_backslash_names_rejected() {
        for name in ["/etc/passwd", "..\\..\\evil.txt", "C:/windows/x"] {
            let mut zip = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
            zip.start_file(name, zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(b"boom").unwrap();
            let bytes = zip.finish().unwrap().into_inner();

            let mem = MemoryBackend::new();
            put(&mem, "x.zip", &bytes).await;
            let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;
            let id = engine
                .submit(JobRequest::extract(q("m", "x.zip"), q("m", "into")))
                .await
                .unwrap();
            let job = engine.wait(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed, "{name}");
            assert_eq!(mem.used_bytes(), bytes.len() as u64, "{name}");
        }
    }

    #[tokio::test]
    async fn test_garbage_archive_is_corrupt() {
        let mem = MemoryBackend::new();
        put(&mem, "junk.tar.gz", b"definitely not gzip").await;
        let engine = engine_with(vec![storage("m", mem)], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::extract(q("m", "junk.tar.gz"), q("m", "out")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn test_symlink_entry_is_skipped() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "shortcut", "real.txt").unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(3);
        file.set_mode(0o644);
        builder.append_data(&mut file, "real.txt", &b"abc"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let mem = MemoryBackend::new();
        put(&mem, "links.tar", &bytes).await;
        let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::extract(q("m", "links.tar"), q("m", "x")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.items.iter().any(|i| i.status == ItemStatus::Skipped));
        assert_eq!(read(&mem, "x/real.txt").await, b"abc");
        assert!(mem.stat(&sp("x/shortcut")).await.is_err());
    }

    #[tokio::test]
    async fn test_extract_conflicts_are_per_item() {
        let mem = MemoryBackend::new();
        put(&mem, "pack/a.txt", b"A").await;
        put(&mem, "pack/b.txt", b"B").await;
        let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::compress(vec![q("m", "pack")], q("m", "pack.tar")))
            .await
            .unwrap();
        engine.wait(id).await.unwrap();

        put(&mem, "dest/pack/a.txt", b"existing").await;
        let id = engine
            .submit(JobRequest::extract(q("m", "pack.tar"), q("m", "dest")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items_failed(), 1);
        assert_eq!(
            job.items.iter().find(|i| i.is_failure()).unwrap().failure,
            Some(FailureClass::Conflict)
        );
        assert_eq!(read(&mem, "dest/pack/a.txt").await, b"existing");
        assert_eq!(read(&mem, "dest/pack/b.txt").await, b"B");
    }

    #[tokio::test]
    async fn test_format_inference() {
        assert_eq!(ArchiveFormat::from_path(&sp("a/b.TGZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_path(&sp("b.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_path(&sp("b.tar")), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_path(&sp("b.zip")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_path(&sp("b.rar")), None);
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);

        let mem = MemoryBackend::new();
        put(&mem, "f", b"f").await;
        let engine = engine_with(vec![storage("m", mem)], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::compress(vec![q("m", "f")], q("m", "f.unknown")))
            .await
            .unwrap();
        assert_eq!(engine.wait(id).await.unwrap().status, JobStatus::Failed);
    }
}
