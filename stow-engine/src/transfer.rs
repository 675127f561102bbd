// SPDX-License-Identifier: AGPL-3.0-or-later
//! Copy, move, delete, mkdir, upload and download job bodies

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use stow_core::{
    ByteStream, EntryKind, EntryMeta, FailureClass, QualifiedPath, Side, StorageDriver, StowError,
    StowResult,
};

use crate::engine::JobCtx;
use crate::job::{ConflictPolicy, ItemOutcome, SidedError};

/// One file scheduled for transfer
struct FileTask {
    source: QualifiedPath,
    destination: QualifiedPath,
    size: u64,
}

/// Everything a copy or move has to do after walking its sources
#[derive(Default)]
struct Plan {
    files: Vec<FileTask>,
    /// Source directories walked for a move, parents before children
    walked_dirs: Vec<QualifiedPath>,
}

fn is_cancel(err: &StowError) -> bool {
    matches!(err, StowError::Cancelled)
}

/// Copy (or move, when `remove_source`) every source into `dest_dir`
pub(crate) async fn copy(
    ctx: &JobCtx,
    sources: &[QualifiedPath],
    dest_dir: &QualifiedPath,
    remove_source: bool,
) -> StowResult<()> {
    let dst = ctx.driver(&dest_dir.storage)?;
    if !dest_dir.path.is_root() {
        ctx.call("mkdir", dst.mkdir(&dest_dir.path)).await?;
    }

    let mut plan = Plan::default();
    for source in sources {
        ctx.check_cancelled()?;
        match plan_source(ctx, source, dest_dir, remove_source, &mut plan).await {
            Ok(()) => {}
            Err(e) if e.is_cancel() => return Err(e.into()),
            Err(e) => ctx.record(e.outcome(Some(source.clone()), None)),
        }
    }

    ctx.add_total(plan.files.iter().map(|f| f.size).sum());
    debug!(files = plan.files.len(), "transfer planned");

    let mut outcomes = futures::stream::iter(plan.files)
        .map(|task| guarded(ctx, task, remove_source))
        .buffer_unordered(ctx.workers());
    while let Some(outcome) = outcomes.next().await {
        if ctx.is_cancelled() {
            break;
        }
        if outcome.failure != Some(FailureClass::Cancelled) {
            ctx.record(outcome);
        }
    }
    drop(outcomes);
    ctx.check_cancelled()?;

    if remove_source {
        // Deepest first; a directory still holding a failed file stays put
        for dir in plan.walked_dirs.iter().rev() {
            let driver = ctx.driver(&dir.storage)?;
            match ctx.call("remove", driver.remove(&dir.path, false)).await {
                Ok(()) | Err(StowError::NotFound(_)) => {}
                Err(e) if is_cancel(&e) => return Err(e),
                Err(e) => warn!(path = %dir, error = %e, "source directory left behind"),
            }
        }
    }
    Ok(())
}

/// Resolve one top-level source into directory creations and file tasks
async fn plan_source(
    ctx: &JobCtx,
    source: &QualifiedPath,
    dest_dir: &QualifiedPath,
    remove_source: bool,
    plan: &mut Plan,
) -> Result<(), SidedError> {
    let src = ctx.driver(&source.storage).map_err(SidedError::source)?;
    let dst = ctx.driver(&dest_dir.storage).map_err(SidedError::destination)?;
    let name = source.path.name().ok_or_else(|| {
        SidedError::source(StowError::InvalidPath(format!("{source} is a storage root")))
    })?;
    let target_path = dest_dir.path.join(name).map_err(SidedError::destination)?;
    let target = QualifiedPath::new(dest_dir.storage.clone(), target_path);
    let meta = ctx
        .call("stat", src.stat(&source.path))
        .await
        .map_err(SidedError::source)?;

    let same_storage = source.storage == dest_dir.storage;
    if meta.is_directory() && same_storage && target.path.starts_with(&source.path) {
        return Err(SidedError::destination(StowError::InvalidPath(format!(
            "cannot place {source} inside itself"
        ))));
    }
    if target == *source {
        return Err(SidedError::destination(StowError::InvalidPath(format!(
            "{source} is already at its destination"
        ))));
    }

    if remove_source && same_storage && src.capabilities().native_move {
        if let Some(outcome) = move_natively(ctx, src, source, &target, &meta).await? {
            ctx.record(outcome);
            return Ok(());
        }
    }

    match meta.kind {
        EntryKind::File => {
            plan.files.push(FileTask {
                source: source.clone(),
                destination: target,
                size: meta.size,
            });
            Ok(())
        }
        EntryKind::Symlink => {
            ctx.record(ItemOutcome::skipped(Some(source.clone()), Some(target), "symlinks are not followed"));
            Ok(())
        }
        EntryKind::Directory => walk(ctx, src, dst, source, &target, remove_source, plan).await,
    }
}

/// Try a backend-native move. `None` means fall back to copy + delete.
/// An occupied target with a directory on either side also falls back, so
/// directories merge and conflicts resolve per file.
async fn move_natively(
    ctx: &JobCtx,
    driver: &Arc<dyn StorageDriver>,
    source: &QualifiedPath,
    target: &QualifiedPath,
    meta: &EntryMeta,
) -> Result<Option<ItemOutcome>, SidedError> {
    match ctx.call("stat", driver.stat(&target.path)).await {
        Ok(existing) => {
            if existing.is_directory() || meta.is_directory() {
                return Ok(None);
            }
            match ctx.conflict() {
                ConflictPolicy::Fail => {
                    return Err(SidedError::destination(StowError::AlreadyExists(
                        target.to_string(),
                    )))
                }
                ConflictPolicy::Skip => {
                    return Ok(Some(ItemOutcome::skipped(
                        Some(source.clone()),
                        Some(target.clone()),
                        "destination exists",
                    )))
                }
                ConflictPolicy::Overwrite => {
                    ctx.call("remove", driver.remove(&target.path, false))
                        .await
                        .map_err(SidedError::destination)?;
                }
            }
        }
        Err(StowError::NotFound(_)) => {}
        Err(e) => return Err(SidedError::destination(e)),
    }

    let moved = ctx
        .call("move", driver.move_native(&source.path, &target.path))
        .await
        .map_err(SidedError::source)?;
    if !moved {
        return Ok(None);
    }
    let bytes = if meta.is_file() { meta.size } else { 0 };
    ctx.add_total(bytes);
    ctx.add_bytes(bytes);
    Ok(Some(ItemOutcome::succeeded(Some(source.clone()), Some(target.clone()), bytes)))
}

/// Depth-first walk of a source directory. Destination directories are
/// created as they are reached; files are only collected.
async fn walk(
    ctx: &JobCtx,
    src: &Arc<dyn StorageDriver>,
    dst: &Arc<dyn StorageDriver>,
    source: &QualifiedPath,
    target: &QualifiedPath,
    remove_source: bool,
    plan: &mut Plan,
) -> Result<(), SidedError> {
    let mut stack = vec![(source.path.clone(), target.path.clone())];
    while let Some((from, to)) = stack.pop() {
        ctx.check_cancelled().map_err(SidedError::source)?;
        let from_q = QualifiedPath::new(source.storage.clone(), from.clone());
        let to_q = QualifiedPath::new(target.storage.clone(), to.clone());

        if let Err(e) = ctx.call("mkdir", dst.mkdir(&to)).await {
            if is_cancel(&e) {
                return Err(SidedError::destination(e));
            }
            ctx.record(ItemOutcome::failed_at(Side::Destination, Some(from_q), Some(to_q), &e));
            continue;
        }
        let children = match ctx.call("list", src.list(&from)).await {
            Ok(children) => children,
            Err(e) if is_cancel(&e) => return Err(SidedError::source(e)),
            Err(e) => {
                ctx.record(ItemOutcome::failed_at(Side::Source, Some(from_q), Some(to_q), &e));
                continue;
            }
        };
        ctx.record(ItemOutcome::succeeded(Some(from_q), Some(to_q), 0));
        if remove_source {
            plan.walked_dirs.push(QualifiedPath::new(source.storage.clone(), from.clone()));
        }

        let mut subdirs = Vec::new();
        for child in children {
            let Some(name) = child.name() else { continue };
            let child_target = to.join(name).map_err(SidedError::destination)?;
            match child.kind {
                EntryKind::Directory => subdirs.push((child.path.clone(), child_target)),
                EntryKind::File => plan.files.push(FileTask {
                    source: QualifiedPath::new(source.storage.clone(), child.path.clone()),
                    destination: QualifiedPath::new(target.storage.clone(), child_target),
                    size: child.size,
                }),
                EntryKind::Symlink => ctx.record(ItemOutcome::skipped(
                    Some(QualifiedPath::new(source.storage.clone(), child.path.clone())),
                    Some(QualifiedPath::new(target.storage.clone(), child_target)),
                    "symlinks are not followed",
                )),
            }
        }
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(())
}

/// Transfer one file, turning a panic into an item failure
async fn guarded(ctx: &JobCtx, task: FileTask, remove_source: bool) -> ItemOutcome {
    let source = Some(task.source.clone());
    let destination = Some(task.destination.clone());
    let result = AssertUnwindSafe(transfer_file(ctx, &task, remove_source))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => e.outcome(source, destination),
        Err(_) => ItemOutcome::failed(
            source,
            destination,
            &StowError::Other("transfer worker panicked".into()),
        ),
    }
}

async fn transfer_file(
    ctx: &JobCtx,
    task: &FileTask,
    remove_source: bool,
) -> Result<ItemOutcome, SidedError> {
    let src = ctx.driver(&task.source.storage).map_err(SidedError::source)?;
    let dst = ctx.driver(&task.destination.storage).map_err(SidedError::destination)?;
    let source = Some(task.source.clone());
    let destination = Some(task.destination.clone());

    let claimed = ctx
        .claim_destination(dst, &task.destination)
        .await
        .map_err(SidedError::destination)?;
    if !claimed {
        ctx.drop_total(task.size);
        return Ok(ItemOutcome::skipped(source, destination, "destination exists"));
    }

    let reader = ctx
        .call("open", src.open_read(&task.source.path, 0))
        .await
        .map_err(SidedError::source)?;
    let sink = ctx
        .call("create", dst.open_write(&task.destination.path))
        .await
        .map_err(SidedError::destination)?;
    let (bytes, _) = ctx.pump(reader, sink).await?;
    let outcome = ItemOutcome::succeeded(source, destination, bytes);
    if !remove_source {
        return Ok(outcome);
    }

    let written = ctx
        .call("stat", dst.stat(&task.destination.path))
        .await
        .map_err(SidedError::destination)?;
    if written.size != task.size || bytes != task.size {
        return Err(SidedError::destination(StowError::Other(format!(
            "{} has {} bytes after copy, expected {}; source kept",
            task.destination, written.size, task.size
        ))));
    }
    match ctx.call("remove", src.remove(&task.source.path, false)).await {
        Ok(()) => Ok(outcome),
        Err(e) if is_cancel(&e) => Err(SidedError::source(e)),
        Err(e) => {
            warn!(source = %task.source, error = %e, "copied but could not delete source");
            Ok(outcome.with_warning(format!("source not deleted: {e}")))
        }
    }
}

pub(crate) async fn delete(ctx: &JobCtx, sources: &[QualifiedPath]) -> StowResult<()> {
    for source in sources {
        ctx.check_cancelled()?;
        let result = match ctx.driver(&source.storage) {
            Ok(_) if source.path.is_root() => {
                Err(StowError::InvalidPath(format!("refusing to delete the root of {}", source.storage)))
            }
            Ok(driver) => ctx.call("remove", driver.remove(&source.path, true)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ctx.record(ItemOutcome::succeeded(Some(source.clone()), None, 0)),
            Err(e) if is_cancel(&e) => return Err(e),
            Err(e) => ctx.record(ItemOutcome::failed(Some(source.clone()), None, &e)),
        }
    }
    Ok(())
}

pub(crate) async fn mkdir(ctx: &JobCtx, path: &QualifiedPath) -> StowResult<()> {
    let driver = ctx.driver(&path.storage)?;
    match ctx.call("mkdir", driver.mkdir(&path.path)).await {
        Ok(()) => ctx.record(ItemOutcome::succeeded(None, Some(path.clone()), 0)),
        Err(e) if is_cancel(&e) => return Err(e),
        Err(e) => ctx.record(ItemOutcome::failed_at(Side::Destination, None, Some(path.clone()), &e)),
    }
    Ok(())
}

pub(crate) async fn upload(ctx: &JobCtx, data: ByteStream, destination: &QualifiedPath) -> StowResult<()> {
    let outcome = match upload_file(ctx, data, destination).await {
        Ok(Some(bytes)) => ItemOutcome::succeeded(None, Some(destination.clone()), bytes),
        Ok(None) => ItemOutcome::skipped(None, Some(destination.clone()), "destination exists"),
        Err(e) if e.is_cancel() => return Err(e.into()),
        Err(e) => e.outcome(None, Some(destination.clone())),
    };
    ctx.record(outcome);
    Ok(())
}

async fn upload_file(
    ctx: &JobCtx,
    data: ByteStream,
    destination: &QualifiedPath,
) -> Result<Option<u64>, SidedError> {
    let placed = async {
        let driver = ctx.driver(&destination.storage)?;
        if destination.path.is_root() {
            return Err(StowError::InvalidPath(format!("{destination} is a storage root")));
        }
        if !ctx.claim_destination(driver, destination).await? {
            return Ok(None);
        }
        if let Some(parent) = destination.path.parent().filter(|p| !p.is_root()) {
            ctx.call("mkdir", driver.mkdir(&parent)).await?;
        }
        let sink = ctx.call("create", driver.open_write(&destination.path)).await?;
        Ok::<_, StowError>(Some(sink))
    }
    .await
    .map_err(SidedError::destination)?;

    match placed {
        Some(sink) => {
            let (bytes, _) = ctx.pump(data, sink).await?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}

pub(crate) async fn download(
    ctx: &JobCtx,
    source: &QualifiedPath,
    mut tx: futures::channel::mpsc::Sender<StowResult<Bytes>>,
) -> StowResult<()> {
    let result = async {
        let driver = ctx.driver(&source.storage)?;
        let meta = ctx.call("stat", driver.stat(&source.path)).await?;
        if !meta.is_file() {
            return Err(StowError::NotAFile(source.to_string()));
        }
        ctx.add_total(meta.size);

        let mut reader = ctx.call("open", driver.open_read(&source.path, 0)).await?;
        let mut sent = 0u64;
        while let Some(chunk) = ctx
            .call("read", async { Ok::<_, StowError>(reader.next().await) })
            .await?
        {
            let chunk = chunk?;
            let len = chunk.len() as u64;
            ctx.call("send", async {
                tx.send(Ok(chunk))
                    .await
                    .map_err(|_| StowError::Other("download receiver went away".into()))
            })
            .await?;
            sent += len;
            ctx.add_bytes(len);
        }
        Ok::<_, StowError>(sent)
    }
    .await;

    match result {
        Ok(bytes) => ctx.record(ItemOutcome::succeeded(Some(source.clone()), None, bytes)),
        Err(e) if is_cancel(&e) => {
            let _ = tx.try_send(Err(StowError::Cancelled));
            return Err(e);
        }
        Err(e) => {
            ctx.record(ItemOutcome::failed_at(Side::Source, Some(source.clone()), None, &e));
            let _ = tx.try_send(Err(e));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::job::{ItemStatus, JobRequest, JobStatus};
    use crate::testing::{engine_with, put, read, storage, FaultyDriver};
    use stow_core::StoragePath;
    use stow_providers::{LocalBackend, MemoryBackend};

    fn q(storage: &str, path: &str) -> QualifiedPath {
        QualifiedPath::parse(storage, path).unwrap()
    }

    fn sp(path: &str) -> StoragePath {
        StoragePath::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_copy_tree_across_storages() {
        let (a, b) = (MemoryBackend::new(), MemoryBackend::new());
        put(&a, "docs/readme.md", b"# hi").await;
        put(&a, "docs/deep/nested/x.txt", b"xx").await;
        a.mkdir(&sp("docs/empty")).await.unwrap();
        let engine = engine_with(
            vec![storage("a", a.clone()), storage("b", b.clone())],
            EngineConfig::default(),
        )
        .await;

        let id = engine
            .submit(JobRequest::copy(vec![q("a", "docs")], q("b", "backup")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(read(&b, "backup/docs/deep/nested/x.txt").await, b"xx");
        assert!(b.stat(&sp("backup/docs/empty")).await.unwrap().is_directory());
        // Source untouched
        assert_eq!(read(&a, "docs/readme.md").await, b"# hi");
    }

    #[tokio::test]
    async fn test_directories_precede_their_files() {
        let mem = MemoryBackend::new();
        put(&mem, "t/a/1.txt", b"1").await;
        put(&mem, "t/b/2.txt", b"2").await;
        let engine = engine_with(vec![storage("m", mem)], EngineConfig::default()).await;
        let id = engine.submit(JobRequest::copy(vec![q("m", "t")], q("m", "c"))).await.unwrap();
        let job = engine.wait(id).await.unwrap();

        let order: Vec<String> = job
            .items
            .iter()
            .map(|i| i.destination.as_ref().unwrap().path.to_string())
            .collect();
        let pos = |p: &str| order.iter().position(|o| o == p).unwrap();
        assert!(pos("/c/t") < pos("/c/t/a"));
        assert!(pos("/c/t/a") < pos("/c/t/a/1.txt"));
        assert!(pos("/c/t/b") < pos("/c/t/b/2.txt"));
    }

    #[tokio::test]
    async fn test_copy_into_itself_fails() {
        let mem = MemoryBackend::new();
        put(&mem, "loop/f", b"f").await;
        let engine = engine_with(vec![storage("m", mem)], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::copy(vec![q("m", "loop")], q("m", "loop/inner")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.items[0].message.as_deref().unwrap().contains("inside itself"));
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let mem = MemoryBackend::new();
        put(&mem, "f.txt", b"new").await;
        put(&mem, "out/f.txt", b"old").await;
        let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;

        let fail = engine.submit(JobRequest::copy(vec![q("m", "f.txt")], q("m", "out"))).await.unwrap();
        let job = engine.wait(fail).await.unwrap();
        assert_eq!(job.items[0].failure, Some(FailureClass::Conflict));

        let skip = engine
            .submit(JobRequest::copy(vec![q("m", "f.txt")], q("m", "out")).with_conflict(ConflictPolicy::Skip))
            .await
            .unwrap();
        let job = engine.wait(skip).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.items[0].status, ItemStatus::Skipped);
        assert_eq!(read(&mem, "out/f.txt").await, b"old");

        let overwrite = engine
            .submit(
                JobRequest::copy(vec![q("m", "f.txt")], q("m", "out"))
                    .with_conflict(ConflictPolicy::Overwrite),
            )
            .await
            .unwrap();
        engine.wait(overwrite).await.unwrap();
        assert_eq!(read(&mem, "out/f.txt").await, b"new");
    }

    #[tokio::test]
    async fn test_move_falls_back_to_copy_and_delete() {
        let (a, b) = (MemoryBackend::new(), MemoryBackend::new());
        put(&a, "album/1.jpg", b"one").await;
        put(&a, "album/2.jpg", b"two").await;
        let engine = engine_with(
            vec![storage("a", a.clone()), storage("b", b.clone())],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::move_to(vec![q("a", "album")], q("b", "/")))
            .await
            .unwrap();
        assert_eq!(engine.wait(id).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(read(&b, "album/2.jpg").await, b"two");
        assert!(matches!(a.stat(&sp("album")).await, Err(StowError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_move_keeps_source_when_delete_fails() {
        let faulty = FaultyDriver::new().fail_removes("keep.txt");
        put(faulty.inner(), "keep.txt", b"data").await;
        let inner = faulty.inner().clone();
        let engine = engine_with(
            vec![storage("a", faulty), storage("b", MemoryBackend::new())],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::move_to(vec![q("a", "keep.txt")], q("b", "/")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.items[0].status, ItemStatus::SucceededWithWarning);
        assert_eq!(read(&inner, "keep.txt").await, b"data");
    }

    #[tokio::test]
    async fn test_move_never_deletes_unread_source() {
        let faulty = FaultyDriver::new().fail_reads("dir/locked.txt");
        put(faulty.inner(), "dir/locked.txt", b"secret").await;
        put(faulty.inner(), "dir/open.txt", b"fine").await;
        let inner = faulty.inner().clone();
        let engine = engine_with(
            vec![storage("a", faulty), storage("b", MemoryBackend::new())],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::move_to(vec![q("a", "dir")], q("b", "/")))
            .await
            .unwrap();
        assert_eq!(engine.wait(id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(read(&inner, "dir/locked.txt").await, b"secret");
        assert!(inner.stat(&sp("dir/open.txt")).await.is_err());
    }

    #[tokio::test]
    async fn test_native_move_on_local_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("from")).unwrap();
        std::fs::write(dir.path().join("from/a.txt"), b"local").unwrap();
        let engine = engine_with(
            vec![storage("disk", LocalBackend::new(dir.path()))],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::move_to(vec![q("disk", "from")], q("disk", "to")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.items.len(), 1);
        assert_eq!(std::fs::read(dir.path().join("to/from/a.txt")).unwrap(), b"local");
        assert!(!dir.path().join("from").exists());
    }

    #[tokio::test]
    async fn test_native_move_merges_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("from")).unwrap();
        std::fs::create_dir_all(dir.path().join("to/from")).unwrap();
        std::fs::write(dir.path().join("from/a.txt"), b"moved").unwrap();
        std::fs::write(dir.path().join("to/from/b.txt"), b"resident").unwrap();
        let engine = engine_with(
            vec![storage("disk", LocalBackend::new(dir.path()))],
            EngineConfig::default(),
        )
        .await;

        let id = engine
            .submit(JobRequest::move_to(vec![q("disk", "from")], q("disk", "to")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.items.iter().all(|i| i.status == ItemStatus::Succeeded));
        assert_eq!(std::fs::read(dir.path().join("to/from/a.txt")).unwrap(), b"moved");
        assert_eq!(std::fs::read(dir.path().join("to/from/b.txt")).unwrap(), b"resident");
        assert!(!dir.path().join("from").exists());
    }

    #[tokio::test]
    async fn test_merge_matches_across_backends() {
        let mem = MemoryBackend::new();
        put(&mem, "from/a.txt", b"moved").await;
        put(&mem, "to/from/b.txt", b"resident").await;
        let native = FaultyDriver::new().with_native_move();
        put(native.inner(), "from/a.txt", b"moved").await;
        put(native.inner(), "to/from/b.txt", b"resident").await;
        let native_inner = native.inner().clone();
        let engine = engine_with(
            vec![storage("plain", mem.clone()), storage("native", native)],
            EngineConfig::default(),
        )
        .await;

        for (id, backend) in [("plain", &mem), ("native", &native_inner)] {
            let job = engine
                .submit(JobRequest::move_to(vec![q(id, "from")], q(id, "to")))
                .await
                .unwrap();
            assert_eq!(engine.wait(job).await.unwrap().status, JobStatus::Succeeded, "{id}");
            assert_eq!(read(backend, "to/from/a.txt").await, b"moved");
            assert_eq!(read(backend, "to/from/b.txt").await, b"resident");
        }
    }

    #[tokio::test]
    async fn test_unreadable_source_is_not_blamed_on_destination() {
        let faulty = FaultyDriver::new().fail_reads("src/a.txt");
        put(faulty.inner(), "src/a.txt", b"locked").await;
        let engine = engine_with(
            vec![storage("a", faulty), storage("b", MemoryBackend::new())],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::copy(vec![q("a", "src/a.txt")], q("b", "/")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.items[0].failure, Some(FailureClass::SourceUnreadable));
    }

    #[tokio::test]
    async fn test_refused_write_is_destination_denied() {
        let src = MemoryBackend::new();
        put(&src, "a.txt", b"payload").await;
        let faulty = FaultyDriver::new().fail_writes("out/a.txt");
        let engine = engine_with(
            vec![storage("a", src.clone()), storage("b", faulty)],
            EngineConfig::default(),
        )
        .await;
        let id = engine
            .submit(JobRequest::move_to(vec![q("a", "a.txt")], q("b", "out")))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items[0].failure, Some(FailureClass::DestinationDenied));
        assert_eq!(read(&src, "a.txt").await, b"payload");
    }

    #[tokio::test]
    async fn test_skipped_files_leave_the_byte_total() {
        let mem = MemoryBackend::new();
        put(&mem, "d/old.txt", b"abc").await;
        put(&mem, "d/new.txt", b"hello").await;
        put(&mem, "out/d/old.txt", b"kept").await;
        let engine = engine_with(vec![storage("m", mem)], EngineConfig::default()).await;
        let id = engine
            .submit(JobRequest::copy(vec![q("m", "d")], q("m", "out")).with_conflict(ConflictPolicy::Skip))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.items.iter().any(|i| i.status == ItemStatus::Skipped));
        assert_eq!(job.bytes_total, 5);
        assert_eq!(job.bytes_done, job.bytes_total);
    }

    #[tokio::test]
    async fn test_native_move_respects_skip() {
        let driver = FaultyDriver::new().with_native_move();
        put(driver.inner(), "x.txt", b"src").await;
        put(driver.inner(), "dst/x.txt", b"dst").await;
        let inner = driver.inner().clone();
        let engine = engine_with(vec![storage("m", driver)], EngineConfig::default()).await;
        let id = engine
            .submit(
                JobRequest::move_to(vec![q("m", "x.txt")], q("m", "dst")).with_conflict(ConflictPolicy::Skip),
            )
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.items[0].status, ItemStatus::Skipped);
        assert_eq!(read(&inner, "x.txt").await, b"src");
        assert_eq!(read(&inner, "dst/x.txt").await, b"dst");
    }

    #[tokio::test]
    async fn test_delete_and_mkdir() {
        let mem = MemoryBackend::new();
        put(&mem, "trash/a", b"a").await;
        let engine = engine_with(vec![storage("m", mem.clone())], EngineConfig::default()).await;

        let id = engine
            .submit(JobRequest::delete(vec![q("m", "trash"), q("m", "/"), q("m", "missing")]))
            .await
            .unwrap();
        let job = engine.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items_failed(), 2);
        assert!(mem.stat(&sp("trash")).await.is_err());

        let id = engine.submit(JobRequest::mkdir(q("m", "made/here"))).await.unwrap();
        assert_eq!(engine.wait(id).await.unwrap().status, JobStatus::Succeeded);
        assert!(mem.stat(&sp("made/here")).await.unwrap().is_directory());
    }
}
