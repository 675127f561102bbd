// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job engine
//!
//! Every submitted job runs as its own tokio task. A semaphore bounds how
//! many are Running at once; the rest wait Queued. Each job carries one
//! cancellation token, tripped by the user or by the optional maximum
//! duration, and every backend call it makes races that token and the
//! per-call I/O timeout.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use stow_core::{
    BoxSink, ByteStream, EntryMeta, QualifiedPath, StorageDriver, StowError, StowResult,
};

use crate::archive;
use crate::job::{
    CancelCause, ConflictPolicy, ItemOutcome, JobId, JobKind, JobRequest, JobSnapshot, JobStatus,
    SidedError,
};
use crate::progress::{Counters, ProgressBus, ProgressKind, Subscription, Topic};
use crate::registry::{StorageLease, StorageRegistry};
use crate::transfer;

/// Depth of the channel feeding a download consumer
const DOWNLOAD_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per write handed to a destination
    pub chunk_size: usize,
    /// Concurrent file transfers within one job
    pub workers_per_job: usize,
    /// Jobs allowed to be Running at once
    pub max_concurrent_jobs: usize,
    /// Upper bound on any single backend call or chunk
    pub io_timeout: Duration,
    /// Cancel a job that runs longer than this
    pub max_job_duration: Option<Duration>,
    /// How long finished jobs stay queryable
    pub job_retention: Duration,
    /// Minimum time between progress events
    pub progress_interval: Duration,
    /// Byte delta that forces a progress event regardless of time
    pub progress_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            workers_per_job: 4,
            max_concurrent_jobs: 4,
            io_timeout: Duration::from_secs(60),
            max_job_duration: None,
            job_retention: Duration::from_secs(600),
            progress_interval: Duration::from_millis(250),
            progress_bytes: 4 * 1024 * 1024,
        }
    }
}

struct Throttle {
    at: Instant,
    bytes: u64,
}

/// Live state of one job
pub(crate) struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
    cause: Mutex<Option<CancelCause>>,
    record: Mutex<JobSnapshot>,
    bytes_done: AtomicU64,
    throttle: Mutex<Throttle>,
    finished: Mutex<Option<Instant>>,
    done: watch::Sender<bool>,
    bus: Arc<ProgressBus>,
}

impl JobHandle {
    fn new(id: JobId, snapshot: JobSnapshot, bus: Arc<ProgressBus>) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            cause: Mutex::new(None),
            record: Mutex::new(snapshot),
            bytes_done: AtomicU64::new(0),
            throttle: Mutex::new(Throttle {
                at: Instant::now(),
                bytes: 0,
            }),
            finished: Mutex::new(None),
            done: watch::channel(false).0,
            bus,
        }
    }

    fn counters(&self, record: &JobSnapshot) -> Counters {
        let items_failed = record.items_failed();
        Counters {
            status: record.status,
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: record.bytes_total,
            items_done: record.items.len() - items_failed,
            items_failed,
        }
    }

    /// Publish with the record locked so counters and sequence agree
    fn publish_locked(&self, record: &JobSnapshot, kind: ProgressKind, item: Option<String>) {
        self.bus.publish(self.id, kind, self.counters(record), item);
    }

    fn emit(&self, kind: ProgressKind) {
        let record = self.record.lock();
        self.publish_locked(&record, kind, None);
    }

    fn snapshot(&self) -> JobSnapshot {
        let record = self.record.lock();
        let mut snapshot = record.clone();
        if !snapshot.status.is_terminal() {
            snapshot.bytes_done = self.bytes_done.load(Ordering::Relaxed);
        }
        snapshot
    }

    /// Trip the cancellation token unless the job already finished
    fn trip(&self, cause: CancelCause) -> bool {
        if self.record.lock().status.is_terminal() {
            return false;
        }
        self.cause.lock().get_or_insert(cause);
        self.cancel.cancel();
        true
    }

    fn start(&self) {
        let mut record = self.record.lock();
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        self.publish_locked(&record, ProgressKind::Started, None);
    }

    fn finish(&self, error: Option<StowError>) -> JobStatus {
        let mut record = self.record.lock();
        record.bytes_done = self.bytes_done.load(Ordering::Relaxed);
        record.finished_at = Some(Utc::now());

        let status = match &error {
            Some(StowError::Cancelled) => JobStatus::Cancelled,
            Some(_) => JobStatus::Failed,
            None if record.items_failed() > 0 => JobStatus::Failed,
            None => JobStatus::Succeeded,
        };
        record.status = status;
        if status == JobStatus::Cancelled {
            record.cancel_cause = Some((*self.cause.lock()).unwrap_or(CancelCause::User));
        } else if let Some(e) = error {
            record.error = Some(e.to_string());
            record.failure = Some(e.class());
        }

        let kind = if status == JobStatus::Cancelled {
            ProgressKind::Cancelled
        } else {
            ProgressKind::Finished
        };
        self.publish_locked(&record, kind, None);
        drop(record);

        *self.finished.lock() = Some(Instant::now());
        self.done.send_replace(true);
        status
    }

    fn expired(&self, retention: Duration) -> bool {
        self.finished
            .lock()
            .is_some_and(|at| at.elapsed() >= retention)
    }
}

/// What a job's task is handed to work on
pub(crate) struct JobCtx {
    handle: Arc<JobHandle>,
    config: EngineConfig,
    leases: HashMap<String, StorageLease>,
    conflict: ConflictPolicy,
}

impl JobCtx {
    pub(crate) fn driver(&self, storage: &str) -> StowResult<&Arc<dyn StorageDriver>> {
        self.leases
            .get(storage)
            .map(StorageLease::driver)
            .ok_or_else(|| StowError::StorageNotFound(storage.to_string()))
    }

    pub(crate) fn conflict(&self) -> ConflictPolicy {
        self.conflict
    }

    pub(crate) fn workers(&self) -> usize {
        self.config.workers_per_job.max(1)
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.handle.cancel.is_cancelled()
    }

    pub(crate) fn check_cancelled(&self) -> StowResult<()> {
        if self.is_cancelled() {
            Err(StowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run one backend call, bounded by the I/O timeout and the job's
    /// cancellation token
    pub(crate) async fn call<T, F>(&self, what: &str, fut: F) -> StowResult<T>
    where
        F: Future<Output = StowResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.handle.cancel.cancelled() => Err(StowError::Cancelled),
            result = tokio::time::timeout(self.config.io_timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(StowError::Timeout(format!(
                    "{what} took longer than {}s",
                    self.config.io_timeout.as_secs_f32()
                ))),
            },
        }
    }

    pub(crate) fn add_total(&self, bytes: u64) {
        self.handle.record.lock().bytes_total += bytes;
    }

    /// Take back bytes planned for an item that will not be transferred
    pub(crate) fn drop_total(&self, bytes: u64) {
        let mut record = self.handle.record.lock();
        record.bytes_total = record.bytes_total.saturating_sub(bytes);
    }

    /// Count transferred bytes, emitting a coalesced progress event
    pub(crate) fn add_bytes(&self, bytes: u64) {
        let done = self.handle.bytes_done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let due = {
            let mut throttle = self.handle.throttle.lock();
            let due = throttle.at.elapsed() >= self.config.progress_interval
                || done.saturating_sub(throttle.bytes) >= self.config.progress_bytes;
            if due {
                throttle.at = Instant::now();
                throttle.bytes = done;
            }
            due
        };
        if due {
            self.handle.emit(ProgressKind::Progress);
        }
    }

    pub(crate) fn record(&self, outcome: ItemOutcome) {
        let kind = if outcome.is_failure() {
            ProgressKind::ItemFailed
        } else {
            ProgressKind::ItemDone
        };
        let item = outcome
            .destination
            .as_ref()
            .or(outcome.source.as_ref())
            .map(QualifiedPath::to_uri);
        if let Some(message) = outcome.message.as_deref().filter(|_| outcome.is_failure()) {
            debug!(item = item.as_deref().unwrap_or("-"), error = message, "item failed");
        }

        let mut record = self.handle.record.lock();
        record.items.push(outcome);
        self.handle.publish_locked(&record, kind, item);
    }

    /// Decide whether `dest` may be written. `Ok(false)` means skip it.
    pub(crate) async fn claim_destination(
        &self,
        driver: &Arc<dyn StorageDriver>,
        dest: &QualifiedPath,
    ) -> StowResult<bool> {
        match self.call("stat", driver.stat(&dest.path)).await {
            Ok(existing) if existing.is_directory() => Err(StowError::AlreadyExists(format!(
                "{dest} is a directory"
            ))),
            Ok(_) => match self.conflict {
                ConflictPolicy::Fail => Err(StowError::AlreadyExists(dest.to_string())),
                ConflictPolicy::Skip => Ok(false),
                ConflictPolicy::Overwrite => Ok(true),
            },
            Err(StowError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Stream `reader` into `sink` in chunk-sized writes and commit it.
    /// The sink is aborted on any failure.
    pub(crate) async fn pump(
        &self,
        mut reader: ByteStream,
        mut sink: BoxSink,
    ) -> Result<(u64, EntryMeta), SidedError> {
        let chunk_size = self.chunk_size();
        let copied = async {
            let mut buf = BytesMut::new();
            let mut total = 0u64;
            while let Some(next) = self
                .call("read", async { Ok::<_, StowError>(reader.next().await) })
                .await
                .map_err(SidedError::source)?
            {
                buf.extend_from_slice(&next.map_err(SidedError::source)?);
                while buf.len() >= chunk_size {
                    let chunk = buf.split_to(chunk_size).freeze();
                    total += self
                        .write_chunk(&mut sink, chunk)
                        .await
                        .map_err(SidedError::destination)?;
                }
            }
            if !buf.is_empty() {
                total += self
                    .write_chunk(&mut sink, buf.freeze())
                    .await
                    .map_err(SidedError::destination)?;
            }
            Ok::<_, SidedError>(total)
        }
        .await;

        match copied {
            Ok(total) => {
                let meta = self
                    .call("commit", sink.commit())
                    .await
                    .map_err(SidedError::destination)?;
                Ok((total, meta))
            }
            Err(e) => {
                self.abort(sink).await;
                Err(e)
            }
        }
    }

    async fn write_chunk(&self, sink: &mut BoxSink, chunk: Bytes) -> StowResult<u64> {
        let len = chunk.len() as u64;
        self.call("write", sink.write(chunk)).await?;
        self.add_bytes(len);
        Ok(len)
    }

    /// Best-effort sink cleanup; never waits past the I/O timeout
    pub(crate) async fn abort(&self, sink: BoxSink) {
        match tokio::time::timeout(self.config.io_timeout, sink.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to clean up partial write"),
            Err(_) => warn!("timed out cleaning up partial write"),
        }
    }
}

enum Work {
    Request(JobRequest),
    Upload {
        data: ByteStream,
        destination: QualifiedPath,
    },
    Download {
        source: QualifiedPath,
        tx: futures::channel::mpsc::Sender<StowResult<Bytes>>,
    },
}

struct Inner {
    config: EngineConfig,
    registry: Arc<StorageRegistry>,
    bus: Arc<ProgressBus>,
    jobs: DashMap<JobId, Arc<JobHandle>>,
    slots: Arc<Semaphore>,
}

impl Inner {
    fn evict_expired(&self) -> usize {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().expired(self.config.job_retention))
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.jobs.remove(id);
            self.bus.close(*id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted finished jobs");
        }
        expired.len()
    }
}

/// Runs storage operations as cancellable background jobs
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(registry: Arc<StorageRegistry>, config: EngineConfig) -> Self {
        Self::with_bus(registry, config, Arc::new(ProgressBus::new()))
    }

    pub fn with_bus(registry: Arc<StorageRegistry>, config: EngineConfig, bus: Arc<ProgressBus>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                bus,
                jobs: DashMap::new(),
                slots,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate a request, lease its storages and queue it
    pub async fn submit(&self, request: JobRequest) -> StowResult<JobId> {
        request.check()?;
        let mut storages: Vec<&str> = request.sources.iter().map(|s| s.storage.as_str()).collect();
        if let Some(dest) = &request.destination {
            storages.push(&dest.storage);
        }
        let leases = self
            .lease_all(&storages, request.unregistered_destination.as_ref())
            .await?;
        let (kind, sources, destination, conflict) = (
            request.kind,
            request.sources.clone(),
            request.destination.clone(),
            request.conflict,
        );
        Ok(self.spawn(kind, sources, destination, conflict, leases, Work::Request(request)))
    }

    /// Write an external byte stream to exactly `destination`
    pub async fn upload(
        &self,
        data: ByteStream,
        destination: QualifiedPath,
        conflict: ConflictPolicy,
    ) -> StowResult<JobId> {
        let leases = self.lease_all(&[destination.storage.as_str()], None).await?;
        Ok(self.spawn(
            JobKind::Upload,
            Vec::new(),
            Some(destination.clone()),
            conflict,
            leases,
            Work::Upload { data, destination },
        ))
    }

    /// Read `source` as a byte stream. The stream is fed through a bounded
    /// channel, so a slow consumer slows the transfer down.
    pub async fn download(&self, source: QualifiedPath) -> StowResult<(JobId, ByteStream)> {
        let leases = self.lease_all(&[source.storage.as_str()], None).await?;
        let (tx, rx) = futures::channel::mpsc::channel(DOWNLOAD_DEPTH);
        let id = self.spawn(
            JobKind::Download,
            vec![source.clone()],
            None,
            ConflictPolicy::default(),
            leases,
            Work::Download { source, tx },
        );
        Ok((id, Box::pin(rx)))
    }

    async fn lease_all(
        &self,
        storages: &[&str],
        unregistered: Option<&stow_core::StorageDescriptor>,
    ) -> StowResult<HashMap<String, StorageLease>> {
        let mut leases = HashMap::new();
        for &id in storages {
            if leases.contains_key(id) {
                continue;
            }
            let lease = match unregistered.filter(|d| d.id == id) {
                Some(descriptor) => {
                    let driver = self.inner.registry.connect_ephemeral(descriptor).await?;
                    StorageLease::unregistered(id, driver)
                }
                None => self.inner.registry.lease(id)?,
            };
            leases.insert(id.to_string(), lease);
        }
        Ok(leases)
    }

    fn spawn(
        &self,
        kind: JobKind,
        sources: Vec<QualifiedPath>,
        destination: Option<QualifiedPath>,
        conflict: ConflictPolicy,
        leases: HashMap<String, StorageLease>,
        work: Work,
    ) -> JobId {
        let id = JobId::new();
        let snapshot = JobSnapshot {
            id,
            kind,
            sources,
            destination,
            status: JobStatus::Queued,
            bytes_total: 0,
            bytes_done: 0,
            items: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_cause: None,
            error: None,
            failure: None,
        };
        let handle = Arc::new(JobHandle::new(id, snapshot, Arc::clone(&self.inner.bus)));
        self.inner.bus.open(id);
        self.inner.jobs.insert(id, Arc::clone(&handle));
        handle.emit(ProgressKind::Queued);

        let ctx = JobCtx {
            handle,
            config: self.inner.config.clone(),
            leases,
            conflict,
        };
        let span = info_span!("job", job_id = %id, kind = %kind);
        tokio::spawn(run_job(Arc::clone(&self.inner.slots), ctx, work).instrument(span));
        info!(job_id = %id, kind = %kind, "job queued");
        id
    }

    fn handle(&self, id: JobId) -> StowResult<Arc<JobHandle>> {
        self.inner
            .jobs
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StowError::JobNotFound(id.to_string()))
    }

    /// Request cancellation. Cancelling a finished job is a no-op.
    pub fn cancel(&self, id: JobId) -> StowResult<()> {
        let handle = self.handle(id)?;
        if handle.trip(CancelCause::User) {
            info!(job_id = %id, "cancellation requested");
        }
        Ok(())
    }

    pub fn status(&self, id: JobId) -> StowResult<JobSnapshot> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Snapshots of every retained job, oldest first
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.inner.jobs.iter().map(|e| e.value().snapshot()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn subscribe(&self, topic: Topic) -> StowResult<Subscription> {
        self.inner.bus.subscribe(topic)
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, id: JobId) -> StowResult<JobSnapshot> {
        let handle = self.handle(id)?;
        let mut done = handle.done.subscribe();
        // The sender lives in the handle we hold, so this cannot close early
        let _ = done.wait_for(|finished| *finished).await;
        Ok(handle.snapshot())
    }

    /// Forget jobs that finished longer than `job_retention` ago
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Periodically evict expired jobs until the engine is dropped
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = (self.inner.config.job_retention / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                inner.evict_expired();
            }
        })
    }
}

async fn run_job(slots: Arc<Semaphore>, ctx: JobCtx, work: Work) {
    let handle = Arc::clone(&ctx.handle);
    let permit = tokio::select! {
        permit = slots.acquire_owned() => permit.ok(),
        _ = handle.cancel.cancelled() => None,
    };
    let Some(_permit) = permit else {
        handle.finish(Some(StowError::Cancelled));
        info!("job cancelled while queued");
        return;
    };

    handle.start();
    info!("job started");

    let timer = ctx.config.max_job_duration.map(|limit| {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if handle.trip(CancelCause::Timeout) {
                warn!(job_id = %handle.id, "job exceeded its maximum duration");
            }
        })
    });

    let result = AssertUnwindSafe(execute(&ctx, work)).catch_unwind().await;
    if let Some(timer) = timer {
        timer.abort();
    }
    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(StowError::Other("job task panicked".into())),
    };

    let status = handle.finish(error);
    let snapshot = handle.snapshot();
    match status {
        JobStatus::Failed => warn!(
            items_failed = snapshot.items_failed(),
            error = snapshot.error.as_deref().unwrap_or(""),
            "job failed"
        ),
        _ => info!(status = %status, bytes = snapshot.bytes_done, "job finished"),
    }
}

async fn execute(ctx: &JobCtx, work: Work) -> StowResult<()> {
    match work {
        Work::Upload { data, destination } => transfer::upload(ctx, data, &destination).await,
        Work::Download { source, tx } => transfer::download(ctx, &source, tx).await,
        Work::Request(request) => {
            let destination = request.destination.as_ref();
            let need_destination =
                || destination.ok_or_else(|| StowError::InvalidConfig("missing destination".into()));
            match request.kind {
                JobKind::Copy => transfer::copy(ctx, &request.sources, need_destination()?, false).await,
                JobKind::Move => transfer::copy(ctx, &request.sources, need_destination()?, true).await,
                JobKind::Delete => transfer::delete(ctx, &request.sources).await,
                JobKind::Mkdir => transfer::mkdir(ctx, need_destination()?).await,
                JobKind::Compress => {
                    archive::compress(ctx, &request.sources, need_destination()?, request.format).await
                }
                JobKind::Extract => {
                    archive::extract(ctx, &request.sources[0], need_destination()?, request.format).await
                }
                JobKind::Upload | JobKind::Download => Err(StowError::Unsupported(format!(
                    "{} jobs take a byte stream; use Engine::{}",
                    request.kind, request.kind
                ))),
            }
        }
    }
}
