// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI command implementations

use chrono::{DateTime, Utc};
use console::style;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use stow_core::{
    ByteStream, EntryKind, EntryMeta, QualifiedPath, StorageDescriptor, StorageKind, StowError,
    StowResult,
};
use stow_engine::{
    ArchiveFormat, ConflictPolicy, Engine, ItemOutcome, ItemStatus, JobId, JobRequest,
    JobSnapshot, JobStatus, SecurityGate, StorageRegistry, Topic, TomlDescriptorStore,
    BLOCKED_RANGES,
};
use stow_providers::ProviderFactory;

use crate::config::Config;

const URI_SCHEME: &str = "stow://";

/// Parse a path argument into a storage-qualified path.
/// Supports:
/// - stow://storage/path - explicit URI
/// - storage:path - short form
/// - path - on the default storage
fn parse_target(input: &str, default: Option<&str>) -> StowResult<QualifiedPath> {
    if input.starts_with(URI_SCHEME) {
        return QualifiedPath::parse_uri(input);
    }
    if let Some((id, rest)) = input.split_once(':') {
        let looks_like_id = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if looks_like_id {
            return QualifiedPath::parse(id, rest);
        }
    }
    match default {
        Some(id) => QualifiedPath::parse(id, input),
        None => Err(StowError::InvalidConfig(format!(
            "no default storage; write {input} as storage:path"
        ))),
    }
}

/// Format a timestamp for display
fn format_time(dt: Option<DateTime<Utc>>) -> String {
    dt.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Format file size
fn format_size(size: u64, human: bool) -> String {
    if human {
        bytesize::ByteSize(size).to_string()
    } else {
        size.to_string()
    }
}

/// Format entry kind
fn format_kind(kind: EntryKind) -> String {
    match kind {
        EntryKind::Directory => style("d").cyan().to_string(),
        EntryKind::File => "-".to_string(),
        EntryKind::Symlink => style("l").magenta().to_string(),
    }
}

fn format_status(status: ItemStatus) -> String {
    match status {
        ItemStatus::Succeeded => style("ok").green().to_string(),
        ItemStatus::SucceededWithWarning => style("warning").yellow().to_string(),
        ItemStatus::Skipped => style("skipped").dim().to_string(),
        ItemStatus::Failed => style("failed").red().to_string(),
    }
}

fn item_label(outcome: &ItemOutcome) -> String {
    outcome
        .destination
        .as_ref()
        .or(outcome.source.as_ref())
        .map_or_else(|| "-".to_string(), |p| p.to_uri())
}

#[derive(Tabled)]
struct LsEntry {
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
    #[tabled(rename = "Name")]
    name: String,
}

#[derive(Tabled)]
struct StorageRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Default")]
    default: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct ItemRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Item")]
    item: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct RangeRow {
    #[tabled(rename = "Range")]
    cidr: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

fn progress_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(label.to_string());
    bar
}

/// Print every item that did not simply succeed, then a summary line
fn report(job: &JobSnapshot) -> StowResult<()> {
    let notable: Vec<ItemRow> = job
        .items
        .iter()
        .filter(|i| i.status != ItemStatus::Succeeded)
        .map(|i| ItemRow {
            status: format_status(i.status),
            item: item_label(i),
            detail: i.message.clone().unwrap_or_default(),
        })
        .collect();
    if !notable.is_empty() {
        println!("{}", Table::new(notable));
    }

    let elapsed = match (job.started_at, job.finished_at) {
        (Some(start), Some(end)) => {
            format!(" in {:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => String::new(),
    };
    let failed = job.items_failed();
    println!(
        "{} {}: {} items, {}{}",
        match job.status {
            JobStatus::Succeeded => style(job.status.as_str()).green(),
            JobStatus::Cancelled => style(job.status.as_str()).yellow(),
            _ => style(job.status.as_str()).red(),
        },
        job.kind,
        job.items.len(),
        bytesize::ByteSize(job.bytes_done),
        elapsed
    );

    match job.status {
        JobStatus::Succeeded => Ok(()),
        JobStatus::Cancelled => Err(StowError::Cancelled),
        _ if failed > 0 => Err(StowError::PartialFailure {
            failed,
            total: job.items.len(),
        }),
        _ => Err(StowError::Other(
            job.error.clone().unwrap_or_else(|| "job failed".to_string()),
        )),
    }
}

/// Everything a command needs: the loaded registry and an engine over it
pub struct App {
    registry: Arc<StorageRegistry>,
    engine: Engine,
}

impl App {
    pub async fn open(config: &Config) -> StowResult<Self> {
        let store = TomlDescriptorStore::new(config.state_file()?);
        let registry = Arc::new(StorageRegistry::new(
            Arc::new(ProviderFactory::new()),
            Arc::new(SecurityGate::new(config.security())),
            Arc::new(store),
        ));
        registry.load().await?;
        let engine = Engine::new(Arc::clone(&registry), config.engine());
        Ok(Self { registry, engine })
    }

    fn target(&self, input: &str) -> StowResult<QualifiedPath> {
        let default = self.registry.default_storage().map(|d| d.id);
        parse_target(input, default.as_deref())
    }

    fn targets(&self, inputs: &[String]) -> StowResult<Vec<QualifiedPath>> {
        inputs.iter().map(|i| self.target(i)).collect()
    }

    /// Follow a job on the progress bus until it ends. Ctrl-C cancels it.
    async fn follow(&self, id: JobId, label: &str) -> StowResult<()> {
        let mut events = self.engine.subscribe(Topic::Job(id))?;
        let bar = progress_bar(label);
        let mut cancelling = false;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    bar.set_length(event.counters.bytes_total);
                    bar.set_position(event.counters.bytes_done);
                    if event.kind.is_terminal() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c(), if !cancelling => {
                    cancelling = true;
                    bar.set_message(format!("{label} (cancelling)"));
                    self.engine.cancel(id)?;
                }
            }
        }
        bar.finish_and_clear();
        report(&self.engine.wait(id).await?)
    }

    async fn submit(&self, request: JobRequest, label: &str) -> StowResult<()> {
        let id = self.engine.submit(request).await?;
        self.follow(id, label).await
    }

    // -- storage ---------------------------------------------------------

    pub async fn storage_list(&self) -> StowResult<()> {
        let rows: Vec<StorageRow> = self
            .registry
            .statuses()
            .into_iter()
            .map(|s| StorageRow {
                id: s.descriptor.id.clone(),
                kind: s.descriptor.kind.to_string(),
                name: s.descriptor.name.clone(),
                default: if s.descriptor.is_default { "*".into() } else { String::new() },
                status: match (&s.unavailable, s.in_use) {
                    (Some(reason), _) => style(format!("unavailable: {reason}")).red().to_string(),
                    (None, true) => style("in use").yellow().to_string(),
                    (None, false) => style("available").green().to_string(),
                },
            })
            .collect();

        if rows.is_empty() {
            println!("(no storages registered)");
        } else {
            println!("{}", Table::new(rows));
        }
        Ok(())
    }

    pub async fn storage_add(
        &self,
        id: String,
        kind: &str,
        name: Option<String>,
        config: &[String],
        icon: Option<String>,
        default: bool,
    ) -> StowResult<()> {
        let kind: StorageKind = kind.parse()?;
        let name = name.unwrap_or_else(|| id.clone());
        let mut descriptor = StorageDescriptor::new(id.clone(), kind, name);
        for pair in config {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                StowError::InvalidConfig(format!("expected KEY=VALUE, got {pair}"))
            })?;
            descriptor = descriptor.with_config(key.trim(), value);
        }
        if let Some(icon) = icon {
            descriptor = descriptor.with_icon(icon);
        }
        descriptor.is_default = default;

        self.registry.add(descriptor).await?;
        println!("Registered {}", style(&id).bold());
        Ok(())
    }

    pub async fn storage_remove(&self, id: &str) -> StowResult<()> {
        self.registry.remove(id).await?;
        println!("Removed {id}");
        Ok(())
    }

    pub async fn storage_default(&self, id: &str) -> StowResult<()> {
        self.registry.set_default(id).await?;
        println!("Default storage is now {id}");
        Ok(())
    }

    pub async fn storage_test(&self, id: &str) -> StowResult<()> {
        let descriptor = self.registry.descriptor(id)?;
        self.registry.test_connection(&descriptor).await?;
        println!("{} {id} ({})", style("ok").green(), descriptor.kind);
        Ok(())
    }

    pub fn storage_show(&self, id: &str) -> StowResult<()> {
        let descriptor = self.registry.descriptor(id)?.redacted();
        println!("  ID: {}", descriptor.id);
        println!("  Kind: {}", descriptor.kind);
        println!("  Name: {}", descriptor.name);
        if !descriptor.icon.is_empty() {
            println!("  Icon: {}", descriptor.icon);
        }
        println!("  Default: {}", descriptor.is_default);
        for (key, value) in &descriptor.config {
            println!("  {key} = {value}");
        }
        Ok(())
    }

    // -- browsing ---------------------------------------------------------

    pub async fn ls(&self, path: &str, long: bool, all: bool, human: bool) -> StowResult<()> {
        let target = self.target(path)?;
        tracing::debug!(%target, "listing");
        let driver = self.registry.get(&target.storage)?;

        let mut entries: Vec<EntryMeta> = driver
            .list(&target.path)
            .await?
            .into_iter()
            .filter(|e| all || !e.name().is_some_and(|n| n.starts_with('.')))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        if entries.is_empty() {
            println!("(empty directory)");
        } else if long {
            let rows: Vec<LsEntry> = entries
                .iter()
                .map(|e| LsEntry {
                    kind: format_kind(e.kind),
                    size: if e.is_directory() { "-".into() } else { format_size(e.size, human) },
                    modified: format_time(e.modified),
                    name: e.name().unwrap_or("?").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        } else {
            for entry in &entries {
                match entry.kind {
                    EntryKind::Directory => {
                        println!("{}/", style(entry.name().unwrap_or("?")).cyan())
                    }
                    _ => println!("{}", entry.name().unwrap_or("?")),
                }
            }
        }
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> StowResult<()> {
        let target = self.target(path)?;
        let entry = self.registry.get(&target.storage)?.stat(&target.path).await?;

        println!("  Path: {}", target.to_uri());
        println!("  Type: {:?}", entry.kind);
        if entry.is_file() {
            println!("  Size: {} ({})", entry.size, bytesize::ByteSize(entry.size));
        }
        if let Some(modified) = entry.modified {
            println!("  Modified: {modified}");
        }
        if let Some(revision) = &entry.revision {
            println!("  Revision: {revision}");
        }
        Ok(())
    }

    // -- jobs -------------------------------------------------------------

    pub async fn copy(
        &self,
        sources: &[String],
        dest: &str,
        conflict: ConflictPolicy,
        remove_source: bool,
    ) -> StowResult<()> {
        let sources = self.targets(sources)?;
        let dest = self.target(dest)?;
        let (request, label) = if remove_source {
            (JobRequest::move_to(sources, dest), "moving")
        } else {
            (JobRequest::copy(sources, dest), "copying")
        };
        self.submit(request.with_conflict(conflict), label).await
    }

    pub async fn rm(&self, paths: &[String]) -> StowResult<()> {
        self.submit(JobRequest::delete(self.targets(paths)?), "removing")
            .await
    }

    pub async fn mkdir(&self, path: &str) -> StowResult<()> {
        self.submit(JobRequest::mkdir(self.target(path)?), "creating")
            .await
    }

    pub async fn upload(&self, local: &Path, dest: &str, conflict: ConflictPolicy) -> StowResult<()> {
        let dest = self.target(dest)?;
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| StowError::from_io(e, local.display().to_string()))?;
        let data: ByteStream = Box::pin(ReaderStream::new(file).map(|r| r.map_err(StowError::Io)));
        let id = self.engine.upload(data, dest, conflict).await?;
        self.follow(id, "uploading").await
    }

    pub async fn download(&self, source: &str, local: &str) -> StowResult<()> {
        let source = self.target(source)?;
        let (id, mut data) = self.engine.download(source).await?;

        let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = if local == "-" {
            Box::new(tokio::io::stdout())
        } else {
            let file = tokio::fs::File::create(local)
                .await
                .map_err(|e| StowError::from_io(e, local))?;
            Box::new(file)
        };
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await.map_err(StowError::Io)?;
        }
        out.flush().await.map_err(StowError::Io)?;

        let job = self.engine.wait(id).await?;
        if local == "-" {
            // Keep stdout clean for the data
            return match job.status {
                JobStatus::Succeeded => Ok(()),
                _ => report(&job),
            };
        }
        report(&job)
    }

    pub async fn compress(
        &self,
        sources: &[String],
        archive: &str,
        format: Option<ArchiveFormat>,
        conflict: ConflictPolicy,
    ) -> StowResult<()> {
        let mut request = JobRequest::compress(self.targets(sources)?, self.target(archive)?)
            .with_conflict(conflict);
        if let Some(format) = format {
            request = request.with_format(format);
        }
        self.submit(request, "compressing").await
    }

    pub async fn extract(
        &self,
        archive: &str,
        dest: &str,
        format: Option<ArchiveFormat>,
        conflict: ConflictPolicy,
    ) -> StowResult<()> {
        let mut request =
            JobRequest::extract(self.target(archive)?, self.target(dest)?).with_conflict(conflict);
        if let Some(format) = format {
            request = request.with_format(format);
        }
        self.submit(request, "extracting").await
    }

    // -- policy -----------------------------------------------------------

    pub async fn policy(&self, endpoint: Option<&str>) -> StowResult<()> {
        let security = self.registry.security();
        let policy = security.policy();
        let Some(endpoint) = endpoint else {
            println!(
                "Local addresses: {}",
                if policy.allow_local_ips {
                    style("allowed").yellow()
                } else {
                    style("blocked").green()
                }
            );
            let rows: Vec<RangeRow> = BLOCKED_RANGES
                .iter()
                .map(|r| RangeRow {
                    cidr: r.cidr(),
                    reason: r.reason.to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
            return Ok(());
        };

        let resolved = security.validate(endpoint).await?;
        let addrs: Vec<String> = resolved.addrs.iter().map(|a| a.ip().to_string()).collect();
        println!("{} {} -> {}", style("allowed").green(), resolved.host, addrs.join(", "));
        Ok(())
    }
}
