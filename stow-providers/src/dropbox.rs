// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dropbox storage backend (API v2)
//!
//! Metadata calls go to the RPC host, file bodies to the content host.
//! Large uploads use upload sessions, which stay invisible until finished.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use stow_core::{
    stream, BoxSink, ByteSink, ByteStream, Capabilities, EntryMeta, ResolvedEndpoint,
    StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};

use crate::config::Settings;
use crate::http::{body_stream, network, pinned_client, status_error};

const PROVIDER: &str = "dropbox";
pub(crate) const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub(crate) const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const LIST_LIMIT: u32 = 2000;
/// Upload session chunk; uploads below this go in a single request
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Dropbox backend configuration
#[derive(Debug, Clone)]
pub struct DropboxConfig {
    pub access_token: String,
    /// Folder inside the Dropbox the backend root maps to
    pub root: StoragePath,
    pub api_url: Url,
    pub content_url: Url,
}

impl DropboxConfig {
    pub(crate) fn from_settings(settings: &Settings) -> StowResult<Self> {
        match settings.optional("provider").unwrap_or(PROVIDER) {
            PROVIDER => {}
            other => {
                return Err(StowError::Unsupported(format!("cloud-drive provider {other}")));
            }
        }
        Ok(Self {
            access_token: settings.required("access_token")?.to_string(),
            root: StoragePath::parse(settings.optional("root").unwrap_or("/"))?,
            api_url: parse_base(settings.optional("api_url").unwrap_or(DEFAULT_API_URL))?,
            content_url: parse_base(settings.optional("content_url").unwrap_or(DEFAULT_CONTENT_URL))?,
        })
    }
}

fn parse_base(raw: &str) -> StowResult<Url> {
    let mut url = Url::parse(raw).map_err(|e| StowError::InvalidConfig(format!("dropbox url: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `Dropbox-API-Arg` values must be ASCII; everything else is `\u` escaped
fn header_arg(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    size: Option<u64>,
    server_modified: Option<String>,
    rev: Option<String>,
}

impl Metadata {
    fn into_entry(self, path: StoragePath) -> EntryMeta {
        if self.tag == "folder" {
            return EntryMeta::directory(path);
        }
        let modified = self
            .server_modified
            .as_deref()
            .and_then(|m| DateTime::parse_from_rfc3339(m).ok())
            .map(|dt| dt.with_timezone(&Utc));
        EntryMeta::file(path, self.size.unwrap_or(0))
            .with_modified(modified)
            .with_revision(self.rev)
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_summary: String,
}

/// Map an `error_summary` such as `path/not_found/..` to the error taxonomy
fn summary_error(summary: &str, path: &str) -> StowError {
    if summary.contains("not_found") {
        StowError::NotFound(path.to_string())
    } else if summary.contains("conflict") {
        StowError::AlreadyExists(path.to_string())
    } else if summary.contains("not_folder") {
        StowError::NotADirectory(path.to_string())
    } else if summary.contains("not_file") {
        StowError::NotAFile(path.to_string())
    } else if summary.contains("insufficient_space") {
        StowError::StorageFull(path.to_string())
    } else if summary.contains("no_write_permission") || summary.contains("access_denied") {
        StowError::PermissionDenied(path.to_string())
    } else {
        StowError::ProviderApi {
            provider: PROVIDER.into(),
            message: summary.to_string(),
        }
    }
}

async fn api_error(path: &str, response: Response) -> StowError {
    match response.status() {
        StatusCode::CONFLICT => match response.json::<ApiError>().await {
            Ok(err) => summary_error(&err.error_summary, path),
            Err(e) => StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: format!("unreadable error body: {e}"),
            },
        },
        StatusCode::TOO_MANY_REQUESTS => StowError::Network(format!("{path}: rate limited")),
        _ => status_error(PROVIDER, path, response).await,
    }
}

#[derive(Serialize)]
struct Cursor<'a> {
    session_id: &'a str,
    offset: u64,
}

struct Inner {
    config: DropboxConfig,
    http: Client,
}

impl Inner {
    /// Dropbox path for a backend path; the Dropbox root is the empty string
    fn dropbox_path(&self, path: &StoragePath) -> String {
        let full = self.config.root.join_path(path);
        if full.is_root() {
            String::new()
        } else {
            full.to_path_string()
        }
    }

    fn endpoint(base: &Url, route: &str) -> StowResult<Url> {
        base.join(&format!("2/{route}"))
            .map_err(|e| StowError::InvalidConfig(format!("dropbox route {route}: {e}")))
    }

    fn post(&self, url: Url) -> RequestBuilder {
        self.http
            .post(url)
            .bearer_auth(&self.config.access_token)
    }

    async fn rpc<T: DeserializeOwned>(&self, route: &str, arg: serde_json::Value, path: &str) -> StowResult<T> {
        debug!(route, path, "dropbox rpc");
        let response = self
            .post(Self::endpoint(&self.config.api_url, route)?)
            .json(&arg)
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(api_error(path, response).await);
        }
        response.json().await.map_err(|e| StowError::ProviderApi {
            provider: PROVIDER.into(),
            message: format!("{route}: {e}"),
        })
    }

    async fn content(&self, route: &str, arg: serde_json::Value, body: Bytes, path: &str) -> StowResult<Response> {
        let response = self
            .post(Self::endpoint(&self.config.content_url, route)?)
            .header("Dropbox-API-Arg", header_arg(&arg))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(api_error(path, response).await);
        }
        Ok(response)
    }

    async fn metadata(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        let dropbox = self.dropbox_path(path);
        if dropbox.is_empty() {
            return Ok(EntryMeta::directory(path.clone()));
        }
        let meta: Metadata = self
            .rpc("files/get_metadata", json!({ "path": dropbox }), &dropbox)
            .await?;
        Ok(meta.into_entry(path.clone()))
    }
}

/// Dropbox storage backend
pub struct DropboxBackend {
    inner: Arc<Inner>,
}

impl DropboxBackend {
    /// `endpoints` are the validated API and content hosts
    pub fn new(config: DropboxConfig, endpoints: &[ResolvedEndpoint]) -> StowResult<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                http: pinned_client(endpoints)?,
                config,
            }),
        })
    }
}

#[async_trait]
impl StorageDriver for DropboxBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::CloudDrive
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_move: true,
            range_reads: true,
            atomic_writes: true,
            real_directories: true,
        }
    }

    async fn health_check(&self) -> StowResult<()> {
        let _: serde_json::Value = self
            .inner
            .rpc("users/get_current_account", serde_json::Value::Null, "account")
            .await?;
        let root = self.inner.metadata(&StoragePath::root()).await?;
        if root.is_directory() {
            Ok(())
        } else {
            Err(StowError::NotADirectory(self.inner.config.root.to_string()))
        }
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let dropbox = self.inner.dropbox_path(path);
        let mut page: ListFolderResponse = self
            .inner
            .rpc(
                "files/list_folder",
                json!({
                    "path": dropbox,
                    "recursive": false,
                    "include_deleted": false,
                    "limit": LIST_LIMIT,
                }),
                &dropbox,
            )
            .await?;

        let mut entries = Vec::new();
        loop {
            for meta in page.entries {
                let Ok(child) = path.join(&meta.name) else { continue };
                if meta.tag == "deleted" {
                    continue;
                }
                entries.push(meta.into_entry(child));
            }
            if !page.has_more {
                break;
            }
            page = self
                .inner
                .rpc("files/list_folder/continue", json!({ "cursor": page.cursor }), &dropbox)
                .await?;
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        self.inner.metadata(path).await
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let dropbox = self.inner.dropbox_path(path);
        if dropbox.is_empty() {
            return Err(StowError::NotAFile(path.to_string()));
        }
        let mut request = self
            .inner
            .post(Inner::endpoint(&self.inner.config.content_url, "files/download")?)
            .header("Dropbox-API-Arg", header_arg(&json!({ "path": dropbox })));
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(network)?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(body_stream(response)),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(stream::once(Bytes::new())),
            s if s.is_success() => Ok(stream::skip_prefix(body_stream(response), offset)),
            _ => Err(api_error(&dropbox, response).await),
        }
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        let dropbox = self.inner.dropbox_path(path);
        if dropbox.is_empty() {
            return Err(StowError::NotAFile(path.to_string()));
        }
        Ok(Box::new(DropboxSink {
            inner: Arc::clone(&self.inner),
            path: path.clone(),
            dropbox,
            buffer: BytesMut::new(),
            session: None,
            offset: 0,
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        let dropbox = self.inner.dropbox_path(path);
        if dropbox.is_empty() {
            return Ok(());
        }
        let created: StowResult<serde_json::Value> = self
            .inner
            .rpc("files/create_folder_v2", json!({ "path": dropbox, "autorename": false }), &dropbox)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(StowError::AlreadyExists(_)) => match self.inner.metadata(path).await? {
                entry if entry.is_directory() => Ok(()),
                _ => Err(StowError::AlreadyExists(path.to_string())),
            },
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let dropbox = self.inner.dropbox_path(path);
        if dropbox.is_empty() {
            return Err(StowError::InvalidPath("cannot remove the storage root".into()));
        }
        if !recursive {
            let entry = self.inner.metadata(path).await?;
            if entry.is_directory() && !self.list(path).await?.is_empty() {
                return Err(StowError::Other(format!("directory not empty: {path}")));
            }
        }
        let _: serde_json::Value = self
            .inner
            .rpc("files/delete_v2", json!({ "path": dropbox }), &dropbox)
            .await?;
        Ok(())
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        let from = self.inner.dropbox_path(src);
        let to = self.inner.dropbox_path(dst);
        let _: serde_json::Value = self
            .inner
            .rpc(
                "files/move_v2",
                json!({
                    "from_path": from,
                    "to_path": to,
                    "autorename": false,
                    "allow_ownership_transfer": false,
                }),
                &to,
            )
            .await?;
        Ok(true)
    }
}

/// Buffers up to one chunk; larger files go through an upload session
struct DropboxSink {
    inner: Arc<Inner>,
    path: StoragePath,
    dropbox: String,
    buffer: BytesMut,
    session: Option<String>,
    offset: u64,
}

impl DropboxSink {
    fn commit_info(&self) -> serde_json::Value {
        json!({
            "path": self.dropbox,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        })
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> StowResult<()> {
        let len = chunk.len() as u64;
        match self.session.clone() {
            None => {
                #[derive(Deserialize)]
                struct Started {
                    session_id: String,
                }
                let response = self
                    .inner
                    .content("files/upload_session/start", json!({ "close": false }), chunk, &self.dropbox)
                    .await?;
                let started: Started = response.json().await.map_err(network)?;
                self.session = Some(started.session_id);
            }
            Some(id) => {
                let arg = json!({
                    "cursor": Cursor { session_id: &id, offset: self.offset },
                    "close": false,
                });
                self.inner
                    .content("files/upload_session/append_v2", arg, chunk, &self.dropbox)
                    .await?;
            }
        }
        self.offset += len;
        Ok(())
    }
}

#[async_trait]
impl ByteSink for DropboxSink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= CHUNK_SIZE {
            let part = self.buffer.split_to(CHUNK_SIZE).freeze();
            self.send_chunk(part).await?;
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StowResult<EntryMeta> {
        let rest = std::mem::take(&mut self.buffer).freeze();
        let response = match &self.session {
            None => {
                self.inner
                    .content("files/upload", self.commit_info(), rest, &self.dropbox)
                    .await?
            }
            Some(id) => {
                let arg = json!({
                    "cursor": Cursor { session_id: id, offset: self.offset },
                    "commit": self.commit_info(),
                });
                self.inner
                    .content("files/upload_session/finish", arg, rest, &self.dropbox)
                    .await?
            }
        };
        let meta: Metadata = response.json().await.map_err(network)?;
        Ok(meta.into_entry(self.path.clone()))
    }

    async fn abort(self: Box<Self>) -> StowResult<()> {
        // Unfinished sessions expire server-side and never become files
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stow_core::StorageDescriptor;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let mut desc = StorageDescriptor::new("dbx", StorageKind::CloudDrive, "Dropbox");
        for (k, v) in pairs {
            desc = desc.with_config(*k, *v);
        }
        Settings::from_descriptor(&desc).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = DropboxConfig::from_settings(&settings(&[("access_token", "t")])).unwrap();
        assert_eq!(config.api_url.as_str(), "https://api.dropboxapi.com/");
        assert_eq!(config.content_url.as_str(), "https://content.dropboxapi.com/");
        assert!(config.root.is_root());
        assert!(DropboxConfig::from_settings(&settings(&[])).is_err());
    }

    #[test]
    fn test_other_providers_unsupported() {
        let result = DropboxConfig::from_settings(&settings(&[("provider", "gdrive"), ("access_token", "t")]));
        assert!(matches!(result, Err(StowError::Unsupported(_))));
    }

    #[test]
    fn test_header_arg_escapes_non_ascii() {
        let arg = header_arg(&json!({ "path": "/Fotos/Žluťoučký 🐴.jpg" }));
        assert!(arg.is_ascii());
        assert!(arg.contains("\\u017d"));
        // Astral characters become surrogate pairs
        assert!(arg.contains("\\ud83d\\udc34"));
    }

    #[test]
    fn test_summary_errors() {
        assert!(matches!(summary_error("path/not_found/..", "/a"), StowError::NotFound(_)));
        assert!(matches!(summary_error("to/conflict/file/..", "/a"), StowError::AlreadyExists(_)));
        assert!(matches!(
            summary_error("path/insufficient_space/..", "/a"),
            StowError::StorageFull(_)
        ));
        assert!(matches!(summary_error("too_many_write_operations/", "/a"), StowError::ProviderApi { .. }));
    }

    #[test]
    fn test_metadata_into_entry() {
        let raw = r#"{".tag":"file","name":"a.txt","size":12,"server_modified":"2024-03-01T10:00:00Z","rev":"abc123"}"#;
        let meta: Metadata = serde_json::from_str(raw).unwrap();
        let entry = meta.into_entry(StoragePath::parse("docs/a.txt").unwrap());
        assert_eq!(entry.size, 12);
        assert_eq!(entry.revision.as_deref(), Some("abc123"));
        assert!(entry.modified.is_some());

        let folder: Metadata = serde_json::from_str(r#"{".tag":"folder","name":"docs"}"#).unwrap();
        assert!(folder.into_entry(StoragePath::parse("docs").unwrap()).is_directory());
    }

    #[test]
    fn test_dropbox_paths_respect_root() {
        let config = DropboxConfig::from_settings(&settings(&[("access_token", "t"), ("root", "Apps/stow")])).unwrap();
        let backend = DropboxBackend::new(config, &[]).unwrap();
        assert_eq!(backend.inner.dropbox_path(&StoragePath::root()), "/Apps/stow");
        assert_eq!(
            backend.inner.dropbox_path(&StoragePath::parse("x/y").unwrap()),
            "/Apps/stow/x/y"
        );
    }
}
