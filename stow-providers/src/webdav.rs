// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebDAV storage backend
//!
//! HTTP-based distributed authoring and versioning protocol.
//! Compatible with NextCloud, ownCloud, SharePoint, Apache mod_dav, etc.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use reqwest::{header, Body, Client, Method, RequestBuilder, StatusCode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use stow_core::{
    stream, BoxSink, ByteSink, ByteStream, Capabilities, EntryMeta, ResolvedEndpoint,
    StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};

use crate::config::Settings;
use crate::http::{body_stream, network, parse_http_date, pinned_client, status_error};
use crate::xml;

const PROVIDER: &str = "webdav";
const UPLOAD_QUEUE: usize = 4;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

/// WebDAV authentication method
#[derive(Debug, Clone)]
pub enum WebDavAuth {
    None,
    Basic { username: String, password: String },
    /// Bearer token (OAuth)
    Bearer(String),
}

/// WebDAV backend configuration
#[derive(Debug, Clone)]
pub struct WebDavConfig {
    /// Base collection URL (e.g., "https://cloud.example.com/remote.php/dav/files/username")
    pub base_url: Url,
    pub auth: WebDavAuth,
}

impl WebDavConfig {
    pub(crate) fn from_settings(settings: &Settings) -> StowResult<Self> {
        let raw = settings.required("url")?;
        let mut base_url = Url::parse(raw)
            .map_err(|e| StowError::InvalidConfig(format!("webdav url: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(StowError::InvalidConfig(format!("webdav url must be http(s): {raw}")));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let auth = match (settings.optional("token"), settings.optional("username")) {
            (Some(token), _) => WebDavAuth::Bearer(token.to_string()),
            (None, Some(username)) => WebDavAuth::Basic {
                username: username.to_string(),
                password: settings.optional("password").unwrap_or_default().to_string(),
            },
            (None, None) => WebDavAuth::None,
        };
        Ok(Self { base_url, auth })
    }
}

/// DAV response from PROPFIND
#[derive(Debug, Clone, Default)]
struct DavResponse {
    href: String,
    is_collection: bool,
    content_length: Option<u64>,
    last_modified: Option<chrono::DateTime<chrono::Utc>>,
    etag: Option<String>,
}

/// Parse a multistatus body, keeping only the properties reported with 200
fn parse_multistatus(body: &str) -> Vec<DavResponse> {
    xml::elements(body, "response")
        .into_iter()
        .filter_map(|response| {
            let href = xml::text(response, "href")?;
            let mut dav = DavResponse {
                href,
                ..DavResponse::default()
            };
            for propstat in xml::elements(response, "propstat") {
                let ok = xml::text(propstat, "status").map_or(true, |s| s.contains(" 200"));
                if !ok {
                    continue;
                }
                if xml::elements(propstat, "resourcetype")
                    .first()
                    .is_some_and(|rt| !xml::elements(rt, "collection").is_empty())
                {
                    dav.is_collection = true;
                }
                if let Some(len) = xml::text(propstat, "getcontentlength") {
                    dav.content_length = len.parse().ok();
                }
                if let Some(modified) = xml::text(propstat, "getlastmodified") {
                    dav.last_modified = parse_http_date(&modified);
                }
                if let Some(etag) = xml::text(propstat, "getetag") {
                    dav.etag = Some(etag.trim_matches('"').to_string());
                }
            }
            Some(dav)
        })
        .collect()
}

struct Inner {
    config: WebDavConfig,
    http: Client,
}

impl Inner {
    fn url_for(&self, path: &StoragePath) -> StowResult<Url> {
        let rel = path
            .segments()
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        self.config
            .base_url
            .join(&rel)
            .map_err(|e| StowError::InvalidPath(format!("{path}: {e}")))
    }

    fn collection_url(&self, path: &StoragePath) -> StowResult<Url> {
        let mut url = self.url_for(path)?;
        if !url.path().ends_with('/') {
            let p = format!("{}/", url.path());
            url.set_path(&p);
        }
        Ok(url)
    }

    /// Build authenticated request
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.config.auth {
            WebDavAuth::None => request,
            WebDavAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            WebDavAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// PROPFIND request for listing/metadata
    async fn propfind(&self, path: &StoragePath, depth: &str) -> StowResult<Vec<DavResponse>> {
        let response = self
            .request(dav_method(b"PROPFIND")?, self.url_for(path)?)
            .header("Depth", depth)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(network)?;

        if response.status() != StatusCode::MULTI_STATUS && !response.status().is_success() {
            return Err(status_error(PROVIDER, &path.to_string(), response).await);
        }
        let body = response.text().await.map_err(network)?;
        Ok(parse_multistatus(&body))
    }

    /// Strip the base collection from an href, yielding the backend path
    fn path_from_href(&self, href: &str) -> Option<StoragePath> {
        let href_path = match Url::parse(href) {
            Ok(abs) => abs.path().to_string(),
            Err(_) => href.to_string(),
        };
        let decoded = urlencoding::decode(&href_path).ok()?.into_owned();
        let base = urlencoding::decode(self.config.base_url.path()).ok()?.into_owned();
        let rel = decoded.strip_prefix(base.trim_end_matches('/'))?;
        StoragePath::parse(rel).ok()
    }

    fn entry_for(&self, dav: &DavResponse) -> Option<EntryMeta> {
        let path = self.path_from_href(&dav.href)?;
        let entry = if dav.is_collection {
            EntryMeta::directory(path)
        } else {
            EntryMeta::file(path, dav.content_length.unwrap_or(0))
        };
        Some(entry.with_modified(dav.last_modified).with_revision(dav.etag.clone()))
    }

    async fn move_resource(&self, from: Url, to: &Url, overwrite: bool, path: &str) -> StowResult<()> {
        let response = self
            .request(dav_method(b"MOVE")?, from)
            .header("Destination", to.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await
            .map_err(network)?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Err(StowError::AlreadyExists(path.to_string())),
            _ => Err(status_error(PROVIDER, path, response).await),
        }
    }

    /// Returns the raw status; 405 means something already exists there
    async fn mkcol(&self, path: &StoragePath) -> StowResult<StatusCode> {
        let response = self
            .request(dav_method(b"MKCOL")?, self.collection_url(path)?)
            .send()
            .await
            .map_err(network)?;
        Ok(response.status())
    }

    async fn delete(&self, url: Url, path: &str) -> StowResult<()> {
        let response = self.request(Method::DELETE, url).send().await.map_err(network)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(PROVIDER, path, response).await)
        }
    }
}

fn dav_method(name: &'static [u8]) -> StowResult<Method> {
    Method::from_bytes(name).map_err(|e| StowError::Other(format!("http method: {e}")))
}

/// WebDAV storage backend
pub struct WebDavBackend {
    inner: Arc<Inner>,
}

impl WebDavBackend {
    pub fn new(config: WebDavConfig, endpoint: &ResolvedEndpoint) -> StowResult<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                http: pinned_client(std::slice::from_ref(endpoint))?,
                config,
            }),
        })
    }
}

#[async_trait]
impl StorageDriver for WebDavBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Webdav
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
        let root = self.inner.propfind(&StoragePath::root(), "0").await?;
        match root.first() {
            Some(r) if r.is_collection => Ok(()),
            Some(_) => Err(StowError::NotADirectory(self.inner.config.base_url.to_string())),
            None => Err(StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: "empty PROPFIND response".into(),
            }),
        }
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let responses = self.inner.propfind(path, "1").await?;
        let mut entries = Vec::new();
        let mut self_entry = None;
        for dav in &responses {
            let Some(entry) = self.inner.entry_for(dav) else { continue };
            if &entry.path == path {
                self_entry = Some(entry);
            } else if entry.path.parent().as_ref() == Some(path) {
                entries.push(entry);
            }
        }
        if let Some(me) = self_entry {
            if !me.is_directory() {
                return Err(StowError::NotADirectory(path.to_string()));
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        let responses = self.inner.propfind(path, "0").await?;
        responses
            .iter()
            .find_map(|dav| self.inner.entry_for(dav))
            .map(|mut entry| {
                entry.path = path.clone();
                entry
            })
            .ok_or_else(|| StowError::NotFound(path.to_string()))
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let mut request = self.inner.request(Method::GET, self.inner.url_for(path)?);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(network)?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(body_stream(response)),
            // Server ignored the range
            StatusCode::OK => Ok(stream::skip_prefix(body_stream(response), offset)),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(stream::once(Bytes::new())),
            _ => Err(status_error(PROVIDER, &path.to_string(), response).await),
        }
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        let name = path
            .name()
            .ok_or_else(|| StowError::NotAFile(path.to_string()))?;
        let parent = path.parent().unwrap_or_default();
        let temp = parent.join(format!(".{}.stow-{}.part", name, uuid::Uuid::new_v4().simple()))?;
        let temp_url = self.inner.url_for(&temp)?;
        let target_url = self.inner.url_for(path)?;

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(UPLOAD_QUEUE);
        let put = self
            .inner
            .request(Method::PUT, temp_url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(rx));
        let display = path.to_string();
        let upload = tokio::spawn(async move {
            let response = put.send().await.map_err(network)?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(status_error(PROVIDER, &display, response).await)
            }
        });

        debug!(path = %path, "webdav upload started");
        Ok(Box::new(WebDavSink {
            inner: Arc::clone(&self.inner),
            path: path.clone(),
            temp_url,
            target_url,
            tx: Some(tx),
            upload: Some(upload),
            written: 0,
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        if path.is_root() {
            return Ok(());
        }
        let mut status = self.inner.mkcol(path).await?;
        if status == StatusCode::CONFLICT {
            // Missing parent: create the chain, then retry once
            let parent = path.parent().unwrap_or_default();
            if parent.is_root() {
                return Err(StowError::NotFound(self.inner.config.base_url.to_string()));
            }
            self.mkdir(&parent).await?;
            status = self.inner.mkcol(path).await?;
        }
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => match self.stat(path).await? {
                entry if entry.is_directory() => Ok(()),
                _ => Err(StowError::AlreadyExists(path.to_string())),
            },
            s => Err(StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: format!("MKCOL {path}: {s}"),
            }),
        }
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let entry = self.stat(path).await?;
        if !entry.is_directory() {
            return self.inner.delete(self.inner.url_for(path)?, &path.to_string()).await;
        }
        let children = self.list(path).await?;
        if !recursive && !children.is_empty() {
            return Err(StowError::Other(format!("directory not empty: {path}")));
        }

        // Best effort: children one by one so a failure does not stop siblings
        let mut first_error = None;
        for child in children {
            if let Err(e) = self.remove(&child.path, true).await {
                warn!(path = %child.path, error = %e, "webdav delete failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.inner
            .delete(self.inner.collection_url(path)?, &path.to_string())
            .await
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        let entry = self.stat(src).await?;
        let (from, to) = if entry.is_directory() {
            (self.inner.collection_url(src)?, self.inner.collection_url(dst)?)
        } else {
            (self.inner.url_for(src)?, self.inner.url_for(dst)?)
        };
        self.inner.move_resource(from, &to, false, &dst.to_string()).await?;
        Ok(true)
    }
}

/// Streams the body of a PUT to a hidden temp resource; `commit` renames it
struct WebDavSink {
    inner: Arc<Inner>,
    path: StoragePath,
    temp_url: Url,
    target_url: Url,
    tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    upload: Option<JoinHandle<StowResult<()>>>,
    written: u64,
}

impl WebDavSink {
    async fn finish_upload(&mut self) -> StowResult<()> {
        self.tx.take();
        match self.upload.take() {
            Some(handle) => handle
                .await
                .map_err(|e| StowError::Other(format!("upload task: {e}")))?,
            None => Err(StowError::Other("sink already closed".into())),
        }
    }
}

#[async_trait]
impl ByteSink for WebDavSink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        let len = chunk.len() as u64;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StowError::Other("write after close".into()))?;
        if tx.send(Ok(chunk)).await.is_err() {
            // Request ended early; surface its error
            return match self.finish_upload().await {
                Err(e) => Err(e),
                Ok(()) => Err(StowError::Network("upload closed by server".into())),
            };
        }
        self.written += len;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StowResult<EntryMeta> {
        self.finish_upload().await?;
        let display = self.path.to_string();
        if let Err(e) = self
            .inner
            .move_resource(self.temp_url.clone(), &self.target_url, true, &display)
            .await
        {
            let _ = self.inner.delete(self.temp_url.clone(), &display).await;
            return Err(e);
        }
        Ok(EntryMeta::file(self.path.clone(), self.written).with_modified(Some(chrono::Utc::now())))
    }

    async fn abort(mut self: Box<Self>) -> StowResult<()> {
        self.tx.take();
        if let Some(handle) = self.upload.take() {
            handle.abort();
        }
        let display = self.path.to_string();
        match self.inner.delete(self.temp_url.clone(), &display).await {
            Ok(()) | Err(StowError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WebDavSink {
    fn drop(&mut self) {
        if let Some(handle) = self.upload.take() {
            handle.abort();
        }
    }
}
