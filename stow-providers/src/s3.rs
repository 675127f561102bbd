// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3-compatible storage backend
//!
//! Works with AWS S3, MinIO, Wasabi, DigitalOcean Spaces, Backblaze B2,
//! Cloudflare R2, and any S3-compatible object storage.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, Response, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use stow_core::{
    stream, BoxSink, ByteSink, ByteStream, Capabilities, EntryMeta, ResolvedEndpoint,
    StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};

use crate::config::Settings;
use crate::http::{body_stream, network, parse_http_date, pinned_client, status_error};
use crate::xml;

const PROVIDER: &str = "s3";
const DEFAULT_REGION: &str = "us-east-1";
/// S3 rejects non-final multipart parts below 5 MiB
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3 backend configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 endpoint URL (e.g., "https://s3.amazonaws.com" or "https://minio.example.com")
    pub endpoint: Url,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Use path-style URLs (required for MinIO and some providers)
    pub path_style: bool,
    /// Uploads above this size switch to multipart
    pub part_size: usize,
}

impl S3Config {
    pub(crate) fn from_settings(settings: &Settings) -> StowResult<Self> {
        let endpoint = settings.required("endpoint")?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StowError::InvalidConfig(format!("object-store endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(StowError::InvalidConfig(format!(
                "object-store endpoint must be an http(s) URL: {endpoint}"
            )));
        }

        let part_size = settings.parse_or("part_size", DEFAULT_PART_SIZE)?;
        Ok(Self {
            endpoint,
            bucket: settings.required("bucket")?.to_string(),
            region: settings.optional("region").unwrap_or(DEFAULT_REGION).to_string(),
            access_key_id: settings.required("access_key_id")?.to_string(),
            secret_access_key: settings.required("secret_access_key")?.to_string(),
            path_style: settings.flag("path_style", true)?,
            part_size: part_size.max(MIN_PART_SIZE),
        })
    }

    /// Scheme, authority and path prefix every request goes to
    pub fn request_base(&self) -> String {
        let scheme = self.endpoint.scheme();
        let host = self.endpoint.host_str().unwrap_or_default();
        let port = self.endpoint.port().map(|p| format!(":{p}")).unwrap_or_default();
        if self.path_style {
            format!("{scheme}://{host}{port}/{}", uri_encode(&self.bucket))
        } else {
            format!("{scheme}://{}.{host}{port}", self.bucket)
        }
    }
}

/// AWS-style URI encoding: everything but unreserved characters
fn uri_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// SHA-256 hash as hex string
fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// HMAC-SHA256
fn hmac_sha256(key: &[u8], data: &[u8]) -> StowResult<Vec<u8>> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StowError::Other(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

struct Inner {
    config: S3Config,
    base: String,
    /// Path component of `base`, signed as the canonical URI prefix
    base_path: String,
    host_header: String,
    http: Client,
}

impl Inner {
    /// Produce the `Authorization` header for an AWS Signature Version 4 request
    fn sign(
        &self,
        method: &Method,
        canonical_uri: &str,
        canonical_query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> StowResult<String> {
        let config = &self.config;
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", config.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        )?;
        let k_region = hmac_sha256(&k_date, config.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, b"s3")?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            config.access_key_id, credential_scope, signed_headers, signature
        ))
    }

    /// Make a signed request against `key` (empty for the bucket itself)
    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Option<Bytes>,
    ) -> StowResult<Response> {
        let object_path = if key.is_empty() {
            String::new()
        } else {
            format!("/{}", encode_key(key))
        };
        let canonical_uri = match format!("{}{}", self.base_path, object_path) {
            uri if uri.is_empty() => "/".to_string(),
            uri => uri,
        };

        let mut params: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        params.sort();
        let canonical_query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = match &body {
            Some(data) => sha256_hex(data),
            None => EMPTY_SHA256.to_string(),
        };
        let now = Utc::now();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), self.host_header.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        for (k, v) in extra_headers {
            if k.starts_with("x-amz-") {
                headers.insert(k.to_string(), v.clone());
            }
        }
        let auth = self.sign(&method, &canonical_uri, &canonical_query, &headers, &payload_hash, now)?;

        let mut url = format!("{}{}", self.base, object_path);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut request = self.http.request(method, &url);
        for (k, v) in headers.iter().filter(|(k, _)| k.as_str() != "host") {
            request = request.header(k.as_str(), v.as_str());
        }
        for (k, v) in extra_headers.iter().filter(|(k, _)| !k.starts_with("x-amz-")) {
            request = request.header(*k, v.as_str());
        }
        request = request.header(header::AUTHORIZATION, auth);
        if let Some(data) = body {
            request = request.body(data);
        }

        request.send().await.map_err(network)
    }

    /// One page of ListObjectsV2
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
        max_keys: Option<&str>,
    ) -> StowResult<ListPage> {
        let mut query = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(d) = delimiter {
            query.push(("delimiter", d));
        }
        if let Some(t) = token {
            query.push(("continuation-token", t));
        }
        if let Some(m) = max_keys {
            query.push(("max-keys", m));
        }

        let response = self.request(Method::GET, "", &query, &[], None).await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, prefix, response).await);
        }
        let body = response.text().await.map_err(network)?;
        Ok(parse_list_objects_v2(&body))
    }

    /// Every object and common prefix under `prefix`, following continuation tokens
    async fn list_all(&self, prefix: &str, delimiter: Option<&str>) -> StowResult<ListPage> {
        let mut all = ListPage::default();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, delimiter, token.as_deref(), None).await?;
            all.objects.extend(page.objects);
            all.common_prefixes.extend(page.common_prefixes);
            match page.continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => return Ok(all),
            }
        }
    }

    async fn head(&self, key: &str, path: &StoragePath) -> StowResult<Option<EntryMeta>> {
        let response = self.request(Method::HEAD, key, &[], &[], None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let headers = response.headers();
                let size = headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let modified = headers
                    .get(header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_http_date);
                let etag = headers
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_string());
                Ok(Some(
                    EntryMeta::file(path.clone(), size)
                        .with_modified(modified)
                        .with_revision(etag),
                ))
            }
            _ => Err(status_error(PROVIDER, &path.to_string(), response).await),
        }
    }

    async fn delete_key(&self, key: &str, path: &str) -> StowResult<()> {
        let response = self.request(Method::DELETE, key, &[], &[], None).await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(PROVIDER, path, response).await)
        }
    }
}

/// S3 object metadata
#[derive(Debug, Clone, Default)]
struct S3Object {
    key: String,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ListPage {
    objects: Vec<S3Object>,
    common_prefixes: Vec<String>,
    is_truncated: bool,
    continuation_token: Option<String>,
}

/// Parse ListObjectsV2 XML response
fn parse_list_objects_v2(body: &str) -> ListPage {
    let objects = xml::elements(body, "Contents")
        .into_iter()
        .filter_map(|contents| {
            Some(S3Object {
                key: xml::text(contents, "Key")?,
                size: xml::text(contents, "Size").and_then(|s| s.parse().ok()).unwrap_or(0),
                last_modified: xml::text(contents, "LastModified")
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                etag: xml::text(contents, "ETag").map(|e| e.trim_matches('"').to_string()),
            })
        })
        .collect();
    let common_prefixes = xml::elements(body, "CommonPrefixes")
        .into_iter()
        .filter_map(|cp| xml::text(cp, "Prefix"))
        .collect();

    ListPage {
        objects,
        common_prefixes,
        is_truncated: xml::text(body, "IsTruncated").as_deref() == Some("true"),
        continuation_token: xml::text(body, "NextContinuationToken"),
    }
}

fn key_prefix(path: &StoragePath) -> String {
    let key = path.as_key();
    if key.is_empty() {
        key
    } else {
        format!("{key}/")
    }
}

/// S3 storage backend
pub struct S3Backend {
    inner: Arc<Inner>,
}

impl S3Backend {
    /// `endpoint` must be the validated form of [`S3Config::request_base`]
    pub fn new(config: S3Config, endpoint: &ResolvedEndpoint) -> StowResult<Self> {
        let base = config.request_base();
        let parsed = Url::parse(&base)
            .map_err(|e| StowError::InvalidConfig(format!("object-store endpoint: {e}")))?;
        let host = parsed.host_str().unwrap_or_default();
        let host_header = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let base_path = parsed.path().trim_end_matches('/').to_string();

        Ok(Self {
            inner: Arc::new(Inner {
                http: pinned_client(std::slice::from_ref(endpoint))?,
                base: base.trim_end_matches('/').to_string(),
                base_path,
                host_header,
                config,
            }),
        })
    }

    pub fn config(&self) -> &S3Config {
        &self.inner.config
    }
}

#[async_trait]
impl StorageDriver for S3Backend {
    fn kind(&self) -> StorageKind {
        StorageKind::ObjectStore
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::object_store()
    }

    async fn health_check(&self) -> StowResult<()> {
        self.inner.list_page("", Some("/"), None, Some("1")).await.map(|_| ())
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let prefix = key_prefix(path);
        let page = self.inner.list_all(&prefix, Some("/")).await?;

        let mut marker_seen = false;
        let mut entries = Vec::new();
        for obj in page.objects {
            let Some(rest) = obj.key.strip_prefix(&prefix) else { continue };
            if rest.is_empty() {
                marker_seen = true;
                continue;
            }
            entries.push(
                EntryMeta::file(path.join(rest)?, obj.size)
                    .with_modified(obj.last_modified)
                    .with_revision(obj.etag),
            );
        }
        for cp in page.common_prefixes {
            let Some(rest) = cp.strip_prefix(&prefix) else { continue };
            let name = rest.trim_end_matches('/');
            if !name.is_empty() {
                entries.push(EntryMeta::directory(path.join(name)?));
            }
        }

        if entries.is_empty() && !marker_seen && !path.is_root() {
            return match self.inner.head(&path.as_key(), path).await? {
                Some(_) => Err(StowError::NotADirectory(path.to_string())),
                None => Err(StowError::NotFound(path.to_string())),
            };
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        if path.is_root() {
            return Ok(EntryMeta::directory(path.clone()));
        }
        if let Some(entry) = self.inner.head(&path.as_key(), path).await? {
            return Ok(entry);
        }
        let page = self
            .inner
            .list_page(&key_prefix(path), None, None, Some("1"))
            .await?;
        if page.objects.is_empty() && page.common_prefixes.is_empty() {
            Err(StowError::NotFound(path.to_string()))
        } else {
            Ok(EntryMeta::directory(path.clone()))
        }
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let range = format!("bytes={offset}-");
        let headers: Vec<(&str, String)> = if offset > 0 {
            vec![("range", range)]
        } else {
            Vec::new()
        };
        let response = self
            .inner
            .request(Method::GET, &path.as_key(), &[], &headers, None)
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(body_stream(response)),
            StatusCode::OK => Ok(stream::skip_prefix(body_stream(response), offset)),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(stream::once(Bytes::new())),
            _ => Err(status_error(PROVIDER, &path.to_string(), response).await),
        }
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        if path.is_root() {
            return Err(StowError::NotAFile(path.to_string()));
        }
        Ok(Box::new(S3Sink {
            inner: Arc::clone(&self.inner),
            path: path.clone(),
            key: path.as_key(),
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
            total: 0,
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        if path.is_root() {
            return Ok(());
        }
        if self.inner.head(&path.as_key(), path).await?.is_some() {
            return Err(StowError::AlreadyExists(path.to_string()));
        }
        let marker = key_prefix(path);
        let response = self
            .inner
            .request(Method::PUT, &marker, &[], &[], Some(Bytes::new()))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, &path.to_string(), response).await);
        }
        Ok(())
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let key = path.as_key();
        if !key.is_empty() && self.inner.head(&key, path).await?.is_some() {
            return self.inner.delete_key(&key, &path.to_string()).await;
        }

        let prefix = key_prefix(path);
        let page = self.inner.list_all(&prefix, None).await?;
        if page.objects.is_empty() {
            return Err(StowError::NotFound(path.to_string()));
        }
        if !recursive && page.objects.iter().any(|o| o.key != prefix) {
            return Err(StowError::Other(format!("directory not empty: {path}")));
        }

        let mut first_error = None;
        // Deepest keys first so the marker goes last
        let mut keys: Vec<String> = page.objects.into_iter().map(|o| o.key).collect();
        keys.sort_by(|a, b| b.cmp(a));
        for key in keys {
            if let Err(e) = self.inner.delete_key(&key, &key).await {
                warn!(key = %key, error = %e, "s3 delete failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn move_native(&self, _src: &StoragePath, _dst: &StoragePath) -> StowResult<bool> {
        Ok(false)
    }
}

/// Buffers one part at a time; switches to multipart once a part fills
struct S3Sink {
    inner: Arc<Inner>,
    path: StoragePath,
    key: String,
    buffer: BytesMut,
    upload_id: Option<String>,
    /// (part number, etag)
    parts: Vec<(u32, String)>,
    total: u64,
}

impl S3Sink {
    async fn start_multipart(&mut self) -> StowResult<String> {
        let response = self
            .inner
            .request(Method::POST, &self.key, &[("uploads", "")], &[], None)
            .await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, &self.key, response).await);
        }
        let body = response.text().await.map_err(network)?;
        let upload_id = xml::text(&body, "UploadId").ok_or_else(|| StowError::ProviderApi {
            provider: PROVIDER.into(),
            message: "CreateMultipartUpload returned no UploadId".into(),
        })?;
        debug!(key = %self.key, "started multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(&mut self, data: Bytes) -> StowResult<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self.start_multipart().await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        let number = self.parts.len() as u32 + 1;
        let number_str = number.to_string();
        let response = self
            .inner
            .request(
                Method::PUT,
                &self.key,
                &[("partNumber", number_str.as_str()), ("uploadId", upload_id.as_str())],
                &[],
                Some(data),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, &self.key, response).await);
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: format!("part {number} returned no ETag"),
            })?;
        self.parts.push((number, etag));
        Ok(())
    }

    async fn finish_multipart(
        &mut self,
        upload_id: &str,
        remaining: Bytes,
    ) -> StowResult<Option<String>> {
        if !remaining.is_empty() {
            self.upload_part(remaining).await?;
        }
        self.complete(upload_id).await
    }

    async fn abort_multipart(&self, upload_id: &str) -> StowResult<()> {
        let response = self
            .inner
            .request(Method::DELETE, &self.key, &[("uploadId", upload_id)], &[], None)
            .await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, &self.key, response).await);
        }
        debug!(key = %self.key, "aborted multipart upload");
        Ok(())
    }

    async fn complete(&mut self, upload_id: &str) -> StowResult<Option<String>> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &self.parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                number,
                xml::escape(etag)
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let response = self
            .inner
            .request(
                Method::POST,
                &self.key,
                &[("uploadId", upload_id)],
                &[("content-type", "application/xml".to_string())],
                Some(Bytes::from(body)),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, &self.key, response).await);
        }
        // Errors can arrive inside a 200 response
        let text = response.text().await.map_err(network)?;
        if let Some(code) = xml::text(&text, "Code") {
            return Err(StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: format!("CompleteMultipartUpload: {code}"),
            });
        }
        Ok(xml::text(&text, "ETag").map(|e| e.trim_matches('"').to_string()))
    }
}

#[async_trait]
impl ByteSink for S3Sink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        self.total += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);
        let part_size = self.inner.config.part_size;
        while self.buffer.len() >= part_size {
            let part = self.buffer.split_to(part_size).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StowResult<EntryMeta> {
        let remaining = std::mem::take(&mut self.buffer).freeze();
        let etag = match self.upload_id.clone() {
            None => {
                let response = self
                    .inner
                    .request(Method::PUT, &self.key, &[], &[], Some(remaining))
                    .await?;
                if !response.status().is_success() {
                    return Err(status_error(PROVIDER, &self.key, response).await);
                }
                response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_string())
            }
            Some(upload_id) => match self.finish_multipart(&upload_id, remaining).await {
                Ok(etag) => etag,
                Err(e) => {
                    if let Err(cleanup) = self.abort_multipart(&upload_id).await {
                        warn!(key = %self.key, error = %cleanup, "orphaned multipart upload");
                    }
                    return Err(e);
                }
            },
        };
        Ok(EntryMeta::file(self.path.clone(), self.total)
            .with_modified(Some(Utc::now()))
            .with_revision(etag))
    }

    async fn abort(self: Box<Self>) -> StowResult<()> {
        match &self.upload_id {
            Some(upload_id) => self.abort_multipart(upload_id).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use stow_core::{StorageDescriptor, StorageKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn settings(path_style: &str) -> Settings {
        let desc = StorageDescriptor::new("s3", StorageKind::ObjectStore, "S3")
            .with_config("endpoint", "https://minio.example.com:9000")
            .with_config("bucket", "media")
            .with_config("access_key_id", "AKIDEXAMPLE")
            .with_config("secret_access_key", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")
            .with_config("path_style", path_style)
            .with_config("part_size", "1024");
        Settings::from_descriptor(&desc).unwrap()
    }

    #[test]
    fn test_request_base_styles() {
        let path = S3Config::from_settings(&settings("true")).unwrap();
        assert_eq!(path.request_base(), "https://minio.example.com:9000/media");
        assert_eq!(path.part_size, MIN_PART_SIZE);

        let vhost = S3Config::from_settings(&settings("false")).unwrap();
        assert_eq!(vhost.request_base(), "https://media.minio.example.com:9000");
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(encode_key("dir/a file+b.txt"), "dir/a%20file%2Bb.txt");
        assert_eq!(uri_encode("a/b~c"), "a%2Fb~c");
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn test_signing_key_chain_matches_aws_example() {
        // From the AWS SigV4 documentation
        let k_date = hmac_sha256(
            b"AWS4wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            b"20150830",
        )
        .unwrap();
        let k_region = hmac_sha256(&k_date, b"us-east-1").unwrap();
        let k_service = hmac_sha256(&k_region, b"iam").unwrap();
        let k_signing = hmac_sha256(&k_service, b"aws4_request").unwrap();
        assert_eq!(
            hex::encode(k_signing),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_parse_list_page() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>media</Name><Prefix>photos/</Prefix><KeyCount>3</KeyCount>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents>
    <Key>photos/</Key><Size>0</Size>
  </Contents>
  <Contents>
    <Key>photos/a&amp;b.jpg</Key>
    <LastModified>2024-01-02T03:04:05.000Z</LastModified>
    <ETag>&quot;9b2cf535f27731c974343645a3985328&quot;</ETag>
    <Size>1024</Size>
  </Contents>
  <CommonPrefixes><Prefix>photos/2024/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_objects_v2(body);
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[1].key, "photos/a&b.jpg");
        assert_eq!(page.objects[1].size, 1024);
        assert_eq!(page.objects[1].etag.as_deref(), Some("9b2cf535f27731c974343645a3985328"));
        assert!(page.objects[1].last_modified.is_some());
        assert_eq!(page.common_prefixes, ["photos/2024/"]);
        assert!(page.is_truncated);
        assert!(page.continuation_token.is_some());
    }

    /// Request line of one HTTP request, with its body drained
    async fn read_request(stream: &mut TcpStream) -> Option<String> {
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .unwrap_or(0);
        let mut body = buf.len() - head_end;
        while body < length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            body += n;
        }
        head.lines().next().map(str::to_string)
    }

    /// Accepts a multipart upload but refuses its second part
    async fn serve_failing_second_part(listener: TcpListener, seen: Arc<Mutex<Vec<String>>>) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let Some(line) = read_request(&mut stream).await else { continue };
            seen.lock().push(line.clone());
            let (status, extra, body) = if line.starts_with("POST") && line.contains("uploads") {
                (
                    "200 OK",
                    "",
                    "<InitiateMultipartUploadResult><UploadId>u-1</UploadId></InitiateMultipartUploadResult>",
                )
            } else if line.starts_with("PUT") && line.contains("partNumber=1") {
                ("200 OK", "ETag: \"p1\"\r\n", "")
            } else if line.starts_with("DELETE") {
                ("204 No Content", "", "")
            } else {
                ("500 Internal Server Error", "", "<Error><Code>InternalError</Code></Error>")
            };
            let response = format!(
                "HTTP/1.1 {status}\r\n{extra}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_failed_commit_aborts_multipart_upload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_failing_second_part(listener, Arc::clone(&seen)));

        let url = format!("http://{addr}");
        let desc = StorageDescriptor::new("s3", StorageKind::ObjectStore, "S3")
            .with_config("endpoint", url.as_str())
            .with_config("bucket", "media")
            .with_config("access_key_id", "AKIDEXAMPLE")
            .with_config("secret_access_key", "secret")
            .with_config("part_size", "1024");
        let config = S3Config::from_settings(&Settings::from_descriptor(&desc).unwrap()).unwrap();
        let endpoint = ResolvedEndpoint {
            input: url.clone(),
            host: "127.0.0.1".into(),
            port: Some(addr.port()),
            addrs: vec![addr],
        };
        let backend = S3Backend::new(config, &endpoint).unwrap();

        let mut sink = backend
            .open_write(&StoragePath::parse("big.bin").unwrap())
            .await
            .unwrap();
        sink.write(Bytes::from(vec![7u8; MIN_PART_SIZE + 10])).await.unwrap();
        assert!(sink.commit().await.is_err());

        let seen = seen.lock().clone();
        assert!(seen.iter().any(|r| r.starts_with("PUT") && r.contains("partNumber=2")), "{seen:?}");
        let last = seen.last().unwrap();
        assert!(last.starts_with("DELETE") && last.contains("uploadId=u-1"), "{seen:?}");
    }
}
