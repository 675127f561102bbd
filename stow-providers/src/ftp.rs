// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTP backend (RFC 959 with RFC 3659 MLSD/MLST, passive mode)
//!
//! Each operation opens its own control connection, so the driver is safe to
//! share between jobs. Reads cannot resume: offsets are honoured by discarding.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{stream, StreamExt};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use stow_core::{
    stream as byte_stream, BoxSink, ByteSink, ByteStream, Capabilities, EntryKind, EntryMeta,
    ResolvedEndpoint, StorageDriver, StorageKind, StoragePath, StowError, StowResult,
};

use crate::config::Settings;

const PROVIDER: &str = "ftp";
const DEFAULT_PORT: u16 = 21;
const MAX_REPLY_LINES: usize = 512;

/// FTP backend configuration
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Server directory the backend root maps to
    pub root: StoragePath,
}

impl FtpConfig {
    pub(crate) fn from_settings(settings: &Settings) -> StowResult<Self> {
        Ok(Self {
            host: settings.required("host")?.to_string(),
            port: settings.parse_or("port", DEFAULT_PORT)?,
            username: settings.optional("username").unwrap_or("anonymous").to_string(),
            password: settings.optional("password").unwrap_or_default().to_string(),
            root: StoragePath::parse(settings.optional("root").unwrap_or("/"))?,
        })
    }
}

/// A server reply: code plus the text of every line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is(&self, codes: &[u16]) -> bool {
        codes.contains(&self.code)
    }

    fn into_error(self, path: &str) -> StowError {
        match self.code {
            550 => StowError::NotFound(path.to_string()),
            530 | 532 | 553 => StowError::PermissionDenied(format!("{path}: {}", self.text)),
            452 | 552 => StowError::StorageFull(path.to_string()),
            421 | 425 | 426 => StowError::Network(format!("{}: {}", self.code, self.text)),
            _ => StowError::ProviderApi {
                provider: PROVIDER.into(),
                message: format!("{} {}", self.code, self.text),
            },
        }
    }
}

/// Read one (possibly multi-line) reply
async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> StowResult<Reply> {
    let mut line = String::new();
    let mut text = String::new();
    let mut code: Option<u16> = None;

    for _ in 0..MAX_REPLY_LINES {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| StowError::Network(format!("ftp control: {e}")))?;
        if n == 0 {
            return Err(StowError::Network("ftp control connection closed".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let parsed = trimmed.get(..3).and_then(|c| c.parse::<u16>().ok());
        let sep = trimmed.as_bytes().get(3).copied();

        match (code, parsed) {
            (None, Some(c)) => {
                code = Some(c);
                text.push_str(trimmed.get(4..).unwrap_or_default());
                if sep != Some(b'-') {
                    return Ok(Reply { code: c, text });
                }
            }
            (Some(c), Some(p)) if p == c && sep == Some(b' ') => {
                text.push('\n');
                text.push_str(trimmed.get(4..).unwrap_or_default());
                return Ok(Reply { code: c, text });
            }
            (Some(_), _) => {
                text.push('\n');
                text.push_str(trimmed);
            }
            (None, None) => {
                return Err(StowError::ProviderApi {
                    provider: PROVIDER.into(),
                    message: format!("malformed reply: {trimmed}"),
                })
            }
        }
    }
    Err(StowError::ProviderApi {
        provider: PROVIDER.into(),
        message: "reply too long".into(),
    })
}

/// Port from a 229 reply: `Entering Extended Passive Mode (|||6446|)`
fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    text[start + 1..end]
        .split('|')
        .filter(|s| !s.is_empty())
        .next_back()?
        .parse()
        .ok()
}

/// Port from a 227 reply. The host part is ignored: data connections go to
/// the control connection's peer.
fn parse_pasv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let nums: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<_>>()?;
    match nums.as_slice() {
        [_, _, _, _, hi, lo] if *hi < 256 && *lo < 256 => Some(hi * 256 + lo),
        _ => None,
    }
}

fn parse_mlsx_time(value: &str) -> Option<DateTime<Utc>> {
    let base = value.split('.').next()?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}

/// One MLSD/MLST fact line: `type=file;size=10;modify=20240101000000; name`
fn parse_facts(line: &str) -> Option<(String, EntryKind, u64, Option<DateTime<Utc>>)> {
    let line = line.strip_prefix(' ').unwrap_or(line);
    let (facts, name) = line.split_once(' ')?;
    let mut kind = None;
    let mut size = 0;
    let mut modified = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "file" => Some(EntryKind::File),
                    "dir" | "cdir" | "pdir" => Some(EntryKind::Directory),
                    v if v.starts_with("os.unix=symlink") || v.starts_with("os.unix=slink") => {
                        Some(EntryKind::Symlink)
                    }
                    _ => None,
                };
                if matches!(value.to_ascii_lowercase().as_str(), "cdir" | "pdir") {
                    return None;
                }
            }
            "size" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_mlsx_time(value),
            _ => {}
        }
    }
    Some((name.to_string(), kind?, size, modified))
}

/// Absolute server path for a backend path
fn server_path(root: &StoragePath, path: &StoragePath) -> StowResult<String> {
    let full = root.join_path(path);
    if full.segments().iter().any(|s| s.contains(['\r', '\n'])) {
        return Err(StowError::InvalidPath(path.to_string()));
    }
    Ok(full.to_path_string())
}

/// One logged-in control connection
struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
}

impl Session {
    async fn connect(config: &FtpConfig, addrs: &[SocketAddr]) -> StowResult<Self> {
        let stream = TcpStream::connect(addrs)
            .await
            .map_err(|e| StowError::Network(format!("ftp connect {}: {e}", config.host)))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| StowError::Network(e.to_string()))?
            .ip();
        let (read, write) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
        };

        let greeting = read_reply(&mut session.reader).await?;
        if greeting.code != 220 {
            return Err(greeting.into_error(&config.host));
        }

        let user = session.command(&format!("USER {}", config.username)).await?;
        if user.code == 331 {
            let pass = session.command(&format!("PASS {}", config.password)).await?;
            if !pass.is(&[230, 202]) {
                return Err(StowError::PermissionDenied(format!("ftp login: {}", pass.text)));
            }
        } else if user.code != 230 {
            return Err(StowError::PermissionDenied(format!("ftp login: {}", user.text)));
        }

        session.expect("TYPE I", &[200], &config.host).await?;
        Ok(session)
    }

    async fn command(&mut self, cmd: &str) -> StowResult<Reply> {
        if cmd.contains(['\r', '\n']) {
            return Err(StowError::InvalidPath(cmd.to_string()));
        }
        self.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .map_err(|e| StowError::Network(format!("ftp control: {e}")))?;
        read_reply(&mut self.reader).await
    }

    async fn expect(&mut self, cmd: &str, codes: &[u16], path: &str) -> StowResult<Reply> {
        let reply = self.command(cmd).await?;
        if reply.is(codes) {
            Ok(reply)
        } else {
            Err(reply.into_error(path))
        }
    }

    /// Open a passive data connection to the control peer
    async fn data_connection(&mut self) -> StowResult<TcpStream> {
        let reply = self.command("EPSV").await?;
        let port = if reply.code == 229 {
            parse_epsv(&reply.text)
        } else {
            let reply = self.expect("PASV", &[227], "PASV").await?;
            parse_pasv(&reply.text)
        }
        .ok_or_else(|| StowError::ProviderApi {
            provider: PROVIDER.into(),
            message: "unparseable passive reply".into(),
        })?;

        TcpStream::connect(SocketAddr::new(self.peer, port))
            .await
            .map_err(|e| StowError::Network(format!("ftp data connection: {e}")))
    }

    /// Run a command whose reply arrives over a data connection and read it whole
    async fn transfer_text(&mut self, cmd: &str, path: &str) -> StowResult<String> {
        let data = self.data_connection().await?;
        self.expect(cmd, &[125, 150], path).await?;
        let mut body = Vec::new();
        let mut reader = BufReader::new(data);
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut body)
            .await
            .map_err(|e| StowError::Network(format!("ftp data: {e}")))?;
        let done = read_reply(&mut self.reader).await?;
        if !done.is(&[226, 250]) {
            return Err(done.into_error(path));
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn mlst(&mut self, server: &str) -> StowResult<Option<(EntryKind, u64, Option<DateTime<Utc>>)>> {
        let reply = self.command(&format!("MLST {server}")).await?;
        match reply.code {
            250 => Ok(reply
                .text
                .lines()
                .filter(|l| l.starts_with(' ') || l.contains(';'))
                .find_map(parse_facts)
                .map(|(_, kind, size, modified)| (kind, size, modified))),
            550 => Ok(None),
            _ => Err(reply.into_error(server)),
        }
    }

    async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }
}

/// FTP storage backend
pub struct FtpBackend {
    config: FtpConfig,
    addrs: Vec<SocketAddr>,
}

impl FtpBackend {
    pub fn new(config: FtpConfig, endpoint: &ResolvedEndpoint) -> StowResult<Self> {
        let addrs = endpoint.addrs_with_port(config.port);
        if addrs.is_empty() {
            return Err(StowError::InvalidConfig(format!("ftp host {} has no address", config.host)));
        }
        Ok(Self { config, addrs })
    }

    async fn session(&self) -> StowResult<Session> {
        debug!(host = %self.config.host, "ftp connect");
        Session::connect(&self.config, &self.addrs).await
    }

    fn server_path(&self, path: &StoragePath) -> StowResult<String> {
        server_path(&self.config.root, path)
    }

    async fn list_with(&self, session: &mut Session, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let server = self.server_path(path)?;
        match session.mlst(&server).await? {
            None => return Err(StowError::NotFound(path.to_string())),
            Some((EntryKind::Directory, _, _)) => {}
            Some(_) => return Err(StowError::NotADirectory(path.to_string())),
        }

        let body = session.transfer_text(&format!("MLSD {server}"), &server).await?;
        let mut entries = Vec::new();
        for line in body.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()) {
            let Some((name, kind, size, modified)) = parse_facts(line) else { continue };
            let Ok(child) = path.join(&name) else { continue };
            let entry = match kind {
                EntryKind::Directory => EntryMeta::directory(child),
                EntryKind::File => EntryMeta::file(child, size),
                EntryKind::Symlink => EntryMeta {
                    kind: EntryKind::Symlink,
                    ..EntryMeta::file(child, 0)
                },
            };
            entries.push(entry.with_modified(modified));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn remove_with(&self, session: &mut Session, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let server = self.server_path(path)?;
        match session.mlst(&server).await? {
            None => Err(StowError::NotFound(path.to_string())),
            Some((EntryKind::Directory, _, _)) => {
                if recursive {
                    // Iterative post-order walk; keeps going past failures
                    let mut first_error = None;
                    let mut stack = vec![(path.clone(), false)];
                    while let Some((dir, expanded)) = stack.pop() {
                        let dir_server = self.server_path(&dir)?;
                        if expanded {
                            if let Err(e) = session.expect(&format!("RMD {dir_server}"), &[250], &dir_server).await {
                                first_error.get_or_insert(e);
                            }
                            continue;
                        }
                        stack.push((dir.clone(), true));
                        match self.list_with(session, &dir).await {
                            Ok(children) => {
                                for child in children {
                                    if child.is_directory() {
                                        stack.push((child.path, false));
                                    } else {
                                        let child_server = self.server_path(&child.path)?;
                                        if let Err(e) = session
                                            .expect(&format!("DELE {child_server}"), &[250], &child_server)
                                            .await
                                        {
                                            warn!(path = %child.path, error = %e, "ftp delete failed");
                                            first_error.get_or_insert(e);
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                    match first_error {
                        Some(e) => Err(e),
                        None => Ok(()),
                    }
                } else {
                    session
                        .expect(&format!("RMD {server}"), &[250], &server)
                        .await
                        .map(|_| ())
                }
            }
            Some(_) => session
                .expect(&format!("DELE {server}"), &[250], &server)
                .await
                .map(|_| ()),
        }
    }
}

#[async_trait]
impl StorageDriver for FtpBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_move: true,
            range_reads: false,
            atomic_writes: true,
            real_directories: true,
        }
    }

    async fn health_check(&self) -> StowResult<()> {
        let mut session = self.session().await?;
        let root = self.server_path(&StoragePath::root())?;
        let result = session.mlst(&root).await;
        session.quit().await;
        match result? {
            Some((EntryKind::Directory, _, _)) => Ok(()),
            Some(_) => Err(StowError::NotADirectory(root)),
            None => Err(StowError::NotFound(root)),
        }
    }

    async fn list(&self, path: &StoragePath) -> StowResult<Vec<EntryMeta>> {
        let mut session = self.session().await?;
        let result = self.list_with(&mut session, path).await;
        session.quit().await;
        result
    }

    async fn stat(&self, path: &StoragePath) -> StowResult<EntryMeta> {
        let mut session = self.session().await?;
        let result = session.mlst(&self.server_path(path)?).await;
        session.quit().await;
        match result? {
            None => Err(StowError::NotFound(path.to_string())),
            Some((EntryKind::Directory, _, modified)) => Ok(EntryMeta::directory(path.clone()).with_modified(modified)),
            Some((kind, size, modified)) => Ok(EntryMeta {
                kind,
                ..EntryMeta::file(path.clone(), size)
            }
            .with_modified(modified)),
        }
    }

    async fn open_read(&self, path: &StoragePath, offset: u64) -> StowResult<ByteStream> {
        let server = self.server_path(path)?;
        let mut session = self.session().await?;
        let data = session.data_connection().await?;
        session.expect(&format!("RETR {server}"), &[125, 150], &server).await?;

        // The final 226 is read once the data connection reaches EOF
        let state = (Some(ReaderStream::new(data)), Some(session), server);
        let body = stream::unfold(state, |(mut data, mut control, server)| async move {
            let reader = data.as_mut()?;
            match reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), (data, control, server))),
                Some(Err(e)) => Some((
                    Err(StowError::Network(format!("ftp data: {e}"))),
                    (None, None, server),
                )),
                None => {
                    let mut session = control.take()?;
                    let done = read_reply(&mut session.reader).await;
                    session.quit().await;
                    match done {
                        Ok(reply) if reply.is(&[226, 250]) => None,
                        Ok(reply) => Some((Err(reply.into_error(&server)), (None, None, server))),
                        Err(e) => Some((Err(e), (None, None, server))),
                    }
                }
            }
        });
        Ok(byte_stream::skip_prefix(Box::pin(body), offset))
    }

    async fn open_write(&self, path: &StoragePath) -> StowResult<BoxSink> {
        let name = path
            .name()
            .ok_or_else(|| StowError::NotAFile(path.to_string()))?;
        let parent = path.parent().unwrap_or_default();
        let temp = parent.join(format!(".{}.stow-{}.part", name, uuid::Uuid::new_v4().simple()))?;
        let temp_server = self.server_path(&temp)?;
        let target_server = self.server_path(path)?;

        let mut session = self.session().await?;
        let data = session.data_connection().await?;
        session
            .expect(&format!("STOR {temp_server}"), &[125, 150], &temp_server)
            .await?;

        Ok(Box::new(FtpSink {
            session: Some(session),
            data: Some(data),
            path: path.clone(),
            temp_server,
            target_server,
            written: 0,
        }))
    }

    async fn mkdir(&self, path: &StoragePath) -> StowResult<()> {
        let mut session = self.session().await?;
        let mut result = Ok(());
        let mut current = StoragePath::root();
        for segment in path.segments() {
            current = current.join(segment)?;
            let server = self.server_path(&current)?;
            let reply = session.command(&format!("MKD {server}")).await?;
            if reply.code == 257 {
                continue;
            }
            match session.mlst(&server).await? {
                Some((EntryKind::Directory, _, _)) => continue,
                Some(_) => {
                    result = Err(StowError::AlreadyExists(current.to_string()));
                    break;
                }
                None => {
                    result = Err(reply.into_error(&server));
                    break;
                }
            }
        }
        session.quit().await;
        result
    }

    async fn remove(&self, path: &StoragePath, recursive: bool) -> StowResult<()> {
        let mut session = self.session().await?;
        let result = self.remove_with(&mut session, path, recursive).await;
        session.quit().await;
        result
    }

    async fn move_native(&self, src: &StoragePath, dst: &StoragePath) -> StowResult<bool> {
        let from = self.server_path(src)?;
        let to = self.server_path(dst)?;
        let mut session = self.session().await?;
        let result = async {
            if session.mlst(&to).await?.is_some() {
                return Err(StowError::AlreadyExists(dst.to_string()));
            }
            session.expect(&format!("RNFR {from}"), &[350], &from).await?;
            session.expect(&format!("RNTO {to}"), &[250], &to).await?;
            Ok(true)
        }
        .await;
        session.quit().await;
        result
    }
}

/// Streams into a hidden temp file; `commit` renames it into place
struct FtpSink {
    session: Option<Session>,
    data: Option<TcpStream>,
    path: StoragePath,
    temp_server: String,
    target_server: String,
    written: u64,
}

impl FtpSink {
    /// Close the data connection and read the transfer's final reply
    async fn finish_transfer(&mut self) -> StowResult<Session> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| StowError::Other("sink already closed".into()))?;
        if let Some(mut data) = self.data.take() {
            if let Err(e) = data.shutdown().await {
                return Err(StowError::Network(format!("ftp data: {e}")));
            }
        }
        let done = read_reply(&mut session.reader).await?;
        if !done.is(&[226, 250]) {
            return Err(done.into_error(&self.temp_server));
        }
        Ok(session)
    }
}

#[async_trait]
impl ByteSink for FtpSink {
    async fn write(&mut self, chunk: Bytes) -> StowResult<()> {
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| StowError::Other("write after close".into()))?;
        data.write_all(&chunk)
            .await
            .map_err(|e| StowError::Network(format!("ftp data: {e}")))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StowResult<EntryMeta> {
        let mut session = self.finish_transfer().await?;
        let temp = self.temp_server.clone();
        let target = self.target_server.clone();
        let renamed = async {
            session.expect(&format!("RNFR {temp}"), &[350], &temp).await?;
            session.expect(&format!("RNTO {target}"), &[250], &target).await
        }
        .await;
        if let Err(e) = renamed {
            let _ = session.command(&format!("DELE {temp}")).await;
            session.quit().await;
            return Err(e);
        }
        session.quit().await;
        Ok(EntryMeta::file(self.path.clone(), self.written).with_modified(Some(Utc::now())))
    }

    async fn abort(mut self: Box<Self>) -> StowResult<()> {
        self.data.take();
        if let Some(mut session) = self.session.take() {
            // The aborted transfer's reply may or may not arrive; either is fine
            let _ = read_reply(&mut session.reader).await;
            let _ = session.command(&format!("DELE {}", self.temp_server)).await;
            session.quit().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_read_single_and_multiline_replies() {
        let input: &[u8] = b"220 Welcome\r\n211-Features:\r\n MLST type*;size*;\r\n UTF8\r\n211 End\r\n";
        let mut reader = BufReader::new(input);
        let first = read_reply(&mut reader).await.unwrap();
        assert_eq!(first, Reply { code: 220, text: "Welcome".into() });
        let second = read_reply(&mut reader).await.unwrap();
        assert_eq!(second.code, 211);
        assert!(second.text.contains("MLST type*;size*;"));
        assert!(second.text.ends_with("End"));
    }

    #[tokio::test]
    async fn test_closed_connection_is_network_error() {
        let input: &[u8] = b"";
        let mut reader = BufReader::new(input);
        assert!(matches!(read_reply(&mut reader).await, Err(StowError::Network(_))));
    }

    #[test]
    fn test_passive_replies() {
        assert_eq!(parse_epsv("Entering Extended Passive Mode (|||6446|)"), Some(6446));
        assert_eq!(parse_pasv("Entering Passive Mode (10,0,0,5,195,80)"), Some(195 * 256 + 80));
        assert_eq!(parse_pasv("Entering Passive Mode (1,2,3)"), None);
    }

    #[test]
    fn test_parse_facts() {
        let (name, kind, size, modified) =
            parse_facts("type=file;size=1337;modify=20240102030405.123; report final.pdf").unwrap();
        assert_eq!(name, "report final.pdf");
        assert_eq!(kind, EntryKind::File);
        assert_eq!(size, 1337);
        assert!(modified.is_some());

        assert!(parse_facts("type=cdir;modify=20240102030405; .").is_none());
        assert_eq!(parse_facts("Type=dir; photos").unwrap().1, EntryKind::Directory);
    }

    #[test]
    fn test_server_path_rejects_control_characters() {
        let root = StoragePath::parse("/pub").unwrap();
        assert_eq!(
            server_path(&root, &StoragePath::parse("a/b").unwrap()).unwrap(),
            "/pub/a/b"
        );
        assert!(server_path(&root, &StoragePath::parse("evil\r\nDELE x").unwrap()).is_err());
    }

    /// Scripted server: login, one MLST, one MLSD over EPSV
    async fn serve_listing(listener: TcpListener) {
        let (control, _) = listener.accept().await.unwrap();
        let (read, mut write) = control.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"220 ready\r\n").await.unwrap();

        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_listener.local_addr().unwrap().port();

        while let Some(line) = lines.next_line().await.unwrap() {
            let (cmd, _arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            match cmd {
                "USER" => write.write_all(b"331 password please\r\n").await.unwrap(),
                "PASS" => write.write_all(b"230 logged in\r\n").await.unwrap(),
                "TYPE" => write.write_all(b"200 binary\r\n").await.unwrap(),
                "MLST" => write
                    .write_all(b"250-Listing\r\n type=dir;modify=20240101000000; /pub/docs\r\n250 End\r\n")
                    .await
                    .unwrap(),
                "EPSV" => write
                    .write_all(format!("229 Entering Extended Passive Mode (|||{data_port}|)\r\n").as_bytes())
                    .await
                    .unwrap(),
                "MLSD" => {
                    write.write_all(b"150 opening\r\n").await.unwrap();
                    let (mut data, _) = data_listener.accept().await.unwrap();
                    data.write_all(
                        b"type=cdir;modify=20240101000000; .\r\n\
                          type=file;size=5;modify=20240101000000; a.txt\r\n\
                          type=dir;modify=20240101000000; sub\r\n",
                    )
                    .await
                    .unwrap();
                    drop(data);
                    write.write_all(b"226 done\r\n").await.unwrap();
                }
                "QUIT" => {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                }
                _ => write.write_all(b"502 not implemented\r\n").await.unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn test_list_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_listing(listener));

        let config = FtpConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            username: "anna".into(),
            password: "secret".into(),
            root: StoragePath::parse("/pub").unwrap(),
        };
        let endpoint = ResolvedEndpoint {
            input: "127.0.0.1".into(),
            host: "127.0.0.1".into(),
            port: None,
            addrs: vec![addr],
        };
        let backend = FtpBackend::new(config, &endpoint).unwrap();

        let entries = backend.list(&StoragePath::parse("docs").unwrap()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path.as_key(), "docs/a.txt");
        assert_eq!(entries[0].size, 5);
        assert!(entries[1].is_directory());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_error_mapping() {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(&b"550 No such file\r\n"[..]);
        reader.read_to_end(&mut buf).await.unwrap();
        let reply = read_reply(&mut BufReader::new(&buf[..])).await.unwrap();
        assert!(matches!(reply.into_error("/x"), StowError::NotFound(_)));
    }
}
