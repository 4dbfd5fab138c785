//! HTTP fetch utilities, snapshot codec, and remote snapshot store sessions.

use std::fmt;
use std::fs;
use std::io::{Cursor, Write};
use std::net::ToSocketAddrs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use roster_core::ParticipationRecord;
use sha2::{Digest, Sha256};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Thin reqwest wrapper. One request per call; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: expected at most 2 columns, found {found}")]
    ColumnCount { line: u64, found: usize },
    #[error("flushing csv writer: {0}")]
    Flush(String),
}

/// Parse a headerless `participant_id,event_id` table. Rows with an empty
/// participant id carry no key and are skipped. A row holding only a
/// participant id keeps it with an empty event id; rows with more than two
/// columns make the whole table unreadable.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<ParticipationRecord>, SnapshotError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.len() > 2 {
            return Err(SnapshotError::ColumnCount {
                line: row.position().map(|p| p.line()).unwrap_or_default(),
                found: row.len(),
            });
        }
        let participant_id = row.get(0).unwrap_or_default();
        if participant_id.is_empty() {
            continue;
        }
        let event_id = row.get(1).unwrap_or_default();
        records.push(ParticipationRecord::new(participant_id, event_id));
    }
    Ok(records)
}

pub fn encode_snapshot(records: &[ParticipationRecord]) -> Result<Vec<u8>, SnapshotError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for record in records {
        writer.write_record([record.participant_id.as_str(), record.event_id.as_str()])?;
    }
    writer
        .into_inner()
        .map_err(|err| SnapshotError::Flush(err.error().to_string()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store setting {0} is not configured")]
    MissingSetting(&'static str),
    #[error("resolving {0}: no usable address")]
    Resolve(String),
    #[error("ftp {op}: {source}")]
    Ftp {
        op: &'static str,
        #[source]
        source: FtpError,
    },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path {0} escapes the store root")]
    InvalidPath(String),
    #[error("encoding snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

fn ftp_err(op: &'static str) -> impl FnOnce(FtpError) -> StoreError {
    move |source| StoreError::Ftp { op, source }
}

fn io_err(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { op, path, source }
}

/// One open connection to wherever the snapshot lives. Sessions stay on the
/// thread that opened them.
pub trait RemoteSession {
    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, StoreError>;
    fn store(&mut self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct FtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 21,
            user: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct FtpSession {
    stream: FtpStream,
}

impl FtpSession {
    /// Connect, log in, and switch to passive binary transfers.
    pub fn connect(settings: &FtpSettings) -> Result<Self, StoreError> {
        let host = settings
            .host
            .as_deref()
            .ok_or(StoreError::MissingSetting("ROSTER_FTP_HOST"))?;
        let user = settings
            .user
            .as_deref()
            .ok_or(StoreError::MissingSetting("ROSTER_FTP_USER"))?;
        let password = settings
            .password
            .as_deref()
            .ok_or(StoreError::MissingSetting("ROSTER_FTP_PASSWORD"))?;

        let endpoint = format!("{host}:{}", settings.port);
        let addr = endpoint
            .to_socket_addrs()
            .map_err(|_| StoreError::Resolve(endpoint.clone()))?
            .next()
            .ok_or_else(|| StoreError::Resolve(endpoint.clone()))?;

        let mut stream =
            FtpStream::connect_timeout(addr, settings.timeout).map_err(ftp_err("connect"))?;
        if let Err(err) = stream.login(user, password) {
            let _ = stream.quit();
            return Err(StoreError::Ftp {
                op: "login",
                source: err,
            });
        }
        stream.set_mode(Mode::Passive);
        if let Err(err) = stream.transfer_type(FileType::Binary) {
            let _ = stream.quit();
            return Err(StoreError::Ftp {
                op: "TYPE I",
                source: err,
            });
        }
        info!(%endpoint, user, "ftp session opened");
        Ok(Self { stream })
    }
}

impl RemoteSession for FtpSession {
    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, StoreError> {
        let buffer = self.stream.retr_as_buffer(path).map_err(ftp_err("RETR"))?;
        Ok(buffer.into_inner())
    }

    fn store(&mut self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut reader = Cursor::new(bytes);
        self.stream
            .put_file(path, &mut reader)
            .map_err(ftp_err("STOR"))?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.stream.quit().map_err(ftp_err("QUIT"))
    }
}

/// A directory standing in for the remote server. Writes land atomically via
/// a temp file and rename.
#[derive(Debug, Clone)]
pub struct LocalDirSession {
    root: PathBuf,
}

impl LocalDirSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteSession for LocalDirSession {
    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, StoreError> {
        let absolute = self.resolve(path)?;
        fs::read(&absolute).map_err(io_err("reading", &absolute))
    }

    fn store(&mut self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let absolute = self.resolve(path)?;
        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(io_err("creating directory", &parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .map_err(io_err("writing temp snapshot", &temp_path));
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &absolute) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io {
                op: "renaming temp snapshot into",
                path: absolute,
                source: err,
            });
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum StoreTarget {
    Ftp(FtpSettings),
    LocalDir(PathBuf),
}

impl StoreTarget {
    pub fn describe(&self) -> String {
        match self {
            StoreTarget::Ftp(settings) => format!(
                "ftp://{}:{}",
                settings.host.as_deref().unwrap_or("<unset>"),
                settings.port
            ),
            StoreTarget::LocalDir(root) => format!("local:{}", root.display()),
        }
    }

    pub fn open(&self) -> Result<Box<dyn RemoteSession>, StoreError> {
        match self {
            StoreTarget::Ftp(settings) => Ok(Box::new(FtpSession::connect(settings)?)),
            StoreTarget::LocalDir(root) => Ok(Box::new(LocalDirSession::new(root.clone()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub path: String,
    pub byte_size: usize,
    pub content_hash: String,
}

/// Reads and writes the participant snapshot over one open session.
pub struct SnapshotStore {
    session: Box<dyn RemoteSession>,
}

impl SnapshotStore {
    pub fn new(session: Box<dyn RemoteSession>) -> Self {
        Self { session }
    }

    pub fn open(target: &StoreTarget) -> Result<Self, StoreError> {
        Ok(Self::new(target.open()?))
    }

    /// Previous snapshot at `path`. A missing or unreadable file counts as no
    /// snapshot at all, which is the normal state before the first upload.
    pub fn download(&mut self, path: &str) -> Vec<ParticipationRecord> {
        let bytes = match self.session.retrieve(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path, error = %err, "no prior snapshot; starting empty");
                return Vec::new();
            }
        };
        match decode_snapshot(&bytes) {
            Ok(records) => {
                info!(path, records = records.len(), "downloaded prior snapshot");
                records
            }
            Err(err) => {
                warn!(path, error = %err, "prior snapshot unreadable; starting empty");
                Vec::new()
            }
        }
    }

    pub fn upload(
        &mut self,
        path: &str,
        records: &[ParticipationRecord],
    ) -> Result<UploadReceipt, StoreError> {
        let bytes = encode_snapshot(records)?;
        self.session.store(path, &bytes)?;
        let receipt = UploadReceipt {
            path: path.to_string(),
            byte_size: bytes.len(),
            content_hash: sha256_hex(&bytes),
        };
        info!(
            path,
            records = records.len(),
            bytes = receipt.byte_size,
            sha256 = %receipt.content_hash,
            "uploaded snapshot"
        );
        Ok(receipt)
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.session.close()
    }
}
