//! HTTP plumbing and durable attachment storage for pmsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod attachments;
mod auth;
mod drive;

pub use attachments::{
    AttachmentError, AttachmentMigrator, AttachmentStats, FallbackPolicy, ResolvedAttachment,
};
pub use auth::{GoogleCredentials, GOOGLE_SCOPES};
pub use drive::{DriveConfig, DriveStore};

pub const CRATE_NAME: &str = "pmsync-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("obtaining access token: {0}")]
    Auth(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Thin wrapper over a shared `reqwest::Client`. Calls are never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Download a whole body into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            content_type,
            body,
        })
    }

    /// Send a prepared request and decode a JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        let text = self.send_text(request).await?;
        serde_json::from_str(&text.1).map_err(|source| FetchError::Decode { url: text.0, source })
    }

    /// Send a prepared request and discard the body.
    pub async fn send_empty(&self, request: RequestBuilder) -> Result<(), FetchError> {
        self.send_text(request).await.map(|_| ())
    }

    async fn send_text(&self, request: RequestBuilder) -> Result<(String, String), FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        debug!(%url, status = status.as_u16(), "http ok");
        Ok((url, body))
    }
}

/// Deterministic location of an object inside the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    pub folder: String,
    pub name: String,
}

impl StorePath {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
        }
    }

    /// `{folder}/{owner suffix}_{sanitized filename}`; stable across runs.
    pub fn for_attachment(folder: &str, owner_id: &str, filename: &str) -> Self {
        Self::new(
            folder,
            format!("{}_{}", owner_suffix(owner_id), sanitize_filename(filename)),
        )
    }

    pub fn relative(&self) -> String {
        if self.folder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.folder, self.name)
        }
    }
}

pub fn owner_suffix(owner_id: &str) -> &str {
    let start = owner_id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &owner_id[start..]
}

pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub id: String,
    pub public_url: String,
    pub content_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage root is not accessible: {0}")]
    Inaccessible(String),
    #[error("unexpected store response: {0}")]
    Unexpected(String),
}

/// Write-once blob store used to host migrated attachments.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fails when the configured root folder cannot be used at all.
    async fn verify_root(&self) -> Result<(), StoreError>;

    async fn find(&self, path: &StorePath) -> Result<Option<StoredObject>, StoreError>;

    async fn upload(
        &self,
        path: &StorePath,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StoreError>;

    /// Best effort; callers treat failures as warnings.
    async fn set_public_read(&self, id: &str) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<StoredObject, StoreError>;
}

/// Filesystem-backed store. Object ids are paths relative to the root.
#[derive(Debug, Clone)]
pub struct LocalDurableStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalDurableStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        let root = root.into();
        let public_base_url = public_base_url
            .unwrap_or_else(|| format!("file://{}", root.display()))
            .trim_end_matches('/')
            .to_string();
        Self {
            root,
            public_base_url,
        }
    }

    fn object_for(&self, relative: &str, content_hash: Option<String>) -> StoredObject {
        StoredObject {
            id: relative.to_string(),
            public_url: format!("{}/{}", self.public_base_url, relative),
            content_hash,
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool, StoreError> {
        fs::try_exists(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl DurableStore for LocalDurableStore {
    async fn verify_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Inaccessible(format!("{}: {e}", self.root.display())))
    }

    async fn find(&self, path: &StorePath) -> Result<Option<StoredObject>, StoreError> {
        let relative = path.relative();
        if self.exists(&self.root.join(&relative)).await? {
            Ok(Some(self.object_for(&relative, None)))
        } else {
            Ok(None)
        }
    }

    /// Atomic temp-file rename; an object that already exists is left untouched.
    async fn upload(
        &self,
        path: &StorePath,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredObject, StoreError> {
        let relative = path.relative();
        let absolute_path = self.root.join(&relative);
        let content_hash = Some(sha256_hex(bytes));
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

        if self.exists(&absolute_path).await? {
            return Ok(self.object_for(&relative, content_hash));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(self.object_for(&relative, content_hash)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(self.object_for(&relative, content_hash))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io {
                    path: absolute_path,
                    source: err,
                })
            }
        }
    }

    async fn set_public_read(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<StoredObject, StoreError> {
        if self.exists(&self.root.join(id)).await? {
            Ok(self.object_for(id, None))
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }
}
