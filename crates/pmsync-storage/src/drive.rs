//! Google Drive v3 backend for the durable store.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{DurableStore, GoogleCredentials, HttpFetcher, StoreError, StorePath, StoredObject};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const MULTIPART_BOUNDARY: &str = "pmsync-drive-upload-boundary";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub api_url: String,
    pub upload_url: String,
    pub credentials: GoogleCredentials,
    pub root_folder_id: String,
}

impl DriveConfig {
    pub fn new(credentials: GoogleCredentials, root_folder_id: impl Into<String>) -> Self {
        Self {
            api_url: "https://www.googleapis.com".to_string(),
            upload_url: "https://www.googleapis.com".to_string(),
            credentials,
            root_folder_id: root_folder_id.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Files live in one sub-folder per collection under the configured root folder.
#[derive(Debug)]
pub struct DriveStore {
    http: HttpFetcher,
    config: DriveConfig,
    folders: Mutex<HashMap<String, String>>,
}

impl DriveStore {
    pub fn new(http: HttpFetcher, config: DriveConfig) -> Self {
        Self {
            http,
            config,
            folders: Mutex::new(HashMap::new()),
        }
    }

    pub fn public_url_for(id: &str) -> String {
        format!("https://drive.google.com/uc?export=view&id={id}")
    }

    fn object(file: DriveFile) -> StoredObject {
        StoredObject {
            public_url: Self::public_url_for(&file.id),
            id: file.id,
            content_hash: file.md5_checksum,
        }
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.config.api_url)
    }

    async fn authed(
        &self,
        method: Method,
        url: &str,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let token = self.config.credentials.bearer().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn list(&self, query: &str) -> Result<Vec<DriveFile>, StoreError> {
        let request = self.authed(Method::GET, &self.files_url()).await?.query(&[
            ("q", query),
            ("fields", "files(id,name,md5Checksum)"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ]);
        let list: DriveFileList = self.http.send_json(request).await?;
        Ok(list.files)
    }

    /// Resolve (or create) the sub-folder for a collection, memoized for the run.
    async fn folder_id(&self, folder: &str) -> Result<String, StoreError> {
        if folder.is_empty() {
            return Ok(self.config.root_folder_id.clone());
        }
        let mut folders = self.folders.lock().await;
        if let Some(id) = folders.get(folder) {
            return Ok(id.clone());
        }

        let query = format!(
            "name = '{}' and '{}' in parents and mimeType = '{FOLDER_MIME}' and trashed = false",
            escape_query(folder),
            self.config.root_folder_id
        );
        let id = match self.list(&query).await?.into_iter().next() {
            Some(existing) => existing.id,
            None => {
                let request = self
                    .authed(Method::POST, &self.files_url())
                    .await?
                    .query(&[("supportsAllDrives", "true"), ("fields", "id")])
                    .json(&json!({
                        "name": folder,
                        "mimeType": FOLDER_MIME,
                        "parents": [self.config.root_folder_id],
                    }));
                let created: DriveFile = self.http.send_json(request).await?;
                info!(folder, id = %created.id, "created drive folder");
                created.id
            }
        };
        folders.insert(folder.to_string(), id.clone());
        Ok(id)
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related_body(
    metadata: &serde_json::Value,
    bytes: &[u8],
    content_type: &str,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n\
             --{MULTIPART_BOUNDARY}\r\n\
             Content-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

#[async_trait]
impl DurableStore for DriveStore {
    async fn verify_root(&self) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.files_url(), self.config.root_folder_id);
        let request = self
            .authed(Method::GET, &url)
            .await?
            .query(&[("fields", "id,mimeType"), ("supportsAllDrives", "true")]);
        self.http
            .send_json::<serde_json::Value>(request)
            .await
            .map(|_| ())
            .map_err(|e| {
                StoreError::Inaccessible(format!(
                    "drive folder {}: {e}",
                    self.config.root_folder_id
                ))
            })
    }

    async fn find(&self, path: &StorePath) -> Result<Option<StoredObject>, StoreError> {
        let folder_id = self.folder_id(&path.folder).await?;
        let query = format!(
            "name = '{}' and '{folder_id}' in parents and trashed = false",
            escape_query(&path.name)
        );
        Ok(self.list(&query).await?.into_iter().next().map(Self::object))
    }

    async fn upload(
        &self,
        path: &StorePath,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StoreError> {
        let folder_id = self.folder_id(&path.folder).await?;
        let metadata = json!({ "name": path.name, "parents": [folder_id] });
        let url = format!("{}/upload/drive/v3/files", self.config.upload_url);
        let request = self
            .authed(Method::POST, &url)
            .await?
            .query(&[
                ("uploadType", "multipart"),
                ("supportsAllDrives", "true"),
                ("fields", "id,md5Checksum"),
            ])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(multipart_related_body(&metadata, bytes, content_type));
        let file: DriveFile = self.http.send_json(request).await?;
        debug!(name = %path.name, id = %file.id, bytes = bytes.len(), "uploaded to drive");
        Ok(Self::object(file))
    }

    async fn set_public_read(&self, id: &str) -> Result<(), StoreError> {
        let url = format!("{}/{id}/permissions", self.files_url());
        let request = self
            .authed(Method::POST, &url)
            .await?
            .query(&[("supportsAllDrives", "true")])
            .json(&json!({ "role": "reader", "type": "anyone" }));
        self.http.send_empty(request).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<StoredObject, StoreError> {
        let url = format!("{}/{id}", self.files_url());
        let request = self
            .authed(Method::GET, &url)
            .await?
            .query(&[("fields", "id,md5Checksum"), ("supportsAllDrives", "true")]);
        match self.http.send_json::<DriveFile>(request).await {
            Ok(file) => Ok(Self::object(file)),
            Err(e) if e.status() == Some(404) => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
