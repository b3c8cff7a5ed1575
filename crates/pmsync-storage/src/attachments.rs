//! Download-once, upload-once transfer of source attachments into the durable store.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use pmsync_core::{AttachmentDescriptor, MigratedAttachment};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DurableStore, FetchError, HttpFetcher, StoreError, StorePath};

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("downloading {filename}: {source}")]
    Download {
        filename: String,
        #[source]
        source: FetchError,
    },
    #[error("storing {filename}: {source}")]
    Store {
        filename: String,
        #[source]
        source: StoreError,
    },
}

/// What to put in the target when a transfer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Keep the original source-hosted URL (may expire later).
    #[default]
    SourceUrl,
    Drop,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source-url" | "source_url" | "source" => Ok(FallbackPolicy::SourceUrl),
            "drop" | "none" => Ok(FallbackPolicy::Drop),
            other => Err(format!("unknown attachment fallback policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentStats {
    pub transferred: usize,
    pub reused: usize,
    pub cache_hits: usize,
    pub failed: usize,
}

/// URL to write into the target, after the fallback policy has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub url: String,
    /// Durable file id; `None` when the source URL was kept.
    pub file_id: Option<String>,
}

/// Per-run attachment cache keyed by `{owner_id}_{filename}`.
pub struct AttachmentMigrator {
    store: Arc<dyn DurableStore>,
    http: HttpFetcher,
    fallback: FallbackPolicy,
    cache: HashMap<String, MigratedAttachment>,
    stats: AttachmentStats,
    warnings: Vec<String>,
}

impl AttachmentMigrator {
    pub fn new(store: Arc<dyn DurableStore>, http: HttpFetcher, fallback: FallbackPolicy) -> Self {
        Self {
            store,
            http,
            fallback,
            cache: HashMap::new(),
            stats: AttachmentStats::default(),
            warnings: Vec::new(),
        }
    }

    pub fn stats(&self) -> AttachmentStats {
        self.stats
    }

    /// Non-fatal problems such as rejected permission grants.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cache_key(owner_id: &str, filename: &str) -> String {
        format!("{owner_id}_{filename}")
    }

    pub async fn migrate(
        &mut self,
        descriptor: &AttachmentDescriptor,
        folder: &str,
        owner_id: &str,
    ) -> Result<MigratedAttachment, AttachmentError> {
        let key = Self::cache_key(owner_id, &descriptor.filename);
        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            return Ok(hit.clone());
        }

        let path = StorePath::for_attachment(folder, owner_id, &descriptor.filename);
        let store_err = |source| AttachmentError::Store {
            filename: descriptor.filename.clone(),
            source,
        };

        if let Some(existing) = self.store.find(&path).await.map_err(store_err)? {
            debug!(path = %path.relative(), "attachment already in store");
            self.stats.reused += 1;
            let migrated = MigratedAttachment {
                durable_url: existing.public_url,
                durable_file_id: existing.id,
            };
            self.cache.insert(key, migrated.clone());
            return Ok(migrated);
        }

        let fetched = self
            .http
            .fetch_bytes(&descriptor.remote_url)
            .await
            .map_err(|source| AttachmentError::Download {
                filename: descriptor.filename.clone(),
                source,
            })?;
        let content_type = if descriptor.mime_type.is_empty() {
            fetched
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string())
        } else {
            descriptor.mime_type.clone()
        };
        let stored = self
            .store
            .upload(&path, &fetched.body, &content_type)
            .await
            .map_err(store_err)?;

        if let Err(e) = self.store.set_public_read(&stored.id).await {
            debug!(id = %stored.id, error = %e, "public-read grant rejected");
            self.warnings
                .push(format!("public-read grant for {} rejected: {e}", path.relative()));
        }

        info!(
            path = %path.relative(),
            bytes = fetched.body.len(),
            "attachment transferred"
        );
        self.stats.transferred += 1;
        let migrated = MigratedAttachment {
            durable_url: stored.public_url,
            durable_file_id: stored.id,
        };
        self.cache.insert(key, migrated.clone());
        Ok(migrated)
    }

    /// Migrate, applying the fallback policy instead of failing the caller's record.
    pub async fn resolve(
        &mut self,
        descriptor: &AttachmentDescriptor,
        folder: &str,
        owner_id: &str,
    ) -> Option<ResolvedAttachment> {
        match self.migrate(descriptor, folder, owner_id).await {
            Ok(m) => Some(ResolvedAttachment {
                url: m.durable_url,
                file_id: Some(m.durable_file_id),
            }),
            Err(e) => {
                self.stats.failed += 1;
                warn!(record = owner_id, error = %e, "attachment transfer failed");
                match self.fallback {
                    FallbackPolicy::SourceUrl => Some(ResolvedAttachment {
                        url: descriptor.remote_url.clone(),
                        file_id: None,
                    }),
                    FallbackPolicy::Drop => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HttpClientConfig, LocalDurableStore, StoredObject};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OWNER: &str = "recOwner00000001";

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    fn descriptor(server: &MockServer, name: &str) -> AttachmentDescriptor {
        AttachmentDescriptor {
            remote_url: format!("{}/files/{name}", server.uri()),
            filename: name.to_string(),
            mime_type: "image/png".to_string(),
        }
    }

    async fn serve_file(server: &MockServer, name: &str, expected_downloads: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/files/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-data".to_vec()))
            .expect(expected_downloads)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn same_owner_and_filename_transfers_once_per_run() {
        let server = MockServer::start().await;
        serve_file(&server, "logo.png", 1).await;
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalDurableStore::new(dir.path(), None));
        let mut migrator = AttachmentMigrator::new(store, http(), FallbackPolicy::SourceUrl);

        let d = descriptor(&server, "logo.png");
        let first = migrator.migrate(&d, "users", OWNER).await.unwrap();
        let second = migrator.migrate(&d, "users", OWNER).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            migrator.stats(),
            AttachmentStats {
                transferred: 1,
                reused: 0,
                cache_hits: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn second_run_against_populated_store_downloads_nothing() {
        let server = MockServer::start().await;
        serve_file(&server, "logo.png", 1).await;
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalDurableStore::new(dir.path(), None));
        let d = descriptor(&server, "logo.png");

        let mut run_one = AttachmentMigrator::new(store.clone(), http(), FallbackPolicy::SourceUrl);
        let first = run_one.migrate(&d, "users", OWNER).await.unwrap();

        let mut run_two = AttachmentMigrator::new(store, http(), FallbackPolicy::SourceUrl);
        let second = run_two.migrate(&d, "users", OWNER).await.unwrap();

        assert_eq!(first.durable_file_id, second.durable_file_id);
        assert_eq!(run_two.stats().transferred, 0);
        assert_eq!(run_two.stats().reused, 1);
    }

    #[tokio::test]
    async fn failed_download_falls_back_per_policy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/gone.png"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(LocalDurableStore::new(dir.path(), None));
        let d = descriptor(&server, "gone.png");

        let mut keep = AttachmentMigrator::new(store.clone(), http(), FallbackPolicy::SourceUrl);
        let kept = keep.resolve(&d, "items", OWNER).await.expect("fallback url");
        assert_eq!(kept.url, d.remote_url);
        assert!(kept.file_id.is_none());
        assert_eq!(keep.stats().failed, 1);

        let mut dropping = AttachmentMigrator::new(store, http(), FallbackPolicy::Drop);
        assert!(dropping.resolve(&d, "items", OWNER).await.is_none());
    }

    struct NoPermissionStore(LocalDurableStore);

    #[async_trait]
    impl DurableStore for NoPermissionStore {
        async fn verify_root(&self) -> Result<(), StoreError> {
            self.0.verify_root().await
        }
        async fn find(&self, path: &StorePath) -> Result<Option<StoredObject>, StoreError> {
            self.0.find(path).await
        }
        async fn upload(
            &self,
            path: &StorePath,
            bytes: &[u8],
            ct: &str,
        ) -> Result<StoredObject, StoreError> {
            self.0.upload(path, bytes, ct).await
        }
        async fn set_public_read(&self, _id: &str) -> Result<(), StoreError> {
            Err(StoreError::Unexpected("sharing disabled".into()))
        }
        async fn get(&self, id: &str) -> Result<StoredObject, StoreError> {
            self.0.get(id).await
        }
    }

    #[tokio::test]
    async fn rejected_permission_grant_is_only_a_warning() {
        let server = MockServer::start().await;
        serve_file(&server, "doc.png", 1).await;
        let dir = tempdir().unwrap();
        let store = Arc::new(NoPermissionStore(LocalDurableStore::new(dir.path(), None)));
        let mut migrator = AttachmentMigrator::new(store, http(), FallbackPolicy::Drop);

        let resolved = migrator
            .resolve(&descriptor(&server, "doc.png"), "projects", OWNER)
            .await
            .expect("migrated");
        assert!(resolved.file_id.is_some());
        assert_eq!(migrator.warnings().len(), 1);
        assert!(migrator.warnings()[0].contains("sharing disabled"));
    }

    #[test]
    fn fallback_policy_parses() {
        assert_eq!("source-url".parse::<FallbackPolicy>(), Ok(FallbackPolicy::SourceUrl));
        assert_eq!("DROP".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Drop));
        assert!("maybe".parse::<FallbackPolicy>().is_err());
    }
}
