//! Run orchestration for both targets: configuration, table registry, and run summaries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pmsync_core::{EntityKind, SourceRecord};
use pmsync_source::{fetch_all, AirtableClient, AirtableConfig, SchemaIntrospector, SourceApi};
use pmsync_storage::{
    AttachmentMigrator, AttachmentStats, DriveConfig, DriveStore, DurableStore, FallbackPolicy,
    GoogleCredentials, HttpClientConfig, HttpFetcher, LocalDurableStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

mod database;
mod layout;
mod remap;
mod sheets;
mod spreadsheet;

pub use database::{
    parse_date, DatabaseMigrator, EntityOutcome, PgTargetDatabase, TargetDatabase, CLEAR_ORDER,
};
pub use layout::{build_columns, choice_color, column_letter, ColumnDescriptor, ColumnRole};
pub use remap::{IdentifierMap, IdentifierRemapper};
pub use sheets::{GoogleSheetsClient, SheetInfo, SheetsConfig, SheetsError, SpreadsheetApi};
pub use spreadsheet::{
    display_name, read_tables, LoadedTable, SheetRef, SheetSyncReport, SheetSyncer, TabReport,
};

pub const CRATE_NAME: &str = "pmsync-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("reading table registry {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing table registry: {0}")]
    RegistryParse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Drive {
        folder_id: String,
    },
    Local {
        root: PathBuf,
        public_base_url: Option<String>,
    },
}

/// Where Drive and Sheets bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoogleAuth {
    AccessToken(String),
    ServiceAccountFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub airtable: AirtableConfig,
    pub database_url: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub google_auth: Option<GoogleAuth>,
    pub store: StoreBackend,
    pub fallback: FallbackPolicy,
    pub tables_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| var(key).ok_or(ConfigError::Missing(key));

        let mut airtable =
            AirtableConfig::new(required("AIRTABLE_API_KEY")?, required("AIRTABLE_BASE_ID")?);
        if let Some(api_url) = var("AIRTABLE_API_URL") {
            airtable.api_url = api_url;
        }

        let store = match var("ATTACHMENT_STORE").as_deref().unwrap_or("drive") {
            "drive" => StoreBackend::Drive {
                folder_id: required("DRIVE_FOLDER_ID")?,
            },
            "local" => StoreBackend::Local {
                root: var("ATTACHMENTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./attachments")),
                public_base_url: var("ATTACHMENT_PUBLIC_BASE_URL"),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "ATTACHMENT_STORE",
                    reason: format!("expected 'drive' or 'local', got '{other}'"),
                })
            }
        };

        let fallback = match var("ATTACHMENT_FALLBACK") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                var: "ATTACHMENT_FALLBACK",
                reason,
            })?,
            None => FallbackPolicy::default(),
        };

        let http_timeout_secs = match var("PMSYNC_HTTP_TIMEOUT_SECS") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "PMSYNC_HTTP_TIMEOUT_SECS",
                reason: format!("'{v}' is not a whole number of seconds"),
            })?,
            None => 60,
        };

        let google_auth = var("GOOGLE_ACCESS_TOKEN")
            .map(GoogleAuth::AccessToken)
            .or_else(|| {
                var("GOOGLE_APPLICATION_CREDENTIALS")
                    .map(|path| GoogleAuth::ServiceAccountFile(PathBuf::from(path)))
            });

        Ok(Self {
            airtable,
            database_url: var("DATABASE_URL"),
            spreadsheet_id: var("SPREADSHEET_ID"),
            google_auth,
            store,
            fallback,
            tables_path: var("PMSYNC_TABLES").map(PathBuf::from),
            user_agent: var("PMSYNC_USER_AGENT").unwrap_or_else(|| "pmsync/0.1".to_string()),
            http_timeout_secs,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn require_spreadsheet_id(&self) -> Result<&str, ConfigError> {
        self.spreadsheet_id.as_deref().ok_or(ConfigError::Missing("SPREADSHEET_ID"))
    }

    /// `GOOGLE_ACCESS_TOKEN` wins over a service-account key file.
    pub fn google_credentials(&self) -> Result<GoogleCredentials, ConfigError> {
        match &self.google_auth {
            Some(GoogleAuth::AccessToken(token)) => {
                Ok(GoogleCredentials::access_token(token.clone()))
            }
            Some(GoogleAuth::ServiceAccountFile(path)) => {
                GoogleCredentials::service_account_file(path).map_err(|e| ConfigError::Invalid {
                    var: "GOOGLE_APPLICATION_CREDENTIALS",
                    reason: e.to_string(),
                })
            }
            None => Err(ConfigError::Missing("GOOGLE_APPLICATION_CREDENTIALS")),
        }
    }

    pub fn http_client(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
    }

    /// The YAML registry when `PMSYNC_TABLES` is set, else the built-in one.
    pub fn registry(&self) -> Result<TableRegistry, ConfigError> {
        match &self.tables_path {
            Some(path) => TableRegistry::load(path),
            None => Ok(TableRegistry::builtin()),
        }
    }

    pub fn build_store(&self, http: &HttpFetcher) -> Result<Arc<dyn DurableStore>, ConfigError> {
        Ok(match &self.store {
            StoreBackend::Drive { folder_id } => Arc::new(DriveStore::new(
                http.clone(),
                DriveConfig::new(self.google_credentials()?, folder_id.clone()),
            )),
            StoreBackend::Local {
                root,
                public_base_url,
            } => Arc::new(LocalDurableStore::new(root.clone(), public_base_url.clone())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub table: String,
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub entity: Option<EntityKind>,
}

impl TableEntry {
    pub fn new(table: &str, entity: Option<EntityKind>) -> Self {
        Self {
            table: table.to_string(),
            sheet: None,
            entity,
        }
    }

    pub fn sheet_name(&self) -> &str {
        self.sheet.as_deref().unwrap_or(&self.table)
    }

    /// Durable-store folder for attachments owned by this table's records.
    pub fn folder(&self) -> String {
        match self.entity {
            Some(kind) => kind.as_str().to_string(),
            None => self
                .sheet_name()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect(),
        }
    }
}

/// Header pattern such as `"(from Vendor)"` whose column gets a dropdown from `target_sheet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRule {
    pub pattern: String,
    pub target_sheet: String,
}

impl LookupRule {
    pub fn new(pattern: &str, target_sheet: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            target_sheet: target_sheet.to_string(),
        }
    }

    pub fn matches(&self, header: &str) -> bool {
        header.contains(&self.pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableEntry>,
    #[serde(default)]
    pub lookup_rules: Vec<LookupRule>,
}

impl TableRegistry {
    pub fn builtin() -> Self {
        Self {
            tables: vec![
                TableEntry::new("Contacts", Some(EntityKind::Users)),
                TableEntry::new("Projects", Some(EntityKind::Projects)),
                TableEntry::new("Purchases", Some(EntityKind::Items)),
                TableEntry::new("Static Info", Some(EntityKind::StaticInfo)),
            ],
            lookup_rules: vec![
                LookupRule::new("(from Vendor)", "Contacts"),
                LookupRule::new("(from Team)", "Contacts"),
                LookupRule::new("(from Purchased By)", "Contacts"),
                LookupRule::new("(from Project)", "Projects"),
            ],
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::RegistryIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn entity_table(&self, kind: EntityKind) -> Option<&TableEntry> {
        self.tables.iter().find(|t| t.entity == Some(kind))
    }

    /// Source table name → tab name, for link rendering.
    pub fn sheet_targets(&self) -> HashMap<String, String> {
        self.tables
            .iter()
            .map(|t| (t.table.clone(), t.sheet_name().to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: BTreeMap<EntityKind, EntityOutcome>,
    pub dependency_updates: usize,
    pub attachments: AttachmentStats,
    pub unresolved: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

impl DatabaseRunSummary {
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .entities
            .iter()
            .map(|(kind, o)| format!("{kind}: migrated={} failed={}", o.migrated, o.failed))
            .collect();
        lines.push(format!("project dependency updates: {}", self.dependency_updates));
        lines.push(render_attachments(&self.attachments));
        lines.extend(render_unresolved(&self.unresolved));
        lines.extend(render_warnings(&self.warnings));
        lines
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tabs: Vec<TabReport>,
    pub attachments: AttachmentStats,
    pub unresolved: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

impl SheetRunSummary {
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .tabs
            .iter()
            .map(|t| {
                format!(
                    "{}: rows={} columns={} linked_columns={}",
                    t.sheet, t.rows, t.columns, t.linked_columns
                )
            })
            .collect();
        lines.push(render_attachments(&self.attachments));
        lines.extend(render_unresolved(&self.unresolved));
        lines.extend(render_warnings(&self.warnings));
        lines
    }
}

fn render_attachments(stats: &AttachmentStats) -> String {
    format!(
        "attachments: transferred={} reused={} cache_hits={} failed={}",
        stats.transferred, stats.reused, stats.cache_hits, stats.failed
    )
}

fn render_unresolved(unresolved: &BTreeMap<String, usize>) -> Option<String> {
    if unresolved.is_empty() {
        return None;
    }
    let parts: Vec<String> = unresolved.iter().map(|(k, n)| format!("{k}={n}")).collect();
    Some(format!("unresolved references: {}", parts.join(" ")))
}

fn render_warnings(warnings: &[String]) -> Vec<String> {
    warnings.iter().map(|w| format!("warning: {w}")).collect()
}

/// Fetch every entity table up front, then clear and re-import the database.
pub async fn migrate_database(
    api: &dyn SourceApi,
    introspector: &mut SchemaIntrospector,
    db: &dyn TargetDatabase,
    attachments: &mut AttachmentMigrator,
    registry: &TableRegistry,
) -> Result<DatabaseRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let mut fetched: BTreeMap<EntityKind, Vec<SourceRecord>> = BTreeMap::new();
    for kind in EntityKind::MIGRATION_ORDER {
        let Some(entry) = registry.entity_table(kind) else {
            warn!(entity = %kind, "no source table registered; skipping");
            continue;
        };
        let fields = introspector.schema_for(&entry.table).await;
        let records = fetch_all(api, &entry.table, &fields)
            .await
            .with_context(|| format!("fetching {kind} from '{}'", entry.table))?;
        fetched.insert(kind, records);
    }

    let mut migrator = DatabaseMigrator::new(db, attachments);
    migrator.clear_target().await.context("clearing target database")?;
    for kind in EntityKind::MIGRATION_ORDER {
        let records = fetched.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        match kind {
            EntityKind::Users => migrator.migrate_users(records).await,
            EntityKind::Projects => migrator.migrate_projects(records).await,
            EntityKind::Items => migrator.migrate_items(records).await,
            EntityKind::StaticInfo => migrator.migrate_static_info(records).await,
        }
        if kind == EntityKind::Projects {
            migrator.resolve_project_dependencies().await;
        }
    }

    let entities = migrator.outcomes().clone();
    let dependency_updates = migrator.dependency_updates();
    let unresolved = migrator.remapper().unresolved().clone();
    let unresolved_total = migrator.remapper().unresolved_total();
    let mut warnings: Vec<String> = introspector.warnings().to_vec();
    warnings.extend(migrator.row_warnings().iter().cloned());
    drop(migrator);
    warnings.extend(attachments.warnings().iter().cloned());

    let finished_at = Utc::now();
    info!(
        %run_id,
        unresolved = unresolved_total,
        elapsed_ms = (finished_at - started_at).num_milliseconds(),
        "database migration finished"
    );
    Ok(DatabaseRunSummary {
        run_id,
        started_at,
        finished_at,
        entities,
        dependency_updates,
        attachments: attachments.stats(),
        unresolved,
        warnings,
    })
}

/// Phase 0 read, then the spreadsheet writer's write and link phases.
pub async fn sync_spreadsheet(
    api: &dyn SourceApi,
    introspector: &mut SchemaIntrospector,
    sheets: &dyn SpreadsheetApi,
    attachments: &mut AttachmentMigrator,
    registry: &TableRegistry,
) -> Result<SheetRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let tables = read_tables(api, introspector, &registry.tables)
        .await
        .context("reading source tables")?;
    let link_targets = introspector.table_lookup().await;

    let report = SheetSyncer::new(sheets, attachments, &registry.lookup_rules, link_targets)
        .run(&tables)
        .await?;

    let mut warnings: Vec<String> = introspector.warnings().to_vec();
    warnings.extend(report.warnings);
    warnings.extend(attachments.warnings().iter().cloned());

    let finished_at = Utc::now();
    info!(%run_id, tabs = report.tabs.len(), "spreadsheet sync finished");
    Ok(SheetRunSummary {
        run_id,
        started_at,
        finished_at,
        tabs: report.tabs,
        attachments: attachments.stats(),
        unresolved: report.unresolved,
        warnings,
    })
}

struct RunContext {
    registry: TableRegistry,
    source: Arc<dyn SourceApi>,
    introspector: SchemaIntrospector,
    attachments: AttachmentMigrator,
    http: HttpFetcher,
}

/// Shared setup for both commands; an inaccessible storage root is fatal here.
async fn prepare(config: &SyncConfig) -> Result<RunContext> {
    let registry = config.registry()?;
    let http = config.http_client()?;
    let source: Arc<dyn SourceApi> =
        Arc::new(AirtableClient::new(http.clone(), config.airtable.clone()));
    let introspector = SchemaIntrospector::new(source.clone(), registry.sheet_targets());

    let store = config.build_store(&http)?;
    store
        .verify_root()
        .await
        .context("attachment storage root is not usable")?;
    let attachments = AttachmentMigrator::new(store, http.clone(), config.fallback);

    Ok(RunContext {
        registry,
        source,
        introspector,
        attachments,
        http,
    })
}

pub async fn run_database_migration_from_env() -> Result<DatabaseRunSummary> {
    let config = SyncConfig::from_env()?;
    let database_url = config.require_database_url()?.to_string();
    let mut ctx = prepare(&config).await?;
    let db = PgTargetDatabase::connect(&database_url).await?;
    migrate_database(
        ctx.source.as_ref(),
        &mut ctx.introspector,
        &db,
        &mut ctx.attachments,
        &ctx.registry,
    )
    .await
}

pub async fn run_sheet_sync_from_env() -> Result<SheetRunSummary> {
    let config = SyncConfig::from_env()?;
    let sheets_config =
        SheetsConfig::new(config.google_credentials()?, config.require_spreadsheet_id()?);
    let mut ctx = prepare(&config).await?;
    let sheets = GoogleSheetsClient::new(ctx.http.clone(), sheets_config);
    sync_spreadsheet(
        ctx.source.as_ref(),
        &mut ctx.introspector,
        &sheets,
        &mut ctx.attachments,
        &ctx.registry,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{offline_migrator, MemoryDatabase};
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn config_requires_source_credentials() {
        let err = SyncConfig::from_lookup(env(&[("AIRTABLE_BASE_ID", "appX")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AIRTABLE_API_KEY")));

        let err = SyncConfig::from_lookup(env(&[
            ("AIRTABLE_API_KEY", "  "),
            ("AIRTABLE_BASE_ID", "appX"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AIRTABLE_API_KEY")));
    }

    #[test]
    fn config_defaults_to_drive_and_source_url_fallback() {
        let err = SyncConfig::from_lookup(env(&[
            ("AIRTABLE_API_KEY", "k"),
            ("AIRTABLE_BASE_ID", "appX"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DRIVE_FOLDER_ID")));

        let config = SyncConfig::from_lookup(env(&[
            ("AIRTABLE_API_KEY", "k"),
            ("AIRTABLE_BASE_ID", "appX"),
            ("DRIVE_FOLDER_ID", "folder1"),
        ]))
        .unwrap();
        assert_eq!(config.store, StoreBackend::Drive { folder_id: "folder1".into() });
        assert_eq!(config.fallback, FallbackPolicy::SourceUrl);
        assert_eq!(config.airtable.api_url, "https://api.airtable.com");
        assert_eq!(config.user_agent, "pmsync/0.1");
        assert_eq!(config.http_timeout_secs, 60);
        assert!(matches!(config.require_database_url(), Err(ConfigError::Missing("DATABASE_URL"))));
        assert!(config.build_store(&config.http_client().unwrap()).is_err());
    }

    #[test]
    fn config_reads_local_store_and_overrides() {
        let config = SyncConfig::from_lookup(env(&[
            ("AIRTABLE_API_KEY", "k"),
            ("AIRTABLE_BASE_ID", "appX"),
            ("ATTACHMENT_STORE", "local"),
            ("ATTACHMENT_PUBLIC_BASE_URL", "https://cdn.example/att"),
            ("ATTACHMENT_FALLBACK", "drop"),
            ("PMSYNC_HTTP_TIMEOUT_SECS", "15"),
            ("DATABASE_URL", "postgres://localhost/pm"),
        ]))
        .unwrap();
        assert_eq!(
            config.store,
            StoreBackend::Local {
                root: PathBuf::from("./attachments"),
                public_base_url: Some("https://cdn.example/att".into()),
            }
        );
        assert_eq!(config.fallback, FallbackPolicy::Drop);
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.require_database_url().unwrap(), "postgres://localhost/pm");
    }

    #[test]
    fn config_rejects_bad_values() {
        let base = [
            ("AIRTABLE_API_KEY", "k"),
            ("AIRTABLE_BASE_ID", "appX"),
            ("ATTACHMENT_STORE", "local"),
        ];
        let with = |extra: (&'static str, &'static str)| {
            let mut pairs = base.to_vec();
            pairs.push(extra);
            SyncConfig::from_lookup(env(&pairs))
        };
        assert!(matches!(
            with(("ATTACHMENT_FALLBACK", "retry")),
            Err(ConfigError::Invalid { var: "ATTACHMENT_FALLBACK", .. })
        ));
        assert!(matches!(
            with(("PMSYNC_HTTP_TIMEOUT_SECS", "soon")),
            Err(ConfigError::Invalid { var: "PMSYNC_HTTP_TIMEOUT_SECS", .. })
        ));
        assert!(matches!(
            SyncConfig::from_lookup(env(&[
                ("AIRTABLE_API_KEY", "k"),
                ("AIRTABLE_BASE_ID", "a"),
                ("ATTACHMENT_STORE", "s3"),
            ])),
            Err(ConfigError::Invalid { var: "ATTACHMENT_STORE", .. })
        ));
    }

    #[test]
    fn google_auth_prefers_token_over_service_account_file() {
        let key_file = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/google/service_account.json")
            .to_string_lossy()
            .into_owned();
        let load = |extra: &[(&str, &str)]| {
            let mut pairs = vec![
                ("AIRTABLE_API_KEY", "k"),
                ("AIRTABLE_BASE_ID", "appX"),
                ("DRIVE_FOLDER_ID", "folder1"),
            ];
            pairs.extend_from_slice(extra);
            SyncConfig::from_lookup(env(&pairs)).unwrap()
        };

        let config = load(&[("GOOGLE_APPLICATION_CREDENTIALS", key_file.as_str())]);
        assert_eq!(
            config.google_auth,
            Some(GoogleAuth::ServiceAccountFile(PathBuf::from(&key_file)))
        );
        assert!(matches!(
            config.google_credentials(),
            Ok(GoogleCredentials::ServiceAccount(_))
        ));
        assert!(config.build_store(&config.http_client().unwrap()).is_ok());

        let config = load(&[
            ("GOOGLE_APPLICATION_CREDENTIALS", key_file.as_str()),
            ("GOOGLE_ACCESS_TOKEN", "ya29.override"),
        ]);
        assert_eq!(
            config.google_auth,
            Some(GoogleAuth::AccessToken("ya29.override".into()))
        );
        assert!(matches!(
            config.google_credentials(),
            Ok(GoogleCredentials::AccessToken(_))
        ));

        let config = load(&[("GOOGLE_APPLICATION_CREDENTIALS", "/nonexistent/sa.json")]);
        assert!(matches!(
            config.google_credentials(),
            Err(ConfigError::Invalid { var: "GOOGLE_APPLICATION_CREDENTIALS", .. })
        ));

        let config = load(&[]);
        assert!(matches!(
            config.google_credentials(),
            Err(ConfigError::Missing("GOOGLE_APPLICATION_CREDENTIALS"))
        ));
    }

    #[test]
    fn registry_parses_yaml_with_optional_fields() {
        let registry = TableRegistry::from_yaml_str(
            r#"
tables:
  - table: Contacts
    sheet: People
    entity: users
  - table: Punch List
lookup_rules:
  - pattern: "(from Owner)"
    target_sheet: People
"#,
        )
        .unwrap();
        assert_eq!(registry.tables[0].sheet_name(), "People");
        assert_eq!(registry.tables[0].folder(), "users");
        assert_eq!(registry.tables[1].sheet_name(), "Punch List");
        assert_eq!(registry.tables[1].folder(), "punch_list");
        assert_eq!(
            registry.entity_table(EntityKind::Users).map(|t| t.table.as_str()),
            Some("Contacts")
        );
        assert!(registry.entity_table(EntityKind::Items).is_none());
        assert!(registry.lookup_rules[0].matches("Email (from Owner)"));
        assert!(!registry.lookup_rules[0].matches("Owner"));
        assert_eq!(registry.sheet_targets()["Contacts"], "People");

        assert!(matches!(
            TableRegistry::from_yaml_str("tables: nope"),
            Err(ConfigError::RegistryParse(_))
        ));
    }

    #[test]
    fn builtin_registry_covers_every_entity() {
        let registry = TableRegistry::builtin();
        for kind in EntityKind::MIGRATION_ORDER {
            assert!(registry.entity_table(kind).is_some(), "{kind} missing");
        }
        assert!(registry.lookup_rules.iter().any(|r| r.matches("Phone (from Vendor)")));
    }

    async fn serve_table(server: &MockServer, url_path: &str, records: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(url_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "records": records })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn database_run_reports_per_entity_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases/appBase/tables"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        serve_table(
            &server,
            "/v0/appBase/Contacts",
            json!([
                {"id": "recUserAAAAAAAAAA", "createdTime": "2026-01-01T00:00:00.000Z",
                 "fields": {"Name": "Acme", "Role": "Vendor"}},
                {"id": "recUserBBBBBBBBBB", "createdTime": "2026-01-01T00:00:00.000Z",
                 "fields": {"Name": "Ada"}}
            ]),
        )
        .await;
        serve_table(
            &server,
            "/v0/appBase/Projects",
            json!([
                {"id": "recProjAAAAAAAAAA", "createdTime": "2026-01-02T00:00:00.000Z", "fields": {
                    "Name": "Kitchen",
                    "Vendor": ["recUserAAAAAAAAAA"],
                    "Team": ["recUserBBBBBBBBBB", "recUserZZZZZZZZZZ"],
                    "Due Date": "2026-05-01",
                    "Blocking": ["recProjBBBBBBBBBB"]
                }},
                {"id": "recProjBBBBBBBBBB", "createdTime": "2026-01-02T00:00:00.000Z", "fields": {
                    "Name": "Cabinets", "Blocked By": ["recProjAAAAAAAAAA"]
                }}
            ]),
        )
        .await;
        serve_table(
            &server,
            "/v0/appBase/Purchases",
            json!([
                {"id": "recItemAAAAAAAAAA", "createdTime": "2026-01-03T00:00:00.000Z", "fields": {
                    "Item": "Hinges", "Project": ["recProjAAAAAAAAAA"],
                    "Quantity": 12, "Unit Cost": 3.5
                }}
            ]),
        )
        .await;
        serve_table(
            &server,
            "/v0/appBase/Static%20Info",
            json!([
                {"id": "recInfoAAAAAAAAAA", "createdTime": "2026-01-04T00:00:00.000Z",
                 "fields": {"Key": "wifi", "Value": "pm-guest"}}
            ]),
        )
        .await;

        let mut airtable = AirtableConfig::new("key", "appBase");
        airtable.api_url = server.uri();
        let api: Arc<dyn SourceApi> = Arc::new(AirtableClient::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            airtable,
        ));
        let registry = TableRegistry::builtin();
        let mut introspector = SchemaIntrospector::new(api.clone(), registry.sheet_targets());
        let db = MemoryDatabase::default();
        let dir = tempfile::tempdir().unwrap();
        let mut attachments = offline_migrator(dir.path());

        let summary =
            migrate_database(api.as_ref(), &mut introspector, &db, &mut attachments, &registry)
                .await
                .unwrap();

        for kind in EntityKind::MIGRATION_ORDER {
            assert_eq!(summary.entities[&kind].failed, 0, "{kind}");
        }
        assert_eq!(summary.entities[&EntityKind::Users].migrated, 2);
        assert_eq!(summary.entities[&EntityKind::Projects].migrated, 2);
        assert_eq!(summary.entities[&EntityKind::Items].migrated, 1);
        assert_eq!(summary.entities[&EntityKind::StaticInfo].migrated, 1);
        assert_eq!(summary.dependency_updates, 2);
        assert_eq!(summary.unresolved.get("users"), Some(&1));
        assert!(summary.warnings.iter().any(|w| w.contains("schema metadata unavailable")));

        let tables = db.snapshot();
        let kitchen = tables.projects.iter().find(|p| p.1.name == "Kitchen").unwrap();
        assert_eq!(kitchen.1.due_date, chrono::NaiveDate::from_ymd_opt(2026, 5, 1));
        assert_eq!(tables.items[0].1.project_id, Some(kitchen.0));
        assert_eq!(tables.items[0].1.quantity, Some(12));
        assert_eq!(tables.assignments.len(), 1);
        assert_eq!(tables.static_info[0].1.value.as_deref(), Some("pm-guest"));

        let lines = summary.render_lines();
        assert_eq!(lines[0], "users: migrated=2 failed=0");
        assert!(lines.iter().any(|l| l == "unresolved references: users=1"));
    }

    #[tokio::test]
    async fn failed_fetch_aborts_before_anything_is_cleared() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/appBase/Contacts"))
            .respond_with(ResponseTemplate::new(401).set_body_string("AUTHENTICATION_REQUIRED"))
            .mount(&server)
            .await;

        let mut airtable = AirtableConfig::new("bad", "appBase");
        airtable.api_url = server.uri();
        let api: Arc<dyn SourceApi> = Arc::new(AirtableClient::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            airtable,
        ));
        let registry = TableRegistry::builtin();
        let mut introspector = SchemaIntrospector::new(api.clone(), HashMap::new());
        let db = MemoryDatabase::default();
        let dir = tempfile::tempdir().unwrap();
        let mut attachments = offline_migrator(dir.path());

        let err =
            migrate_database(api.as_ref(), &mut introspector, &db, &mut attachments, &registry)
                .await
                .unwrap_err();
        assert!(format!("{err:#}").contains("Contacts"));
        assert!(db.snapshot().cleared.is_empty());
    }
}
