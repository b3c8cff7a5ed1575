//! Airtable source API: paginated record reader, schema introspection and field ingestion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmsync_core::{
    looks_like_record_id, AttachmentDescriptor, Choice, FieldValue, Scalar, SchemaField,
    SourceRecord, TableSchema,
};
use pmsync_storage::{FetchError, HttpFetcher};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pmsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching table '{table}': {source}")]
    Fetch {
        table: String,
        #[source]
        source: FetchError,
    },
    #[error("fetching base schema: {0}")]
    Schema(#[source] FetchError),
    #[error("invalid source api url {url}: {reason}")]
    Url { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
}

impl AirtableConfig {
    pub fn new(api_key: impl Into<String>, base_id: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.airtable.com".to_string(),
            api_key: api_key.into(),
            base_id: base_id.into(),
        }
    }
}

/// One page of the list-records endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(rename = "createdTime")]
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawBaseSchema {
    #[serde(default)]
    tables: Vec<RawTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTable {
    id: String,
    name: String,
    #[serde(default)]
    primary_field_id: Option<String>,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    id: String,
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    options: Option<RawFieldOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFieldOptions {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    linked_table_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    name: String,
    #[serde(default)]
    color: Option<String>,
}

impl From<RawTable> for TableSchema {
    fn from(raw: RawTable) -> Self {
        TableSchema {
            id: raw.id,
            name: raw.name,
            primary_field_id: raw.primary_field_id,
            fields: raw
                .fields
                .into_iter()
                .map(|f| {
                    let options = f.options.unwrap_or_default();
                    SchemaField {
                        id: f.id,
                        name: f.name,
                        field_type: f.field_type,
                        choices: options
                            .choices
                            .into_iter()
                            .map(|c| Choice {
                                name: c.name,
                                color: c.color,
                            })
                            .collect(),
                        linked_table_id: options.linked_table_id,
                    }
                })
                .collect(),
        }
    }
}

/// The two calls the pipeline needs from the tabular source.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn list_page(&self, table: &str, offset: Option<&str>) -> Result<RecordPage, SourceError>;

    async fn base_schema(&self) -> Result<Vec<TableSchema>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct AirtableClient {
    http: HttpFetcher,
    config: AirtableConfig,
}

impl AirtableClient {
    pub fn new(http: HttpFetcher, config: AirtableConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let bad = |reason: &str| SourceError::Url {
            url: self.config.api_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&self.config.api_url).map_err(|e| bad(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad("cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl SourceApi for AirtableClient {
    async fn list_page(
        &self,
        table: &str,
        offset: Option<&str>,
    ) -> Result<RecordPage, SourceError> {
        let url = self.url(&["v0", &self.config.base_id, table])?;
        let mut request = self
            .http
            .request(Method::GET, url.as_str())
            .bearer_auth(&self.config.api_key)
            .query(&[("pageSize", "100")]);
        if let Some(offset) = offset {
            request = request.query(&[("offset", offset)]);
        }
        self.http
            .send_json(request)
            .await
            .map_err(|source| SourceError::Fetch {
                table: table.to_string(),
                source,
            })
    }

    async fn base_schema(&self) -> Result<Vec<TableSchema>, SourceError> {
        let url = self.url(&["v0", "meta", "bases", &self.config.base_id, "tables"])?;
        let request = self
            .http
            .request(Method::GET, url.as_str())
            .bearer_auth(&self.config.api_key);
        let raw: RawBaseSchema = self.http.send_json(request).await.map_err(SourceError::Schema)?;
        Ok(raw.tables.into_iter().map(TableSchema::from).collect())
    }
}

/// Follow the offset cursor until exhausted. Any failed page aborts the whole table.
pub async fn fetch_all(
    api: &dyn SourceApi,
    table: &str,
    schema: &[SchemaField],
) -> Result<Vec<SourceRecord>, SourceError> {
    let types: HashMap<&str, &str> = schema
        .iter()
        .map(|f| (f.name.as_str(), f.field_type.as_str()))
        .collect();
    let mut records = Vec::new();
    let mut offset: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = api.list_page(table, offset.as_deref()).await?;
        pages += 1;
        debug!(table, page = pages, records = page.records.len(), "fetched page");
        records.extend(page.records.into_iter().map(|raw| ingest_record(raw, &types)));
        match page.offset {
            Some(next) if !next.is_empty() => offset = Some(next),
            _ => break,
        }
    }

    info!(table, records = records.len(), pages, "fetched table");
    Ok(records)
}

fn ingest_record(raw: RawRecord, types: &HashMap<&str, &str>) -> SourceRecord {
    let fields = raw
        .fields
        .into_iter()
        .filter_map(|(name, value)| {
            let hint = types.get(name.as_str()).copied();
            classify_value(&value, hint).map(|v| (name, v))
        })
        .collect();
    SourceRecord {
        id: raw.id,
        created_time: raw.created_time,
        fields,
    }
}

/// Decide the `FieldValue` variant for one JSON cell. `field_type` is the schema type when known.
pub fn classify_value(value: &JsonValue, field_type: Option<&str>) -> Option<FieldValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Array(items) => classify_array(items, field_type),
        other => scalar_of(other).map(FieldValue::Scalar),
    }
}

fn classify_array(items: &[JsonValue], field_type: Option<&str>) -> Option<FieldValue> {
    if items.is_empty() {
        return None;
    }

    let attachments: Option<Vec<AttachmentDescriptor>> = items.iter().map(attachment_of).collect();
    if let Some(files) = attachments {
        return Some(FieldValue::Attachments(files));
    }

    let strings: Option<Vec<&str>> = items.iter().map(JsonValue::as_str).collect();
    if let Some(ids) = strings {
        let is_link = match field_type {
            Some(t) => t == "multipleRecordLinks",
            None => ids.iter().all(|s| looks_like_record_id(s)),
        };
        if is_link {
            return Some(FieldValue::links(ids));
        }
    }

    let scalars: Vec<Scalar> = items.iter().filter_map(scalar_of).collect();
    if scalars.is_empty() {
        None
    } else {
        Some(FieldValue::ScalarList(scalars))
    }
}

fn attachment_of(value: &JsonValue) -> Option<AttachmentDescriptor> {
    let obj = value.as_object()?;
    let url = obj.get("url")?.as_str()?;
    let filename = obj.get("filename")?.as_str()?;
    Some(AttachmentDescriptor {
        remote_url: url.to_string(),
        filename: filename.to_string(),
        mime_type: obj
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn scalar_of(value: &JsonValue) -> Option<Scalar> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(Scalar::Bool(*b)),
        JsonValue::Number(n) => n.as_f64().map(Scalar::Number),
        JsonValue::String(s) => Some(Scalar::Text(s.clone())),
        JsonValue::Object(obj) => ["name", "email", "label", "url"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(JsonValue::as_str))
            .map(|s| Scalar::Text(s.to_string()))
            .or_else(|| Some(Scalar::Text(value.to_string()))),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(scalar_of)
                .map(|s| s.to_string())
                .collect();
            Some(Scalar::Text(parts.join(", ")))
        }
    }
}

/// Where a linked-record field points: the source table and the target tab/collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedTable {
    pub name: String,
    pub target: String,
}

#[derive(Debug)]
enum SchemaState {
    NotLoaded,
    Loaded(Vec<TableSchema>),
    Unavailable,
}

/// Memoized base metadata. A metadata failure degrades to empty schemas.
pub struct SchemaIntrospector {
    api: Arc<dyn SourceApi>,
    targets: HashMap<String, String>,
    state: SchemaState,
    warnings: Vec<String>,
}

impl SchemaIntrospector {
    /// `targets` maps source table names to target tab/collection names.
    pub fn new(api: Arc<dyn SourceApi>, targets: HashMap<String, String>) -> Self {
        Self {
            api,
            targets,
            state: SchemaState::NotLoaded,
            warnings: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub async fn load(&mut self) {
        if !matches!(self.state, SchemaState::NotLoaded) {
            return;
        }
        self.state = match self.api.base_schema().await {
            Ok(tables) => {
                info!(tables = tables.len(), "loaded base schema");
                SchemaState::Loaded(tables)
            }
            Err(e) => {
                warn!(error = %e, "schema metadata unavailable; continuing without it");
                self.warnings.push(format!("schema metadata unavailable: {e}"));
                SchemaState::Unavailable
            }
        };
    }

    fn tables(&self) -> &[TableSchema] {
        match &self.state {
            SchemaState::Loaded(tables) => tables,
            _ => &[],
        }
    }

    pub async fn table(&mut self, name: &str) -> Option<&TableSchema> {
        self.load().await;
        self.tables().iter().find(|t| t.name == name)
    }

    pub async fn schema_for(&mut self, name: &str) -> Vec<SchemaField> {
        self.table(name).await.map(|t| t.fields.clone()).unwrap_or_default()
    }

    /// Table id → logical name and target, across every table in the base.
    pub async fn table_lookup(&mut self) -> HashMap<String, LinkedTable> {
        self.load().await;
        self.tables()
            .iter()
            .map(|t| {
                let target = self.targets.get(&t.name).cloned().unwrap_or_else(|| t.name.clone());
                (
                    t.id.clone(),
                    LinkedTable {
                        name: t.name.clone(),
                        target,
                    },
                )
            })
            .collect()
    }
}
