//! Core domain model for the pmsync reconciliation pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pmsync-core";

/// Single typed cell value coming out of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(s) => f.write_str(s),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Binary file referenced by a source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub remote_url: String,
    pub filename: String,
    pub mime_type: String,
}

impl AttachmentDescriptor {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Result of moving one attachment into the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedAttachment {
    pub durable_url: String,
    pub durable_file_id: String,
}

/// Field value classified once at ingestion so downstream code can match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(Scalar),
    ScalarList(Vec<Scalar>),
    Attachments(Vec<AttachmentDescriptor>),
    Links(Vec<String>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Scalar(Scalar::Text(value.into()))
    }

    pub fn links<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldValue::Links(ids.into_iter().map(Into::into).collect())
    }

    /// Plain-text rendering used by spreadsheet cells and text columns.
    pub fn to_cell_text(&self) -> String {
        match self {
            FieldValue::Scalar(s) => s.to_string(),
            FieldValue::ScalarList(items) => join_display(items.iter()),
            FieldValue::Attachments(files) => join_display(files.iter().map(|a| &a.remote_url)),
            FieldValue::Links(ids) => join_display(ids.iter()),
        }
    }
}

fn join_display<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

/// One row fetched from the source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub created_time: DateTime<Utc>,
    /// Fields in the order the source returned them.
    pub fields: IndexMap<String, FieldValue>,
}

impl SourceRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Text view of a field; empty strings collapse to `None`.
    pub fn text(&self, name: &str) -> Option<String> {
        let text = self.field(name)?.to_cell_text();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.field(name)? {
            FieldValue::Scalar(Scalar::Number(n)) => Some(*n),
            FieldValue::Scalar(Scalar::Text(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn links(&self, name: &str) -> &[String] {
        match self.field(name) {
            Some(FieldValue::Links(ids)) => ids,
            _ => &[],
        }
    }

    pub fn attachments(&self, name: &str) -> &[AttachmentDescriptor] {
        match self.field(name) {
            Some(FieldValue::Attachments(files)) => files,
            _ => &[],
        }
    }
}

/// Airtable record ids are `rec` followed by 14 alphanumerics.
pub fn looks_like_record_id(value: &str) -> bool {
    value.len() == 17
        && value.starts_with("rec")
        && value[3..].chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub id: String,
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub linked_table_id: Option<String>,
}

impl SchemaField {
    pub fn is_select(&self) -> bool {
        matches!(self.field_type.as_str(), "singleSelect" | "multipleSelects")
            && !self.choices.is_empty()
    }

    pub fn is_link(&self) -> bool {
        self.field_type == "multipleRecordLinks" && self.linked_table_id.is_some()
    }

    pub fn is_attachment(&self) -> bool {
        self.field_type == "multipleAttachments"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: String,
    pub name: String,
    pub primary_field_id: Option<String>,
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn primary_field(&self) -> Option<&SchemaField> {
        let primary = self.primary_field_id.as_deref()?;
        self.fields.iter().find(|f| f.id == primary)
    }
}

/// Entity types migrated into the relational database, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Users,
    Projects,
    Items,
    StaticInfo,
}

impl EntityKind {
    pub const MIGRATION_ORDER: [EntityKind; 4] = [
        EntityKind::Users,
        EntityKind::Projects,
        EntityKind::Items,
        EntityKind::StaticInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Projects => "projects",
            EntityKind::Items => "items",
            EntityKind::StaticInfo => "static_info",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value produced by a best-effort step, together with the non-fatal problems it hit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WithWarnings<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> WithWarnings<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

}
