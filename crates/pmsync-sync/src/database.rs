//! Relational target: full-replace import in dependency order with a second pass for
//! project-to-project references.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use pmsync_core::{EntityKind, SourceRecord};
use pmsync_storage::AttachmentMigrator;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::remap::IdentifierRemapper;

/// Tables emptied before an import, children first.
pub const CLEAR_ORDER: [&str; 7] = [
    "project_assignments",
    "documents",
    "messages",
    "items",
    "projects",
    "static_info",
    "users",
];

pub mod fields {
    pub const NAME: &str = "Name";
    pub const EMAIL: &str = "Email";
    pub const PHONE: &str = "Phone";
    pub const ROLE: &str = "Role";
    pub const COMPANY: &str = "Company";
    pub const PHOTO: &str = "Photo";

    pub const STATUS: &str = "Status";
    pub const PRIORITY: &str = "Priority";
    pub const DESCRIPTION: &str = "Description";
    pub const VENDOR: &str = "Vendor";
    pub const TEAM: &str = "Team";
    pub const START_DATE: &str = "Start Date";
    pub const DUE_DATE: &str = "Due Date";
    pub const BLOCKING: &str = "Blocking";
    pub const BLOCKED_BY: &str = "Blocked By";
    pub const ATTACHMENTS: &str = "Attachments";

    pub const ITEM: &str = "Item";
    pub const PROJECT: &str = "Project";
    pub const PURCHASED_BY: &str = "Purchased By";
    pub const QUANTITY: &str = "Quantity";
    pub const UNIT_COST: &str = "Unit Cost";
    pub const LINK: &str = "Link";
    pub const RECEIPT: &str = "Receipt";
    pub const NOTES: &str = "Notes";

    pub const KEY: &str = "Key";
    pub const VALUE: &str = "Value";
    pub const CATEGORY: &str = "Category";
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserRow {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub company: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectRow {
    pub name: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub description: Option<String>,
    pub vendor_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemRow {
    pub name: String,
    pub project_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub purchased_by: Option<Uuid>,
    pub status: Option<String>,
    pub quantity: Option<i32>,
    pub unit_cost: Option<f64>,
    pub link: Option<String>,
    pub receipt_url: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaticInfoRow {
    pub key: String,
    pub value: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub project_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub project_id: Uuid,
    pub name: String,
    pub url: String,
    pub file_id: Option<String>,
    pub mime_type: Option<String>,
}

/// Row-level operations against the application database.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    async fn delete_all(&self, table: &str) -> Result<u64>;
    async fn insert_user(&self, row: &UserRow) -> Result<Uuid>;
    async fn insert_project(&self, row: &ProjectRow) -> Result<Uuid>;
    async fn insert_item(&self, row: &ItemRow) -> Result<Uuid>;
    async fn insert_static_info(&self, row: &StaticInfoRow) -> Result<Uuid>;
    async fn insert_assignment(&self, row: &AssignmentRow) -> Result<()>;
    async fn insert_document(&self, row: &DocumentRow) -> Result<()>;
    async fn update_project_dependencies(
        &self,
        project_id: Uuid,
        blocking: &[Uuid],
        blocked_by: &[Uuid],
    ) -> Result<()>;
}

pub struct PgTargetDatabase {
    pool: PgPool,
}

impl PgTargetDatabase {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to target database")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TargetDatabase for PgTargetDatabase {
    async fn delete_all(&self, table: &str) -> Result<u64> {
        anyhow::ensure!(CLEAR_ORDER.contains(&table), "refusing to clear unknown table {table}");
        let done = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("clearing {table}"))?;
        Ok(done.rows_affected())
    }

    async fn insert_user(&self, row: &UserRow) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO users (name, email, phone, role, company, avatar_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&row.name)
        .bind(&row.email)
        .bind(&row.phone)
        .bind(&row.role)
        .bind(&row.company)
        .bind(&row.avatar_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_project(&self, row: &ProjectRow) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO projects
                (name, status, priority, description, vendor_id,
                 start_date, due_date, blocking, blocked_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, '{}', '{}')
            RETURNING id
            "#,
        )
        .bind(&row.name)
        .bind(&row.status)
        .bind(&row.priority)
        .bind(&row.description)
        .bind(row.vendor_id)
        .bind(row.start_date)
        .bind(row.due_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_item(&self, row: &ItemRow) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO items
                (name, project_id, vendor_id, purchased_by, status,
                 quantity, unit_cost, link, receipt_url, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&row.name)
        .bind(row.project_id)
        .bind(row.vendor_id)
        .bind(row.purchased_by)
        .bind(&row.status)
        .bind(row.quantity)
        .bind(row.unit_cost)
        .bind(&row.link)
        .bind(&row.receipt_url)
        .bind(&row.notes)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_static_info(&self, row: &StaticInfoRow) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO static_info (key, value, category) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&row.key)
        .bind(&row.value)
        .bind(&row.category)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_assignment(&self, row: &AssignmentRow) -> Result<()> {
        sqlx::query("INSERT INTO project_assignments (project_id, user_id) VALUES ($1, $2)")
            .bind(row.project_id)
            .bind(row.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_document(&self, row: &DocumentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (project_id, name, url, file_id, mime_type)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.project_id)
        .bind(&row.name)
        .bind(&row.url)
        .bind(&row.file_id)
        .bind(&row.mime_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_project_dependencies(
        &self,
        project_id: Uuid,
        blocking: &[Uuid],
        blocked_by: &[Uuid],
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET blocking = $2, blocked_by = $3 WHERE id = $1")
            .bind(project_id)
            .bind(blocking.to_vec())
            .bind(blocked_by.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub migrated: usize,
    pub failed: usize,
}

/// Airtable dates are `YYYY-MM-DD`; date-times are truncated to the date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let head = value.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

struct PendingDependencies {
    project_id: Uuid,
    source_id: String,
    blocking: Vec<String>,
    blocked_by: Vec<String>,
}

/// One database import run. Owns the identifier maps for the run.
pub struct DatabaseMigrator<'a> {
    db: &'a dyn TargetDatabase,
    attachments: &'a mut AttachmentMigrator,
    remapper: IdentifierRemapper<Uuid>,
    outcomes: BTreeMap<EntityKind, EntityOutcome>,
    pending: Vec<PendingDependencies>,
    row_warnings: Vec<String>,
    dependency_updates: usize,
}

impl<'a> DatabaseMigrator<'a> {
    pub fn new(db: &'a dyn TargetDatabase, attachments: &'a mut AttachmentMigrator) -> Self {
        Self {
            db,
            attachments,
            remapper: IdentifierRemapper::new(),
            outcomes: BTreeMap::new(),
            pending: Vec::new(),
            row_warnings: Vec::new(),
            dependency_updates: 0,
        }
    }

    pub fn remapper(&self) -> &IdentifierRemapper<Uuid> {
        &self.remapper
    }

    pub fn outcomes(&self) -> &BTreeMap<EntityKind, EntityOutcome> {
        &self.outcomes
    }

    pub fn row_warnings(&self) -> &[String] {
        &self.row_warnings
    }

    pub fn dependency_updates(&self) -> usize {
        self.dependency_updates
    }

    /// Destructive: empties every target table, children first.
    pub async fn clear_target(&self) -> Result<()> {
        for table in CLEAR_ORDER {
            let removed = self.db.delete_all(table).await?;
            info!(table, removed, "cleared target table");
        }
        Ok(())
    }

    fn note(&mut self, kind: EntityKind, record_id: &str, result: Result<Uuid>) -> Option<Uuid> {
        let outcome = self.outcomes.entry(kind).or_default();
        match result {
            Ok(id) => {
                outcome.migrated += 1;
                self.remapper.record(kind.as_str(), record_id, id);
                info!(entity = %kind, record = record_id, %id, "migrated");
                Some(id)
            }
            Err(e) => {
                outcome.failed += 1;
                warn!(entity = %kind, record = record_id, error = %e, "insert failed; continuing");
                None
            }
        }
    }

    async fn first_attachment_url(
        &mut self,
        record: &SourceRecord,
        field: &str,
        folder: &str,
    ) -> Option<String> {
        let descriptor = record.attachments(field).first()?;
        self.attachments
            .resolve(descriptor, folder, &record.id)
            .await
            .map(|r| r.url)
    }

    pub async fn migrate_users(&mut self, records: &[SourceRecord]) {
        use fields::*;
        self.outcomes.entry(EntityKind::Users).or_default();
        for record in records {
            let row = UserRow {
                name: record.text(NAME).unwrap_or_default(),
                email: record.text(EMAIL),
                phone: record.text(PHONE),
                role: record.text(ROLE),
                company: record.text(COMPANY),
                avatar_url: self.first_attachment_url(record, PHOTO, "users").await,
            };
            let result = self.db.insert_user(&row).await;
            self.note(EntityKind::Users, &record.id, result);
        }
    }

    /// First pass: vendor and team resolve against users; blocking links are deferred.
    pub async fn migrate_projects(&mut self, records: &[SourceRecord]) {
        use fields::*;
        let users = EntityKind::Users.as_str();
        self.outcomes.entry(EntityKind::Projects).or_default();
        for record in records {
            let vendor_id = self.remapper.resolve_first(users, record.links(VENDOR));
            let row = ProjectRow {
                name: record.text(NAME).unwrap_or_default(),
                status: record.text(STATUS),
                priority: record.text(PRIORITY),
                description: record.text(DESCRIPTION),
                vendor_id,
                start_date: record.text(START_DATE).as_deref().and_then(parse_date),
                due_date: record.text(DUE_DATE).as_deref().and_then(parse_date),
            };
            let result = self.db.insert_project(&row).await;
            let Some(project_id) = self.note(EntityKind::Projects, &record.id, result) else {
                continue;
            };

            let team = self.remapper.resolve_all(users, record.links(TEAM));
            for user_id in team {
                let assignment = AssignmentRow { project_id, user_id };
                if let Err(e) = self.db.insert_assignment(&assignment).await {
                    self.row_warning(&record.id, format!("team assignment {user_id}: {e}"));
                }
            }

            for descriptor in record.attachments(ATTACHMENTS) {
                let resolved = self
                    .attachments
                    .resolve(descriptor, "projects", &record.id)
                    .await;
                let Some(resolved) = resolved else {
                    continue;
                };
                let doc = DocumentRow {
                    project_id,
                    name: descriptor.filename.clone(),
                    url: resolved.url,
                    file_id: resolved.file_id,
                    mime_type: Some(descriptor.mime_type.clone()).filter(|m| !m.is_empty()),
                };
                if let Err(e) = self.db.insert_document(&doc).await {
                    self.row_warning(&record.id, format!("document {}: {e}", descriptor.filename));
                }
            }

            let blocking = record.links(BLOCKING).to_vec();
            let blocked_by = record.links(BLOCKED_BY).to_vec();
            if !blocking.is_empty() || !blocked_by.is_empty() {
                self.pending.push(PendingDependencies {
                    project_id,
                    source_id: record.id.clone(),
                    blocking,
                    blocked_by,
                });
            }
        }
    }

    /// Second pass: every project now has a target id.
    pub async fn resolve_project_dependencies(&mut self) {
        let projects = EntityKind::Projects.as_str();
        for pending in std::mem::take(&mut self.pending) {
            let blocking = self.remapper.resolve_all(projects, &pending.blocking);
            let blocked_by = self.remapper.resolve_all(projects, &pending.blocked_by);
            match self
                .db
                .update_project_dependencies(pending.project_id, &blocking, &blocked_by)
                .await
            {
                Ok(()) => self.dependency_updates += 1,
                Err(e) => self.row_warning(&pending.source_id, format!("dependency update: {e}")),
            }
        }
    }

    pub async fn migrate_items(&mut self, records: &[SourceRecord]) {
        use fields::*;
        let users = EntityKind::Users.as_str();
        let projects = EntityKind::Projects.as_str();
        self.outcomes.entry(EntityKind::Items).or_default();
        for record in records {
            let project_id = self.remapper.resolve_first(projects, record.links(PROJECT));
            let vendor_id = self.remapper.resolve_first(users, record.links(VENDOR));
            let purchased_by = self.remapper.resolve_first(users, record.links(PURCHASED_BY));
            let row = ItemRow {
                name: record.text(ITEM).or_else(|| record.text(NAME)).unwrap_or_default(),
                project_id,
                vendor_id,
                purchased_by,
                status: record.text(STATUS),
                quantity: record.number(QUANTITY).map(|q| q.round() as i32),
                unit_cost: record.number(UNIT_COST),
                link: record.text(LINK),
                receipt_url: self.first_attachment_url(record, RECEIPT, "items").await,
                notes: record.text(NOTES),
            };
            let result = self.db.insert_item(&row).await;
            self.note(EntityKind::Items, &record.id, result);
        }
    }

    pub async fn migrate_static_info(&mut self, records: &[SourceRecord]) {
        use fields::*;
        self.outcomes.entry(EntityKind::StaticInfo).or_default();
        for record in records {
            let row = StaticInfoRow {
                key: record.text(KEY).or_else(|| record.text(NAME)).unwrap_or_default(),
                value: record.text(VALUE),
                category: record.text(CATEGORY),
            };
            let result = self.db.insert_static_info(&row).await;
            self.note(EntityKind::StaticInfo, &record.id, result);
        }
    }

    fn row_warning(&mut self, record_id: &str, message: String) {
        warn!(record = record_id, "{message}");
        self.row_warnings.push(format!("{record_id}: {message}"));
    }
}
