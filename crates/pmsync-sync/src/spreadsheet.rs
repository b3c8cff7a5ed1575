//! Spreadsheet target: read every table, write and format one tab per table, then link tabs.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use pmsync_core::{FieldValue, SchemaField, SourceRecord, TableSchema, WithWarnings};
use pmsync_source::{fetch_all, LinkedTable, SchemaIntrospector, SourceApi, SourceError};
use pmsync_storage::AttachmentMigrator;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

use crate::layout::{self, ColumnDescriptor, ColumnRole, MAX_PREVIEWS, PREVIEW_FORMULA};
use crate::remap::IdentifierRemapper;
use crate::sheets::SpreadsheetApi;
use crate::{LookupRule, TableEntry};

/// One registered table after Phase 0.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: String,
    pub sheet: String,
    /// Durable-store folder for this table's attachments.
    pub folder: String,
    pub schema: Option<TableSchema>,
    pub records: Vec<SourceRecord>,
}

impl LoadedTable {
    fn fields(&self) -> &[SchemaField] {
        self.schema.as_ref().map(|s| s.fields.as_slice()).unwrap_or(&[])
    }
}

/// Phase 0: fetch every registered table. Any fetch failure aborts the run.
pub async fn read_tables(
    api: &dyn SourceApi,
    introspector: &mut SchemaIntrospector,
    entries: &[TableEntry],
) -> Result<Vec<LoadedTable>, SourceError> {
    let mut loaded = Vec::with_capacity(entries.len());
    for entry in entries {
        let schema = introspector.table(&entry.table).await.cloned();
        let fields = schema.as_ref().map(|s| s.fields.clone()).unwrap_or_default();
        let records = fetch_all(api, &entry.table, &fields).await?;
        loaded.push(LoadedTable {
            table: entry.table.clone(),
            sheet: entry.sheet_name().to_string(),
            folder: entry.folder(),
            schema,
            records,
        });
    }
    Ok(loaded)
}

/// Where a source record landed: its sheet row and the text other tabs show for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRef {
    pub row: usize,
    pub display: String,
}

/// Primary field value, else the first name-like field, else the record id.
pub fn display_name(record: &SourceRecord, schema: Option<&TableSchema>) -> String {
    schema
        .and_then(TableSchema::primary_field)
        .and_then(|f| record.text(&f.name))
        .or_else(|| {
            layout::NAME_COLUMN_CANDIDATES
                .iter()
                .find_map(|name| record.text(name))
        })
        .unwrap_or_else(|| record.id.clone())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TabReport {
    pub sheet: String,
    pub rows: usize,
    pub columns: usize,
    pub linked_columns: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SheetSyncReport {
    pub tabs: Vec<TabReport>,
    pub warnings: Vec<String>,
    pub unresolved: BTreeMap<String, usize>,
}

struct WrittenTab {
    sheet: String,
    sheet_id: i64,
    columns: Vec<ColumnDescriptor>,
    /// Link field name → target sheet.
    link_fields: HashMap<String, String>,
    row_count: usize,
}

#[derive(Default)]
struct ResolvedFiles {
    images: Vec<String>,
    others: Vec<String>,
}

pub struct SheetSyncer<'a> {
    sheets: &'a dyn SpreadsheetApi,
    attachments: &'a mut AttachmentMigrator,
    lookup_rules: &'a [LookupRule],
    link_targets: HashMap<String, LinkedTable>,
    remapper: IdentifierRemapper<SheetRef>,
    existing: HashMap<String, i64>,
    name_columns: HashMap<String, Option<usize>>,
}

impl<'a> SheetSyncer<'a> {
    /// `link_targets` maps source table ids to their tab, as produced by the schema introspector.
    pub fn new(
        sheets: &'a dyn SpreadsheetApi,
        attachments: &'a mut AttachmentMigrator,
        lookup_rules: &'a [LookupRule],
        link_targets: HashMap<String, LinkedTable>,
    ) -> Self {
        Self {
            sheets,
            attachments,
            lookup_rules,
            link_targets,
            remapper: IdentifierRemapper::new(),
            existing: HashMap::new(),
            name_columns: HashMap::new(),
        }
    }

    pub async fn run(mut self, tables: &[LoadedTable]) -> Result<SheetSyncReport> {
        for table in tables {
            let schema = table.schema.as_ref();
            for (index, record) in table.records.iter().enumerate() {
                let target = SheetRef {
                    row: index + 2,
                    display: display_name(record, schema),
                };
                self.remapper.record(&table.sheet, &record.id, target);
            }
        }

        self.existing = self
            .sheets
            .list_sheets()
            .await
            .context("listing spreadsheet tabs")?
            .into_iter()
            .map(|s| (s.title, s.sheet_id))
            .collect();

        let mut report = SheetSyncReport::default();
        let mut written = Vec::with_capacity(tables.len());
        for table in tables {
            let span = info_span!("tab", sheet = %table.sheet);
            let tab = self.write_tab(table).instrument(span).await?;
            report.warnings.extend(tab.warnings);
            written.push(tab.value);
        }

        for tab in &written {
            let linked = self.link_tab(tab).await;
            report.tabs.push(TabReport {
                sheet: tab.sheet.clone(),
                rows: tab.row_count.saturating_sub(1),
                columns: tab.columns.len(),
                linked_columns: linked.value,
            });
            report.warnings.extend(linked.warnings);
        }

        report.unresolved = self.remapper.unresolved().clone();
        Ok(report)
    }

    /// Phase 1 for one table. Recreating or writing the tab is fatal; formatting is not.
    async fn write_tab(&mut self, table: &LoadedTable) -> Result<WithWarnings<WrittenTab>> {
        let fields = table.fields();
        let columns = layout::build_columns(fields, &table.records);
        let link_fields: HashMap<String, String> = fields
            .iter()
            .filter(|f| f.is_link())
            .filter_map(|f| {
                let target = self.link_targets.get(f.linked_table_id.as_deref()?)?;
                Some((f.name.clone(), target.target.clone()))
            })
            .collect();

        let mut rows = Vec::with_capacity(table.records.len() + 1);
        rows.push(columns.iter().map(ColumnDescriptor::header).collect::<Vec<_>>());
        for record in &table.records {
            let row = self.build_row(record, &columns, &link_fields, &table.folder).await;
            rows.push(row);
        }

        let sheet_id = self
            .recreate_tab(&table.sheet)
            .await
            .with_context(|| format!("recreating tab '{}'", table.sheet))?;
        self.sheets
            .write_values(&table.sheet, &rows)
            .await
            .with_context(|| format!("writing tab '{}'", table.sheet))?;
        info!(rows = table.records.len(), columns = columns.len(), "tab written");

        let tab = WrittenTab {
            sheet: table.sheet.clone(),
            sheet_id,
            columns,
            link_fields,
            row_count: rows.len(),
        };
        let mut out = WithWarnings::new(());
        self.format_tab(&tab, fields, &mut out).await;
        Ok(WithWarnings {
            value: tab,
            warnings: out.warnings,
        })
    }

    async fn build_row(
        &mut self,
        record: &SourceRecord,
        columns: &[ColumnDescriptor],
        link_fields: &HashMap<String, String>,
        folder: &str,
    ) -> Vec<String> {
        let mut files: HashMap<&str, ResolvedFiles> = HashMap::new();
        let mut row = Vec::with_capacity(columns.len());

        for column in columns {
            let field = column.base_field.as_str();
            if column.role != ColumnRole::Value && !files.contains_key(field) {
                let mut resolved = ResolvedFiles::default();
                for descriptor in record.attachments(field) {
                    let r = self.attachments.resolve(descriptor, folder, &record.id).await;
                    let Some(r) = r else {
                        continue;
                    };
                    if descriptor.is_image() {
                        resolved.images.push(r.url);
                    } else {
                        resolved.others.push(r.url);
                    }
                }
                files.insert(field, resolved);
            }

            let cell = match column.role {
                ColumnRole::Value => self.value_cell(record.field(field), link_fields.get(field)),
                ColumnRole::Url => files[field]
                    .images
                    .get(column.variant_index - 1)
                    .cloned()
                    .unwrap_or_default(),
                ColumnRole::Preview => {
                    if files[field].images.len() >= column.variant_index {
                        PREVIEW_FORMULA.to_string()
                    } else {
                        String::new()
                    }
                }
                ColumnRole::Overflow => {
                    let f = &files[field];
                    f.images
                        .iter()
                        .skip(MAX_PREVIEWS)
                        .chain(f.others.iter())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            };
            row.push(cell);
        }
        row
    }

    fn value_cell(&mut self, value: Option<&FieldValue>, link_target: Option<&String>) -> String {
        match value {
            None => String::new(),
            Some(FieldValue::Links(ids)) => {
                let names: Vec<String> = ids
                    .iter()
                    .filter_map(|id| match link_target {
                        Some(sheet) => self.remapper.resolve(sheet, id),
                        None => self.remapper.resolve_anywhere(id),
                    })
                    .map(|r| r.display)
                    .collect();
                names.join(", ")
            }
            Some(other) => other.to_cell_text(),
        }
    }

    /// Replace a tab in place: add a temporary tab, drop the old one, rename.
    async fn recreate_tab(&mut self, title: &str) -> Result<i64> {
        let Some(old_id) = self.existing.get(title).copied() else {
            let id = self.sheets.add_sheet(title).await?;
            self.existing.insert(title.to_string(), id);
            return Ok(id);
        };

        let temp = format!("{title}__pmsync");
        if let Some(stale) = self.existing.remove(&temp) {
            self.sheets.delete_sheet(stale).await?;
        }
        let id = self.sheets.add_sheet(&temp).await?;
        self.sheets.delete_sheet(old_id).await?;
        self.sheets
            .batch_update(vec![layout::rename_sheet(id, title)])
            .await?;
        self.existing.insert(title.to_string(), id);
        debug!(title, old_id, new_id = id, "tab recreated");
        Ok(id)
    }

    async fn cosmetic(
        &self,
        out: &mut WithWarnings<()>,
        sheet: &str,
        step: &str,
        requests: Vec<JsonValue>,
    ) -> bool {
        match self.sheets.batch_update(requests).await {
            Ok(()) => true,
            Err(e) => {
                debug!(sheet, step, error = %e, "formatting step failed");
                out.warn(format!("{sheet}: {step} failed: {e}"));
                false
            }
        }
    }

    async fn format_tab(
        &self,
        tab: &WrittenTab,
        fields: &[SchemaField],
        out: &mut WithWarnings<()>,
    ) {
        let id = tab.sheet_id;
        let width = tab.columns.len();
        let sheet = tab.sheet.as_str();
        let filter = || vec![layout::basic_filter(id, tab.row_count, width)];

        self.cosmetic(out, sheet, "freeze header", vec![layout::freeze_header(id)]).await;
        self.cosmetic(out, sheet, "bold header", vec![layout::bold_header(id, width)]).await;
        if tab.row_count < 2 {
            self.cosmetic(out, sheet, "basic filter", filter()).await;
            return;
        }
        self.cosmetic(
            out,
            sheet,
            "row height",
            vec![layout::data_row_height(id, tab.row_count, layout::PREVIEW_ROW_HEIGHT_PX)],
        )
        .await;
        self.cosmetic(out, sheet, "basic filter", filter()).await;

        for field in fields.iter().filter(|f| f.is_select()) {
            let Some(column) = value_column(&tab.columns, &field.name) else {
                continue;
            };
            let names: Vec<String> = field.choices.iter().map(|c| c.name.clone()).collect();
            let step = format!("dropdown for {}", field.name);
            let dropdown = layout::one_of_list(id, column, tab.row_count, &names);
            self.cosmetic(out, sheet, &step, vec![dropdown]).await;

            let colours: Vec<JsonValue> = field
                .choices
                .iter()
                .filter_map(|c| {
                    let rgb = layout::choice_color(c.color.as_deref()?)?;
                    Some(layout::text_eq_color(id, column, tab.row_count, &c.name, rgb))
                })
                .collect();
            if !colours.is_empty() {
                let step = format!("colours for {}", field.name);
                self.cosmetic(out, sheet, &step, colours).await;
            }
        }
    }

    /// Phase 2 for one tab; returns how many columns got a cross-tab dropdown.
    async fn link_tab(&mut self, tab: &WrittenTab) -> WithWarnings<usize> {
        let mut out = WithWarnings::new(());
        let mut linked = 0;
        if tab.row_count < 2 {
            return WithWarnings { value: 0, warnings: out.warnings };
        }

        for (column, descriptor) in tab.columns.iter().enumerate() {
            if descriptor.role != ColumnRole::Value {
                continue;
            }
            let header = descriptor.header();
            let target = tab.link_fields.get(&descriptor.base_field).cloned().or_else(|| {
                self.lookup_rules
                    .iter()
                    .find(|rule| rule.matches(&header))
                    .map(|rule| rule.target_sheet.clone())
            });
            let Some(target) = target else {
                continue;
            };
            if !self.existing.contains_key(&target) {
                out.warn(format!(
                    "{}: column '{header}' links to missing tab '{target}'",
                    tab.sheet
                ));
                continue;
            }
            let Some(name_column) = self.name_column(&target, &mut out).await else {
                continue;
            };
            let request =
                layout::one_of_range(tab.sheet_id, column, tab.row_count, &target, name_column);
            let step = format!("link dropdown for '{header}'");
            if self.cosmetic(&mut out, &tab.sheet, &step, vec![request]).await {
                linked += 1;
            }
        }
        WithWarnings {
            value: linked,
            warnings: out.warnings,
        }
    }

    /// Display-name column of a tab, discovered from its header row and memoized.
    async fn name_column(&mut self, sheet: &str, out: &mut WithWarnings<()>) -> Option<usize> {
        if let Some(cached) = self.name_columns.get(sheet) {
            return *cached;
        }
        let range = format!("{}!1:1", layout::quote_sheet_name(sheet));
        let found = match self.sheets.read_values(&range).await {
            Ok(rows) => {
                let headers = rows.into_iter().next().unwrap_or_default();
                let found = layout::find_name_column(&headers);
                if found.is_none() {
                    out.warn(format!("tab '{sheet}' has no display-name column"));
                }
                found
            }
            Err(e) => {
                debug!(sheet, error = %e, "reading header row failed");
                out.warn(format!("reading header row of '{sheet}' failed: {e}"));
                None
            }
        };
        self.name_columns.insert(sheet.to_string(), found);
        found
    }
}

fn value_column(columns: &[ColumnDescriptor], field: &str) -> Option<usize> {
    columns
        .iter()
        .position(|c| c.role == ColumnRole::Value && c.base_field == field)
}
