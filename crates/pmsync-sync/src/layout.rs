//! Spreadsheet column layout and Sheets v4 formatting requests.

use std::cmp::Ordering;
use std::collections::HashSet;

use pmsync_core::{FieldValue, SchemaField, SourceRecord};
use serde_json::{json, Value as JsonValue};

/// Image previews rendered per attachment field; the rest go to the overflow column.
pub const MAX_PREVIEWS: usize = 3;
pub const PREVIEW_ROW_HEIGHT_PX: i64 = 100;
pub const PREVIEW_FORMULA: &str =
    r#"=IF(INDIRECT("RC[-1]",FALSE)="","",IMAGE(INDIRECT("RC[-1]",FALSE)))"#;

/// Header names tried, in order, when looking for a tab's display-name column.
pub const NAME_COLUMN_CANDIDATES: [&str; 6] =
    ["Name", "Full Name", "Project Name", "Item", "Title", "Key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnRole {
    Value,
    Url,
    Preview,
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    pub base_field: String,
    /// Position of the source field in the tab.
    pub field_index: usize,
    /// 1-based attachment slot; 0 for plain values.
    pub variant_index: usize,
    pub role: ColumnRole,
}

impl ColumnDescriptor {
    pub fn value(base_field: &str, field_index: usize) -> Self {
        Self {
            base_field: base_field.to_string(),
            field_index,
            variant_index: 0,
            role: ColumnRole::Value,
        }
    }

    pub fn header(&self) -> String {
        match self.role {
            ColumnRole::Value => self.base_field.clone(),
            ColumnRole::Url => format!("{} {} URL", self.base_field, self.variant_index),
            ColumnRole::Preview => format!("{} {}", self.base_field, self.variant_index),
            ColumnRole::Overflow => format!("{} (more)", self.base_field),
        }
    }

    fn sort_key(&self) -> (usize, usize, ColumnRole) {
        (self.field_index, self.variant_index, self.role)
    }
}

impl Ord for ColumnDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.base_field.cmp(&other.base_field))
    }
}

impl PartialOrd for ColumnDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Schema order first, then any record fields the schema does not know, in first-seen order.
pub fn field_order(schema: &[SchemaField], records: &[SourceRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let names = schema
        .iter()
        .map(|f| f.name.as_str())
        .chain(records.iter().flat_map(|r| r.fields.keys().map(String::as_str)));
    for name in names {
        if seen.insert(name) {
            order.push(name.to_string());
        }
    }
    order
}

#[derive(Debug, Default)]
struct AttachmentShape {
    seen: bool,
    max_images: usize,
    overflow: bool,
}

fn attachment_shape(
    field: &str,
    schema: &[SchemaField],
    records: &[SourceRecord],
) -> AttachmentShape {
    let mut shape = AttachmentShape {
        seen: schema.iter().any(|f| f.name == field && f.is_attachment()),
        ..Default::default()
    };
    for record in records {
        if let Some(FieldValue::Attachments(files)) = record.field(field) {
            shape.seen = true;
            let images = files.iter().filter(|f| f.is_image()).count();
            shape.max_images = shape.max_images.max(images.min(MAX_PREVIEWS));
            if images > MAX_PREVIEWS || images < files.len() {
                shape.overflow = true;
            }
        }
    }
    shape
}

/// Column plan for one tab, already sorted.
pub fn build_columns(schema: &[SchemaField], records: &[SourceRecord]) -> Vec<ColumnDescriptor> {
    let mut columns = Vec::new();
    for (field_index, name) in field_order(schema, records).iter().enumerate() {
        let shape = attachment_shape(name, schema, records);
        if !shape.seen {
            columns.push(ColumnDescriptor::value(name, field_index));
            continue;
        }

        let pairs = if shape.max_images == 0 && !shape.overflow {
            1
        } else {
            shape.max_images
        };
        for variant_index in 1..=pairs {
            for role in [ColumnRole::Url, ColumnRole::Preview] {
                columns.push(ColumnDescriptor {
                    base_field: name.clone(),
                    field_index,
                    variant_index,
                    role,
                });
            }
        }
        if shape.overflow {
            columns.push(ColumnDescriptor {
                base_field: name.clone(),
                field_index,
                variant_index: MAX_PREVIEWS + 1,
                role: ColumnRole::Overflow,
            });
        }
    }
    columns.sort();
    columns
}

/// 0-based column index to A1 letters.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// `'Tab Name'` with embedded quotes doubled.
pub fn quote_sheet_name(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Data-column range below the header, open-ended: `='Tab'!B2:B`.
pub fn data_column_range(title: &str, column: usize) -> String {
    let letter = column_letter(column);
    format!("={}!{letter}2:{letter}", quote_sheet_name(title))
}

const PALETTE: [(&str, [&str; 4]); 10] = [
    ("blue", ["cfdfff", "9cc7ff", "2d7ff9", "2750ae"]),
    ("cyan", ["d0f0fd", "77d1f3", "18bfff", "0b76b7"]),
    ("teal", ["c2f5e9", "72ddc3", "20d9d2", "06a09b"]),
    ("green", ["d1f7c4", "93e088", "20c933", "338a17"]),
    ("yellow", ["ffeab6", "ffd66e", "fcb400", "b87503"]),
    ("orange", ["fee2d5", "ffa981", "ff6f2c", "d74d26"]),
    ("red", ["ffdce5", "ff9eb7", "f82b60", "ba1e45"]),
    ("pink", ["ffdaf6", "f99de2", "ff08c2", "b2158b"]),
    ("purple", ["ede2fe", "cdb0ff", "8b46ff", "6b1cb0"]),
    ("gray", ["eeeeee", "cccccc", "666666", "444444"]),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Rgb {
    fn from_hex(hex: &str) -> Option<Self> {
        let channel = |range: std::ops::Range<usize>| -> Option<f64> {
            u8::from_str_radix(hex.get(range)?, 16)
                .ok()
                .map(|v| f64::from(v) / 255.0)
        };
        Some(Self {
            red: channel(0..2)?,
            green: channel(2..4)?,
            blue: channel(4..6)?,
        })
    }

    pub fn to_json(self) -> JsonValue {
        json!({ "red": self.red, "green": self.green, "blue": self.blue })
    }
}

/// Airtable choice colours look like `blueLight2`, `greenBright`, `redDark1`.
pub fn choice_color(name: &str) -> Option<Rgb> {
    let shade = [("Light2", 0), ("Light1", 1), ("Bright", 2), ("Dark1", 3)]
        .into_iter()
        .find_map(|(suffix, idx)| name.strip_suffix(suffix).map(|base| (base, idx)));
    let (base, idx) = shade.unwrap_or((name, 0));
    let base = base.to_ascii_lowercase();
    let base = if base == "grey" { "gray".to_string() } else { base };
    PALETTE
        .iter()
        .find(|(color, _)| *color == base)
        .and_then(|(_, shades)| Rgb::from_hex(shades[idx]))
}

fn grid_range(sheet_id: i64, rows: (usize, usize), cols: (usize, usize)) -> JsonValue {
    json!({
        "sheetId": sheet_id,
        "startRowIndex": rows.0,
        "endRowIndex": rows.1,
        "startColumnIndex": cols.0,
        "endColumnIndex": cols.1,
    })
}

pub fn freeze_header(sheet_id: i64) -> JsonValue {
    json!({
        "updateSheetProperties": {
            "properties": { "sheetId": sheet_id, "gridProperties": { "frozenRowCount": 1 } },
            "fields": "gridProperties.frozenRowCount"
        }
    })
}

pub fn bold_header(sheet_id: i64, column_count: usize) -> JsonValue {
    json!({
        "repeatCell": {
            "range": grid_range(sheet_id, (0, 1), (0, column_count)),
            "cell": { "userEnteredFormat": { "textFormat": { "bold": true } } },
            "fields": "userEnteredFormat.textFormat.bold"
        }
    })
}

/// Fixed height for rows `1..row_count` (everything under the header).
pub fn data_row_height(sheet_id: i64, row_count: usize, pixels: i64) -> JsonValue {
    json!({
        "updateDimensionProperties": {
            "range": {
                "sheetId": sheet_id,
                "dimension": "ROWS",
                "startIndex": 1,
                "endIndex": row_count
            },
            "properties": { "pixelSize": pixels },
            "fields": "pixelSize"
        }
    })
}

pub fn basic_filter(sheet_id: i64, row_count: usize, column_count: usize) -> JsonValue {
    json!({
        "setBasicFilter": {
            "filter": { "range": grid_range(sheet_id, (0, row_count), (0, column_count)) }
        }
    })
}

pub fn rename_sheet(sheet_id: i64, title: &str) -> JsonValue {
    json!({
        "updateSheetProperties": {
            "properties": { "sheetId": sheet_id, "title": title },
            "fields": "title"
        }
    })
}

pub fn one_of_list(sheet_id: i64, column: usize, row_count: usize, values: &[String]) -> JsonValue {
    let values: Vec<JsonValue> = values.iter().map(|v| json!({ "userEnteredValue": v })).collect();
    json!({
        "setDataValidation": {
            "range": grid_range(sheet_id, (1, row_count), (column, column + 1)),
            "rule": {
                "condition": { "type": "ONE_OF_LIST", "values": values },
                "showCustomUi": true,
                "strict": false
            }
        }
    })
}

pub fn text_eq_color(
    sheet_id: i64,
    column: usize,
    row_count: usize,
    value: &str,
    color: Rgb,
) -> JsonValue {
    json!({
        "addConditionalFormatRule": {
            "index": 0,
            "rule": {
                "ranges": [grid_range(sheet_id, (1, row_count), (column, column + 1))],
                "booleanRule": {
                    "condition": { "type": "TEXT_EQ", "values": [{ "userEnteredValue": value }] },
                    "format": { "backgroundColor": color.to_json() }
                }
            }
        }
    })
}

/// Dropdown backed by another tab's display-name column.
pub fn one_of_range(
    sheet_id: i64,
    column: usize,
    row_count: usize,
    target_title: &str,
    target_column: usize,
) -> JsonValue {
    let source = data_column_range(target_title, target_column);
    json!({
        "setDataValidation": {
            "range": grid_range(sheet_id, (1, row_count), (column, column + 1)),
            "rule": {
                "condition": {
                    "type": "ONE_OF_RANGE",
                    "values": [{ "userEnteredValue": source }]
                },
                "showCustomUi": true,
                "strict": false
            }
        }
    })
}

/// First header matching a name-column candidate, in candidate order.
pub fn find_name_column(headers: &[String]) -> Option<usize> {
    NAME_COLUMN_CANDIDATES
        .iter()
        .find_map(|candidate| headers.iter().position(|h| h.trim() == *candidate))
}
