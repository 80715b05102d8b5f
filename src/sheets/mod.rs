// 📊 Spreadsheet sync - diff canonical rows against a worksheet, write only the difference
//
// plan:          index what the sheet holds, compute inserts and cell updates
// client:        SpreadsheetApi capability + Google Sheets v4 implementation
// synchronizer:  batching and retries around a plan

pub mod client;
pub mod plan;
pub mod synchronizer;

pub use client::{GoogleSheetsClient, SpreadsheetApi};
pub use plan::{CellUpdate, ExistingIndex, RowWrite, SyncPlan, WorksheetLayout};
pub use synchronizer::{Synchronizer, WorksheetOutcome};

use crate::parser::{parse_amount, parse_date};
use crate::records::{columns, AssetSnapshot, CanonicalRecord, SHEET_DATE_FORMAT};

/// Column holding the rule ids applied to a transaction
pub const ADJUSTMENT_COLUMN: &str = "調整";

/// A record that can be laid out as a worksheet row.
pub trait SheetRow {
    fn external_id(&self) -> String;

    /// Cell text for a mapped column; None when the record has no such field.
    fn cell(&self, column: &str) -> Option<String>;
}

impl SheetRow for CanonicalRecord {
    fn external_id(&self) -> String {
        self.record.external_id.clone()
    }

    fn cell(&self, column: &str) -> Option<String> {
        let r = &self.record;
        let value = match column {
            columns::DATE => r.date.format(SHEET_DATE_FORMAT).to_string(),
            columns::DESCRIPTION => r.description.clone(),
            columns::AMOUNT => r.amount.to_string(),
            columns::INSTITUTION => r.institution.clone(),
            columns::MAJOR_CATEGORY => r.major_category.clone(),
            columns::MINOR_CATEGORY => r.minor_category.clone(),
            columns::MEMO => r.memo.clone(),
            columns::TRANSFER => bool_cell(r.is_transfer),
            columns::INCLUDED => bool_cell(r.included),
            columns::ID => r.external_id.clone(),
            ADJUSTMENT_COLUMN => self.adjustment_applied.join(","),
            _ => return None,
        };
        Some(value)
    }
}

impl SheetRow for AssetSnapshot {
    fn external_id(&self) -> String {
        AssetSnapshot::external_id(self)
    }

    fn cell(&self, column: &str) -> Option<String> {
        if column == columns::DATE {
            return Some(AssetSnapshot::external_id(self));
        }
        self.balance(column).map(|v| v.to_string())
    }
}

fn bool_cell(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

/// Comparable form of a cell as the sheet may render it.
///
/// "¥-1,200", "-1200" and "-1200.0" compare equal; so do "2024/5/1" and "2024/05/01".
pub fn normalize_cell(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(date) = parse_date(trimmed) {
        return date.format(SHEET_DATE_FORMAT).to_string();
    }
    if let Ok(amount) = parse_amount(trimmed) {
        return amount.to_string();
    }
    trimmed.to_string()
}

/// Comparable form of a key cell: dates are normalized, everything else stays text.
///
/// Ids such as "0123" and "123" are different keys.
pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    match parse_date(trimmed) {
        Some(date) => date.format(SHEET_DATE_FORMAT).to_string(),
        None => trimmed.to_string(),
    }
}

/// Whether two cells hold the same value once formatting is stripped.
pub fn same_value(a: &str, b: &str) -> bool {
    normalize_cell(a) == normalize_cell(b)
}
