// 🧮 Sync planning - pure diff between canonical rows and what the worksheet holds

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::{normalize_key, same_value, SheetRow};
use crate::config::{ColumnSettings, WorksheetSettings};
use crate::error::SyncError;

// ============================================================================
// LAYOUT
// ============================================================================

/// Where the managed data lives on one worksheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksheetLayout {
    pub name: String,
    /// First data row, 1-based
    pub start_row: u32,
    /// 1-based column of the external id
    pub key_col: u32,
    /// Managed columns ordered by position
    pub columns: Vec<ColumnSettings>,
}

impl WorksheetLayout {
    pub fn from_settings(settings: &WorksheetSettings) -> Result<Self, SyncError> {
        let key_col = settings
            .columns
            .iter()
            .find(|c| c.name == settings.key_column)
            .map(|c| c.col)
            .ok_or_else(|| SyncError::Mapping {
                worksheet: settings.name.clone(),
                reason: format!("key column '{}' is not mapped", settings.key_column),
            })?;

        let mut columns = settings.columns.clone();
        columns.sort_by_key(|c| c.col);

        Ok(WorksheetLayout {
            name: settings.name.clone(),
            start_row: settings.start_row.max(1),
            key_col,
            columns,
        })
    }

    pub fn last_col(&self) -> u32 {
        self.columns.iter().map(|c| c.col).max().unwrap_or(self.key_col)
    }

    /// A1 range covering every managed row: column A through the last managed column.
    pub fn data_range(&self) -> String {
        format!(
            "{}!A{}:{}",
            quote_sheet(&self.name),
            self.start_row,
            column_letter(self.last_col())
        )
    }
}

/// 1 → A, 26 → Z, 27 → AA.
pub fn column_letter(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        col = (col - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn quote_sheet(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// A1 reference of one cell, e.g. `'家計簿データ'!C7`.
pub fn cell_ref(sheet: &str, row: u32, col: u32) -> String {
    format!("{}!{}{}", quote_sheet(sheet), column_letter(col), row)
}

// ============================================================================
// EXISTING INDEX
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRow {
    /// 1-based sheet row
    pub row: u32,
    /// Cells from column A onward, as read
    pub cells: Vec<String>,
}

impl ExistingRow {
    pub fn cell(&self, col: u32) -> &str {
        col.checked_sub(1)
            .and_then(|i| self.cells.get(i as usize))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Normalized external_id → row, built from one read of the managed range.
#[derive(Debug, Default)]
pub struct ExistingIndex {
    rows: HashMap<String, ExistingRow>,
    last_populated_row: Option<u32>,
}

impl ExistingIndex {
    /// `values[i]` is sheet row `layout.start_row + i`.
    pub fn from_values(layout: &WorksheetLayout, values: Vec<Vec<String>>) -> Self {
        let mut index = ExistingIndex::default();

        for (offset, cells) in values.into_iter().enumerate() {
            let row = layout.start_row + offset as u32;
            let existing = ExistingRow { row, cells };
            let populated = layout
                .columns
                .iter()
                .any(|c| !existing.cell(c.col).trim().is_empty());
            if !populated {
                continue;
            }
            index.last_populated_row = Some(row);

            let key = normalize_key(existing.cell(layout.key_col));
            if key.is_empty() {
                continue;
            }
            if let Some(first) = index.rows.get(&key) {
                warn!(worksheet = %layout.name, key = %key, first_row = first.row, row, "duplicate key on sheet, first row kept");
                continue;
            }
            index.rows.insert(key, existing);
        }

        index
    }

    /// Lookup tolerant of display formatting, e.g. "2024/5/1" for "2024/05/01".
    pub fn get(&self, external_id: &str) -> Option<&ExistingRow> {
        self.rows.get(&normalize_key(external_id))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_populated_row(&self) -> Option<u32> {
        self.last_populated_row
    }
}

// ============================================================================
// PLAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub external_id: String,
    pub row: u32,
    pub col: u32,
    pub value: String,
}

/// A new row: managed cells only, unmanaged columns are never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub external_id: String,
    pub row: u32,
    /// (1-based column, value), ordered by column
    pub cells: Vec<(u32, String)>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub inserts: Vec<RowWrite>,
    pub updates: Vec<CellUpdate>,
    pub unchanged: usize,
}

impl SyncPlan {
    /// Diff `rows` against the index. Ids only on the sheet are left alone.
    pub fn compute<R: SheetRow>(layout: &WorksheetLayout, index: &ExistingIndex, rows: &[R]) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let mut next_row = index
            .last_populated_row()
            .map(|r| r + 1)
            .unwrap_or(layout.start_row)
            .max(layout.start_row);
        let mut seen = HashSet::new();

        for record in rows {
            let id = record.external_id();
            if !seen.insert(id.clone()) {
                debug!(worksheet = %layout.name, id = %id, "repeated id in input ignored");
                continue;
            }

            match index.get(&id) {
                Some(existing) => {
                    let before = plan.updates.len();
                    for column in &layout.columns {
                        let Some(desired) = record.cell(&column.name) else {
                            continue;
                        };
                        let current = existing.cell(column.col);
                        let unchanged = if column.col == layout.key_col {
                            normalize_key(&desired) == normalize_key(current)
                        } else {
                            same_value(&desired, current)
                        };
                        if !unchanged {
                            plan.updates.push(CellUpdate {
                                external_id: id.clone(),
                                row: existing.row,
                                col: column.col,
                                value: desired,
                            });
                        }
                    }
                    if plan.updates.len() == before {
                        plan.unchanged += 1;
                    }
                }
                None => {
                    let cells = layout
                        .columns
                        .iter()
                        .map(|c| (c.col, record.cell(&c.name).unwrap_or_default()))
                        .collect();
                    plan.inserts.push(RowWrite {
                        external_id: id,
                        row: next_row,
                        cells,
                    });
                    next_row += 1;
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn updated_rows(&self) -> usize {
        self.updates.iter().map(|u| u.row).collect::<HashSet<_>>().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        id: &'static str,
        amount: i64,
    }

    impl SheetRow for Row {
        fn external_id(&self) -> String {
            self.id.to_string()
        }

        fn cell(&self, column: &str) -> Option<String> {
            match column {
                "ID" => Some(self.id.to_string()),
                "金額（円）" => Some(self.amount.to_string()),
                _ => None,
            }
        }
    }

    fn layout() -> WorksheetLayout {
        WorksheetLayout {
            name: "家計簿データ".to_string(),
            start_row: 5,
            key_col: 3,
            columns: vec![
                ColumnSettings { name: "金額（円）".to_string(), col: 2 },
                ColumnSettings { name: "ID".to_string(), col: 3 },
            ],
        }
    }

    fn sheet(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect()
    }

    #[test]
    fn test_column_letters_and_refs() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(703), "AAA");
        assert_eq!(cell_ref("家計簿データ", 7, 3), "'家計簿データ'!C7");
        assert_eq!(quote_sheet("Bob's"), "'Bob''s'");
        assert_eq!(layout().data_range(), "'家計簿データ'!A5:C");
    }

    #[test]
    fn test_index_tracks_rows_and_last_populated() {
        let index = ExistingIndex::from_values(
            &layout(),
            sheet(&[&["", "-100", "a"], &[], &["memo only"], &["", "5", "b"]]),
        );

        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a").unwrap().row, 5);
        assert_eq!(index.get("b").unwrap().row, 8);
        // Column A is unmanaged: row 7 does not count as populated
        assert_eq!(index.last_populated_row(), Some(8));
    }

    #[test]
    fn test_synced_sheet_plans_nothing() {
        let index = ExistingIndex::from_values(&layout(), sheet(&[&["", "¥-1,000", "a"], &["", "200", "b"]]));
        let rows = [Row { id: "a", amount: -1000 }, Row { id: "b", amount: 200 }];

        let plan = SyncPlan::compute(&layout(), &index, &rows);

        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_changed_amount_updates_one_cell() {
        let index = ExistingIndex::from_values(&layout(), sheet(&[&["", "-1000", "a"], &["", "200", "b"]]));
        let rows = [Row { id: "a", amount: -1000 }, Row { id: "b", amount: 250 }];

        let plan = SyncPlan::compute(&layout(), &index, &rows);

        assert!(plan.inserts.is_empty());
        assert_eq!(
            plan.updates,
            vec![CellUpdate { external_id: "b".to_string(), row: 6, col: 2, value: "250".to_string() }]
        );
        assert_eq!(plan.updated_rows(), 1);
    }

    #[test]
    fn test_new_ids_append_after_last_populated_row() {
        let index = ExistingIndex::from_values(&layout(), sheet(&[&["", "1", "a"], &[], &["", "2", "b"]]));
        let rows = [Row { id: "c", amount: 3 }, Row { id: "a", amount: 1 }, Row { id: "d", amount: 4 }];

        let plan = SyncPlan::compute(&layout(), &index, &rows);

        let placed: Vec<(&str, u32)> = plan.inserts.iter().map(|w| (w.external_id.as_str(), w.row)).collect();
        assert_eq!(placed, vec![("c", 8), ("d", 9)]);
        assert_eq!(plan.inserts[0].cells, vec![(2, "3".to_string()), (3, "c".to_string())]);
    }

    #[test]
    fn test_empty_sheet_starts_at_start_row() {
        let index = ExistingIndex::from_values(&layout(), Vec::new());
        let plan = SyncPlan::compute(&layout(), &index, &[Row { id: "a", amount: 1 }]);
        assert_eq!(plan.inserts[0].row, 5);
    }

    #[test]
    fn test_zero_padded_id_is_its_own_key() {
        let index = ExistingIndex::from_values(&layout(), sheet(&[&["", "5", "123"]]));
        let rows = [Row { id: "0123", amount: 7 }];

        let plan = SyncPlan::compute(&layout(), &index, &rows);

        assert!(index.get("0123").is_none());
        assert!(plan.updates.is_empty());
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].external_id, "0123");
        assert_eq!(plan.inserts[0].row, 6);
    }

    #[test]
    fn test_sheet_only_ids_are_untouched() {
        let index = ExistingIndex::from_values(&layout(), sheet(&[&["", "1", "legacy"]]));
        let plan = SyncPlan::compute::<Row>(&layout(), &index, &[]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_layout_rejects_unmapped_key() {
        let settings = WorksheetSettings {
            name: "x".to_string(),
            dataset: crate::config::Dataset::Transactions,
            start_row: 2,
            key_column: "ID".to_string(),
            columns: vec![ColumnSettings { name: "日付".to_string(), col: 1 }],
        };
        assert!(matches!(WorksheetLayout::from_settings(&settings), Err(SyncError::Mapping { .. })));
    }
}
