// 🌐 Spreadsheet API - the read/append/update contract and its Google Sheets v4 implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::plan::{cell_ref, column_letter, quote_sheet, CellUpdate, RowWrite};
use crate::error::SyncError;

/// The destination spreadsheet, reduced to what the synchronizer needs.
#[async_trait]
pub trait SpreadsheetApi: Send + Sync {
    /// Rows of an A1 range as displayed; trailing empty cells may be omitted.
    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SyncError>;

    async fn append_rows(&self, worksheet: &str, rows: &[RowWrite]) -> Result<(), SyncError>;

    async fn update_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> Result<(), SyncError>;
}

// ============================================================================
// GOOGLE SHEETS
// ============================================================================

pub struct GoogleSheetsClient {
    client: reqwest::Client,
    api_base: String,
    spreadsheet_key: String,
    token: String,
}

#[derive(Deserialize)]
struct ValueRangeResponse {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ValueRange {
    range: String,
    values: Vec<Vec<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest<'a> {
    value_input_option: &'static str,
    data: &'a [ValueRange],
}

impl GoogleSheetsClient {
    pub fn new(api_base: &str, spreadsheet_key: impl Into<String>, token: impl Into<String>) -> Self {
        GoogleSheetsClient {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            spreadsheet_key: spreadsheet_key.into(),
            token: token.into(),
        }
    }

    fn values_url(&self) -> String {
        format!("{}/spreadsheets/{}/values", self.api_base, urlencoding::encode(&self.spreadsheet_key))
    }

    async fn batch_update(&self, data: &[ValueRange]) -> Result<(), SyncError> {
        if data.is_empty() {
            return Ok(());
        }

        let url = format!("{}:batchUpdate", self.values_url());
        let body = BatchUpdateRequest {
            value_input_option: "USER_ENTERED",
            data,
        };
        debug!(ranges = data.len(), "sheets batchUpdate");

        let resp = self.client.post(&url).bearer_auth(&self.token).json(&body).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl SpreadsheetApi for GoogleSheetsClient {
    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SyncError> {
        let url = format!("{}/{}", self.values_url(), urlencoding::encode(range));
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let resp = check_status(resp).await?;

        let body: ValueRangeResponse = resp.json().await?;
        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn append_rows(&self, worksheet: &str, rows: &[RowWrite]) -> Result<(), SyncError> {
        let data: Vec<ValueRange> = rows.iter().flat_map(|r| row_ranges(worksheet, r)).collect();
        self.batch_update(&data).await
    }

    async fn update_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> Result<(), SyncError> {
        let data: Vec<ValueRange> = cells
            .iter()
            .map(|c| ValueRange {
                range: cell_ref(worksheet, c.row, c.col),
                values: vec![vec![c.value.clone()]],
            })
            .collect();
        self.batch_update(&data).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Api {
        status: status.as_u16(),
        body,
    })
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One range per run of adjacent managed columns, so gaps stay untouched.
fn row_ranges(worksheet: &str, row: &RowWrite) -> Vec<ValueRange> {
    let mut ranges = Vec::new();
    let mut run: Vec<String> = Vec::new();
    let mut run_start = 0;
    let mut previous: Option<u32> = None;

    for (col, value) in &row.cells {
        if previous.is_some_and(|p| p + 1 != *col) {
            ranges.push(run_range(worksheet, row.row, run_start, std::mem::take(&mut run)));
        }
        if run.is_empty() {
            run_start = *col;
        }
        run.push(value.clone());
        previous = Some(*col);
    }
    if !run.is_empty() {
        ranges.push(run_range(worksheet, row.row, run_start, run));
    }

    ranges
}

fn run_range(worksheet: &str, row: u32, start_col: u32, values: Vec<String>) -> ValueRange {
    let end_col = start_col + values.len() as u32 - 1;
    ValueRange {
        range: format!(
            "{}!{}{}:{}{}",
            quote_sheet(worksheet),
            column_letter(start_col),
            row,
            column_letter(end_col),
            row
        ),
        values: vec![values],
    }
}

// ============================================================================
// IN-MEMORY SHEET (tests)
// ============================================================================

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        sheets: HashMap<String, BTreeMap<(u32, u32), String>>,
        write_failures: VecDeque<u16>,
        reads: usize,
        write_calls: usize,
        cells_written: usize,
    }

    /// Worksheets held as (row, col) → text.
    #[derive(Clone, Default)]
    pub struct FakeSheets {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeSheets {
        pub fn new() -> Self {
            FakeSheets::default()
        }

        pub fn set(&self, sheet: &str, row: u32, col: u32, value: &str) {
            let mut state = self.state.lock().unwrap();
            state.sheets.entry(sheet.to_string()).or_default().insert((row, col), value.to_string());
        }

        pub fn get(&self, sheet: &str, row: u32, col: u32) -> Option<String> {
            let state = self.state.lock().unwrap();
            state.sheets.get(sheet).and_then(|s| s.get(&(row, col))).cloned()
        }

        /// The next `n` write calls fail with `status`.
        pub fn fail_writes(&self, n: usize, status: u16) {
            let mut state = self.state.lock().unwrap();
            state.write_failures.extend(std::iter::repeat(status).take(n));
        }

        pub fn reads(&self) -> usize {
            self.state.lock().unwrap().reads
        }

        pub fn write_calls(&self) -> usize {
            self.state.lock().unwrap().write_calls
        }

        pub fn cells_written(&self) -> usize {
            self.state.lock().unwrap().cells_written
        }

        fn write(&self, sheet: &str, cells: Vec<(u32, u32, String)>) -> Result<(), SyncError> {
            let mut state = self.state.lock().unwrap();
            state.write_calls += 1;
            if let Some(status) = state.write_failures.pop_front() {
                return Err(SyncError::Api { status, body: "injected".to_string() });
            }
            state.cells_written += cells.len();
            let grid = state.sheets.entry(sheet.to_string()).or_default();
            for (row, col, value) in cells {
                grid.insert((row, col), value);
            }
            Ok(())
        }
    }

    /// `'name'!A5:C` → (name, 5, 3)
    fn parse_range(range: &str) -> (String, u32, u32) {
        let (sheet, cells) = range.rsplit_once('!').unwrap();
        let name = sheet.trim_matches('\'').replace("''", "'");
        let (start, end) = cells.split_once(':').unwrap();
        let start_row: u32 = start.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().unwrap();
        let end_col = end
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .fold(0, |acc, c| acc * 26 + (c as u32 - 'A' as u32 + 1));
        (name, start_row, end_col)
    }

    #[async_trait]
    impl SpreadsheetApi for FakeSheets {
        async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SyncError> {
            let (name, start_row, end_col) = parse_range(range);
            let mut state = self.state.lock().unwrap();
            state.reads += 1;

            let Some(grid) = state.sheets.get(&name) else {
                return Ok(Vec::new());
            };
            let last_row = grid.keys().map(|(r, _)| *r).max().unwrap_or(0);

            let mut rows = Vec::new();
            for row in start_row..=last_row {
                let mut cells: Vec<String> = (1..=end_col)
                    .map(|col| grid.get(&(row, col)).cloned().unwrap_or_default())
                    .collect();
                while cells.last().is_some_and(|c| c.is_empty()) {
                    cells.pop();
                }
                rows.push(cells);
            }
            Ok(rows)
        }

        async fn append_rows(&self, worksheet: &str, rows: &[RowWrite]) -> Result<(), SyncError> {
            let cells = rows
                .iter()
                .flat_map(|r| r.cells.iter().map(move |(col, v)| (r.row, *col, v.clone())))
                .collect();
            self.write(worksheet, cells)
        }

        async fn update_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> Result<(), SyncError> {
            self.write(worksheet, cells.iter().map(|c| (c.row, c.col, c.value.clone())).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(row: u32, cols: &[u32]) -> RowWrite {
        RowWrite {
            external_id: "x".to_string(),
            row,
            cells: cols.iter().map(|c| (*c, format!("v{}", c))).collect(),
        }
    }

    #[test]
    fn test_row_ranges_split_on_gaps() {
        let ranges = row_ranges("家計簿データ", &write(9, &[1, 2, 3, 5]));

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].range, "'家計簿データ'!A9:C9");
        assert_eq!(ranges[0].values, vec![vec!["v1".to_string(), "v2".to_string(), "v3".to_string()]]);
        assert_eq!(ranges[1].range, "'家計簿データ'!E9:E9");
    }

    #[test]
    fn test_batch_request_shape() {
        let data = vec![ValueRange {
            range: "'s'!C7".to_string(),
            values: vec![vec!["250".to_string()]],
        }];
        let body = serde_json::to_value(BatchUpdateRequest {
            value_input_option: "USER_ENTERED",
            data: &data,
        })
        .unwrap();

        assert_eq!(body["valueInputOption"], "USER_ENTERED");
        assert_eq!(body["data"][0]["range"], "'s'!C7");
        assert_eq!(body["data"][0]["values"][0][0], "250");
    }

    #[test]
    fn test_cell_text_flattens_json() {
        assert_eq!(cell_text(Value::String("¥1,000".into())), "¥1,000");
        assert_eq!(cell_text(serde_json::json!(1200)), "1200");
        assert_eq!(cell_text(Value::Null), "");
    }

    #[test]
    fn test_values_response_tolerates_missing_values() {
        let body: ValueRangeResponse = serde_json::from_str(r#"{"range":"'s'!A5:C","majorDimension":"ROWS"}"#).unwrap();
        assert!(body.values.is_empty());
    }
}
