// 🏗️ Parser Framework - decoding and layout-specific parsers for the two exports
//
// decode() tries encodings in order; detect_kind() reads the header row;
// get_parser() hands back the parser for that layout.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use encoding_rs::{Encoding, EUC_JP, SHIFT_JIS};
use tracing::debug;

use crate::error::TransformError;
use crate::records::{columns, AssetSnapshot, RawRecord, ReportKind};

// ============================================================================
// DECODING
// ============================================================================

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Fallbacks after UTF-8, in order. SHIFT_JIS here is the Windows-31J superset.
const FALLBACK_ENCODINGS: [&Encoding; 2] = [SHIFT_JIS, EUC_JP];

const DATE_FORMATS: [&str; 3] = ["%Y/%m/%d", "%Y-%m-%d", "%Y年%m月%d日"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static str,
}

/// Decode an export, trying UTF-8 (BOM tolerated) first and then the fallbacks.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<Decoded, TransformError> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(body) {
        return Ok(Decoded {
            text: text.to_string(),
            encoding: "UTF-8",
        });
    }

    let mut tried = vec!["UTF-8".to_string()];
    for encoding in FALLBACK_ENCODINGS {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            debug!(path = %path.display(), encoding = encoding.name(), "decoded with fallback encoding");
            return Ok(Decoded {
                text: text.into_owned(),
                encoding: encoding.name(),
            });
        }
        tried.push(encoding.name().to_string());
    }

    Err(TransformError::Encoding {
        path: path.to_path_buf(),
        tried,
    })
}

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedExport {
    Transactions(Vec<RawRecord>),
    Assets(Vec<AssetSnapshot>),
}

impl ParsedExport {
    pub fn report_kind(&self) -> ReportKind {
        match self {
            ParsedExport::Transactions(_) => ReportKind::Transaction,
            ParsedExport::Assets(_) => ReportKind::Asset,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ParsedExport::Transactions(rows) => rows.len(),
            ParsedExport::Assets(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One export layout.
pub trait ExportParser: Send + Sync {
    /// Parse decoded CSV text. `path` is only used for error context.
    fn parse(&self, path: &Path, text: &str) -> Result<ParsedExport, TransformError>;

    fn report_kind(&self) -> ReportKind;
}

// ============================================================================
// FACTORY FUNCTIONS
// ============================================================================

/// Tell the layouts apart by their header row.
pub fn detect_kind(path: &Path, text: &str) -> Result<ReportKind, TransformError> {
    let headers = read_headers(path, text)?;
    let has = |name: &str| headers.contains_key(name);

    if has(columns::AMOUNT) && has(columns::INSTITUTION) {
        Ok(ReportKind::Transaction)
    } else if has(columns::ASSET_TOTAL) && has(columns::DATE) {
        Ok(ReportKind::Asset)
    } else {
        Err(TransformError::UnknownLayout { path: path.to_path_buf() })
    }
}

pub fn get_parser(kind: ReportKind) -> Box<dyn ExportParser> {
    match kind {
        ReportKind::Transaction => Box::new(TransactionParser::new()),
        ReportKind::Asset => Box::new(AssetParser::new()),
    }
}

// ============================================================================
// TRANSACTION EXPORT
// ============================================================================

/// 計算対象,日付,内容,金額（円）,保有金融機関,大項目,中項目,メモ,振替,ID
#[derive(Debug, Default)]
pub struct TransactionParser;

impl TransactionParser {
    pub fn new() -> Self {
        TransactionParser
    }
}

impl ExportParser for TransactionParser {
    fn parse(&self, path: &Path, text: &str) -> Result<ParsedExport, TransformError> {
        let mut reader = reader(text);
        let headers = header_index(path, &mut reader)?;
        let layout = Layout { path, headers: &headers };

        for required in [columns::DATE, columns::DESCRIPTION, columns::AMOUNT, columns::INSTITUTION] {
            if !headers.contains_key(required) {
                return Err(TransformError::UnknownLayout { path: path.to_path_buf() });
            }
        }

        let mut records = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let line = index + 2;
            let row = result.map_err(|e| layout.row_error(line, e.to_string()))?;

            let date = parse_date(layout.get(&row, columns::DATE))
                .ok_or_else(|| layout.row_error(line, format!("bad date '{}'", layout.get(&row, columns::DATE))))?;
            let amount = parse_amount(layout.get(&row, columns::AMOUNT))
                .map_err(|reason| layout.row_error(line, reason))?;

            let description = layout.get(&row, columns::DESCRIPTION).to_string();
            let institution = layout.get(&row, columns::INSTITUTION).to_string();

            let external_id = match layout.get(&row, columns::ID) {
                "" => RawRecord::compute_external_id(date, &description, amount, &institution),
                id => id.to_string(),
            };

            records.push(RawRecord {
                date,
                description,
                amount,
                institution,
                major_category: layout.get(&row, columns::MAJOR_CATEGORY).to_string(),
                minor_category: layout.get(&row, columns::MINOR_CATEGORY).to_string(),
                memo: layout.get(&row, columns::MEMO).to_string(),
                is_transfer: parse_flag(layout.get(&row, columns::TRANSFER), false),
                external_id,
                included: parse_flag(layout.get(&row, columns::INCLUDED), true),
            });
        }

        Ok(ParsedExport::Transactions(records))
    }

    fn report_kind(&self) -> ReportKind {
        ReportKind::Transaction
    }
}

// ============================================================================
// ASSET EXPORT
// ============================================================================

/// 日付,合計（円）, then one "…（円）" column per asset class
#[derive(Debug, Default)]
pub struct AssetParser;

impl AssetParser {
    pub fn new() -> Self {
        AssetParser
    }
}

impl ExportParser for AssetParser {
    fn parse(&self, path: &Path, text: &str) -> Result<ParsedExport, TransformError> {
        let mut reader = reader(text);
        let header_row = reader
            .headers()
            .map_err(|e| TransformError::Row {
                path: path.to_path_buf(),
                line: 1,
                reason: e.to_string(),
            })?
            .clone();
        let headers = index_headers(&header_row);
        let layout = Layout { path, headers: &headers };

        if !headers.contains_key(columns::DATE) || !headers.contains_key(columns::ASSET_TOTAL) {
            return Err(TransformError::UnknownLayout { path: path.to_path_buf() });
        }

        let breakdown_columns: Vec<&str> = header_row
            .iter()
            .map(clean_header)
            .filter(|h| h.ends_with("（円）") && *h != columns::ASSET_TOTAL)
            .collect();

        let mut snapshots = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let line = index + 2;
            let row = result.map_err(|e| layout.row_error(line, e.to_string()))?;

            let date = parse_date(layout.get(&row, columns::DATE))
                .ok_or_else(|| layout.row_error(line, format!("bad date '{}'", layout.get(&row, columns::DATE))))?;
            let total = parse_amount(layout.get(&row, columns::ASSET_TOTAL))
                .map_err(|reason| layout.row_error(line, reason))?;

            let mut breakdown = Vec::with_capacity(breakdown_columns.len());
            for column in &breakdown_columns {
                let raw = layout.get(&row, column);
                // Asset classes the account never held come through blank
                let value = if raw.is_empty() {
                    0
                } else {
                    parse_amount(raw).map_err(|reason| layout.row_error(line, reason))?
                };
                breakdown.push((column.to_string(), value));
            }

            snapshots.push(AssetSnapshot { date, total, breakdown });
        }

        Ok(ParsedExport::Assets(snapshots))
    }

    fn report_kind(&self) -> ReportKind {
        ReportKind::Asset
    }
}

// ============================================================================
// HELPERS
// ============================================================================

struct Layout<'a> {
    path: &'a Path,
    headers: &'a HashMap<String, usize>,
}

impl Layout<'_> {
    /// Trimmed cell under `column`; empty when the column or cell is missing.
    fn get<'r>(&self, row: &'r StringRecord, column: &str) -> &'r str {
        self.headers
            .get(column)
            .and_then(|&i| row.get(i))
            .map(str::trim)
            .unwrap_or("")
    }

    fn row_error(&self, line: usize, reason: String) -> TransformError {
        TransformError::Row {
            path: self.path.to_path_buf(),
            line,
            reason,
        }
    }
}

fn reader(text: &str) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes())
}

fn clean_header(header: &str) -> &str {
    header.trim_start_matches('\u{feff}').trim()
}

fn index_headers(row: &StringRecord) -> HashMap<String, usize> {
    row.iter()
        .enumerate()
        .map(|(i, h)| (clean_header(h).to_string(), i))
        .collect()
}

fn header_index(path: &Path, reader: &mut csv::Reader<&[u8]>) -> Result<HashMap<String, usize>, TransformError> {
    let row = reader.headers().map_err(|e| TransformError::Row {
        path: path.to_path_buf(),
        line: 1,
        reason: e.to_string(),
    })?;
    Ok(index_headers(row))
}

fn read_headers(path: &Path, text: &str) -> Result<HashMap<String, usize>, TransformError> {
    header_index(path, &mut reader(text))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok())
}

/// Whole-yen amount; tolerates thousands separators, a yen sign and ".0".
pub fn parse_amount(raw: &str) -> Result<i64, String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '¥' | '￥' | ' ' | '円'))
        .collect();

    if cleaned.is_empty() {
        return Err("empty amount".to_string());
    }

    let (whole, fraction) = match cleaned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (cleaned.as_str(), ""),
    };
    if !fraction.chars().all(|c| c == '0') {
        return Err(format!("fractional yen amount '{}'", raw));
    }

    whole
        .parse::<i64>()
        .map_err(|e| format!("bad amount '{}': {}", raw, e))
}

fn parse_flag(raw: &str, default: bool) -> bool {
    match raw {
        "1" | "true" | "TRUE" | "○" => true,
        "0" | "false" | "FALSE" => false,
        _ => default,
    }
}
