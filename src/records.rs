// 🧾 Records - the values that flow between pipeline stages
//
// ExportLink → DownloadedFile → RawRecord → CanonicalRecord / AssetSnapshot

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// COLUMN NAMES (as exported by the aggregation service)
// ============================================================================

pub mod columns {
    pub const INCLUDED: &str = "計算対象";
    pub const DATE: &str = "日付";
    pub const DESCRIPTION: &str = "内容";
    pub const AMOUNT: &str = "金額（円）";
    pub const INSTITUTION: &str = "保有金融機関";
    pub const MAJOR_CATEGORY: &str = "大項目";
    pub const MINOR_CATEGORY: &str = "中項目";
    pub const MEMO: &str = "メモ";
    pub const TRANSFER: &str = "振替";
    pub const ID: &str = "ID";

    /// Asset exports: total balance column
    pub const ASSET_TOTAL: &str = "合計（円）";

    /// Transaction export layout, in export order
    pub const TRANSACTION_HEADERS: [&str; 10] = [
        INCLUDED,
        DATE,
        DESCRIPTION,
        AMOUNT,
        INSTITUTION,
        MAJOR_CATEGORY,
        MINOR_CATEGORY,
        MEMO,
        TRANSFER,
        ID,
    ];
}

/// Dates are written the way the destination sheet displays them.
pub const SHEET_DATE_FORMAT: &str = "%Y/%m/%d";

// ============================================================================
// REPORT KIND & PERIOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Transaction,
    Asset,
}

impl ReportKind {
    pub fn code(&self) -> &'static str {
        match self {
            ReportKind::Transaction => "transaction",
            ReportKind::Asset => "asset",
        }
    }

    /// Directory name under `outputs/aggregated_files/`
    pub fn aggregate_dir(&self) -> &'static str {
        match self {
            ReportKind::Transaction => "detail",
            ReportKind::Asset => "assets",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Calendar month a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Period { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Period {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Period { year: self.year - 1, month: 12 }
        } else {
            Period { year: self.year, month: self.month - 1 }
        }
    }

    /// The period `months` calendar months before this one.
    pub fn months_back(&self, months: u32) -> Self {
        (0..months).fold(*self, |p, _| p.previous())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("period must look like YYYY-MM: {}", s))?;
        let year = year.parse::<i32>().map_err(|e| format!("bad year in {}: {}", s, e))?;
        let month = month.parse::<u32>().map_err(|e| format!("bad month in {}: {}", s, e))?;
        Period::new(year, month).ok_or_else(|| format!("month out of range: {}", s))
    }
}

// ============================================================================
// EXPORT LINK & DOWNLOADED FILE
// ============================================================================

/// A discovered export target. Unique per (report_kind, period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLink {
    pub report_kind: ReportKind,
    pub period: Period,
    pub url: String,
    pub institution_hint: Option<String>,
}

impl ExportLink {
    pub fn new(report_kind: ReportKind, period: Period, url: impl Into<String>) -> Self {
        ExportLink {
            report_kind,
            period,
            url: url.into(),
            institution_hint: None,
        }
    }

    pub fn with_institution(mut self, institution: impl Into<String>) -> Self {
        self.institution_hint = Some(institution.into());
        self
    }

    pub fn key(&self) -> (ReportKind, Period) {
        (self.report_kind, self.period)
    }

    /// File name used when the export is fetched directly.
    pub fn file_name(&self) -> String {
        format!("{}_{}.csv", self.report_kind, self.period)
    }
}

/// A verified export sitting in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub report_kind: ReportKind,
    pub period: Period,
    pub modified: SystemTime,
}

// ============================================================================
// RAW & CANONICAL RECORDS
// ============================================================================

/// One parsed transaction row. Amount is in minor units (yen).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub date: NaiveDate,
    pub description: String,
    pub amount: i64,
    pub institution: String,
    pub major_category: String,
    pub minor_category: String,
    pub memo: String,
    pub is_transfer: bool,
    pub external_id: String,

    /// Whether the service counts this row in its own totals
    pub included: bool,
}

impl RawRecord {
    /// Fallback identity for rows exported without an ID column.
    ///
    /// NOTE: stable across runs, but two genuinely identical rows collapse.
    pub fn compute_external_id(
        date: NaiveDate,
        description: &str,
        amount: i64,
        institution: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}",
            date.format("%Y-%m-%d"),
            description,
            amount,
            institution
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// A RawRecord after special rules ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record: RawRecord,

    /// Ids of the rules that changed this record, in application order
    pub adjustment_applied: Vec<String>,
}

impl CanonicalRecord {
    pub fn unadjusted(record: RawRecord) -> Self {
        CanonicalRecord {
            record,
            adjustment_applied: Vec::new(),
        }
    }

    pub fn external_id(&self) -> &str {
        &self.record.external_id
    }

    pub fn date(&self) -> NaiveDate {
        self.record.date
    }

    pub fn amount(&self) -> i64 {
        self.record.amount
    }

    pub fn was_adjusted(&self) -> bool {
        !self.adjustment_applied.is_empty()
    }
}

/// One asset-balance row: the total plus each category column, in export order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub date: NaiveDate,
    pub total: i64,
    pub breakdown: Vec<(String, i64)>,
}

impl AssetSnapshot {
    /// Asset rows are keyed by their date.
    pub fn external_id(&self) -> String {
        self.date.format(SHEET_DATE_FORMAT).to_string()
    }

    pub fn balance(&self, column: &str) -> Option<i64> {
        if column == columns::ASSET_TOTAL {
            return Some(self.total);
        }
        self.breakdown
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| *value)
    }
}

// ============================================================================
// CHECKSUMS
// ============================================================================

/// SHA-256 of a file's contents, lowercase hex.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 32 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
