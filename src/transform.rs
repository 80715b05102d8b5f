// 🔄 Transform Engine - staged exports in, canonical record sets out
//
// decode → detect layout → parse → special rules → last-write-wins dedup → sort.
// A file that cannot be decoded or parsed is skipped and reported; the rest
// of the batch still goes through.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::WriterBuilder;
use tracing::{info, warn};

use crate::config::Settings;
use crate::deduplication::{DeduplicationEngine, DuplicateMatch, Sourced};
use crate::error::{ConfigError, TransformError};
use crate::parser::{decode, detect_kind, get_parser, ParsedExport};
use crate::records::{columns, AssetSnapshot, CanonicalRecord, DownloadedFile, Period, ReportKind, SHEET_DATE_FORMAT};
use crate::rules::RuleEngine;

const UTF8_BOM: &str = "\u{feff}";

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub report_kind: ReportKind,
    pub period: Period,
    pub error: TransformError,
}

#[derive(Debug, Default)]
pub struct TransformReport {
    /// Ordered by (date, external_id)
    pub transactions: Vec<CanonicalRecord>,
    /// Ordered by date
    pub assets: Vec<AssetSnapshot>,
    pub skipped: Vec<SkippedFile>,
    pub duplicates: Vec<DuplicateMatch>,
    pub files_parsed: usize,
}

impl TransformReport {
    pub fn adjusted_count(&self) -> usize {
        self.transactions.iter().filter(|r| r.was_adjusted()).count()
    }
}

/// Paths of the aggregated CSVs written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedOutputs {
    pub detail: PathBuf,
    pub assets: PathBuf,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct TransformEngine {
    rules: RuleEngine,
    dedup: DeduplicationEngine,
    aggregated_dir: PathBuf,
}

impl TransformEngine {
    pub fn new(rules: RuleEngine, aggregated_dir: impl Into<PathBuf>) -> Self {
        TransformEngine {
            rules,
            dedup: DeduplicationEngine::new(),
            aggregated_dir: aggregated_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let rules = RuleEngine::from_config(&settings.special_rules)?;
        Ok(TransformEngine::new(rules, settings.paths.aggregated_dir()))
    }

    /// Transform every staged file. Input order matters only for equal timestamps.
    pub fn run(&self, files: &[DownloadedFile]) -> TransformReport {
        let mut report = TransformReport::default();
        let mut transactions = Vec::new();
        let mut assets = Vec::new();

        for file in files {
            match self.parse_file(file) {
                Ok(ParsedExport::Transactions(rows)) => {
                    info!(path = %file.path.display(), rows = rows.len(), "transactions parsed");
                    report.files_parsed += 1;
                    for canonical in self.rules.apply_all(rows) {
                        transactions.push(Sourced::new(canonical, &file.path, file.modified));
                    }
                }
                Ok(ParsedExport::Assets(rows)) => {
                    info!(path = %file.path.display(), rows = rows.len(), "asset snapshots parsed");
                    report.files_parsed += 1;
                    for snapshot in rows {
                        assets.push(Sourced::new(snapshot, &file.path, file.modified));
                    }
                }
                Err(error) => {
                    warn!(
                        path = %file.path.display(),
                        kind = %file.report_kind,
                        period = %file.period,
                        error = %error,
                        "file skipped"
                    );
                    report.skipped.push(SkippedFile {
                        path: file.path.clone(),
                        report_kind: file.report_kind,
                        period: file.period,
                        error,
                    });
                }
            }
        }

        let (mut kept, mut duplicates) = self.dedup.deduplicate(transactions);
        kept.sort_by(|a, b| (a.date(), a.external_id()).cmp(&(b.date(), b.external_id())));
        report.transactions = kept;
        report.duplicates.append(&mut duplicates);

        let (mut kept, mut duplicates) = self.dedup.deduplicate(assets);
        kept.sort_by_key(|s| s.date);
        report.assets = kept;
        report.duplicates.append(&mut duplicates);

        info!(
            transactions = report.transactions.len(),
            assets = report.assets.len(),
            adjusted = report.adjusted_count(),
            duplicates = report.duplicates.len(),
            skipped = report.skipped.len(),
            "transform finished"
        );
        report
    }

    /// Decode and parse one staged file, checking it holds the kind it was fetched as.
    pub fn parse_file(&self, file: &DownloadedFile) -> Result<ParsedExport, TransformError> {
        let bytes = fs::read(&file.path).map_err(|source| TransformError::Io {
            path: file.path.clone(),
            source,
        })?;
        let decoded = decode(&file.path, &bytes)?;

        let found = detect_kind(&file.path, &decoded.text)?;
        if found != file.report_kind {
            return Err(TransformError::KindMismatch {
                path: file.path.clone(),
                expected: file.report_kind,
                found,
            });
        }

        get_parser(found).parse(&file.path, &decoded.text)
    }

    /// Write `detail/detail_YYYYMMDD.csv` and `assets/assets_YYYYMMDD.csv` (UTF-8 with BOM).
    pub fn write_outputs(&self, report: &TransformReport, date: NaiveDate) -> Result<AggregatedOutputs, TransformError> {
        let stamp = date.format("%Y%m%d");
        let detail = self.output_path(ReportKind::Transaction, &format!("detail_{}.csv", stamp));
        let assets = self.output_path(ReportKind::Asset, &format!("assets_{}.csv", stamp));

        write_bom_csv(&detail, transaction_table(&report.transactions))?;
        write_bom_csv(&assets, asset_table(&report.assets))?;

        info!(detail = %detail.display(), assets = %assets.display(), "aggregated files written");
        Ok(AggregatedOutputs { detail, assets })
    }

    fn output_path(&self, kind: ReportKind, file_name: &str) -> PathBuf {
        self.aggregated_dir.join(kind.aggregate_dir()).join(file_name)
    }
}

// ============================================================================
// OUTPUT TABLES
// ============================================================================

fn transaction_table(records: &[CanonicalRecord]) -> Vec<Vec<String>> {
    let mut table = vec![columns::TRANSACTION_HEADERS.iter().map(|h| h.to_string()).collect()];
    for canonical in records {
        let r = &canonical.record;
        table.push(vec![
            flag(r.included),
            r.date.format(SHEET_DATE_FORMAT).to_string(),
            r.description.clone(),
            r.amount.to_string(),
            r.institution.clone(),
            r.major_category.clone(),
            r.minor_category.clone(),
            r.memo.clone(),
            flag(r.is_transfer),
            r.external_id.clone(),
        ]);
    }
    table
}

/// Breakdown columns are the union across snapshots, in first-seen order.
fn asset_table(snapshots: &[AssetSnapshot]) -> Vec<Vec<String>> {
    let mut breakdown: Vec<&str> = Vec::new();
    for snapshot in snapshots {
        for (name, _) in &snapshot.breakdown {
            if !breakdown.contains(&name.as_str()) {
                breakdown.push(name);
            }
        }
    }

    let mut header = vec![columns::DATE.to_string(), columns::ASSET_TOTAL.to_string()];
    header.extend(breakdown.iter().map(|c| c.to_string()));

    let mut table = vec![header];
    for snapshot in snapshots {
        let mut row = vec![snapshot.external_id(), snapshot.total.to_string()];
        row.extend(
            breakdown
                .iter()
                .map(|c| snapshot.balance(c).map(|v| v.to_string()).unwrap_or_default()),
        );
        table.push(row);
    }
    table
}

fn flag(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

fn write_bom_csv(path: &Path, table: Vec<Vec<String>>) -> Result<(), TransformError> {
    let output_error = |reason: String| TransformError::Output {
        path: path.to_path_buf(),
        reason,
    };

    let mut writer = WriterBuilder::new().from_writer(UTF8_BOM.as_bytes().to_vec());
    for row in &table {
        writer.write_record(row).map_err(|e| output_error(e.to_string()))?;
    }
    let bytes = writer.into_inner().map_err(|e| output_error(e.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| output_error(e.to_string()))?;
    }
    fs::write(path, bytes).map_err(|e| output_error(e.to_string()))
}
