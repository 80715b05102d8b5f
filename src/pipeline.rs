// 🚀 Pipeline - Authenticate → Harvest → Download → Transform → Sync → Load
//
// Stages run one after another under a single run deadline. Per-item problems
// (an empty month, a failed download, an unparsable file, a warehouse table)
// are collected as issues. Failed login and a worksheet that exhausts its
// retries are fatal. Hitting the deadline after login stops the run with what
// it already finished.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{login_with, AuthSettings};
use crate::browser::BrowserSession;
use crate::config::{Dataset, DownloadMode, Settings};
use crate::download::{BrowserExportTrigger, DownloadReport, ExportTrigger, FileDownloader, HttpExportTrigger};
use crate::error::{DownloadError, PipelineError, Stage};
use crate::harvest::LinkHarvester;
use crate::mailbox::{Mailbox, MailboxPoller};
use crate::records::{DownloadedFile, Period, ReportKind};
use crate::secrets::Credential;
use crate::sheets::{SpreadsheetApi, Synchronizer, WorksheetOutcome};
use crate::transform::{AggregatedOutputs, TransformEngine, TransformReport};
use crate::warehouse::{Warehouse, WarehouseLoader};

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    PartialSuccess,
    Fatal,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success | RunOutcome::PartialSuccess => 0,
            RunOutcome::Fatal => 1,
        }
    }
}

/// Something skipped or failed without ending the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub stage: Stage,
    pub report_kind: Option<ReportKind>,
    pub period: Option<Period>,
    pub institution: Option<String>,
    pub worksheet: Option<String>,
    pub table: Option<String>,
    pub message: String,
}

impl Issue {
    fn new(stage: Stage, message: impl Into<String>) -> Self {
        Issue {
            stage,
            report_kind: None,
            period: None,
            institution: None,
            worksheet: None,
            table: None,
            message: message.into(),
        }
    }

    fn for_export(mut self, report_kind: ReportKind, period: Option<Period>) -> Self {
        self.report_kind = Some(report_kind);
        self.period = period;
        self
    }

    fn with_institution(mut self, institution: Option<String>) -> Self {
        self.institution = institution;
        self
    }

    fn for_worksheet(mut self, worksheet: &str) -> Self {
        self.worksheet = Some(worksheet.to_string());
        self
    }

    fn for_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunCounters {
    pub links: usize,
    pub empty_periods: usize,
    pub staged: usize,
    pub transactions: usize,
    pub assets: usize,
    pub adjusted: usize,
    pub duplicates: usize,
    pub rows_inserted: usize,
    pub cells_updated: usize,
    pub rows_loaded: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub completed: Vec<Stage>,
    /// Stage the run deadline cut short
    pub interrupted: Option<Stage>,
    pub counters: RunCounters,
    pub worksheets: Vec<WorksheetOutcome>,
    pub outputs: Option<AggregatedOutputs>,
    pub issues: Vec<Issue>,
    pub fatal: Option<PipelineError>,
}

impl RunReport {
    fn start() -> Self {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            completed: Vec::new(),
            interrupted: None,
            counters: RunCounters::default(),
            worksheets: Vec::new(),
            outputs: None,
            issues: Vec::new(),
            fatal: None,
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.fatal.is_some() {
            RunOutcome::Fatal
        } else if self.issues.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::PartialSuccess
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }

    fn complete(&mut self, stage: Stage) {
        info!(run_id = %self.run_id, stage = %stage, "stage complete");
        self.completed.push(stage);
    }

    /// Deadline after login keeps the finished stages; anything else is fatal.
    fn fail(&mut self, err: PipelineError) {
        if let PipelineError::DeadlineExceeded { stage, .. } = &err {
            if *stage != Stage::Authenticate {
                warn!(run_id = %self.run_id, stage = %stage, completed = ?self.completed, "run deadline reached");
                self.interrupted = Some(*stage);
                self.issues.push(Issue::new(*stage, err.to_string()));
                return;
            }
        }
        self.fatal = Some(err);
    }

    fn log_issues(&self) {
        for issue in &self.issues {
            warn!(
                run_id = %self.run_id,
                stage = %issue.stage,
                kind = ?issue.report_kind.map(|k| k.code()),
                period = ?issue.period.map(|p| p.to_string()),
                institution = ?issue.institution,
                worksheet = ?issue.worksheet,
                table = ?issue.table,
                "{}",
                issue.message
            );
        }
    }

    fn log_summary(&self) {
        let c = &self.counters;
        match self.outcome() {
            RunOutcome::Success => info!(
                run_id = %self.run_id,
                links = c.links,
                staged = c.staged,
                transactions = c.transactions,
                assets = c.assets,
                adjusted = c.adjusted,
                inserted = c.rows_inserted,
                updated = c.cells_updated,
                loaded = c.rows_loaded,
                "run succeeded"
            ),
            RunOutcome::PartialSuccess => {
                self.log_issues();
                warn!(
                    run_id = %self.run_id,
                    issues = self.issues.len(),
                    interrupted = ?self.interrupted.map(|s| s.to_string()),
                    inserted = c.rows_inserted,
                    updated = c.cells_updated,
                    "run partially succeeded"
                );
            }
            RunOutcome::Fatal => {
                self.log_issues();
                if let Some(err) = &self.fatal {
                    error!(run_id = %self.run_id, stage = ?err.stage().map(|s| s.to_string()), error = %err, "run failed");
                }
            }
        }
    }
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Everything the run talks to, created by the caller.
pub struct Collaborators<M: Mailbox, A: SpreadsheetApi> {
    pub session: BrowserSession,
    pub poller: MailboxPoller<M>,
    pub sheets: A,
    pub credential: Credential,
    /// Analytics copy; skipped when absent
    pub warehouse: Option<Box<dyn Warehouse>>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    settings: Settings,
    auth: AuthSettings,
    today: Option<NaiveDate>,
    deadline: Option<Duration>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let auth = AuthSettings::from_settings(&settings);
        Pipeline {
            settings,
            auth,
            today: None,
            deadline: None,
        }
    }

    pub fn with_auth_settings(mut self, auth: AuthSettings) -> Self {
        self.auth = auth;
        self
    }

    /// Pin the harvest window and output file names to a date.
    pub fn as_of(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Override `run.deadline_secs`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn run_deadline(&self) -> Duration {
        self.deadline.unwrap_or_else(|| self.settings.run.deadline())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run<M: Mailbox, A: SpreadsheetApi>(&self, collaborators: Collaborators<M, A>) -> RunReport {
        let mut report = RunReport::start();
        let deadline = Instant::now() + self.run_deadline();
        info!(run_id = %report.run_id, deadline = ?self.run_deadline(), "run started");

        // The session may be dropped mid-stage by the deadline; the driver still has to go.
        let closer = collaborators.session.closer();
        let result = self.execute(collaborators, deadline, &mut report).await;
        let _ = closer.close().await;

        if let Err(err) = result {
            report.fail(err);
        }

        report.finished_at = Some(Utc::now());
        report.log_summary();
        report
    }

    async fn execute<M: Mailbox, A: SpreadsheetApi>(
        &self,
        collaborators: Collaborators<M, A>,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let Collaborators {
            session,
            mut poller,
            sheets,
            credential,
            warehouse,
        } = collaborators;
        let engine = TransformEngine::from_settings(&self.settings)?;

        // ---- authenticate
        let login = login_with(session, self.auth.clone(), &self.settings, &credential, &mut poller);
        let session = match self.within(deadline, Stage::Authenticate, login).await? {
            Ok(session) => session,
            Err(failure) => {
                close(failure.session).await;
                return Err(PipelineError::Authentication {
                    state: failure.failed_in.to_string(),
                    source: failure.error,
                });
            }
        };
        report.complete(Stage::Authenticate);

        // ---- harvest + download share the live session
        let staged = self.collect_exports(&session, deadline, report).await;
        close(session).await;
        let staged = staged?;

        // ---- transform
        let transformed = self.transform(&engine, &staged, deadline, report)?;

        // ---- sync, then load; a failed worksheet still lets the warehouse copy go out
        let synced = self
            .sync(Synchronizer::new(sheets, &self.settings.spreadsheet), &transformed, deadline, report)
            .await;
        if matches!(synced, Err(PipelineError::DeadlineExceeded { .. })) {
            return synced;
        }
        let loaded = self.load(warehouse.as_deref(), &transformed, deadline, report).await;

        synced.and(loaded)
    }

    async fn collect_exports(
        &self,
        session: &BrowserSession,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<Vec<DownloadedFile>, PipelineError> {
        let mut harvester = LinkHarvester::new(&self.settings);
        if let Some(today) = self.today {
            harvester = harvester.as_of(today);
        }

        let harvest = self.within(deadline, Stage::Harvest, harvester.harvest(session)).await??;
        report.counters.links = harvest.links.len();
        report.counters.empty_periods = harvest.empty_periods.len();
        for failure in &harvest.failures {
            report.issues.push(
                Issue::new(Stage::Harvest, failure.reason.clone()).for_export(failure.report_kind, failure.period),
            );
        }
        report.complete(Stage::Harvest);

        let downloads = match self.settings.download.mode {
            DownloadMode::Http => {
                let trigger = HttpExportTrigger::from_session(session).await?;
                self.within(deadline, Stage::Download, self.download(trigger, &harvest.links)).await??
            }
            DownloadMode::Browser => {
                let trigger = BrowserExportTrigger::new(session);
                self.within(deadline, Stage::Download, self.download(trigger, &harvest.links)).await??
            }
        };

        report.counters.staged = downloads.staged.len();
        for failed in downloads.failed {
            report.issues.push(
                Issue::new(Stage::Download, failed.error.to_string())
                    .for_export(failed.link.report_kind, Some(failed.link.period))
                    .with_institution(failed.link.institution_hint),
            );
        }
        report.complete(Stage::Download);

        Ok(downloads.staged)
    }

    async fn download<T: ExportTrigger>(
        &self,
        trigger: T,
        links: &[crate::records::ExportLink],
    ) -> Result<DownloadReport, DownloadError> {
        let downloader = FileDownloader::new(trigger, &self.settings);
        downloader.prepare_dirs().await?;
        Ok(downloader.download_all(links).await)
    }

    fn transform(
        &self,
        engine: &TransformEngine,
        staged: &[DownloadedFile],
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<TransformReport, PipelineError> {
        if Instant::now() >= deadline {
            return Err(self.deadline_error(Stage::Transform));
        }

        let transformed = engine.run(staged);
        report.counters.transactions = transformed.transactions.len();
        report.counters.assets = transformed.assets.len();
        report.counters.adjusted = transformed.adjusted_count();
        report.counters.duplicates = transformed.duplicates.len();
        for skipped in &transformed.skipped {
            report.issues.push(
                Issue::new(Stage::Transform, skipped.error.to_string())
                    .for_export(skipped.report_kind, Some(skipped.period)),
            );
        }

        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        match engine.write_outputs(&transformed, today) {
            Ok(outputs) => report.outputs = Some(outputs),
            Err(err) => report.issues.push(Issue::new(Stage::Transform, err.to_string())),
        }

        report.complete(Stage::Transform);
        Ok(transformed)
    }

    /// Worksheets sync independently; any that gives up fails the run once the rest are done.
    async fn sync<A: SpreadsheetApi>(
        &self,
        synchronizer: Synchronizer<A>,
        transformed: &TransformReport,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let mut failed = Vec::new();

        for definition in &self.settings.spreadsheet.worksheets {
            let synced = match definition.dataset {
                Dataset::Transactions => {
                    self.within(deadline, Stage::Sync, synchronizer.sync_worksheet(definition, &transformed.transactions))
                        .await
                }
                Dataset::Assets => {
                    self.within(deadline, Stage::Sync, synchronizer.sync_worksheet(definition, &transformed.assets))
                        .await
                }
            };

            let outcome = match synced {
                Ok(outcome) => outcome,
                Err(deadline_err) if failed.is_empty() => return Err(deadline_err),
                Err(deadline_err) => {
                    report.issues.push(Issue::new(Stage::Sync, deadline_err.to_string()).for_worksheet(&definition.name));
                    break;
                }
            };

            match outcome {
                Ok(outcome) => {
                    report.counters.rows_inserted += outcome.inserted;
                    report.counters.cells_updated += outcome.updated_cells;
                    report.worksheets.push(outcome);
                }
                Err(err) => {
                    error!(worksheet = %definition.name, error = %err, "worksheet sync failed");
                    report.issues.push(Issue::new(Stage::Sync, err.to_string()).for_worksheet(&definition.name));
                    failed.push(definition.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(PipelineError::Sync { worksheets: failed });
        }
        report.complete(Stage::Sync);
        Ok(())
    }

    async fn load(
        &self,
        warehouse: Option<&dyn Warehouse>,
        transformed: &TransformReport,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let (Some(settings), Some(warehouse)) = (&self.settings.warehouse, warehouse) else {
            debug!("no warehouse configured, skipping load");
            return Ok(());
        };

        let loader = WarehouseLoader::new(warehouse, settings);
        let loads = self.within(deadline, Stage::Load, loader.load(transformed, Utc::now())).await?;
        for load in loads {
            match load.result {
                Ok(()) => report.counters.rows_loaded += load.rows,
                Err(err) => report.issues.push(Issue::new(Stage::Load, err.to_string()).for_table(&load.table)),
            }
        }

        report.complete(Stage::Load);
        Ok(())
    }

    async fn within<T>(&self, deadline: Instant, stage: Stage, fut: impl Future<Output = T>) -> Result<T, PipelineError> {
        timeout_at(deadline, fut)
            .await
            .map_err(|_| self.deadline_error(stage))
    }

    fn deadline_error(&self, stage: Stage) -> PipelineError {
        PipelineError::DeadlineExceeded {
            stage,
            deadline: self.run_deadline(),
        }
    }
}

async fn close(session: BrowserSession) {
    // close() already logs a failed quit
    let _ = session.close().await;
}
