// 🚨 Error Taxonomy
// One enum per pipeline stage; the pipeline decides which ones are fatal.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::records::{Period, ReportKind};

// ============================================================================
// BROWSER
// ============================================================================

/// Failures raised by the browser capability and the session manager.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Selector matched nothing on the current page.
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    /// Element reference went stale between lookup and action.
    #[error("stale element reference: {selector}")]
    StaleElement { selector: String },

    /// A bounded wait ran out.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Navigation landed somewhere outside the expected site.
    #[error("unexpected url: expected prefix {expected}, landed on {actual}")]
    UnexpectedUrl { expected: String, actual: String },

    /// The site reports the account as locked or blocked.
    #[error("account locked (landed on {url})")]
    AccountLocked { url: String },

    /// WebDriver protocol or transport failure.
    #[error("webdriver error: {0}")]
    Driver(String),

    /// Retries of a transient failure ran out.
    #[error("{action} failed after {attempts} attempts: {last}")]
    Exhausted {
        action: String,
        attempts: u32,
        #[source]
        last: Box<BrowserError>,
    },
}

impl BrowserError {
    /// Only element-not-found, stale-element and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrowserError::ElementNotFound { .. }
                | BrowserError::StaleElement { .. }
                | BrowserError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrowserError::ElementNotFound { .. } | BrowserError::StaleElement { .. }
        )
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        BrowserError::Driver(err.to_string())
    }
}

// ============================================================================
// MAILBOX
// ============================================================================

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mailbox api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("could not decode message {message_id}: {reason}")]
    Decode { message_id: String, reason: String },

    #[error("no verification email arrived within {waited:?}")]
    Timeout { waited: Duration },
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("login rejected: invalid credentials")]
    InvalidCredentials,

    #[error("second factor not completed: no matching code within {waited:?}")]
    SecondFactorTimeout { waited: Duration },

    #[error("verification challenge expired before a code was accepted")]
    ChallengeExpired,

    #[error("verification code rejected {attempts} times")]
    CodeRejected { attempts: u32 },

    #[error("unexpected page while {state}: {url}")]
    UnexpectedPage { state: String, url: String },

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("mailbox unavailable: {0}")]
    Mailbox(#[from] MailboxError),
}

// ============================================================================
// DOWNLOAD
// ============================================================================

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("export trigger failed: {0}")]
    Trigger(String),

    #[error("export request returned status {status}")]
    Status { status: u16 },

    #[error("no finished file appeared within {waited:?}")]
    Timeout { waited: Duration },

    #[error("downloaded file is empty: {}", path.display())]
    EmptyFile { path: PathBuf },

    #[error("downloaded file is corrupt ({reason}): {}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("could not stage {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("{kind} {period}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        kind: ReportKind,
        period: Period,
        attempts: u32,
        #[source]
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Staging failures are local disk problems; a fresh export will not fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DownloadError::Staging { .. } | DownloadError::Exhausted { .. })
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Trigger(err.to_string())
    }
}

// ============================================================================
// TRANSFORM
// ============================================================================

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: no usable encoding (tried {})", path.display(), tried.join(", "))]
    Encoding {
        path: PathBuf,
        tried: Vec<String>,
    },

    #[error("{}: unrecognised export layout", path.display())]
    UnknownLayout { path: PathBuf },

    #[error("{}: expected a {expected} export, found {found}", path.display())]
    KindMismatch {
        path: PathBuf,
        expected: ReportKind,
        found: ReportKind,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Row {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("could not write {}: {reason}", path.display())]
    Output { path: PathBuf, reason: String },
}

// ============================================================================
// SYNC
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("spreadsheet request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("spreadsheet api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("worksheet {worksheet}: {reason}")]
    Mapping { worksheet: String, reason: String },

    #[error("worksheet {worksheet}: {operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        worksheet: String,
        operation: String,
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },
}

impl SyncError {
    /// Network failures, throttling and server errors are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(_) => true,
            SyncError::Api { status, .. } => *status == 429 || *status >= 500,
            SyncError::Mapping { .. } | SyncError::Exhausted { .. } => false,
        }
    }
}

// ============================================================================
// WAREHOUSE
// ============================================================================

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("warehouse api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("table {table}: {rejected} rows rejected: {reason}")]
    Rejected {
        table: String,
        rejected: usize,
        reason: String,
    },

    #[error("table {table}: insert gave up after {attempts} attempts: {last}")]
    Exhausted {
        table: String,
        attempts: u32,
        #[source]
        last: Box<WarehouseError>,
    },
}

impl WarehouseError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::Http(_) => true,
            WarehouseError::Api { status, .. } => *status == 429 || *status >= 500,
            WarehouseError::Rejected { .. } | WarehouseError::Exhausted { .. } => false,
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing secret: environment variable {0} is not set")]
    MissingSecret(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown special rule action '{action}' for {institution}")]
    UnknownRuleAction { institution: String, action: String },
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Authenticate,
    Harvest,
    Download,
    Transform,
    Sync,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Authenticate => "authenticate",
            Stage::Harvest => "harvest",
            Stage::Download => "download",
            Stage::Transform => "transform",
            Stage::Sync => "sync",
            Stage::Load => "load",
        };
        f.write_str(name)
    }
}

/// Conditions that end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("authentication failed while {state}: {source}")]
    Authentication {
        state: String,
        #[source]
        source: AuthenticationError,
    },

    #[error("browser session unusable: {0}")]
    Browser(#[from] BrowserError),

    #[error("download stage failed: {0}")]
    Download(#[from] DownloadError),

    #[error("worksheet sync gave up for {}", .worksheets.join(", "))]
    Sync { worksheets: Vec<String> },

    #[error("run deadline of {deadline:?} passed during {stage}")]
    DeadlineExceeded { stage: Stage, deadline: Duration },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Config(_) => None,
            PipelineError::Authentication { .. } => Some(Stage::Authenticate),
            PipelineError::Browser(_) => Some(Stage::Harvest),
            PipelineError::Download(_) => Some(Stage::Download),
            PipelineError::Sync { .. } => Some(Stage::Sync),
            PipelineError::DeadlineExceeded { stage, .. } => Some(*stage),
        }
    }
}
