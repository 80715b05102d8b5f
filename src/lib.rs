// Household Sync - Core Library
// Aggregator exports → canonical records → shared spreadsheet

pub mod auth;
pub mod browser;
pub mod config;
pub mod deduplication;
pub mod download;
pub mod error;
pub mod harvest;
pub mod logging;
pub mod mailbox;
pub mod parser;
pub mod pipeline;
pub mod records;
pub mod retry;
pub mod rules;
pub mod secrets;
pub mod sheets;
pub mod transform;
pub mod warehouse;

// Re-export commonly used types
pub use auth::{login, AuthSettings, AuthState, Authenticator, VerificationChallenge};
pub use browser::{webdriver::WebDriverBrowser, Browser, BrowserSession, Selector, SessionCloser};
pub use config::{Settings, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
pub use deduplication::{DeduplicationEngine, DuplicateMatch, MatchStrategy};
pub use download::{DownloadReport, ExportTrigger, FileDownloader};
pub use error::{
    AuthenticationError, BrowserError, ConfigError, DownloadError, MailboxError, PipelineError,
    Stage, SyncError, TransformError, WarehouseError,
};
pub use harvest::{HarvestReport, LinkHarvester};
pub use mailbox::{GmailMailbox, Mailbox, MailboxPoller, VerificationCode};
pub use parser::{detect_kind, get_parser, ExportParser, ParsedExport};
pub use pipeline::{Collaborators, Issue, Pipeline, RunOutcome, RunReport};
pub use records::{AssetSnapshot, CanonicalRecord, DownloadedFile, ExportLink, Period, RawRecord, ReportKind};
pub use retry::RetryPolicy;
pub use rules::{RuleAction, RuleEngine, SpecialRule};
pub use secrets::{Credential, CredentialProvider, EnvCredentialProvider};
pub use sheets::{GoogleSheetsClient, SheetRow, SpreadsheetApi, Synchronizer, SyncPlan};
pub use transform::{TransformEngine, TransformReport};
pub use warehouse::{BigQueryClient, Warehouse, WarehouseLoader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
