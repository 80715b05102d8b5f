// ⚙️ Settings - typed view of config/settings.yaml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "HOUSEHOLD_SYNC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

// ============================================================================
// ROOT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceSettings,

    #[serde(default)]
    pub browser: BrowserSettings,

    #[serde(default)]
    pub special_rules: Vec<SpecialRuleConfig>,

    pub history: HistorySettings,

    pub mailbox: MailboxSettings,

    #[serde(default)]
    pub download: DownloadSettings,

    pub spreadsheet: SpreadsheetSettings,

    /// Optional analytics copy of the aggregated outputs
    #[serde(default)]
    pub warehouse: Option<WarehouseSettings>,

    pub paths: PathSettings,

    #[serde(default)]
    pub run: RunSettings,
}

impl Settings {
    /// Read and validate a YAML settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let settings = Settings::from_yaml(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings =
            serde_yaml::from_str(content).context("Failed to parse settings YAML")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.service.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service.base_url is empty".into()));
        }
        if self.history.months_to_download == 0 {
            return Err(ConfigError::Invalid(
                "history.months_to_download must be at least 1".into(),
            ));
        }
        if self.download.parallelism == 0 {
            return Err(ConfigError::Invalid("download.parallelism must be at least 1".into()));
        }
        if self.spreadsheet.batch_size == 0 {
            return Err(ConfigError::Invalid("spreadsheet.batch_size must be at least 1".into()));
        }

        for rule in &self.special_rules {
            if !rule.value.is_finite() || rule.value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "special rule for {} needs a positive value, got {}",
                    rule.institution, rule.value
                )));
            }
        }

        for sheet in &self.spreadsheet.worksheets {
            sheet.validate()?;
        }

        if let Some(warehouse) = &self.warehouse {
            warehouse.validate()?;
        }

        Ok(())
    }

    /// Absolute URL of a configured endpoint path.
    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.service.base_url.trim_end_matches('/'), endpoint)
    }
}

// ============================================================================
// SOURCE SERVICE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    pub base_url: String,

    pub endpoints: Endpoints,

    /// URL fragments the site redirects to when the account is locked
    #[serde(default = "default_lock_markers")]
    pub lock_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    pub login: String,
    pub accounts: String,
    pub history: String,
}

fn default_lock_markers() -> Vec<String> {
    vec!["/account_locked".to_string(), "/sign_in/locked".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Element wait timeout, seconds
    #[serde(default = "default_browser_timeout")]
    pub timeout: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_browser_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_true")]
    pub headless: bool,
}

impl BrowserSettings {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.backoff_ms))
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        BrowserSettings {
            webdriver_url: default_webdriver_url(),
            timeout: default_browser_timeout(),
            retry_count: default_retry_count(),
            backoff_ms: default_browser_backoff_ms(),
            headless: true,
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:4444".to_string()
}

fn default_browser_timeout() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    3
}

fn default_browser_backoff_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// `{institution, action, value}` as written in the settings file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpecialRuleConfig {
    pub institution: String,
    pub action: String,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySettings {
    pub months_to_download: u32,
}

// ============================================================================
// MAILBOX
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxSettings {
    pub sender: String,

    pub subject: String,

    #[serde(default = "default_code_pattern")]
    pub code_pattern: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on the wait for a verification email
    #[serde(default = "default_mailbox_timeout_secs")]
    pub timeout_secs: u64,

    /// Validity the site grants a verification code
    #[serde(default = "default_code_validity_minutes")]
    pub code_validity_minutes: u64,

    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,

    #[serde(default = "default_gmail_api_base")]
    pub api_base: String,
}

impl MailboxSettings {
    /// Gmail search query matching the verification emails.
    pub fn query(&self) -> String {
        format!("from:{} subject:\"{}\"", self.sender, self.subject)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_code_pattern() -> String {
    r"\d{6}".to_string()
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_mailbox_timeout_secs() -> u64 {
    60
}

fn default_code_validity_minutes() -> u64 {
    10
}

fn default_max_code_attempts() -> u32 {
    2
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}

// ============================================================================
// DOWNLOAD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Direct authenticated GET with the session cookies
    Http,
    /// Navigate the browser session to each export URL
    Browser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSettings {
    #[serde(default = "default_download_mode")]
    pub mode: DownloadMode,

    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_download_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_download_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl DownloadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.backoff_ms))
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        DownloadSettings {
            mode: default_download_mode(),
            timeout_secs: default_download_timeout_secs(),
            retry_count: default_retry_count(),
            poll_interval_ms: default_download_poll_ms(),
            backoff_ms: default_download_backoff_ms(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_download_mode() -> DownloadMode {
    DownloadMode::Http
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_download_poll_ms() -> u64 {
    500
}

fn default_download_backoff_ms() -> u64 {
    1000
}

fn default_parallelism() -> usize {
    2
}

// ============================================================================
// SPREADSHEET
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SpreadsheetSettings {
    /// Spreadsheet key; falls back to the SPREADSHEET_KEY env var when empty
    #[serde(default)]
    pub key: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_sheet_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_sheets_api_base")]
    pub api_base: String,

    pub worksheets: Vec<WorksheetSettings>,
}

impl SpreadsheetSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.backoff_ms))
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_sheet_backoff_ms() -> u64 {
    1000
}

fn default_sheets_api_base() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}

/// Which record set a worksheet mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Transactions,
    Assets,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorksheetSettings {
    pub name: String,

    pub dataset: Dataset,

    /// First data row (1-based, below the header)
    pub start_row: u32,

    /// Column holding the external id
    #[serde(default = "default_key_column")]
    pub key_column: String,

    pub columns: Vec<ColumnSettings>,
}

impl WorksheetSettings {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.start_row == 0 {
            return Err(ConfigError::Invalid(format!(
                "worksheet {}: start_row is 1-based",
                self.name
            )));
        }
        if self.columns.iter().any(|c| c.col == 0) {
            return Err(ConfigError::Invalid(format!(
                "worksheet {}: column numbers are 1-based",
                self.name
            )));
        }
        if !self.columns.iter().any(|c| c.name == self.key_column) {
            return Err(ConfigError::Invalid(format!(
                "worksheet {}: key column '{}' is not mapped",
                self.name, self.key_column
            )));
        }

        let mut cols: Vec<u32> = self.columns.iter().map(|c| c.col).collect();
        cols.sort_unstable();
        cols.dedup();
        if cols.len() != self.columns.len() {
            return Err(ConfigError::Invalid(format!(
                "worksheet {}: two columns share a position",
                self.name
            )));
        }

        Ok(())
    }
}

fn default_key_column() -> String {
    "ID".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnSettings {
    pub name: String,
    /// 1-based column number
    pub col: u32,
}

// ============================================================================
// WAREHOUSE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseSettings {
    pub project: String,

    #[serde(default = "default_warehouse_dataset")]
    pub dataset: String,

    #[serde(default = "default_transactions_table")]
    pub transactions_table: String,

    #[serde(default = "default_assets_table")]
    pub assets_table: String,

    /// Rows per insert request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_sheet_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_bigquery_api_base")]
    pub api_base: String,
}

impl WarehouseSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.backoff_ms))
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("warehouse.project is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("warehouse.batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_warehouse_dataset() -> String {
    "moneyforward".to_string()
}

fn default_transactions_table() -> String {
    "raw_transactions".to_string()
}

fn default_assets_table() -> String {
    "raw_assets".to_string()
}

fn default_bigquery_api_base() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

// ============================================================================
// PATHS & RUN
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    pub downloads: PathBuf,
    pub staging: PathBuf,
    pub outputs: PathBuf,
}

impl PathSettings {
    pub fn aggregated_dir(&self) -> PathBuf {
        self.outputs.join("aggregated_files")
    }

    pub fn error_page(&self) -> PathBuf {
        self.outputs.join("error_page.html")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl RunSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    1800
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
service:
  base_url: "https://moneyforward.test"
  endpoints:
    login: "/sign_in"
    accounts: "/cf"
    history: "/bs/history"
browser:
  timeout: 1
  retry_count: 2
  backoff_ms: 1
special_rules:
  - institution: "アメリカン・エキスプレスカード"
    action: "divide_amount"
    value: 2
history:
  months_to_download: 3
mailbox:
  sender: "do_not_reply@moneyforward.test"
  subject: "Additional Authentication via Email"
spreadsheet:
  key: "sheet-key"
  worksheets:
    - name: "家計簿データ"
      dataset: transactions
      start_row: 5
      columns:
        - { name: "日付", col: 1 }
        - { name: "内容", col: 2 }
        - { name: "金額（円）", col: 3 }
        - { name: "保有金融機関", col: 4 }
        - { name: "ID", col: 5 }
    - name: "資産推移"
      dataset: assets
      start_row: 5
      key_column: "日付"
      columns:
        - { name: "日付", col: 1 }
        - { name: "合計（円）", col: 2 }
paths:
  downloads: "downloads"
  staging: "staging"
  outputs: "outputs"
"#;

    pub(crate) fn sample() -> Settings {
        Settings::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        let settings = sample();

        assert_eq!(settings.url(&settings.service.endpoints.login), "https://moneyforward.test/sign_in");
        assert_eq!(settings.browser.webdriver_url, "http://localhost:4444");
        assert_eq!(settings.download.mode, DownloadMode::Http);
        assert_eq!(settings.spreadsheet.batch_size, 500);
        assert_eq!(settings.run.deadline_secs, 1800);
        assert_eq!(settings.mailbox.code_pattern, r"\d{6}");
        assert_eq!(settings.special_rules.len(), 1);
        assert_eq!(settings.spreadsheet.worksheets[0].key_column, "ID");
        assert_eq!(settings.spreadsheet.worksheets[1].dataset, Dataset::Assets);
        assert_eq!(settings.paths.error_page(), PathBuf::from("outputs/error_page.html"));
    }

    #[test]
    fn test_mailbox_query() {
        let settings = sample();
        assert_eq!(
            settings.mailbox.query(),
            "from:do_not_reply@moneyforward.test subject:\"Additional Authentication via Email\""
        );
    }

    #[test]
    fn test_rejects_unmapped_key_column() {
        let broken = SAMPLE.replace("key_column: \"日付\"", "key_column: \"残高\"");
        assert!(Settings::from_yaml(&broken).is_err());
    }

    #[test]
    fn test_rejects_non_positive_rule_value() {
        let broken = SAMPLE.replace("value: 2", "value: 0");
        assert!(Settings::from_yaml(&broken).is_err());
    }

    #[test]
    fn test_rejects_zero_months() {
        let broken = SAMPLE.replace("months_to_download: 3", "months_to_download: 0");
        assert!(Settings::from_yaml(&broken).is_err());
    }

    #[test]
    fn test_warehouse_is_optional() {
        assert!(sample().warehouse.is_none());

        let with_warehouse = format!("{}\nwarehouse:\n  project: \"household-123\"\n", SAMPLE);
        let warehouse = Settings::from_yaml(&with_warehouse).unwrap().warehouse.unwrap();
        assert_eq!(warehouse.dataset, "moneyforward");
        assert_eq!(warehouse.transactions_table, "raw_transactions");
        assert_eq!(warehouse.assets_table, "raw_assets");

        let blank = format!("{}\nwarehouse:\n  project: \"\"\n", SAMPLE);
        assert!(Settings::from_yaml(&blank).is_err());
    }

    #[test]
    fn test_shipped_settings_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let settings = Settings::load(&path).unwrap();

        assert_eq!(settings.history.months_to_download, 12);
        assert_eq!(settings.spreadsheet.worksheets.len(), 2);
        assert!(settings.spreadsheet.key.is_empty());
        assert!(settings.warehouse.is_none());
    }
}
