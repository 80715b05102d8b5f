// 📥 File Downloader - trigger, wait, verify, stage
//
// One ExportLink = one retried cycle of:
//   trigger export → poll download dir → reject empty/HTML → move to staging
// A link that exhausts its retries is reported as failed; the others carry on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{cookie_header, BrowserSession};
use crate::config::Settings;
use crate::error::{BrowserError, DownloadError};
use crate::records::{checksum_file, DownloadedFile, ExportLink};
use crate::retry::{RetryError, RetryPolicy};

/// Browsers write these while a download is still running
const IN_FLIGHT_EXTENSIONS: [&str; 3] = ["crdownload", "part", "tmp"];

/// Bytes inspected when sniffing for an HTML page
const SNIFF_LEN: usize = 512;

// ============================================================================
// TRIGGERS
// ============================================================================

#[async_trait]
pub trait ExportTrigger: Send + Sync {
    /// Make the export appear in `dir`. Returns the file name when the
    /// trigger chooses it; `None` means "whatever new file shows up".
    async fn trigger(&self, link: &ExportLink, dir: &Path) -> Result<Option<String>, DownloadError>;

    /// Whether several links may be triggered at once.
    fn supports_parallel(&self) -> bool;
}

/// Direct GET carrying the browser session's cookies.
pub struct HttpExportTrigger {
    client: reqwest::Client,
    cookie_header: String,
}

impl HttpExportTrigger {
    pub fn new(cookie_header: impl Into<String>) -> Self {
        HttpExportTrigger {
            client: reqwest::Client::new(),
            cookie_header: cookie_header.into(),
        }
    }

    pub async fn from_session(session: &BrowserSession) -> Result<Self, BrowserError> {
        let cookies = session.cookies().await?;
        debug!(count = cookies.len(), "copied session cookies for direct download");
        Ok(HttpExportTrigger::new(cookie_header(&cookies)))
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }
}

#[async_trait]
impl ExportTrigger for HttpExportTrigger {
    async fn trigger(&self, link: &ExportLink, dir: &Path) -> Result<Option<String>, DownloadError> {
        let resp = self
            .client
            .get(&link.url)
            .header(reqwest::header::COOKIE, &self.cookie_header)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status { status: status.as_u16() });
        }

        let bytes = resp.bytes().await?;
        let name = link.file_name();
        let partial = dir.join(format!("{}.part", name));
        fs::write(&partial, &bytes).await?;
        fs::rename(&partial, dir.join(&name)).await?;

        debug!(url = %link.url, bytes = bytes.len(), file = %name, "export fetched");
        Ok(Some(name))
    }

    fn supports_parallel(&self) -> bool {
        true
    }
}

/// Navigates the shared browser session; the browser saves the file.
pub struct BrowserExportTrigger<'a> {
    session: &'a BrowserSession,
}

impl<'a> BrowserExportTrigger<'a> {
    pub fn new(session: &'a BrowserSession) -> Self {
        BrowserExportTrigger { session }
    }
}

#[async_trait]
impl<'a> ExportTrigger for BrowserExportTrigger<'a> {
    async fn trigger(&self, link: &ExportLink, _dir: &Path) -> Result<Option<String>, DownloadError> {
        self.session.navigate(&link.url).await?;
        Ok(None)
    }

    fn supports_parallel(&self) -> bool {
        false
    }
}

// ============================================================================
// DOWNLOADER
// ============================================================================

#[derive(Debug)]
pub struct FailedDownload {
    pub link: ExportLink,
    pub error: DownloadError,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Ordered by (report_kind, period)
    pub staged: Vec<DownloadedFile>,
    pub failed: Vec<FailedDownload>,
}

pub struct FileDownloader<T: ExportTrigger> {
    trigger: T,
    download_dir: PathBuf,
    staging_dir: PathBuf,
    policy: RetryPolicy,
    timeout: Duration,
    poll_interval: Duration,
    parallelism: usize,
}

impl<T: ExportTrigger> FileDownloader<T> {
    pub fn new(trigger: T, settings: &Settings) -> Self {
        FileDownloader {
            trigger,
            download_dir: settings.paths.downloads.clone(),
            staging_dir: settings.paths.staging.clone(),
            policy: settings.download.retry_policy(),
            timeout: Duration::from_secs(settings.download.timeout_secs),
            poll_interval: Duration::from_millis(settings.download.poll_interval_ms),
            parallelism: settings.download.parallelism.max(1),
        }
    }

    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create both directories and empty the download directory.
    pub async fn prepare_dirs(&self) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.download_dir).await?;
        fs::create_dir_all(&self.staging_dir).await?;

        let mut removed = 0;
        let mut entries = fs::read_dir(&self.download_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }

        info!(dir = %self.download_dir.display(), removed, "download directory cleaned");
        Ok(())
    }

    pub async fn download_all(&self, links: &[ExportLink]) -> DownloadReport {
        let width = if self.trigger.supports_parallel() { self.parallelism } else { 1 };
        info!(links = links.len(), parallelism = width, "downloading exports");

        let results: Vec<(ExportLink, Result<DownloadedFile, DownloadError>)> =
            stream::iter(links.iter().cloned())
                .map(|link| async move {
                    let result = self.download_one(&link).await;
                    (link, result)
                })
                .buffer_unordered(width)
                .collect()
                .await;

        let mut report = DownloadReport::default();
        for (link, result) in results {
            match result {
                Ok(file) => report.staged.push(file),
                Err(error) => {
                    warn!(kind = %link.report_kind, period = %link.period, error = %error, "download failed");
                    report.failed.push(FailedDownload { link, error });
                }
            }
        }
        report.staged.sort_by_key(|f| (f.report_kind, f.period));

        info!(staged = report.staged.len(), failed = report.failed.len(), "downloads finished");
        report
    }

    /// The full trigger-and-wait cycle with retries.
    pub async fn download_one(&self, link: &ExportLink) -> Result<DownloadedFile, DownloadError> {
        let label = format!("download {} {}", link.report_kind, link.period);
        let result = self
            .policy
            .run(&label, |_| self.attempt(link), DownloadError::is_retryable)
            .await;

        match result {
            Ok(file) => {
                info!(
                    kind = %file.report_kind,
                    period = %file.period,
                    size = file.size,
                    path = %file.path.display(),
                    "export staged"
                );
                Ok(file)
            }
            Err(RetryError::Aborted { error, .. }) => Err(error),
            Err(RetryError::Exhausted { attempts, last }) => Err(DownloadError::Exhausted {
                kind: link.report_kind,
                period: link.period,
                attempts,
                last: Box::new(last),
            }),
        }
    }

    async fn attempt(&self, link: &ExportLink) -> Result<DownloadedFile, DownloadError> {
        let before = self.snapshot().await?;
        let expected = self.trigger.trigger(link, &self.download_dir).await?;
        let path = self.wait_for_file(expected.as_deref(), &before).await?;

        if let Err(err) = verify(&path).await {
            // A rejected file must not be mistaken for the next attempt's result
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }

        self.stage(link, &path).await
    }

    async fn snapshot(&self) -> Result<HashSet<PathBuf>, DownloadError> {
        let mut seen = HashSet::new();
        let mut entries = fs::read_dir(&self.download_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            seen.insert(entry.path());
        }
        Ok(seen)
    }

    /// Poll until a finished file's size holds still across two polls.
    async fn wait_for_file(&self, expected: Option<&str>, before: &HashSet<PathBuf>) -> Result<PathBuf, DownloadError> {
        let deadline = Instant::now() + self.timeout;
        let mut last: Option<(PathBuf, u64)> = None;

        loop {
            if let Some(candidate) = self.candidate(expected, before).await? {
                let size = fs::metadata(&candidate).await?.len();
                match &last {
                    Some((path, previous)) if *path == candidate && *previous == size => {
                        return Ok(candidate);
                    }
                    _ => last = Some((candidate, size)),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DownloadError::Timeout { waited: self.timeout });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn candidate(&self, expected: Option<&str>, before: &HashSet<PathBuf>) -> Result<Option<PathBuf>, DownloadError> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        let mut entries = fs::read_dir(&self.download_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_in_flight(&path) || !entry.file_type().await?.is_file() {
                continue;
            }

            let matches = match expected {
                Some(name) => path.file_name().is_some_and(|n| n == name),
                None => !before.contains(&path),
            };
            if !matches {
                continue;
            }

            let modified = entry.metadata().await?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }

    /// Move into `{staging}/{kind}/{period}.csv`, replacing any earlier copy.
    async fn stage(&self, link: &ExportLink, source: &Path) -> Result<DownloadedFile, DownloadError> {
        let dir = self.staging_dir.join(link.report_kind.code());
        let target = dir.join(format!("{}.csv", link.period));
        let staging = |source: std::io::Error| DownloadError::Staging {
            path: target.clone(),
            source,
        };

        fs::create_dir_all(&dir).await.map_err(staging)?;
        if fs::try_exists(&target).await.map_err(staging)? {
            debug!(path = %target.display(), "replacing stale staged file");
            fs::remove_file(&target).await.map_err(staging)?;
        }

        // rename fails across filesystems; fall back to copy + delete
        if fs::rename(source, &target).await.is_err() {
            fs::copy(source, &target).await.map_err(staging)?;
            fs::remove_file(source).await.map_err(staging)?;
        }

        let metadata = fs::metadata(&target).await.map_err(staging)?;
        let checksum = checksum_off_runtime(target.clone()).await.map_err(staging)?;

        Ok(DownloadedFile {
            path: target.clone(),
            size: metadata.len(),
            checksum,
            report_kind: link.report_kind,
            period: link.period,
            modified: metadata.modified().map_err(staging)?,
        })
    }
}

/// `checksum_file` on the blocking pool.
async fn checksum_off_runtime(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || checksum_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

fn is_in_flight(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IN_FLIGHT_EXTENSIONS.iter().any(|f| ext.eq_ignore_ascii_case(f)))
}

/// Reject empty files and HTML pages served in place of a CSV.
async fn verify(path: &Path) -> Result<(), DownloadError> {
    let mut file = fs::File::open(path).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let read = file.read(&mut head).await?;
    head.truncate(read);

    if read == 0 {
        return Err(DownloadError::EmptyFile { path: path.to_path_buf() });
    }

    let text = String::from_utf8_lossy(&head);
    let sniff = text.trim_start_matches('\u{feff}').trim_start().to_ascii_lowercase();
    if sniff.starts_with("<!doctype html") || sniff.starts_with("<html") {
        return Err(DownloadError::Corrupt {
            path: path.to_path_buf(),
            reason: "html page instead of csv".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeBrowser;
    use crate::browser::Cookie;
    use crate::records::{Period, ReportKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Outcome {
        Write(&'static [u8]),
        WriteInFlight,
        Fail,
    }

    struct ScriptedTrigger {
        outcomes: Mutex<VecDeque<Outcome>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTrigger {
        fn new(outcomes: Vec<Outcome>) -> Self {
            ScriptedTrigger {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExportTrigger for ScriptedTrigger {
        async fn trigger(&self, link: &ExportLink, dir: &Path) -> Result<Option<String>, DownloadError> {
            *self.calls.lock().unwrap() += 1;
            let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Outcome::Fail);
            let name = link.file_name();
            match outcome {
                Outcome::Write(bytes) => {
                    std::fs::write(dir.join(&name), bytes).unwrap();
                    Ok(Some(name))
                }
                Outcome::WriteInFlight => {
                    std::fs::write(dir.join(format!("{}.crdownload", name)), b"partial").unwrap();
                    Ok(Some(name))
                }
                Outcome::Fail => Err(DownloadError::Status { status: 503 }),
            }
        }

        fn supports_parallel(&self) -> bool {
            true
        }
    }

    const CSV: &[u8] = "計算対象,日付,内容,金額（円）\n1,2024/05/01,コンビニ,-500\n".as_bytes();

    fn settings(root: &Path) -> Settings {
        let mut settings = crate::config::tests::sample();
        settings.paths.downloads = root.join("downloads");
        settings.paths.staging = root.join("staging");
        settings
    }

    fn downloader<T: ExportTrigger>(trigger: T, settings: &Settings) -> FileDownloader<T> {
        FileDownloader::new(trigger, settings)
            .with_timing(Duration::from_millis(60), Duration::from_millis(5))
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn link(kind: ReportKind, month: u32) -> ExportLink {
        ExportLink::new(kind, Period::new(2024, month).unwrap(), format!("https://moneyforward.test/{}", month))
    }

    #[tokio::test]
    async fn test_download_stages_verified_file() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let downloader = downloader(ScriptedTrigger::new(vec![Outcome::Write(CSV)]), &settings);
        downloader.prepare_dirs().await.unwrap();

        let file = downloader.download_one(&link(ReportKind::Transaction, 5)).await.unwrap();

        assert_eq!(file.path, settings.paths.staging.join("transaction").join("2024-05.csv"));
        assert_eq!(file.size, CSV.len() as u64);
        assert_eq!(file.checksum.len(), 64);
        assert_eq!(std::fs::read(&file.path).unwrap(), CSV);
    }

    #[tokio::test]
    async fn test_background_checksum_matches_direct_hash() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("export.csv");
        std::fs::write(&path, CSV).unwrap();

        let hashed = checksum_off_runtime(path.clone()).await.unwrap();

        assert_eq!(hashed, checksum_file(&path).unwrap());
        assert!(checksum_off_runtime(root.path().join("missing.csv")).await.is_err());
    }

    #[tokio::test]
    async fn test_html_response_is_retried() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let trigger = ScriptedTrigger::new(vec![
            Outcome::Write(b"<!DOCTYPE html><html>login</html>"),
            Outcome::Write(CSV),
        ]);
        let downloader = downloader(trigger, &settings);
        downloader.prepare_dirs().await.unwrap();

        let file = downloader.download_one(&link(ReportKind::Asset, 5)).await.unwrap();

        assert_eq!(downloader.trigger.calls(), 2);
        assert_eq!(std::fs::read(&file.path).unwrap(), CSV);
    }

    #[tokio::test]
    async fn test_exhausted_link_fails_without_stopping_others() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());

        // Serial order is not guaranteed with parallel triggers, so every
        // attempt for the failing link writes an empty file
        struct EmptyForApril;

        #[async_trait]
        impl ExportTrigger for EmptyForApril {
            async fn trigger(&self, link: &ExportLink, dir: &Path) -> Result<Option<String>, DownloadError> {
                let bytes: &[u8] = if link.period.month() == 4 { b"" } else { CSV };
                std::fs::write(dir.join(link.file_name()), bytes).unwrap();
                Ok(Some(link.file_name()))
            }

            fn supports_parallel(&self) -> bool {
                true
            }
        }

        let downloader = downloader(EmptyForApril, &settings);
        downloader.prepare_dirs().await.unwrap();

        let report = downloader
            .download_all(&[link(ReportKind::Transaction, 4), link(ReportKind::Transaction, 5)])
            .await;

        assert_eq!(report.staged.len(), 1);
        assert_eq!(report.staged[0].period, Period::new(2024, 5).unwrap());
        assert_eq!(report.failed.len(), 1);
        match &report.failed[0].error {
            DownloadError::Exhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, DownloadError::EmptyFile { .. }));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_flight_file_is_never_picked_up() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let downloader = downloader(ScriptedTrigger::new(vec![Outcome::WriteInFlight]), &settings)
            .with_retry_policy(RetryPolicy::none());
        downloader.prepare_dirs().await.unwrap();

        let err = downloader.download_one(&link(ReportKind::Transaction, 5)).await.unwrap_err();
        match err {
            DownloadError::Exhausted { attempts: 1, last, .. } => {
                assert!(matches!(*last, DownloadError::Timeout { .. }));
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restaging_overwrites_previous_file() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let updated: &'static [u8] = "計算対象,日付,内容,金額（円）\n1,2024/05/02,電車,-200\n".as_bytes();
        let downloader = downloader(
            ScriptedTrigger::new(vec![Outcome::Write(CSV), Outcome::Write(updated)]),
            &settings,
        );
        downloader.prepare_dirs().await.unwrap();

        let first = downloader.download_one(&link(ReportKind::Transaction, 5)).await.unwrap();
        let second = downloader.download_one(&link(ReportKind::Transaction, 5)).await.unwrap();

        assert_eq!(first.path, second.path);
        assert_ne!(first.checksum, second.checksum);
        assert_eq!(std::fs::read(&second.path).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_prepare_dirs_cleans_downloads() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        std::fs::create_dir_all(&settings.paths.downloads).unwrap();
        std::fs::write(settings.paths.downloads.join("old.csv"), CSV).unwrap();

        let downloader = downloader(ScriptedTrigger::new(vec![]), &settings);
        downloader.prepare_dirs().await.unwrap();

        assert_eq!(std::fs::read_dir(&settings.paths.downloads).unwrap().count(), 0);
        assert!(settings.paths.staging.is_dir());
    }

    #[tokio::test]
    async fn test_browser_trigger_picks_new_file() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeBrowser::new();
        fake.add_page("https://moneyforward.test/bs/history", crate::browser::fake::FakePage::new());
        let session = BrowserSession::open(Box::new(fake.clone()), &settings);
        session.navigate("https://moneyforward.test/bs/history").await.unwrap();

        let link = link(ReportKind::Asset, 5);
        fake.add_download(&link.url, settings.paths.downloads.join("資産推移月次.csv"), CSV);

        let trigger = BrowserExportTrigger::new(&session);
        assert!(!trigger.supports_parallel());

        let downloader = downloader(trigger, &settings);
        downloader.prepare_dirs().await.unwrap();
        let file = downloader.download_one(&link).await.unwrap();

        assert_eq!(file.path, settings.paths.staging.join("asset").join("2024-05.csv"));
    }

    #[tokio::test]
    async fn test_http_trigger_takes_session_cookies() {
        let settings = crate::config::tests::sample();
        let fake = FakeBrowser::new();
        fake.set_cookies(vec![
            Cookie { name: "_moneybook_session".into(), value: "abc".into() },
            Cookie { name: "identification_code".into(), value: "xyz".into() },
        ]);
        let session = BrowserSession::open(Box::new(fake), &settings);

        let trigger = HttpExportTrigger::from_session(&session).await.unwrap();
        assert_eq!(trigger.cookie_header(), "_moneybook_session=abc; identification_code=xyz");
        assert!(trigger.supports_parallel());
    }

    #[test]
    fn test_in_flight_extensions() {
        assert!(is_in_flight(Path::new("a.csv.crdownload")));
        assert!(is_in_flight(Path::new("a.csv.part")));
        assert!(!is_in_flight(Path::new("a.csv")));
    }
}
