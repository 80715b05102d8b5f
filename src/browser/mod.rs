// 🌐 Browser Session Manager
//
// `Browser` is the raw capability (one WebDriver session). `BrowserSession`
// wraps it with bounded waits, retries of transient UI failures, landing-page
// checks and the authenticated flag the later stages rely on.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::BrowserError;
use crate::retry::{RetryError, RetryPolicy};

pub mod webdriver;

#[cfg(test)]
pub(crate) mod fake;

pub use webdriver::WebDriverBrowser;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// SELECTORS & HANDLES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Css(String),
    Name(String),
    ClassName(String),
    LinkText(String),
    PartialLinkText(String),
    TagName(String),
}

impl Selector {
    pub fn css(value: impl Into<String>) -> Self {
        Selector::Css(value.into())
    }

    pub fn name(value: impl Into<String>) -> Self {
        Selector::Name(value.into())
    }

    pub fn class(value: impl Into<String>) -> Self {
        Selector::ClassName(value.into())
    }

    pub fn partial_link(value: impl Into<String>) -> Self {
        Selector::PartialLinkText(value.into())
    }

    /// W3C locator strategy and value.
    pub fn locator(&self) -> (&'static str, String) {
        match self {
            Selector::Css(css) => ("css selector", css.clone()),
            Selector::Name(name) => ("css selector", format!("[name=\"{}\"]", name)),
            Selector::ClassName(class) => ("css selector", format!(".{}", class)),
            Selector::LinkText(text) => ("link text", text.clone()),
            Selector::PartialLinkText(text) => ("partial link text", text.clone()),
            Selector::TagName(tag) => ("tag name", tag.clone()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(v) => write!(f, "css={}", v),
            Selector::Name(v) => write!(f, "name={}", v),
            Selector::ClassName(v) => write!(f, "class={}", v),
            Selector::LinkText(v) => write!(f, "link={}", v),
            Selector::PartialLinkText(v) => write!(f, "partial-link={}", v),
            Selector::TagName(v) => write!(f, "tag={}", v),
        }
    }
}

/// Opaque element reference, valid until the page changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Render cookies as a `Cookie:` request header value.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// CAPABILITY
// ============================================================================

#[async_trait]
pub trait Browser: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn find(&self, selector: &Selector) -> Result<ElementId, BrowserError>;
    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementId>, BrowserError>;
    async fn find_within(&self, parent: &ElementId, selector: &Selector) -> Result<ElementId, BrowserError>;
    async fn click(&self, element: &ElementId) -> Result<(), BrowserError>;
    async fn send_keys(&self, element: &ElementId, text: &str) -> Result<(), BrowserError>;
    async fn submit(&self, element: &ElementId) -> Result<(), BrowserError>;
    async fn attribute(&self, element: &ElementId, name: &str) -> Result<Option<String>, BrowserError>;
    async fn text(&self, element: &ElementId) -> Result<String, BrowserError>;
    async fn page_source(&self) -> Result<String, BrowserError>;
    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError>;
    async fn quit(&self) -> Result<(), BrowserError>;
}

// ============================================================================
// SESSION
// ============================================================================

/// One authenticated browser, owned by a single run.
pub struct BrowserSession {
    browser: Arc<dyn Browser>,
    closed: Arc<AtomicBool>,
    policy: RetryPolicy,
    element_timeout: Duration,
    poll_interval: Duration,
    base_url: String,
    lock_markers: Vec<String>,
    authenticated: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
}

impl fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserSession")
            .field("base_url", &self.base_url)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("authenticated", &self.authenticated.load(Ordering::SeqCst))
            .finish()
    }
}

impl BrowserSession {
    pub fn open(browser: Box<dyn Browser>, settings: &Settings) -> Self {
        info!(
            base_url = %settings.service.base_url,
            retries = settings.browser.retry_count,
            "browser session opened"
        );

        BrowserSession {
            browser: Arc::from(browser),
            closed: Arc::new(AtomicBool::new(false)),
            policy: settings.browser.retry_policy(),
            element_timeout: settings.browser.element_timeout(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            base_url: settings.service.base_url.trim_end_matches('/').to_string(),
            lock_markers: settings.service.lock_markers.clone(),
            authenticated: AtomicBool::new(false),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    pub fn with_timeouts(mut self, element_timeout: Duration, poll_interval: Duration) -> Self {
        self.element_timeout = element_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle that can still end the driver session after `self` is gone.
    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            browser: Arc::clone(&self.browser),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn element_timeout(&self) -> Duration {
        self.element_timeout
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
        self.touch();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.last_activity.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Utc::now();
        }
    }

    // ------------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------------

    /// Load `url` and check where the browser actually landed.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.retry("navigate", || self.browser.goto(url)).await?;

        let landed = self.browser.current_url().await?;
        self.check_landing(&landed)?;
        self.touch();

        info!(requested = %url, landed = %landed, "navigated");
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        self.browser.current_url().await
    }

    fn check_landing(&self, landed: &str) -> Result<(), BrowserError> {
        if self.lock_markers.iter().any(|marker| landed.contains(marker.as_str())) {
            warn!(url = %landed, "account lock page detected");
            return Err(BrowserError::AccountLocked { url: landed.to_string() });
        }

        if !same_site(&self.base_url, landed) {
            return Err(BrowserError::UnexpectedUrl {
                expected: self.base_url.clone(),
                actual: landed.to_string(),
            });
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Poll for `selector` until it appears or `timeout` passes.
    pub async fn wait_for(&self, selector: &Selector, timeout: Duration) -> Result<ElementId, BrowserError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.browser.find(selector).await {
                Ok(element) => return Ok(element),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrowserError::Timeout {
                    what: selector.to_string(),
                    after: timeout,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// `wait_for` with the configured element timeout.
    pub async fn wait(&self, selector: &Selector) -> Result<ElementId, BrowserError> {
        self.wait_for(selector, self.element_timeout).await
    }

    /// Whether `selector` shows up within `timeout`; absence is not an error.
    pub async fn probe(&self, selector: &Selector, timeout: Duration) -> Result<Option<ElementId>, BrowserError> {
        match self.wait_for(selector, timeout).await {
            Ok(element) => Ok(Some(element)),
            Err(BrowserError::Timeout { .. }) => {
                debug!(selector = %selector, "probe found nothing");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------------
    // Retried actions
    // ------------------------------------------------------------------------

    /// Retry `op` on transient failures; anything else aborts at once.
    pub async fn retry<T, F, Fut>(&self, action: &str, mut op: F) -> Result<T, BrowserError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrowserError>>,
    {
        let result = self
            .policy
            .run(action, |_| op(), BrowserError::is_transient)
            .await;

        match result {
            Ok(value) => {
                self.touch();
                Ok(value)
            }
            Err(RetryError::Aborted { error, .. }) => Err(error),
            Err(RetryError::Exhausted { attempts, last }) => Err(BrowserError::Exhausted {
                action: action.to_string(),
                attempts,
                last: Box::new(last),
            }),
        }
    }

    pub async fn click(&self, selector: &Selector) -> Result<(), BrowserError> {
        let label = format!("click {}", selector);
        self.retry(&label, || async {
            let element = self.wait(selector).await?;
            self.browser.click(&element).await
        })
        .await
    }

    /// Clear-free typing into a field located by `selector`.
    pub async fn fill(&self, selector: &Selector, text: &str) -> Result<(), BrowserError> {
        let label = format!("fill {}", selector);
        self.retry(&label, || async {
            let element = self.wait(selector).await?;
            self.browser.send_keys(&element, text).await
        })
        .await
    }

    /// Submit the form that owns the field located by `selector`.
    pub async fn submit_field(&self, selector: &Selector) -> Result<(), BrowserError> {
        let label = format!("submit {}", selector);
        self.retry(&label, || async {
            let element = self.wait(selector).await?;
            self.browser.submit(&element).await
        })
        .await
    }

    pub async fn attribute(&self, selector: &Selector, name: &str) -> Result<Option<String>, BrowserError> {
        let label = format!("read {}@{}", selector, name);
        self.retry(&label, || async {
            let element = self.wait(selector).await?;
            self.browser.attribute(&element, name).await
        })
        .await
    }

    pub async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        self.retry("read cookies", || self.browser.cookies()).await
    }

    pub async fn page_source(&self) -> Result<String, BrowserError> {
        self.browser.page_source().await
    }

    /// Dump the current page for post-mortem inspection.
    pub async fn save_page_source(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let source = self.page_source().await.context("Failed to read page source")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, source)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(path = %path.display(), "saved error page");
        Ok(())
    }

    /// End the WebDriver session.
    pub async fn close(self) -> Result<(), BrowserError> {
        self.authenticated.store(false, Ordering::SeqCst);
        self.closer().close().await
    }
}

/// Quits the driver at most once, whoever gets there first.
#[derive(Clone)]
pub struct SessionCloser {
    browser: Arc<dyn Browser>,
    closed: Arc<AtomicBool>,
}

impl SessionCloser {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.browser.quit().await;
        match &result {
            Ok(()) => info!("browser session closed"),
            Err(err) => warn!(error = %err, "browser session did not close cleanly"),
        }
        result
    }
}

/// The configured host itself or one of its subdomains (`www.` on the base is ignored).
fn same_site(base: &str, landed: &str) -> bool {
    let (Ok(base), Ok(landed)) = (reqwest::Url::parse(base), reqwest::Url::parse(landed)) else {
        return false;
    };
    let (Some(base_host), Some(landed_host)) = (base.host_str(), landed.host_str()) else {
        return false;
    };

    let site = base_host.strip_prefix("www.").unwrap_or(base_host);
    landed_host == base_host
        || landed_host == site
        || landed_host
            .strip_suffix(site)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeBrowser, FakeElement, FakePage};
    use super::*;

    const BASE: &str = "https://moneyforward.test";

    fn session(fake: &FakeBrowser) -> BrowserSession {
        let settings = crate::config::tests::sample();
        BrowserSession::open(Box::new(fake.clone()), &settings)
            .with_timeouts(Duration::from_millis(40), Duration::from_millis(5))
    }

    #[test]
    fn test_selector_locators() {
        assert_eq!(
            Selector::name("email_otp").locator(),
            ("css selector", "[name=\"email_otp\"]".to_string())
        );
        assert_eq!(Selector::class("accounts").locator().1, ".accounts");
        assert_eq!(Selector::partial_link("CSV").locator().0, "partial link text");
    }

    #[test]
    fn test_same_site() {
        assert!(same_site(BASE, "https://moneyforward.test/cf"));
        assert!(same_site("https://moneyforward.com", "https://id.moneyforward.com/sign_in"));
        assert!(same_site("https://www.moneyforward.com", "https://id.moneyforward.com/sign_in"));
        assert!(!same_site(BASE, "https://phish.example/cf"));
        assert!(!same_site("https://moneyforward.co.jp", "https://phish.co.jp/sign_in"));
        assert!(!same_site("https://moneyforward.com", "https://evilmoneyforward.com/"));
        assert!(!same_site(BASE, "not a url"));
    }

    #[test]
    fn test_cookie_header() {
        let cookies = vec![
            Cookie { name: "a".into(), value: "1".into() },
            Cookie { name: "b".into(), value: "2".into() },
        ];
        assert_eq!(cookie_header(&cookies), "a=1; b=2");
    }

    #[tokio::test]
    async fn test_navigate_detects_account_lock() {
        let fake = FakeBrowser::new();
        fake.add_page(&format!("{}/cf", BASE), FakePage::redirect(&format!("{}/account_locked", BASE)));

        let err = session(&fake).navigate(&format!("{}/cf", BASE)).await.unwrap_err();
        assert!(matches!(err, BrowserError::AccountLocked { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_navigate_rejects_foreign_host() {
        let fake = FakeBrowser::new();
        fake.add_page(&format!("{}/cf", BASE), FakePage::redirect("https://elsewhere.example/"));

        let err = session(&fake).navigate(&format!("{}/cf", BASE)).await.unwrap_err();
        assert!(matches!(err, BrowserError::UnexpectedUrl { .. }));
    }

    #[tokio::test]
    async fn test_click_survives_transient_not_found() {
        let fake = FakeBrowser::new();
        let url = format!("{}/cf", BASE);
        fake.add_page(&url, FakePage::new().with(FakeElement::new(Selector::css(".today"))));
        fake.fail_finds(&Selector::css(".today"), 1);

        let session = session(&fake);
        session.navigate(&url).await.unwrap();
        session.click(&Selector::css(".today")).await.unwrap();

        assert!(fake.events().iter().any(|e| e == "click css=.today"));
    }

    #[tokio::test]
    async fn test_exhausted_retry_carries_last_cause() {
        let fake = FakeBrowser::new();
        let url = format!("{}/cf", BASE);
        fake.add_page(&url, FakePage::new());

        let session = session(&fake);
        session.navigate(&url).await.unwrap();
        let err = session.click(&Selector::css(".missing")).await.unwrap_err();

        match err {
            BrowserError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, BrowserError::Timeout { .. }));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_absent_is_none() {
        let fake = FakeBrowser::new();
        let url = format!("{}/cf", BASE);
        fake.add_page(&url, FakePage::new());

        let session = session(&fake);
        session.navigate(&url).await.unwrap();
        let found = session.probe(&Selector::name("email_otp"), Duration::from_millis(10)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_close_quits_driver() {
        let fake = FakeBrowser::new();
        let session = session(&fake);
        session.mark_authenticated();
        assert!(session.is_authenticated());

        session.close().await.unwrap();
        assert!(fake.quit_called());
    }

    #[tokio::test]
    async fn test_closer_outlives_dropped_session() {
        let fake = FakeBrowser::new();
        let session = session(&fake);
        let closer = session.closer();
        drop(session);
        assert!(!fake.quit_called());

        closer.close().await.unwrap();
        closer.close().await.unwrap();
        assert!(fake.quit_called());
        assert!(closer.is_closed());
    }
}
