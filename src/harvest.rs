// 🔗 Link Harvester - walks the report pages and collects export links
//
// Transactions: the calendar view is anchored on "today", then stepped back
// one month at a time; each month's download menu carries a CSV link.
// Assets: the balance history page exports the whole series at `<history>/csv`.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDate};
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, Selector};
use crate::config::Settings;
use crate::error::BrowserError;
use crate::records::{ExportLink, Period, ReportKind};

pub(crate) const TODAY_BUTTON: &str = ".btn.fc-button.fc-button-today.spec-fc-button-click-attached";
pub(crate) const PREV_BUTTON: &str = ".btn.fc-button.fc-button-prev.spec-fc-button-click-attached";
pub(crate) const DOWNLOAD_MENU_TEXT: &str = "ダウンロード";
pub(crate) const CSV_LINK_TEXT: &str = "CSVファイル";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestFailure {
    pub report_kind: ReportKind,
    pub period: Option<Period>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct HarvestReport {
    /// Ordered by (report_kind, period)
    pub links: Vec<ExportLink>,
    /// Periods visited that offered no export
    pub empty_periods: Vec<(ReportKind, Period)>,
    pub failures: Vec<HarvestFailure>,
}

impl HarvestReport {
    pub fn links_for(&self, kind: ReportKind) -> impl Iterator<Item = &ExportLink> {
        self.links.iter().filter(move |l| l.report_kind == kind)
    }
}

pub struct LinkHarvester {
    accounts_url: String,
    history_url: String,
    months: u32,
    current: Period,
}

impl LinkHarvester {
    pub fn new(settings: &Settings) -> Self {
        LinkHarvester {
            accounts_url: settings.url(&settings.service.endpoints.accounts),
            history_url: settings.url(&settings.service.endpoints.history),
            months: settings.history.months_to_download,
            current: Period::of(Local::now().date_naive()),
        }
    }

    /// Anchor the traversal on a fixed date instead of the wall clock.
    pub fn as_of(mut self, today: NaiveDate) -> Self {
        self.current = Period::of(today);
        self
    }

    /// Collect links for every report kind.
    ///
    /// Per-period problems land in the report. Only errors that make the
    /// session itself unusable (lock page, foreign host) are returned.
    pub async fn harvest(&self, session: &BrowserSession) -> Result<HarvestReport, BrowserError> {
        let mut found: BTreeMap<(ReportKind, Period), ExportLink> = BTreeMap::new();
        let mut report = HarvestReport::default();

        self.harvest_transactions(session, &mut found, &mut report).await?;
        self.harvest_assets(&mut found);

        report.links = found.into_values().collect();
        info!(
            links = report.links.len(),
            empty = report.empty_periods.len(),
            failures = report.failures.len(),
            "harvest finished"
        );
        Ok(report)
    }

    async fn harvest_transactions(
        &self,
        session: &BrowserSession,
        found: &mut BTreeMap<(ReportKind, Period), ExportLink>,
        report: &mut HarvestReport,
    ) -> Result<(), BrowserError> {
        const KIND: ReportKind = ReportKind::Transaction;

        let anchored = async {
            session.navigate(&self.accounts_url).await?;
            session.click(&Selector::css(TODAY_BUTTON)).await
        };
        if let Err(err) = anchored.await {
            return record_or_abort(report, KIND, None, err);
        }

        let mut period = self.current;
        for step in 0..self.months {
            if step > 0 {
                if let Err(err) = session.click(&Selector::css(PREV_BUTTON)).await {
                    // Months further back are unreachable without the calendar control
                    return record_or_abort(report, KIND, Some(period.previous()), err);
                }
                period = period.previous();
            }

            info!(period = %period, step = step + 1, of = self.months, "visiting transaction period");

            match self.csv_link(session).await {
                Ok(Some(href)) => {
                    let url = resolve(session.base_url(), &href);
                    insert_link(found, ExportLink::new(KIND, period, url));
                }
                Ok(None) => {
                    info!(period = %period, "no export for period");
                    report.empty_periods.push((KIND, period));
                }
                Err(err) => record_or_abort(report, KIND, Some(period), err)?,
            }
        }

        Ok(())
    }

    /// Open the download menu and read the CSV link, if the month has one.
    async fn csv_link(&self, session: &BrowserSession) -> Result<Option<String>, BrowserError> {
        let timeout = session.element_timeout();

        let menu = Selector::partial_link(DOWNLOAD_MENU_TEXT);
        if session.probe(&menu, timeout).await?.is_none() {
            return Ok(None);
        }
        session.click(&menu).await?;

        let csv = Selector::partial_link(CSV_LINK_TEXT);
        if session.probe(&csv, timeout).await?.is_none() {
            return Ok(None);
        }

        let href = session.attribute(&csv, "href").await?;
        Ok(href.filter(|h| !h.trim().is_empty()))
    }

    fn harvest_assets(&self, found: &mut BTreeMap<(ReportKind, Period), ExportLink>) {
        let url = format!("{}/csv", self.history_url.trim_end_matches('/'));
        info!(period = %self.current, url = %url, "asset history export");
        insert_link(found, ExportLink::new(ReportKind::Asset, self.current, url));
    }
}

fn insert_link(found: &mut BTreeMap<(ReportKind, Period), ExportLink>, link: ExportLink) {
    let key = link.key();
    if let Some(existing) = found.get(&key) {
        debug!(kind = %key.0, period = %key.1, kept = %existing.url, "duplicate export link ignored");
        return;
    }
    found.insert(key, link);
}

/// Session-level errors abort the harvest; anything else is recorded.
fn record_or_abort(
    report: &mut HarvestReport,
    report_kind: ReportKind,
    period: Option<Period>,
    err: BrowserError,
) -> Result<(), BrowserError> {
    if matches!(err, BrowserError::AccountLocked { .. } | BrowserError::UnexpectedUrl { .. }) {
        return Err(err);
    }

    warn!(kind = %report_kind, period = ?period.map(|p| p.to_string()), error = %err, "harvest step failed");
    report.failures.push(HarvestFailure {
        report_kind,
        period,
        reason: err.to_string(),
    });
    Ok(())
}

/// Absolute form of an href found on the page.
fn resolve(base: &str, href: &str) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}
