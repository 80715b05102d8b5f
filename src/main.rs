// 🏠 household-sync - one unattended run: login → harvest → download → transform → sync → load

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use household_sync::secrets::{sheets_token_from_env, spreadsheet_key, warehouse_token_from_env};
use household_sync::{
    logging, BigQueryClient, BrowserSession, Collaborators, CredentialProvider,
    EnvCredentialProvider, GmailMailbox, GoogleSheetsClient, MailboxPoller, Pipeline, RunReport,
    Settings, Warehouse, WebDriverBrowser, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, VERSION,
};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!(version = VERSION, "household-sync starting");

    match run().await {
        Ok(report) => ExitCode::from(report.exit_code() as u8),
        Err(err) => {
            error!(error = %format!("{:#}", err), "run could not start");
            ExitCode::FAILURE
        }
    }
}

/// Build the real collaborators and hand them to the pipeline.
async fn run() -> Result<RunReport> {
    let config_path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let settings = Settings::load(&config_path)?;
    info!(config = %config_path.display(), "settings loaded");

    let credential = EnvCredentialProvider::new().credentials()?;
    let sheets_token = sheets_token_from_env()?;
    let key = spreadsheet_key(&settings.spreadsheet.key)?;
    let warehouse = match &settings.warehouse {
        Some(warehouse) => {
            let client = BigQueryClient::new(warehouse, warehouse_token_from_env()?);
            Some(Box::new(client) as Box<dyn Warehouse>)
        }
        None => None,
    };

    // The browser writes downloads itself, so it needs an absolute directory
    fs::create_dir_all(&settings.paths.downloads).with_context(|| {
        format!("Failed to create download directory {}", settings.paths.downloads.display())
    })?;
    let download_dir = fs::canonicalize(&settings.paths.downloads)?;

    let browser = WebDriverBrowser::connect(
        &settings.browser.webdriver_url,
        &download_dir,
        settings.browser.headless,
    )
    .await
    .context("Failed to start a browser session")?;
    let session = BrowserSession::open(Box::new(browser), &settings);

    let mailbox = GmailMailbox::new(&settings.mailbox.api_base, credential.mailbox_token());
    let poller = MailboxPoller::new(mailbox, &settings.mailbox)?;
    let sheets = GoogleSheetsClient::new(&settings.spreadsheet.api_base, key, sheets_token);

    let pipeline = Pipeline::new(settings);
    let report = pipeline
        .run(Collaborators {
            session,
            poller,
            sheets,
            credential,
            warehouse,
        })
        .await;

    Ok(report)
}
