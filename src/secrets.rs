// 🔑 Credentials - supplied from outside, held in memory only

use std::fmt;

use crate::error::ConfigError;

pub const EMAIL_ENV: &str = "EMAIL";
pub const PASSWORD_ENV: &str = "PASSWORD";
pub const MAILBOX_TOKEN_ENV: &str = "GMAIL_API_TOKEN";
pub const SHEETS_TOKEN_ENV: &str = "SHEETS_API_TOKEN";
pub const SPREADSHEET_KEY_ENV: &str = "SPREADSHEET_KEY";
pub const WAREHOUSE_TOKEN_ENV: &str = "BIGQUERY_API_TOKEN";

/// Login id, password and mailbox access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    login_id: String,
    secret: String,
    mailbox_token: String,
}

impl Credential {
    pub fn new(
        login_id: impl Into<String>,
        secret: impl Into<String>,
        mailbox_token: impl Into<String>,
    ) -> Self {
        Credential {
            login_id: login_id.into(),
            secret: secret.into(),
            mailbox_token: mailbox_token.into(),
        }
    }

    pub fn login_id(&self) -> &str {
        &self.login_id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn mailbox_token(&self) -> &str {
        &self.mailbox_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("login_id", &self.login_id)
            .field("secret", &"<redacted>")
            .field("mailbox_token", &"<redacted>")
            .finish()
    }
}

pub trait CredentialProvider {
    fn credentials(&self) -> Result<Credential, ConfigError>;
}

/// Reads credentials from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn new() -> Self {
        EnvCredentialProvider
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Result<Credential, ConfigError> {
        credentials_from(|name| std::env::var(name).ok())
    }
}

/// Build a credential from any name → value lookup.
pub fn credentials_from<F>(lookup: F) -> Result<Credential, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let require = |name: &str| {
        lookup(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingSecret(name.to_string()))
    };

    Ok(Credential::new(
        require(EMAIL_ENV)?,
        require(PASSWORD_ENV)?,
        require(MAILBOX_TOKEN_ENV)?,
    ))
}

/// Bearer token for the destination spreadsheet.
pub fn sheets_token_from_env() -> Result<String, ConfigError> {
    std::env::var(SHEETS_TOKEN_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingSecret(SHEETS_TOKEN_ENV.to_string()))
}

/// Bearer token for the analytics warehouse.
pub fn warehouse_token_from_env() -> Result<String, ConfigError> {
    std::env::var(WAREHOUSE_TOKEN_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingSecret(WAREHOUSE_TOKEN_ENV.to_string()))
}

/// Spreadsheet key from settings, or from the environment when settings leave it empty.
pub fn spreadsheet_key(configured: &str) -> Result<String, ConfigError> {
    spreadsheet_key_from(configured, |name| std::env::var(name).ok())
}

fn spreadsheet_key_from<F>(configured: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !configured.trim().is_empty() {
        return Ok(configured.trim().to_string());
    }
    lookup(SPREADSHEET_KEY_ENV)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingSecret(SPREADSHEET_KEY_ENV.to_string()))
}
