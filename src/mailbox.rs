// 📬 Mailbox Poller - fetches the newest unconsumed verification code
//
// The poller remembers every message id it has looked at, so a code is never
// replayed, and ids that existed before the challenge (the baseline) are
// never considered at all.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::MailboxSettings;
use crate::error::{ConfigError, MailboxError};

/// Expiry line in the verification email, e.g. "valid for 10 mins (May 1, 2024 12:00:00)"
const EXPIRY_PATTERN: &str = r"valid for \d+ mins \((.*?)\)";
const EXPIRY_FORMAT: &str = "%B %d, %Y %H:%M:%S";

/// The service stamps expiry times in JST.
const EXPIRY_UTC_OFFSET_SECS: i32 = 9 * 3600;

const SEARCH_LIMIT: u32 = 5;

// ============================================================================
// MAILBOX CONTRACT
// ============================================================================

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Message ids matching `query`, newest first.
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<String>, MailboxError>;

    /// Plain-text body of a message.
    async fn get_body(&self, message_id: &str) -> Result<String, MailboxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub message_id: String,
    pub code: String,
    pub expires_at: Option<DateTime<FixedOffset>>,
}

// ============================================================================
// POLLER
// ============================================================================

pub struct MailboxPoller<M: Mailbox> {
    mailbox: M,
    query: String,
    code_pattern: Regex,
    expiry_pattern: Regex,
    poll_interval: Duration,
    consumed: HashSet<String>,
}

impl<M: Mailbox> MailboxPoller<M> {
    pub fn new(mailbox: M, settings: &MailboxSettings) -> Result<Self, ConfigError> {
        let code_pattern = Regex::new(&settings.code_pattern).map_err(|e| {
            ConfigError::Invalid(format!("mailbox.code_pattern is not a valid regex: {}", e))
        })?;

        let expiry_pattern = Regex::new(EXPIRY_PATTERN)
            .map_err(|e| ConfigError::Invalid(format!("expiry pattern: {}", e)))?;

        Ok(MailboxPoller {
            mailbox,
            query: settings.query(),
            code_pattern,
            expiry_pattern,
            poll_interval: settings.poll_interval(),
            consumed: HashSet::new(),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Mark every message currently in the mailbox as consumed.
    ///
    /// Call before the site sends a new code so stale emails are never used.
    pub async fn mark_baseline(&mut self) -> Result<usize, MailboxError> {
        let ids = self.mailbox.search(&self.query, SEARCH_LIMIT).await?;
        let count = ids.len();
        self.consumed.extend(ids);
        info!(existing = count, "mailbox baseline recorded");
        Ok(count)
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    /// Block until a fresh, unexpired code arrives or `timeout` passes.
    ///
    /// Search failures are logged and polling continues; only the deadline ends
    /// the wait.
    pub async fn await_code(&mut self, timeout: Duration) -> Result<VerificationCode, MailboxError> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.poll_once().await {
                Ok(Some(code)) => {
                    info!(message_id = %code.message_id, polls, "verification code received");
                    return Ok(code);
                }
                Ok(None) => debug!(polls, "no new verification email yet"),
                Err(err) => warn!(polls, error = %err, "mailbox poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(polls, waited_secs = timeout.as_secs(), "verification email wait timed out");
                return Err(MailboxError::Timeout { waited: timeout });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn poll_once(&mut self) -> Result<Option<VerificationCode>, MailboxError> {
        let ids = self.mailbox.search(&self.query, SEARCH_LIMIT).await?;

        let Some(message_id) = ids.into_iter().find(|id| !self.consumed.contains(id)) else {
            return Ok(None);
        };

        let body = self.mailbox.get_body(&message_id).await?;
        self.consumed.insert(message_id.clone());

        let Some(code) = self.code_pattern.find(&body).map(|m| m.as_str().to_string()) else {
            warn!(message_id = %message_id, "verification email without a code");
            return Ok(None);
        };

        let expires_at = self.parse_expiry(&body);
        if let Some(expiry) = expires_at {
            if expiry.with_timezone(&Utc) <= Utc::now() {
                warn!(message_id = %message_id, expires_at = %expiry, "verification code already expired");
                return Ok(None);
            }
        }

        Ok(Some(VerificationCode {
            message_id,
            code,
            expires_at,
        }))
    }

    fn parse_expiry(&self, body: &str) -> Option<DateTime<FixedOffset>> {
        let captured = self.expiry_pattern.captures(body)?.get(1)?.as_str();
        let naive = NaiveDateTime::parse_from_str(captured, EXPIRY_FORMAT).ok()?;
        let jst = FixedOffset::east_opt(EXPIRY_UTC_OFFSET_SECS)?;
        jst.from_local_datetime(&naive).single()
    }
}

// ============================================================================
// GMAIL REST CLIENT
// ============================================================================

pub struct GmailMailbox {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

impl GmailMailbox {
    pub fn new(api_base: &str, token: impl Into<String>) -> Self {
        GmailMailbox {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, MailboxError> {
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<String>, MailboxError> {
        let url = format!(
            "{}/users/me/messages?q={}&maxResults={}",
            self.api_base,
            urlencoding::encode(query),
            max_results
        );
        let list: ListResponse = self.get_json(&url).await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_body(&self, message_id: &str) -> Result<String, MailboxError> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            self.api_base,
            urlencoding::encode(message_id)
        );
        let message: MessageResponse = self.get_json(&url).await?;
        extract_plain_text(message_id, &message.payload)
    }
}

/// Prefer the first text/plain part; single-part messages carry the body directly.
fn extract_plain_text(message_id: &str, payload: &MessagePart) -> Result<String, MailboxError> {
    fn find_plain(part: &MessagePart) -> Option<&str> {
        if part.mime_type == "text/plain" {
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
                return Some(data);
            }
        }
        part.parts.iter().find_map(find_plain)
    }

    let data = if payload.parts.is_empty() {
        payload.body.as_ref().and_then(|b| b.data.as_deref())
    } else {
        find_plain(payload)
    };

    let data = data.ok_or_else(|| MailboxError::Decode {
        message_id: message_id.to_string(),
        reason: "no text/plain part".to_string(),
    })?;

    decode_base64url(data).map_err(|reason| MailboxError::Decode {
        message_id: message_id.to_string(),
        reason,
    })
}

fn decode_base64url(data: &str) -> Result<String, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

// ============================================================================
// IN-MEMORY MAILBOX (tests)
// ============================================================================

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Inbox {
        /// Newest first
        messages: Vec<(String, String)>,
        /// (deliver once this many searches happened, id, body)
        scheduled: Vec<(usize, String, String)>,
        searches: usize,
        bodies_read: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeMailbox {
        inbox: Arc<Mutex<Inbox>>,
    }

    impl FakeMailbox {
        pub(crate) fn new() -> Self {
            FakeMailbox::default()
        }

        pub(crate) fn deliver(&self, id: &str, body: &str) {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.messages.insert(0, (id.to_string(), body.to_string()));
        }

        pub(crate) fn deliver_after(&self, searches: usize, id: &str, body: &str) {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.scheduled.push((searches, id.to_string(), body.to_string()));
        }

        pub(crate) fn bodies_read(&self) -> Vec<String> {
            self.inbox.lock().unwrap().bodies_read.clone()
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn search(&self, _query: &str, max_results: u32) -> Result<Vec<String>, MailboxError> {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.searches += 1;
            let searches = inbox.searches;

            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut inbox.scheduled)
                .into_iter()
                .partition(|(after, _, _)| *after <= searches);
            inbox.scheduled = later;
            for (_, id, body) in due {
                inbox.messages.insert(0, (id, body));
            }

            Ok(inbox
                .messages
                .iter()
                .take(max_results as usize)
                .map(|(id, _)| id.clone())
                .collect())
        }

        async fn get_body(&self, message_id: &str) -> Result<String, MailboxError> {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.bodies_read.push(message_id.to_string());
            inbox
                .messages
                .iter()
                .find(|(id, _)| id == message_id)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| MailboxError::Api {
                    status: 404,
                    body: format!("no message {}", message_id),
                })
        }
    }
}
