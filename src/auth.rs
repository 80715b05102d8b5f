// 🔐 Authenticator - login plus email second factor as a typestate machine
//
// Unauthenticated → CredentialsSubmitted → AwaitingSecondFactor → Verified
//                                        ↘ Verified (no second factor asked)
// Every transition consumes the authenticator; any failure hands back the
// browser session inside AuthFailure so the caller can save the page and quit.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::browser::{BrowserSession, Selector};
use crate::config::Settings;
use crate::error::{AuthenticationError, BrowserError, MailboxError};
use crate::mailbox::{Mailbox, MailboxPoller, VerificationCode};
use crate::secrets::Credential;

// ============================================================================
// PAGE MARKERS
// ============================================================================

pub(crate) const EMAIL_FIELD: &str = "mfid_user[email]";
pub(crate) const PASSWORD_FIELD: &str = "mfid_user[password]";
pub(crate) const OTP_FIELD: &str = "email_otp";
const LEGACY_OTP_FIELD: &str = "mfid_user[otp_attempt]";
pub(crate) const LOGGED_IN_CLASS: &str = "accounts";
const LOGIN_ERROR_CSS: &str = ".alert-danger, .error-message, #error_explanation";

/// How long to look for a second-factor form before concluding there is none
const OTP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_VALIDITY_MINUTES: u64 = 24 * 60;

// ============================================================================
// STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    CredentialsSubmitted,
    AwaitingSecondFactor,
    Verified,
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::CredentialsSubmitted => "credentials submitted",
            AuthState::AwaitingSecondFactor => "awaiting second factor",
            AuthState::Verified => "verified",
            AuthState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Unauthenticated;
pub struct CredentialsSubmitted;
pub struct AwaitingSecondFactor {
    challenge: VerificationChallenge,
    code_field: Selector,
}
pub struct Verified;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Submitted,
    Accepted,
    Rejected,
    Expired,
}

/// One second-factor challenge as seen from our side.
#[derive(Debug, Clone)]
pub struct VerificationChallenge {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub code: Option<String>,
    pub attempt_count: u32,
    pub status: ChallengeStatus,
}

impl VerificationChallenge {
    pub fn issue(validity: ChronoDuration) -> Self {
        let issued_at = Utc::now();
        VerificationChallenge {
            issued_at,
            expires_at: issued_at + validity,
            code: None,
            attempt_count: 0,
            status: ChallengeStatus::Pending,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn record(&mut self, code: &VerificationCode) {
        self.code = Some(code.code.clone());
        self.attempt_count += 1;
        self.status = ChallengeStatus::Submitted;
        if let Some(expiry) = code.expires_at {
            self.expires_at = self.expires_at.min(expiry.with_timezone(&Utc));
        }
    }
}

/// Result of looking at the page after credentials went in.
pub enum SecondFactorStep {
    Required(Authenticator<AwaitingSecondFactor>),
    NotRequired(Authenticator<Verified>),
}

/// A failed transition. Carries the session back for diagnostics and cleanup.
pub struct AuthFailure {
    pub failed_in: AuthState,
    pub error: AuthenticationError,
    pub session: BrowserSession,
}

impl fmt::Debug for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthFailure")
            .field("failed_in", &self.failed_in)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed while {}: {}", self.failed_in, self.error)
    }
}

// ============================================================================
// AUTHENTICATOR
// ============================================================================

/// Knobs the state machine needs, lifted out of Settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub login_url: String,
    pub code_timeout: Duration,
    pub code_validity: ChronoDuration,
    pub max_code_attempts: u32,
    pub otp_probe_timeout: Duration,
}

impl AuthSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        let minutes = settings.mailbox.code_validity_minutes.min(MAX_VALIDITY_MINUTES) as i64;
        AuthSettings {
            login_url: settings.url(&settings.service.endpoints.login),
            code_timeout: settings.mailbox.timeout(),
            code_validity: ChronoDuration::minutes(minutes),
            max_code_attempts: settings.mailbox.max_code_attempts.max(1),
            otp_probe_timeout: OTP_PROBE_TIMEOUT,
        }
    }

    pub fn with_otp_probe_timeout(mut self, timeout: Duration) -> Self {
        self.otp_probe_timeout = timeout;
        self
    }
}

pub struct Authenticator<S> {
    session: BrowserSession,
    settings: AuthSettings,
    state: S,
}

impl<S> fmt::Debug for Authenticator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("session", &self.session)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<S> Authenticator<S> {
    fn advance<T>(self, state: T) -> Authenticator<T> {
        Authenticator {
            session: self.session,
            settings: self.settings,
            state,
        }
    }

    fn fail(self, failed_in: AuthState, error: impl Into<AuthenticationError>) -> AuthFailure {
        let error = error.into();
        warn!(state = %failed_in, error = %error, "authentication failed");
        AuthFailure {
            failed_in,
            error,
            session: self.session,
        }
    }

    pub fn session(&self) -> &BrowserSession {
        &self.session
    }
}

impl Authenticator<Unauthenticated> {
    pub fn new(session: BrowserSession, settings: AuthSettings) -> Self {
        Authenticator {
            session,
            settings,
            state: Unauthenticated,
        }
    }

    /// Enter the login id, then the password, on the two-step sign-in form.
    ///
    /// The mailbox baseline is taken first so no code older than this login
    /// can ever be used.
    pub async fn submit_credentials<M: Mailbox>(
        self,
        credential: &Credential,
        poller: &mut MailboxPoller<M>,
    ) -> Result<Authenticator<CredentialsSubmitted>, AuthFailure> {
        const STATE: AuthState = AuthState::Unauthenticated;

        if let Err(err) = poller.mark_baseline().await {
            return Err(self.fail(STATE, err));
        }

        if let Err(err) = self.enter_credentials(credential).await {
            return Err(self.fail(STATE, err));
        }

        match self
            .session
            .probe(&Selector::css(LOGIN_ERROR_CSS), Duration::ZERO)
            .await
        {
            Ok(Some(_)) => return Err(self.fail(STATE, AuthenticationError::InvalidCredentials)),
            Ok(None) => {}
            Err(err) => return Err(self.fail(STATE, err)),
        }

        info!(login_id = %credential.login_id(), "credentials submitted");
        Ok(self.advance(CredentialsSubmitted))
    }

    async fn enter_credentials(&self, credential: &Credential) -> Result<(), BrowserError> {
        let email = Selector::name(EMAIL_FIELD);
        let password = Selector::name(PASSWORD_FIELD);

        self.session.navigate(&self.settings.login_url).await?;

        self.session.fill(&email, credential.login_id()).await?;
        self.session.submit_field(&email).await?;

        self.session.fill(&password, credential.secret()).await?;
        self.session.submit_field(&password).await
    }
}

impl Authenticator<CredentialsSubmitted> {
    /// Decide whether the site asks for an emailed code.
    pub async fn detect_second_factor(self) -> Result<SecondFactorStep, AuthFailure> {
        const STATE: AuthState = AuthState::CredentialsSubmitted;
        let probe = self.settings.otp_probe_timeout;

        for field in [OTP_FIELD, LEGACY_OTP_FIELD] {
            let selector = Selector::name(field);
            match self.session.probe(&selector, probe).await {
                Ok(Some(_)) => {
                    info!(field, "second factor requested");
                    let challenge = VerificationChallenge::issue(self.settings.code_validity);
                    return Ok(SecondFactorStep::Required(self.advance(AwaitingSecondFactor {
                        challenge,
                        code_field: selector,
                    })));
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(STATE, err)),
            }
        }

        match self.logged_in().await {
            Ok(true) => {
                info!("no second factor requested");
                self.session.mark_authenticated();
                Ok(SecondFactorStep::NotRequired(self.advance(Verified)))
            }
            Ok(false) => self.unexpected_page(STATE).await,
            Err(err) => Err(self.fail(STATE, err)),
        }
    }

    async fn unexpected_page<T>(self, state: AuthState) -> Result<T, AuthFailure> {
        let url = self.session.current_url().await.unwrap_or_default();
        Err(self.fail(
            state,
            AuthenticationError::UnexpectedPage {
                state: state.to_string(),
                url,
            },
        ))
    }

    async fn logged_in(&self) -> Result<bool, BrowserError> {
        let marker = Selector::class(LOGGED_IN_CLASS);
        Ok(self.session.probe(&marker, self.session.element_timeout()).await?.is_some())
    }
}

impl Authenticator<AwaitingSecondFactor> {
    pub fn challenge(&self) -> &VerificationChallenge {
        &self.state.challenge
    }

    /// Wait for the emailed code and submit it.
    ///
    /// Nothing is typed unless a fresh code arrived. A rejected code is
    /// followed by one more wait for a newer email, up to the attempt limit.
    pub async fn verify<M: Mailbox>(
        mut self,
        poller: &mut MailboxPoller<M>,
    ) -> Result<Authenticator<Verified>, AuthFailure> {
        const STATE: AuthState = AuthState::AwaitingSecondFactor;

        loop {
            if self.state.challenge.is_expired(Utc::now()) {
                self.state.challenge.status = ChallengeStatus::Expired;
                return Err(self.fail(STATE, AuthenticationError::ChallengeExpired));
            }

            let code = match poller.await_code(self.settings.code_timeout).await {
                Ok(code) => code,
                Err(MailboxError::Timeout { waited }) => {
                    return Err(self.fail(STATE, AuthenticationError::SecondFactorTimeout { waited }));
                }
                Err(err) => return Err(self.fail(STATE, err)),
            };

            self.state.challenge.record(&code);
            if self.state.challenge.is_expired(Utc::now()) {
                self.state.challenge.status = ChallengeStatus::Expired;
                return Err(self.fail(STATE, AuthenticationError::ChallengeExpired));
            }

            if let Err(err) = self.submit_code(&code.code).await {
                return Err(self.fail(STATE, err));
            }

            match self.outcome().await {
                Ok(CodeOutcome::Accepted) => {
                    self.state.challenge.status = ChallengeStatus::Accepted;
                    self.session.mark_authenticated();
                    info!(
                        attempts = self.state.challenge.attempt_count,
                        message_id = %code.message_id,
                        "second factor verified"
                    );
                    return Ok(self.advance(Verified));
                }
                Ok(CodeOutcome::Rejected) => {
                    self.state.challenge.status = ChallengeStatus::Rejected;
                    let attempts = self.state.challenge.attempt_count;
                    warn!(attempts, "verification code rejected");
                    if attempts >= self.settings.max_code_attempts {
                        return Err(self.fail(STATE, AuthenticationError::CodeRejected { attempts }));
                    }
                }
                Ok(CodeOutcome::Unrecognised) => {
                    let url = self.session.current_url().await.unwrap_or_default();
                    return Err(self.fail(
                        STATE,
                        AuthenticationError::UnexpectedPage {
                            state: STATE.to_string(),
                            url,
                        },
                    ));
                }
                Err(err) => return Err(self.fail(STATE, err)),
            }
        }
    }

    async fn submit_code(&self, code: &str) -> Result<(), BrowserError> {
        let field = &self.state.code_field;
        self.session.fill(field, code).await?;
        self.session.submit_field(field).await
    }

    async fn outcome(&self) -> Result<CodeOutcome, BrowserError> {
        let marker = Selector::class(LOGGED_IN_CLASS);
        if self.session.probe(&marker, self.session.element_timeout()).await?.is_some() {
            return Ok(CodeOutcome::Accepted);
        }
        if self.session.probe(&self.state.code_field, Duration::ZERO).await?.is_some() {
            return Ok(CodeOutcome::Rejected);
        }
        Ok(CodeOutcome::Unrecognised)
    }
}

enum CodeOutcome {
    Accepted,
    Rejected,
    Unrecognised,
}

impl Authenticator<Verified> {
    pub fn into_session(self) -> BrowserSession {
        self.session
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Run the whole login. On failure the current page is saved for diagnosis.
pub async fn login<M: Mailbox>(
    session: BrowserSession,
    settings: &Settings,
    credential: &Credential,
    poller: &mut MailboxPoller<M>,
) -> Result<BrowserSession, AuthFailure> {
    login_with(session, AuthSettings::from_settings(settings), settings, credential, poller).await
}

pub async fn login_with<M: Mailbox>(
    session: BrowserSession,
    auth: AuthSettings,
    settings: &Settings,
    credential: &Credential,
    poller: &mut MailboxPoller<M>,
) -> Result<BrowserSession, AuthFailure> {
    let result = run_state_machine(Authenticator::new(session, auth), credential, poller).await;

    match result {
        Ok(session) => Ok(session),
        Err(failure) => {
            let path = settings.paths.error_page();
            if let Err(err) = failure.session.save_page_source(&path).await {
                warn!(error = %err, "could not save error page");
            }
            Err(failure)
        }
    }
}

async fn run_state_machine<M: Mailbox>(
    auth: Authenticator<Unauthenticated>,
    credential: &Credential,
    poller: &mut MailboxPoller<M>,
) -> Result<BrowserSession, AuthFailure> {
    let submitted = auth.submit_credentials(credential, poller).await?;

    let verified = match submitted.detect_second_factor().await? {
        SecondFactorStep::NotRequired(verified) => verified,
        SecondFactorStep::Required(awaiting) => awaiting.verify(poller).await?,
    };

    Ok(verified.into_session())
}
