// 🔁 Retry Policy - one backoff loop for browser actions, downloads and sheet writes
//
// Callers supply the operation and a predicate deciding which failures are
// worth another attempt. Everything else aborts on the spot.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (never less than 1)
    pub max_attempts: u32,

    /// Wait after the first failed attempt
    pub initial_backoff: Duration,

    /// Growth factor between consecutive waits
    pub multiplier: u32,

    /// Upper bound for a single wait
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Wait that follows failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// All waits the policy can produce, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.backoff_for(n)).collect()
    }

    /// Run `op` until it succeeds, hits a non-retryable error, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Every failed attempt is logged
    /// with the `label`.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut op: F,
        retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            debug!(action = label, attempt, max_attempts = self.max_attempts, "attempt");

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => {
                    warn!(action = label, attempt, error = %err, "non-retryable failure");
                    return Err(RetryError::Aborted { attempts: attempt, error: err });
                }
                Err(err) if attempt >= self.max_attempts => {
                    warn!(action = label, attempt, error = %err, "retries exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: err });
                }
                Err(err) => {
                    let wait = self.backoff_for(attempt);
                    warn!(
                        action = label,
                        attempt,
                        error = %err,
                        backoff_ms = wait.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(500))
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug)]
pub enum RetryError<E> {
    /// Failure outside the retryable set; returned untouched.
    Aborted { attempts: u32, error: E },

    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Failure {
        Transient,
        Fatal,
    }

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));

        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert!(RetryPolicy::none().schedule().is_empty());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run(
                "flaky",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(Failure::Transient)
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |e| *e == Failure::Transient,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run(
                "fatal",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Failure::Fatal) }
                },
                |e| *e == Failure::Transient,
            )
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), Failure::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let result: Result<(), _> = fast(2)
            .run("always", |_| async { Err(Failure::Transient) }, |_| true)
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 2);
    }
}
