use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{ErrorKind, WriterError, WriterResult};

/// Maximum number of attempts for a single warehouse call.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
/// Initial backoff delay in milliseconds for exponential backoff.
const INITIAL_BACKOFF_MS: u64 = 1_000;
/// Maximum backoff delay in milliseconds.
const MAX_BACKOFF_MS: u64 = 32_000;

/// How a network boundary retries failed calls.
///
/// A policy is a value so that every call site states which failures it tolerates instead of
/// nesting its own loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    retryable: fn(&WriterError) -> bool,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, retryable: fn(&WriterError) -> bool) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            retryable,
        }
    }

    /// Retries connection errors, 5xx responses and 429 responses.
    pub const fn transient() -> Self {
        Self::new(MAX_RETRY_ATTEMPTS, is_transient)
    }

    /// Like [`RetryPolicy::transient`] but also retries 403 responses, which project listing
    /// returns for a while after a credential is granted access.
    pub const fn listing() -> Self {
        Self::new(MAX_RETRY_ATTEMPTS, is_transient_or_forbidden)
    }

    /// Retries only rate limit responses.
    pub const fn rate_limited() -> Self {
        Self::new(MAX_RETRY_ATTEMPTS, is_rate_limited)
    }

    /// Replaces the backoff bounds.
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, error: &WriterError) -> bool {
        (self.retryable)(error)
    }

    /// Exponential backoff with full jitter for the given zero based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        let exponential = initial.saturating_mul(1u64 << attempt.min(16)).min(max);
        if exponential == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::thread_rng().gen_range(exponential / 2..=exponential))
    }

    /// Runs `operation` until it succeeds, fails with a non retryable error or the attempt
    /// budget is used up. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, name: &str, operation: F) -> WriterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WriterResult<T>>,
    {
        self.run_when(name, operation, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but a retryable error is only retried while `replayable`
    /// agrees that the operation can run again.
    pub async fn run_when<T, F, Fut, P>(
        &self,
        name: &str,
        mut operation: F,
        mut replayable: P,
    ) -> WriterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WriterResult<T>>,
        P: FnMut(&WriterError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts
                        || !self.is_retryable(&err)
                        || !replayable(&err)
                    {
                        return Err(err);
                    }

                    let backoff = self.backoff(attempt - 1);
                    warn!(
                        operation = name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = err.message(),
                        "bigquery call failed, backing off before retry"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn is_transient(error: &WriterError) -> bool {
    error.kind().is_transient()
}

fn is_transient_or_forbidden(error: &WriterError) -> bool {
    is_transient(error) || error.kind() == ErrorKind::DestinationPermissionDenied
}

fn is_rate_limited(error: &WriterError) -> bool {
    error.kind() == ErrorKind::DestinationRateLimited
}
