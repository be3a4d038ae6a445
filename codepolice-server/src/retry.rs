//! Bounded retry for external calls.
//!
//! Every call to the source host, the LLM service, or the email provider
//! goes through [`RetryExecutor::execute`]: exactly three attempts with an
//! exponential 1s/2s/4s schedule between them. Failure classification
//! decides whether an attempt is worth repeating at all — rate limits,
//! timeouts and 5xx are retryable; any other 4xx and every validation
//! failure is surfaced immediately without consuming the remaining attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Error taxonomy for everything that crosses a process boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Rate limit, timeout, 5xx, or connection failure. Worth retrying.
    #[error("transient external failure: {0}")]
    Transient(String),

    /// Auth/permission or any 4xx other than 429. Retrying cannot help.
    #[error("fatal external failure: {0}")]
    Fatal(String),

    /// Malformed response or payload. The offending item is dropped by the
    /// caller; retrying would replay the same bytes.
    #[error("validation failure: {0}")]
    Validation(String),

    /// File or context too large for a budget. Chunked or skipped upstream.
    #[error("resource limit: {0}")]
    ResourceLimit(String),

    /// The PR base diverged. Terminal for the job's publish stage; requires
    /// human action, never retried.
    #[error("merge conflict in {file} (base {base_sha}, head {head_sha})")]
    Conflict {
        file: String,
        base_sha: String,
        head_sha: String,
    },
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status from an external API.
    pub fn from_status(status: reqwest::StatusCode, context: &str, body: &str) -> Self {
        let message = format!("{context}: {status} - {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_reqwest(error: reqwest::Error, context: &str) -> Self {
        if error.is_decode() {
            Self::Validation(format!("{context}: {error}"))
        } else {
            // Timeouts, connection resets, DNS failures: all transient.
            Self::Transient(format!("{context}: {error}"))
        }
    }
}

/// Retry policy: attempt count and backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryExecutor {
    #[cfg(test)]
    pub fn with_base_delay(base_delay: Duration) -> Self {
        Self {
            max_attempts: 3,
            base_delay,
        }
    }

    /// Delay before retrying after the given 1-based failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        // 1s, 2s, 4s, ... — exponential, base 2.
        self.base_delay * 2u32.saturating_pow(attempt - 1)
    }

    /// Run `call` until it succeeds, fails fatally, or the attempt budget is
    /// spent. The final attempt's error is returned as-is so the caller can
    /// decide whether the failure is fatal to the job.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        %operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retryable failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(%operation, attempt, %error, "giving up");
                    return Err(error);
                }
            }
        }
    }
}
