//! Page retry policy with exponential backoff.
//!
//! A failed page fetch is classified into a [`FailureType`]; the
//! [`RetryPolicy`] then decides whether the *same* request is re-issued and
//! how long to wait first. The continuation state never advances between
//! attempts.
//!
//! # Example
//!
//! ```
//! use harvester_core::harvest::{RetryDecision, RetryPolicy, classify_error};
//! use harvester_core::oai::ProtocolError;
//!
//! let policy = RetryPolicy::default();
//! let error = ProtocolError::Status { endpoint: "https://example.org/oai".into(), status: 503 };
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::oai::ProtocolError;

/// Default maximum attempts per page, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default growth factor between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a page fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Connection failure, timeout, or 5xx; may succeed on retry.
    Transient,
    /// HTTP 429 from the repository.
    RateLimited,
    /// Protocol-level or envelope failure; retrying the same page won't help.
    Permanent,
}

/// Decision on whether to re-request a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number of the retry (1-indexed, first retry is 2).
        attempt: u32,
    },

    /// Give up on this page.
    DoNotRetry {
        /// Why no retry is attempted.
        reason: String,
    },
}

/// Exponential backoff configuration for page fetches.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is raised to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Disables random jitter, making delays deterministic.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Maximum attempts per page, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry page"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a protocol error for retry decisions.
///
/// | Error | Type |
/// |---|---|
/// | Transport (connect, timeout, body read) | Transient |
/// | HTTP 429 | RateLimited |
/// | HTTP 5xx | Transient |
/// | Other HTTP status | Permanent |
/// | Envelope, OAI error codes, invalid endpoint | Permanent |
#[must_use]
pub fn classify_error(error: &ProtocolError) -> FailureType {
    match error {
        ProtocolError::Status { status: 429, .. } => FailureType::RateLimited,
        other if other.is_retryable() => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ProtocolError {
        ProtocolError::Status {
            endpoint: "https://example.org/oai".to_string(),
            status,
        }
    }

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy =
            RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0).without_jitter();
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_respects_max_delay() {
        let policy =
            RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0).without_jitter();
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(policy.calculate_jitter() <= MAX_JITTER);
        }
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error(&status(429)), FailureType::RateLimited);
        assert_eq!(classify_error(&status(502)), FailureType::Transient);
        assert_eq!(classify_error(&status(404)), FailureType::Permanent);
        assert_eq!(
            classify_error(&ProtocolError::Transport {
                endpoint: "https://example.org/oai".to_string(),
                message: "connection refused".to_string(),
                timeout: false,
            }),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&ProtocolError::BadResumptionToken("expired".to_string())),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_should_retry_permanent_never_retries() {
        let decision = RetryPolicy::default().should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_until_attempts_exhausted() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(1),
                attempt: 2
            }
        );
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")
        ));
    }
}
