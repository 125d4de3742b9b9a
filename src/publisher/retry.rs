//! Retry policy for durable-publish failures (spec §4.4, §7): only the
//! configured retryable error classes are retried, with capped
//! exponential backoff and a total deadline, preserving the ordering
//! key across attempts.

use std::time::Duration;

use crate::config::PublisherRetryConfig;
use crate::errors::PublisherError;

pub struct RetryPolicy {
    codes: Vec<String>,
    max_retries: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    total_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &PublisherRetryConfig) -> Self {
        Self {
            codes: config.retry_codes.clone(),
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay,
            multiplier: config.retry_delay_multiplier,
            max_delay: config.max_retry_delay,
            total_timeout: config.total_timeout,
        }
    }

    /// Whether `error` should be retried given `attempt` (0-based, the
    /// attempt just made) and `elapsed` since the first attempt.
    pub fn should_retry(&self, error: &PublisherError, attempt: u32, elapsed: Duration) -> bool {
        if !error.is_retryable() {
            return false;
        }
        if !self.codes.is_empty() && !self.codes.iter().any(|code| code == error_code(error)) {
            return false;
        }
        attempt < self.max_retries && elapsed < self.total_timeout
    }

    /// Capped exponential backoff for the given (0-based) attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

fn error_code(error: &PublisherError) -> &'static str {
    match error {
        PublisherError::BatchFailedTransient(_) => "BATCH_FAILED_TRANSIENT",
        PublisherError::BatchFailedPermanent(_) => "BATCH_FAILED_PERMANENT",
        PublisherError::TopicNotFound(_) => "TOPIC_NOT_FOUND",
        PublisherError::QuotaExceeded => "QUOTA_EXCEEDED",
        PublisherError::Auth(_) => "AUTH",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(codes: Vec<&str>) -> PublisherRetryConfig {
        PublisherRetryConfig {
            retry_codes: codes.into_iter().map(str::to_string).collect(),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(100),
            retry_delay_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(2),
            total_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = RetryPolicy::new(&config(vec![]));
        let error = PublisherError::BatchFailedPermanent("bad payload".into());
        assert!(!policy.should_retry(&error, 0, Duration::ZERO));
    }

    #[test]
    fn transient_errors_retry_until_max_attempts_exhausted() {
        let policy = RetryPolicy::new(&config(vec![]));
        let error = PublisherError::BatchFailedTransient("timeout".into());
        assert!(policy.should_retry(&error, 0, Duration::ZERO));
        assert!(policy.should_retry(&error, 2, Duration::ZERO));
        assert!(!policy.should_retry(&error, 3, Duration::ZERO));
    }

    #[test]
    fn explicit_code_allowlist_narrows_which_transient_errors_retry() {
        let policy = RetryPolicy::new(&config(vec!["QUOTA_EXCEEDED"]));
        let transient = PublisherError::BatchFailedTransient("timeout".into());
        assert!(!policy.should_retry(&transient, 0, Duration::ZERO));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps_at_max_delay() {
        let policy = RetryPolicy::new(&config(vec![]));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn total_timeout_cuts_off_retries_regardless_of_attempt_count() {
        let policy = RetryPolicy::new(&config(vec![]));
        let error = PublisherError::BatchFailedTransient("timeout".into());
        assert!(!policy.should_retry(&error, 0, Duration::from_secs(31)));
    }
}
