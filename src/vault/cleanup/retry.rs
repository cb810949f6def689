//! Retry policy for outbound HTTP calls: bounded attempts with jittered
//! exponential backoff.

use crate::vault::config::HttpConfig;
use rand::Rng;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &HttpConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// Sleep before attempt `attempt + 1`: `initial * 2^(attempt-1)` plus up
    /// to one `initial` of jitter, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff.saturating_mul(1 << exp);
        let jitter_ms = self.initial_backoff.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        (base + jitter).min(self.max_backoff)
    }

    /// Run `op` until it yields a result `should_retry` rejects, or attempts
    /// run out. The last result is returned either way.
    pub fn run<T, E>(
        &self,
        op: impl FnMut(u32) -> Result<T, E>,
        should_retry: impl Fn(&Result<T, E>) -> bool,
    ) -> Result<T, E> {
        self.run_with_sleep(op, should_retry, thread::sleep)
    }

    pub(crate) fn run_with_sleep<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        should_retry: impl Fn(&Result<T, E>) -> bool,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            let result = op(attempt);
            if attempt >= self.max_attempts || !should_retry(&result) {
                return result;
            }
            let delay = self.backoff(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "http retry");
            sleep(delay);
            attempt += 1;
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Transport failures and throttling/server statuses are worth another try.
pub fn should_retry_http(result: &reqwest::Result<reqwest::blocking::Response>) -> bool {
    match result {
        Ok(response) => is_retryable_status(response.status().as_u16()),
        Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
    }
}

#[cfg(test)]
mod tests {
    use super::{RetryPolicy, is_retryable_status};
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let p = policy(3);
        let first = p.backoff(1);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1_000));
        let third = p.backoff(3);
        assert!(third >= Duration::from_millis(2_000) && third <= Duration::from_millis(2_500));
        assert_eq!(p.backoff(10), Duration::from_millis(8_000));
    }

    #[test]
    fn retries_until_success_and_sleeps_between() {
        let mut slept = Vec::new();
        let result: Result<u16, String> = policy(3).run_with_sleep(
            |attempt| Ok(if attempt < 3 { 503 } else { 200 }),
            |r| matches!(r, Ok(status) if is_retryable_status(*status)),
            |d| slept.push(d),
        );
        assert_eq!(result, Ok(200));
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn returns_last_result_when_attempts_run_out() {
        let mut calls = 0;
        let result: Result<u16, String> = policy(3).run_with_sleep(
            |_| {
                calls += 1;
                Err("connection reset".to_string())
            },
            |r| r.is_err(),
            |_| {},
        );
        assert_eq!(result, Err("connection reset".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<u16, String> = policy(5).run_with_sleep(
            |_| {
                calls += 1;
                Ok(404)
            },
            |r| matches!(r, Ok(status) if is_retryable_status(*status)),
            |_| {},
        );
        assert_eq!(result, Ok(404));
        assert_eq!(calls, 1);
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(400));
    }
}
