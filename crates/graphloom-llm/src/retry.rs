//! Bounded exponential backoff over transient provider errors
//!
//! Classification is textual: provider adapters keep HTTP status codes and
//! reasons in their error messages, and [`is_transient_error`] matches the
//! rendered text. Non-transient errors and exhausted retries propagate
//! unchanged.

use std::future::Future;
use std::time::Duration;

use graphloom_core::config::RetrySettings;
use tracing::{info, warn};

/// Backoff parameters for one provider.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_secs_f64(settings.initial_backoff_s.max(0.0)),
            max_backoff: Duration::from_secs_f64(settings.max_backoff_s.max(0.0)),
            multiplier: settings.backoff_multiplier.max(1.0),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Determines whether an error message describes a transient condition.
///
/// Matches rate limiting, timeouts, temporary unavailability, connection
/// drops, and 5xx server failures.
pub fn is_transient_error(message: &str) -> bool {
    let msg = message.to_lowercase();

    if msg.contains("rate limit") || msg.contains("429") || msg.contains("too many requests") {
        return true;
    }
    if msg.contains("timeout") || msg.contains("timed out") {
        return true;
    }
    if msg.contains("temporarily unavailable") {
        return true;
    }
    if msg.contains("connection reset") || msg.contains("connection aborted") {
        return true;
    }
    if msg.contains("5xx")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
        || msg.contains("server error")
    {
        return true;
    }

    false
}

/// Runs `f`, retrying transient failures with exponential backoff.
///
/// The backoff starts at `initial_backoff`, multiplies by `multiplier` per
/// attempt and is capped at `max_backoff`. At most `max_retries` retries run
/// after the first attempt.
pub async fn with_retry<F, Fut, T, E>(operation: &str, policy: &RetryPolicy, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = policy.initial_backoff.min(policy.max_backoff);
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt >= policy.max_retries || !is_transient_error(&err.to_string()) {
                    return Err(err);
                }
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * policy.multiplier)
                        .min(policy.max_backoff.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    #[test]
    fn transient_classification_table() {
        for msg in [
            "provider error: rate limit exceeded",
            "HTTP 429 Too Many Requests",
            "request timed out after 30s",
            "connect timeout",
            "service temporarily unavailable",
            "connection reset by peer",
            "connection aborted mid-stream",
            "upstream returned 503",
            "bad gateway: 502",
            "gateway timeout 504",
            "internal server error",
        ] {
            assert!(is_transient_error(msg), "should be transient: {msg}");
        }

        for msg in [
            "invalid api key",
            "model not found",
            "response decode error: expected array",
            "400 bad request",
        ] {
            assert!(!is_transient_error(msg), "should not be transient: {msg}");
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let result: Result<i32, String> =
            with_retry("op", &policy(3), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<&str, String> = with_retry("op", &policy(5), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("429 slow down".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<(), String> = with_retry("op", &policy(5), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("invalid api key".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "invalid api key");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_the_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<(), String> = with_retry("op", &policy(2), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("503 unavailable".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "503 unavailable");
        // One initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retry_policy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<(), String> = with_retry("op", &RetryPolicy::none(), move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("429".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policy_from_settings_clamps_multiplier() {
        let policy = RetryPolicy::from_settings(&RetrySettings {
            max_retries: 3,
            initial_backoff_s: 1.0,
            max_backoff_s: 30.0,
            backoff_multiplier: 0.1,
        });
        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.max_retries, 3);
    }
}
