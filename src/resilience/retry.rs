// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two uses:
//! - in-place retry of idempotent operations ([`retry`], [`retry_when`]):
//!   connecting to the mirror database, per-task comment reads
//! - between-cycle backoff for failed syncs ([`backoff_delay`]): the sync
//!   itself is never retried in place, the next triggered cycle waits instead
//!
//! Remote writes are never wrapped in either.
//!
//! # Example
//!
//! ```
//! use task_sync::RetryConfig;
//! use task_sync::resilience::retry::backoff_delay;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Sync backoff: 5s, 10s, 20s ... capped at 5 minutes
//! let backoff = RetryConfig::sync_backoff(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff_delay(&backoff, 1), Duration::from_secs(5));
//! assert_eq!(backoff_delay(&backoff, 3), Duration::from_secs(20));
//! assert_eq!(backoff_delay(&backoff, 20), Duration::from_secs(300));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual reads
/// - [`RetryConfig::sync_backoff()`] - Delay schedule between failed sync cycles
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual reads (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Between-cycle backoff. Unbounded: a failing remote is retried on every
    /// triggered sync once the window has passed.
    #[must_use]
    pub fn sync_backoff(initial: Duration, max: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: initial,
            max_delay: max,
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Wait before the next attempt after `failures` consecutive failures.
///
/// `initial * factor^(failures-1)`, capped at `max_delay`; zero when there
/// have been no failures.
pub fn backoff_delay(config: &RetryConfig, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exp = (failures - 1).min(32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.factor.powi(exp);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        config.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation_name, config, |_| true, operation).await
}

/// Like [`retry`], but gives up immediately on errors `should_retry` rejects.
pub async fn retry_when<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failures: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(val) => {
                if failures > 0 {
                    info!(operation = operation_name, failures, "Succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => err,
        };
        failures = failures.saturating_add(1);

        let exhausted = config.max_retries.is_some_and(|max| failures as usize >= max);
        if exhausted || !should_retry(&err) {
            return Err(err);
        }

        let delay = backoff_delay(config, failures);
        warn!(
            operation = operation_name,
            attempt = failures,
            max_attempts = ?config.max_retries,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        ).await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_when_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry_when(
            "test_op",
            &RetryConfig::test(),
            |e: &TestError| e.0 != "permanent",
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("permanent".to_string()))
                }
            },
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::query().max_retries, Some(3));
        assert!(RetryConfig::sync_backoff(Duration::from_secs(1), Duration::from_secs(2))
            .max_retries
            .is_none());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = RetryConfig::sync_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 0), Duration::ZERO);
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(1));
    }
}
