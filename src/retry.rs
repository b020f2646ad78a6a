//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with optional jitter. All waiting is
//! plain blocking `thread::sleep`; the downloader is strictly sequential.

use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server hiccups, disk contention)
/// should return `true`. Permanent failures (missing paths, state-machine
/// misuse, malformed responses) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // The whole session rides on one link, so any transport error is
            // worth another attempt.
            Error::Network(_) => true,
            // The platform intermittently answers 500s during busy hours;
            // status codes are not fine-grained enough to classify further.
            Error::ServerError { .. } => true,
            // Disk and symlink failures are retried like the transport ones.
            Error::Io(_) => true,
            // Path resolution misses are permanent.
            Error::NotFound(_) | Error::AlreadyExists(_) => false,
            // Invariant violations must surface immediately.
            Error::InvalidOperation(_) | Error::CycleDetected { .. } => false,
            // A non-JSON body will not become JSON by asking again.
            Error::MalformedResponse { .. } => false,
            Error::Serialization(_) | Error::Table(_) | Error::Url(_) => false,
            Error::Config { .. } | Error::Helper(_) => false,
        }
    }
}

/// Retry pacing for one download attempt loop
///
/// `attempts` counts total tries, so a user-facing "retry" count of `n`
/// maps to `n + 1` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts (initial try included)
    pub attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound applied to every backoff delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
    /// Whether to add random jitter on top of each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a user-facing retry count (`retry + 1` attempts)
    pub fn from_retry_count(retry: u32) -> Self {
        Self {
            attempts: retry + 1,
            ..Self::default()
        }
    }

    /// A policy with no sleeping between attempts, for tests
    #[cfg(test)]
    pub(crate) fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Execute an operation with exponential backoff retry logic
///
/// The operation is attempted up to `policy.attempts` times. A
/// non-retryable error aborts the loop immediately; exhausting the attempt
/// budget returns the last error. Each failed attempt is logged with the
/// attempt counter, matching the per-attempt logging the downloader
/// promises.
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut attempt: u32 = 0;
    let mut delay = policy.initial_delay;

    loop {
        match operation() {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(what, attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt + 1 < policy.attempts => {
                attempt += 1;

                tracing::warn!(
                    what,
                    error = %e,
                    attempt = attempt,
                    attempts = policy.attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if policy.jitter { add_jitter(delay) } else { delay };
                if !jittered_delay.is_zero() {
                    std::thread::sleep(jittered_delay);
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * policy.backoff_multiplier);
                delay = next_delay.min(policy.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        what,
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(what, error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so
/// the actual delay falls between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_on_first_attempt_calls_once() {
        let policy = RetryPolicy::immediate(4);
        let mut calls = 0;
        let result = with_retry(&policy, "test", || {
            calls += 1;
            Ok::<_, Error>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let policy = RetryPolicy::immediate(4);
        let mut calls = 0;
        let result = with_retry(&policy, "test", || {
            calls += 1;
            if calls < 3 {
                Err(Error::ServerError { status: 503 })
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3, "two failures then success");
    }

    #[test]
    fn attempt_budget_is_total_attempts_not_retries() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&policy, "test", || {
            calls += 1;
            Err(Error::ServerError { status: 500 })
        });
        assert!(result.is_err());
        assert_eq!(calls, 3, "exactly `attempts` tries");
    }

    #[test]
    fn non_retryable_error_aborts_immediately() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&policy, "test", || {
            calls += 1;
            Err(Error::not_found("/a/b"))
        });
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls, 1, "permanent errors are never retried");
    }

    #[test]
    fn invalid_operation_is_never_retryable() {
        assert!(!Error::invalid_op("ready twice").is_retryable());
        assert!(
            !Error::CycleDetected {
                path: "/x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn transport_and_disk_errors_are_retryable() {
        assert!(Error::ServerError { status: 502 }.is_retryable());
        let io: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk").into();
        assert!(io.is_retryable());
    }

    #[test]
    fn malformed_response_is_not_retryable() {
        assert!(!Error::malformed("<html>").is_retryable());
    }

    #[test]
    fn from_retry_count_adds_the_initial_attempt() {
        let policy = RetryPolicy::from_retry_count(3);
        assert_eq!(policy.attempts, 4);
    }

    #[test]
    fn add_jitter_stays_within_bounds_over_many_iterations() {
        let delay = Duration::from_millis(50);
        for i in 0..200 {
            let jittered = add_jitter(delay);
            assert!(
                jittered >= delay,
                "iteration {i}: jittered {jittered:?} < base delay {delay:?}"
            );
            assert!(
                jittered <= delay * 2,
                "iteration {i}: jittered {jittered:?} > 2x base delay"
            );
        }
    }
}
