//! Deadline and bounded-retry execution for broker operations
//!
//! Every attempt calls the operation factory again, so a retry re-issues the
//! request instead of re-polling a future that already finished.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::TransportError;

/// Default number of attempts for facade operations
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Errors that know whether retrying them can help
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        TransportError::is_transient(self)
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The overall deadline expired
    Timeout(Duration),
    /// The last attempt failed; `attempts` counts every attempt made
    Failed { attempts: u32, source: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Timeout(after) => write!(f, "timed out after {:?}", after),
            RetryError::Failed { attempts, source } => {
                write!(f, "failed after {} attempt(s): {}", attempts, source)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Backoff applied between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Run `operation` at most `retry_count` times, bounded overall by `timeout`
    ///
    /// Only errors reporting themselves transient are retried. A `retry_count`
    /// of zero is treated as one attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        timeout: Option<Duration>,
        retry_count: u32,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let max_attempts = retry_count.max(1);

        let attempts = async {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match operation().await {
                    Ok(value) => return Ok(value),
                    Err(e) if attempt < max_attempts && e.is_transient() => {
                        let delay = self.backoff(attempt);
                        warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Attempt failed, retrying"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    Err(e) => {
                        return Err(RetryError::Failed {
                            attempts: attempt,
                            source: e,
                        })
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .unwrap_or(Err(RetryError::Timeout(limit))),
            None => attempts.await,
        }
    }

    /// Delay after the given (1-based) failed attempt
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let base = std::cmp::min(exp, self.max_backoff);
        if base.is_zero() {
            return base;
        }

        // Up to 25% jitter, never past the cap
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        std::cmp::min(base + Duration::from_millis(jitter_ms), self.max_backoff)
    }
}

/// Run `operation` with the default backoff policy
pub async fn with_retry_and_timeout<T, E, F, Fut>(
    operation: F,
    timeout: Option<Duration>,
    retry_count: u32,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    RetryPolicy::default()
        .run(operation, timeout, retry_count)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<TransportError>> = with_retry_and_timeout(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
            None,
            3,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_exactly_retry_count() {
        for retry_count in [1u32, 3, 5] {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();

            let result: Result<(), _> = with_retry_and_timeout(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Io("connection reset".into())) }
                },
                None,
                retry_count,
            )
            .await;

            assert_eq!(calls.load(Ordering::SeqCst), retry_count);
            match result {
                Err(RetryError::Failed { attempts, source }) => {
                    assert_eq!(attempts, retry_count);
                    assert_eq!(source, TransportError::Io("connection reset".into()));
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_zero_retry_count_still_attempts_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate()
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::ChannelClosed) }
                },
                None,
                0,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Failed { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate()
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Rejected("PRECONDITION_FAILED".into())) }
                },
                None,
                5,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Failed { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate()
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TransportError::ConnectionClosed)
                        } else {
                            Ok("done")
                        }
                    }
                },
                None,
                3,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_never_completing_operation() {
        let start = Instant::now();
        let result: Result<(), RetryError<TransportError>> = with_retry_and_timeout(
            || futures::future::pending(),
            Some(Duration::from_millis(250)),
            3,
        )
        .await;

        assert_eq!(result, Err(RetryError::Timeout(Duration::from_millis(250))));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
        };

        let result: Result<(), _> = policy
            .run(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Io("down".into())) }
                },
                Some(Duration::from_millis(150)),
                10,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };

        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));

        assert_eq!(policy.backoff(20), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::immediate().backoff(4), Duration::ZERO);
    }

    #[test]
    fn test_retry_error_display() {
        let err: RetryError<TransportError> = RetryError::Failed {
            attempts: 3,
            source: TransportError::ChannelClosed,
        };
        assert_eq!(err.to_string(), "failed after 3 attempt(s): Channel closed");
    }
}
