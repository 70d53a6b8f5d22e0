//! Bounded retry for transient store conflicts.
//!
//! Store transactions may abort on a deadlock or a busy database. Those
//! failures surface as [`NsError::Conflict`] and the whole transaction is
//! replayed after a short backoff. Every other error is returned as is.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::duration_ms;
use crate::error::{NsError, Result};

/// Attempt bound and pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// conflicts `max_attempts` times.
///
/// `op` must be safe to replay: each attempt starts its own transaction and
/// takes its own locks.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = operation,
                        attempts = attempt,
                        error = %e,
                        "Giving up after repeated store conflicts"
                    );
                    return Err(NsError::RetryExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    error = %e,
                    "Store conflict, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(5), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NsError::Conflict("deadlock".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_is_surfaced() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(4), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NsError::Conflict("deadlock".to_string()))
        })
        .await;
        match result {
            Err(NsError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.contains("deadlock"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(10), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NsError::Backend("disk full".to_string()))
        })
        .await;
        assert!(matches!(result, Err(NsError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 100);
        assert_eq!(policy.backoff, Duration::from_millis(250));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
