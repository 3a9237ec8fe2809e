//! Bounded retry for registry compare-and-swap races.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use rollgate_registry::RegistryResult;

/// How often and how patiently to retry a conflicting registry write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// Run `op` until it succeeds, fails with something other than a
    /// conflict, or the attempts are used up (returning the last conflict).
    ///
    /// `op` must re-read the group on every call.
    pub async fn on_conflict<T, F, Fut>(&self, mut op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_conflict() && attempt < attempts => {
                    debug!(attempt, error = %err, "registry conflict, retrying");
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_registry::RegistryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> RegistryError {
        RegistryError::Conflict {
            group: "web".into(),
            expected: 1,
            actual: 2,
        }
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(1),
        };
        let result = policy
            .on_conflict(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let result: RegistryResult<()> = policy
            .on_conflict(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy {
            attempts: 4,
            backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(3), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: RegistryResult<()> = RetryPolicy::default()
            .on_conflict(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::NotFound("web".into()))
            })
            .await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
