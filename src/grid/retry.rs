//! Retryable-operation wrapper shared by every component that calls the exchange

use std::future::Future;
use std::time::Duration;

use log::{error, warn};
use serde::Deserialize;

use super::errors::{GridError, GridResult};

/// Exponential backoff policy with a per-call timeout
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound for a single adapter call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            call_timeout_ms: default_call_timeout_ms(),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the budget runs out
    ///
    /// Timeouts count as connectivity errors. The last connectivity error is
    /// returned unchanged when the budget is exhausted.
    pub async fn run<T, F, Fut>(&self, name: &str, operation: F) -> GridResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let timeout = Duration::from_millis(self.call_timeout_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(elapsed) => Err(GridError::from(elapsed)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let delay = self.delay_for(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        name,
                        attempts,
                        max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!("{} failed after {} attempts: {}", name, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 500,
            call_timeout_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_connectivity_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(5)
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GridError::Connectivity("reset by peer".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: GridResult<()> = RetryPolicy::immediate(5)
            .run("reject", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GridError::Rejection("below min notional".into()))
            })
            .await;
        assert!(matches!(result, Err(GridError::Rejection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_connectivity() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: GridResult<()> = RetryPolicy::immediate(3)
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GridError::Connectivity("unreachable".into()))
            })
            .await;
        assert!(matches!(result, Err(GridError::Connectivity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_connectivity() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            call_timeout_ms: 20,
        };
        let result: GridResult<()> = policy
            .run("hang", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GridError::Connectivity(_))));
    }
}
