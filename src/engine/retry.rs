use std::future::Future;
use std::time::Duration;

use crate::error::CoreError;

/// Exponential backoff for calls that hit an unreachable backing store
///
/// Only `StoreUnavailable` is retried. Every other error returns at once.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based): doubles each time, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(CoreError::StoreUnavailable { reason, .. }) => {
                    if attempt >= self.max_attempts.max(1) {
                        tracing::error!(
                            "{} failed after {} attempt(s): {}",
                            operation,
                            attempt,
                            reason
                        );
                        return Err(CoreError::StoreUnavailable {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        "{} hit unavailable store (attempt {}), retrying in {:?}: {}",
                        operation,
                        attempt,
                        delay,
                        reason
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
