//! Fixed-interval retry for the dial phase

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use outpost_core::config::AgentConfig;

/// Bounded attempts separated by a fixed wait, until success or cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
    /// Wait between a failed attempt and the next one
    pub interval: Duration,
}

/// Outcome of a single bounded attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Failed(E),
    TimedOut,
}

impl RetryPolicy {
    pub fn new(attempt_timeout: Duration, interval: Duration) -> Self {
        Self {
            attempt_timeout,
            interval,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.dial_timeout, config.retry_interval)
    }

    /// Run `attempt` under the per-attempt timeout.
    ///
    /// Returns `None` if cancelled first.
    pub async fn attempt<F, T, E>(&self, cancel: &CancellationToken, attempt: F) -> Option<Attempt<T, E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.attempt_timeout, attempt) => Some(match result {
                Ok(Ok(value)) => Attempt::Done(value),
                Ok(Err(e)) => Attempt::Failed(e),
                Err(_) => Attempt::TimedOut,
            }),
        }
    }

    /// Wait one interval. Returns false if cancelled first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5))
    }
}
