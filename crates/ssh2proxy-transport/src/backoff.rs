//! Reconnection backoff with a bounded number of attempts

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Total dial attempts per reconnect (including the first)
    pub max_attempts: usize,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Why [`Backoff::next_attempt`] refused another attempt
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffStop {
    #[error("Max reconnection attempts reached")]
    Exhausted,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Attempt counter with exponential delays between attempts
///
/// The first attempt runs immediately; attempt `n > 1` is preceded by a
/// sleep of `initial_backoff * multiplier^(n-2)`, capped at `max_backoff`.
/// The sleep races the cancellation token.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_backoff: policy.initial_backoff,
            policy,
            attempt: 0,
        }
    }

    /// Wait (if needed) and return the number of the attempt about to run
    pub async fn next_attempt(&mut self, cancel: &CancellationToken) -> Result<usize, BackoffStop> {
        if cancel.is_cancelled() {
            return Err(BackoffStop::Cancelled);
        }
        if self.attempt >= self.policy.max_attempts {
            return Err(BackoffStop::Exhausted);
        }

        if self.attempt > 0 {
            debug!(
                "Waiting {:?} before reconnection attempt {}",
                self.current_backoff,
                self.attempt + 1
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackoffStop::Cancelled),
                _ = tokio::time::sleep(self.current_backoff) => {}
            }

            let next_backoff = Duration::from_secs_f64(
                self.current_backoff.as_secs_f64() * self.policy.multiplier,
            );
            self.current_backoff = next_backoff.min(self.policy.max_backoff);
        }

        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Number of attempts handed out so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay that precedes the next attempt (after the first)
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn max_attempts(&self) -> usize {
        self.policy.max_attempts
    }
}
