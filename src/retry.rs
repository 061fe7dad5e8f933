//! Retry policy for transient store faults.

use std::time::Duration;
use tracing::warn;

use crate::error::{ErrorKind, ShardResult};

pub trait RetryPolicy: Send + Sync {
    /// Whether a failure of `kind` on attempt number `attempt` (1-based)
    /// should be retried.
    fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool;

    /// Delay before the next attempt.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Retries transient faults with exponentially growing delays.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl ExponentialBackoff {
    /// Policy with no delay, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind == ErrorKind::Transient && attempt < self.max_attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Never retries.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _kind: ErrorKind, _attempt: u32) -> bool {
        false
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Runs `f` until it succeeds or `policy` declines another attempt.
pub fn retry_call<T, F>(policy: &dyn RetryPolicy, what: &str, mut f: F) -> ShardResult<T>
where
    F: FnMut() -> ShardResult<T>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(err.kind(), attempt) => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed, retrying: {}",
                    what,
                    err
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
