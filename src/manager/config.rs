use std::time::Duration;

use crate::retry::ExponentialBackoff;
use crate::store::BackendConfig;

/// Configuration for a shard map manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Where the sled stores live.
    pub backend: BackendConfig,

    /// Attempts per store call before a transient fault is surfaced.
    pub retry_max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    pub retry_initial_delay: Duration,

    /// Upper bound for a single retry delay.
    pub retry_max_delay: Duration,

    /// Keep a lookup cache of mappings.
    pub cache_enabled: bool,

    /// Replay a shard map's pending operations before every mutating call on it.
    pub replay_on_access: bool,

    /// Pending entries younger than this are assumed to be in flight and are
    /// not replayed.
    pub replay_grace: Duration,

    /// Interval of the background operation sweeper.
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            retry_max_attempts: 5,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            cache_enabled: true,
            replay_on_access: true,
            replay_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ManagerConfig {
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            multiplier: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let config = ManagerConfig {
            retry_max_attempts: 0,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
    }
}
