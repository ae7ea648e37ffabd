use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Core runtime configuration.
///
/// This is a programmatic struct; loading it from disk or flags is the
/// embedding application's concern. Durations of zero disable the
/// corresponding mechanism where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Number of routing workers (threads). Must be at least 1.
    pub worker_count: usize,
    /// Upper bound on one event-loop turn's blocking wait.
    #[serde(default = "default_loop_tick")]
    pub loop_tick: Duration,
    /// Global parsed-statement cache budget in bytes, split evenly across
    /// workers. 0 disables the cache.
    #[serde(default)]
    pub cache_max_bytes: u64,
    /// Global idle-connection pool capacity per target, split evenly
    /// across workers. 0 disables pooling.
    #[serde(default)]
    pub pool_capacity_per_target: usize,
    /// Maximum age of an idle pooled connection before the expiry sweep
    /// closes it.
    #[serde(default = "default_pool_idle_max_age")]
    pub pool_idle_max_age: Duration,
    /// How long a session may wait for a pooled connection slot before
    /// its statement is failed.
    #[serde(default = "default_multiplex_timeout")]
    pub multiplex_timeout: Duration,
    /// Load-percent difference between the busiest and quietest worker
    /// that triggers session migration. 0 disables rebalancing.
    #[serde(default)]
    pub rebalance_threshold: u32,
    /// Sampling period for worker load collection. 0 disables rebalancing.
    #[serde(default)]
    pub rebalance_window: Duration,
    /// Grace window for zombie descriptors whose backends have not yet
    /// reported safe-to-close.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

fn default_loop_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_pool_idle_max_age() -> Duration {
    Duration::from_secs(300)
}

fn default_multiplex_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            loop_tick: default_loop_tick(),
            cache_max_bytes: 0,
            pool_capacity_per_target: 0,
            pool_idle_max_age: default_pool_idle_max_age(),
            multiplex_timeout: default_multiplex_timeout(),
            rebalance_threshold: 0,
            rebalance_window: Duration::ZERO,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl ProxyConfig {
    /// Validate the configuration, rejecting values the runtime cannot
    /// operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.loop_tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.rebalance_threshold > 100 {
            return Err(ConfigError::ThresholdOutOfRange(self.rebalance_threshold));
        }
        Ok(())
    }

    /// Per-worker share of the statement cache budget.
    pub fn cache_bytes_per_worker(&self) -> u64 {
        self.cache_max_bytes / self.worker_count as u64
    }

    /// Per-worker share of the pool capacity for one target.
    pub fn pool_capacity_per_worker(&self) -> usize {
        self.pool_capacity_per_target / self.worker_count
    }

    /// True when rebalancing is fully configured.
    pub fn rebalance_enabled(&self) -> bool {
        self.rebalance_threshold > 0 && !self.rebalance_window.is_zero()
    }
}

/// Session-level limits. Kept separate from [`ProxyConfig`] so the core
/// config recognizes exactly the documented options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Idle timeout for client sessions (0 = no timeout).
    #[serde(default)]
    pub idle_timeout: Duration,
    /// Per-statement timeout (0 = no timeout).
    #[serde(default)]
    pub statement_timeout: Duration,
    /// Maximum concurrent sessions across all workers (0 = unlimited).
    #[serde(default)]
    pub max_sessions: usize,
    /// Multiplex idle timer: how long a session may sit idle before its
    /// backends are detached into the pool. `None` disables pooling of
    /// linked backends; zero releases them as soon as a statement
    /// completes.
    #[serde(default)]
    pub multiplex_idle: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            statement_timeout: Duration::ZERO,
            max_sessions: 0,
            multiplex_idle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg = ProxyConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::NoWorkers));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let cfg = ProxyConfig {
            loop_tick: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTick));
    }

    #[test]
    fn test_threshold_range() {
        let cfg = ProxyConfig {
            rebalance_threshold: 101,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ThresholdOutOfRange(101))
        ));
    }

    #[test]
    fn test_per_worker_shares() {
        let cfg = ProxyConfig {
            worker_count: 4,
            cache_max_bytes: 4 << 20,
            pool_capacity_per_target: 10,
            ..Default::default()
        };
        assert_eq!(cfg.cache_bytes_per_worker(), 1 << 20);
        assert_eq!(cfg.pool_capacity_per_worker(), 2);
    }

    #[test]
    fn test_rebalance_requires_both_knobs() {
        let mut cfg = ProxyConfig {
            rebalance_threshold: 20,
            ..Default::default()
        };
        assert!(!cfg.rebalance_enabled());
        cfg.rebalance_window = Duration::from_secs(1);
        assert!(cfg.rebalance_enabled());
    }
}
