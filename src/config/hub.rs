use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HubConfig {
    /// Maximum number of holders allowed to be starting at the same time.
    ///
    /// Bounds concurrent subtree watch registrations against the
    /// coordination store during reconnect storms.
    #[serde(default = "default_startup_concurrency")]
    pub startup_concurrency: usize,

    /// Deadline for a holder to load its first full snapshot (milliseconds).
    /// Includes the time spent waiting for a startup slot.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_in_ms: u64,

    /// Capacity of each holder's change log. Watchers lagging further
    /// behind than this are resynchronized with a full dump.
    #[serde(default = "default_change_log_capacity")]
    pub change_log_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            startup_concurrency: default_startup_concurrency(),
            init_timeout_in_ms: default_init_timeout(),
            change_log_capacity: default_change_log_capacity(),
        }
    }
}

impl HubConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_in_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.startup_concurrency == 0 {
            return Err(Error::Config(ConfigError::Message(
                "startup_concurrency must be greater than 0".into(),
            )));
        }

        if self.init_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "init_timeout_in_ms must be at least 1ms".into(),
            )));
        }

        if self.change_log_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "change_log_capacity must be > 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_startup_concurrency() -> usize {
    8
}
// in ms
fn default_init_timeout() -> u64 {
    5_000
}
fn default_change_log_capacity() -> usize {
    1024
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanerConfig {
    #[serde(default = "default_cleaner_enabled")]
    pub enabled: bool,

    /// Interval between two sweeps (milliseconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_in_ms: u64,

    /// Holders idle for longer than this are eviction candidates (seconds)
    #[serde(default = "default_retention")]
    pub retention_in_secs: u64,

    /// Index entries older than this are dropped regardless of eviction outcome (seconds)
    #[serde(default = "default_stale_horizon")]
    pub stale_horizon_in_secs: u64,

    /// Eviction only runs while the hub holds more than this many holders
    #[serde(default)]
    pub min_holders: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleaner_enabled(),
            sweep_interval_in_ms: default_sweep_interval(),
            retention_in_secs: default_retention(),
            stale_horizon_in_secs: default_stale_horizon(),
            min_holders: 0,
        }
    }
}

impl CleanerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_in_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_in_secs)
    }

    pub fn stale_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_horizon_in_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sweep_interval_in_ms cannot be 0".into(),
            )));
        }

        if self.stale_horizon_in_secs <= self.retention_in_secs {
            return Err(Error::Config(ConfigError::Message(format!(
                "stale_horizon_in_secs {} should be greater than retention_in_secs {}",
                self.stale_horizon_in_secs, self.retention_in_secs
            ))));
        }

        Ok(())
    }
}

fn default_cleaner_enabled() -> bool {
    true
}
fn default_sweep_interval() -> u64 {
    60_000
}
fn default_retention() -> u64 {
    300
}
fn default_stale_horizon() -> u64 {
    3_600
}
