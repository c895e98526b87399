use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Upper bound for a session's life span (seconds). Requests asking for
    /// more, or for nothing, get this value.
    #[serde(default = "default_max_life_span")]
    pub max_life_span_in_secs: u64,

    /// Random extra life span added to every session (seconds), so
    /// sessions opened together do not all reconnect together.
    #[serde(default = "default_life_span_jitter")]
    pub life_span_jitter_in_secs: u64,

    /// Buffered messages per session before the producer waits on the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_life_span_in_secs: default_max_life_span(),
            life_span_jitter_in_secs: default_life_span_jitter(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WatcherConfig {
    pub fn max_life_span(&self) -> Duration {
        Duration::from_secs(self.max_life_span_in_secs)
    }

    pub fn life_span_jitter(&self) -> Duration {
        Duration::from_secs(self.life_span_jitter_in_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_life_span_in_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_life_span_in_secs must be greater than 0".into(),
            )));
        }

        if self.channel_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "channel_capacity must be > 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_max_life_span() -> u64 {
    3_600
}
fn default_life_span_jitter() -> u64 {
    300
}
fn default_channel_capacity() -> usize {
    64
}
