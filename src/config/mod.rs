//! Configuration management for the arbor push server.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`ARBOR__SECTION__KEY`)
//! - Component-wise validation

mod hub;
mod monitoring;
mod route;
mod server;
mod watcher;
pub use hub::*;
pub use monitoring::*;
pub use route::*;
pub use server::*;
pub use watcher::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Main configuration container
///
/// Merging order (later sources override earlier):
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Optional `config/local` overrides
/// 4. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct ArborConfig {
    /// HTTP listener and transport keepalive
    #[serde(default)]
    pub server: ServerConfig,
    /// Holder registry and startup throttling
    #[serde(default)]
    pub hub: HubConfig,
    /// Idle holder eviction
    #[serde(default)]
    pub cleaner: CleanerConfig,
    /// Long-poll session parameters
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Intent and default-route resolution
    #[serde(default)]
    pub route: RouteConfig,
    /// Traffic hijack and force-routing tables
    #[serde(default)]
    pub hijack: HijackConfig,
    /// Passive dependency declaration
    #[serde(default)]
    pub dependency: DependencyConfig,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Debug for ArborConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ArborConfig")
            .field("server", &self.server)
            .field("hub", &self.hub)
            .field("cleaner", &self.cleaner)
            .finish_non_exhaustive()
    }
}

impl ArborConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// # Note
    /// Validation is deferred so callers can layer further overrides via
    /// `with_override_config()`. Call `validate()` before use.
    ///
    /// # Example
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/arbor.toml");
    /// std::env::set_var("ARBOR__HUB__STARTUP_CONCURRENCY", "4");
    /// let cfg = ArborConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(File::with_name("config/local").required(false));

        builder = builder.add_source(
            Environment::with_prefix("ARBOR")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("ARBOR")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.server.validate()?;
        self.hub.validate()?;
        self.cleaner.validate()?;
        self.watcher.validate()?;
        self.route.validate()?;
        self.hijack.validate()?;
        self.dependency.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}
