use std::collections::BTreeMap;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_INTENT;
use crate::constants::OVERALL_EZONE;
use crate::constants::PREFIX_WILDCARD;
use crate::route::HijackMode;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    /// Cluster names treated as route intents rather than physical clusters
    #[serde(default = "default_intents")]
    pub intents: Vec<String>,

    /// Known ezones; a cluster named `<ezone>-<rest>` belongs to `<ezone>`
    #[serde(default)]
    pub ezones: Vec<String>,

    /// Last-resort default route: intent -> cluster, prefixed with the caller ezone
    #[serde(default = "default_route_policy")]
    pub default_policy: BTreeMap<String, String>,

    /// Maximum symlink hops followed while resolving one cluster name
    #[serde(default = "default_max_resolve_depth")]
    pub max_resolve_depth: usize,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            intents: default_intents(),
            ezones: Vec::new(),
            default_policy: default_route_policy(),
            max_resolve_depth: default_max_resolve_depth(),
        }
    }
}

impl RouteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.intents.iter().any(|i| i.is_empty()) {
            return Err(Error::Config(ConfigError::Message("intents cannot contain empty names".into())));
        }

        if self.ezones.iter().any(|e| e.is_empty() || e.contains('-') || e == OVERALL_EZONE) {
            return Err(Error::Config(ConfigError::Message(format!(
                "ezones must be non-empty, must not contain '-' and must not be '{OVERALL_EZONE}'"
            ))));
        }

        if self.max_resolve_depth == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_resolve_depth must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_intents() -> Vec<String> {
    vec![DEFAULT_INTENT.to_string()]
}
fn default_route_policy() -> BTreeMap<String, String> {
    BTreeMap::from([(DEFAULT_INTENT.to_string(), "channel-stable-1".to_string())])
}
fn default_max_resolve_depth() -> usize {
    4
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HijackConfig {
    /// Intent the hijack layer routes legacy subscriptions through
    #[serde(default = "default_hijack_intent")]
    pub intent: String,

    /// Mode by source application (`app`) or source cluster (`app@cluster`)
    #[serde(default)]
    pub modes: BTreeMap<String, HijackMode>,

    /// Mode by ezone of the source cluster when `modes` has no entry
    #[serde(default)]
    pub ezone_defaults: BTreeMap<String, HijackMode>,

    /// Destination application -> source applications that standalone mode skips
    #[serde(default)]
    pub standalone_exclusions: BTreeMap<String, Vec<String>>,

    /// Global switch for the force-routing pre-pass
    #[serde(default)]
    pub force_routing_enabled: bool,

    /// Requested cluster (exact, or `prefix*`) -> physical cluster
    #[serde(default)]
    pub force_routing_clusters: BTreeMap<String, String>,

    /// Destination application -> source applications exempt from force routing
    #[serde(default)]
    pub force_routing_exclusions: BTreeMap<String, Vec<String>>,
}

impl Default for HijackConfig {
    fn default() -> Self {
        Self {
            intent: default_hijack_intent(),
            modes: BTreeMap::new(),
            ezone_defaults: BTreeMap::new(),
            standalone_exclusions: BTreeMap::new(),
            force_routing_enabled: false,
            force_routing_clusters: BTreeMap::new(),
            force_routing_exclusions: BTreeMap::new(),
        }
    }
}

impl HijackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.intent.is_empty() {
            return Err(Error::Config(ConfigError::Message("hijack intent cannot be empty".into())));
        }

        for (pattern, target) in &self.force_routing_clusters {
            let bare = pattern.trim_end_matches(PREFIX_WILDCARD);
            if bare.is_empty() || bare.contains(PREFIX_WILDCARD) {
                return Err(Error::Config(ConfigError::Message(format!(
                    "force routing pattern '{pattern}' must be an exact name or a single trailing '*' prefix"
                ))));
            }
            if target.is_empty() || target.contains(PREFIX_WILDCARD) {
                return Err(Error::Config(ConfigError::Message(format!(
                    "force routing target for '{pattern}' must be a physical cluster name"
                ))));
            }
        }

        Ok(())
    }
}

fn default_hijack_intent() -> String {
    DEFAULT_INTENT.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DependencyConfig {
    /// Switch for passive dependency declaration
    #[serde(default)]
    pub enabled: bool,

    /// Attempts per declaration when versioned writes conflict
    #[serde(default = "default_dependency_retries")]
    pub max_retries: usize,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_dependency_retries(),
        }
    }
}

impl DependencyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.max_retries == 0 {
            return Err(Error::Config(ConfigError::Message(
                "dependency max_retries must be > 0 when enabled".into(),
            )));
        }
        Ok(())
    }
}

fn default_dependency_retries() -> usize {
    3
}
