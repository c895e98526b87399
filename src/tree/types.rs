use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::store::join_path;
use crate::WatchError;

/// Kind of subtree a holder mirrors
///
/// Service trees carry cluster metadata (`link`, `route`, `info`) that the
/// routing layer interprets; switch and config trees are plain key-values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeType {
    Service,
    Switch,
    Config,
}

impl TreeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeType::Service => "service",
            TreeType::Switch => "switch",
            TreeType::Config => "config",
        }
    }

    /// Whether cluster names of this tree go through symlink/intent resolution
    pub fn carries_routing(&self) -> bool {
        matches!(self, TreeType::Service)
    }
}

impl fmt::Display for TreeType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TreeType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(TreeType::Service),
            "switch" => Ok(TreeType::Switch),
            "config" => Ok(TreeType::Config),
            other => Err(WatchError::InvalidSubscription(format!("unknown tree type '{other}'"))),
        }
    }
}

/// Types a client can subscribe to
///
/// `ServiceInfo` is backed by the service tree and projects each cluster's
/// `info` metadata instead of its instance keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Service,
    Switch,
    Config,
    ServiceInfo,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Service => "service",
            SubscriptionType::Switch => "switch",
            SubscriptionType::Config => "config",
            SubscriptionType::ServiceInfo => "service_info",
        }
    }

    /// The holder tree backing this subscription
    pub fn tree_type(&self) -> TreeType {
        match self {
            SubscriptionType::Service | SubscriptionType::ServiceInfo => TreeType::Service,
            SubscriptionType::Switch => TreeType::Switch,
            SubscriptionType::Config => TreeType::Config,
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(SubscriptionType::Service),
            "switch" => Ok(SubscriptionType::Switch),
            "config" => Ok(SubscriptionType::Config),
            "service_info" => Ok(SubscriptionType::ServiceInfo),
            other => Err(WatchError::InvalidSubscription(format!(
                "unknown subscription type '{other}'"
            ))),
        }
    }
}

impl From<TreeType> for SubscriptionType {
    fn from(tree_type: TreeType) -> Self {
        match tree_type {
            TreeType::Service => SubscriptionType::Service,
            TreeType::Switch => SubscriptionType::Switch,
            TreeType::Config => SubscriptionType::Config,
        }
    }
}

/// Identity of a holder: one (application, type) subtree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderKey {
    pub application: String,
    pub tree_type: TreeType,
}

impl HolderKey {
    pub fn new(
        application: impl Into<String>,
        tree_type: TreeType,
    ) -> Self {
        Self {
            application: application.into(),
            tree_type,
        }
    }

    /// Store path of the mirrored subtree: `/<type>/<application>`
    pub fn root_path(&self) -> String {
        join_path(&[self.tree_type.as_str(), &self.application])
    }
}

impl fmt::Display for HolderKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.tree_type)
    }
}

/// Checks an application, cluster or key name before it reaches a store path
pub(crate) fn validate_name(
    kind: &str,
    name: &str,
) -> Result<(), WatchError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(WatchError::InvalidSubscription(format!("invalid {kind} name '{name}'")))
    }
}
