//! Typed views over the JSON metadata stored in application and cluster nodes.
//!
//! Metadata is owned by external tooling, so decoding never fails: an empty
//! value is "no metadata" and a malformed one is logged and treated the same.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use crate::constants::DEFAULT_INTENT;
use crate::constants::OVERALL_EZONE;
use crate::constants::ROUTE_INTENT_SEPARATOR;

/// Metadata of one cluster node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    /// Symlink targets; more than one entry makes the cluster a union
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<String>,

    /// `<dest_app>` or `<dest_app>@<intent>` -> destination cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route: BTreeMap<String, String>,

    /// Free-form descriptive fields exposed through `service_info`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub info: Map<String, Value>,

    /// Consumer application -> consumer clusters, maintained by dependency declaration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency: BTreeMap<String, Vec<String>>,

    /// Fields this crate does not interpret, preserved across rewrites
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterMeta {
    /// Decodes a cluster value; `path` only feeds the warning.
    pub fn parse(
        raw: &str,
        path: &str,
    ) -> Self {
        decode(raw, path)
    }

    /// Destination cluster this source cluster routes `dest_app`/`intent` to
    pub fn route_for(
        &self,
        dest_app: &str,
        intent: &str,
    ) -> Option<&str> {
        let scoped = format!("{dest_app}{ROUTE_INTENT_SEPARATOR}{intent}");
        if intent == DEFAULT_INTENT {
            if let Some(cluster) = self.route.get(dest_app) {
                return Some(cluster.as_str());
            }
        }
        self.route.get(&scoped).map(String::as_str)
    }

    pub fn is_link(&self) -> bool {
        !self.link.is_empty()
    }
}

/// Metadata of an application node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMeta {
    /// `{ezone | "overall": {intent: cluster}}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_route: BTreeMap<String, BTreeMap<String, String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApplicationMeta {
    pub fn parse(
        raw: &str,
        path: &str,
    ) -> Self {
        decode(raw, path)
    }

    /// Looks up the ezone table first, then the `overall` table
    pub fn default_route_for(
        &self,
        ezone: Option<&str>,
        intent: &str,
    ) -> Option<&str> {
        ezone
            .and_then(|ezone| self.default_route.get(ezone))
            .and_then(|table| table.get(intent))
            .or_else(|| self.default_route.get(OVERALL_EZONE).and_then(|table| table.get(intent)))
            .map(String::as_str)
    }
}

fn decode<T>(
    raw: &str,
    path: &str,
) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    if raw.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(meta) => meta,
        Err(e) => {
            warn!(path, error = %e, "Malformed node metadata, treating as empty");
            T::default()
        }
    }
}
