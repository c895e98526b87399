//! Force-routing pre-pass.
//!
//! Operators can pin requested cluster names (exactly, or by `prefix*`) to a
//! physical cluster. Matching clusters are rewritten before resolution and
//! hijack run, and are served from the mapped cluster verbatim.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::info;

use crate::config::HijackConfig;
use crate::constants::PREFIX_WILDCARD;
use crate::metrics::FORCE_ROUTED_CLUSTERS;
use crate::tree::SubscriptionRequest;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct ForceRouting {
    exact: BTreeMap<String, String>,
    /// Longest prefix first
    prefixes: Vec<(String, String)>,
    exclusions: BTreeMap<String, BTreeSet<String>>,
}

impl ForceRouting {
    pub fn from_config(config: &HijackConfig) -> Self {
        let mut exact = BTreeMap::new();
        let mut prefixes = Vec::new();
        for (pattern, target) in &config.force_routing_clusters {
            match pattern.strip_suffix(PREFIX_WILDCARD) {
                Some(prefix) => prefixes.push((prefix.to_string(), target.clone())),
                None => {
                    exact.insert(pattern.clone(), target.clone());
                }
            }
        }
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let exclusions = config
            .force_routing_exclusions
            .iter()
            .map(|(dest, sources)| (dest.clone(), sources.iter().cloned().collect()))
            .collect();

        Self {
            exact,
            prefixes,
            exclusions,
        }
    }

    /// Physical cluster forced for `cluster`: exact match first, then longest prefix
    pub fn lookup(
        &self,
        cluster: &str,
    ) -> Option<&str> {
        if let Some(target) = self.exact.get(cluster) {
            return Some(target);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| cluster.starts_with(prefix.as_str()))
            .map(|(_, target)| target.as_str())
    }

    pub fn is_excluded(
        &self,
        dest_app: &str,
        source_app: Option<&str>,
    ) -> bool {
        match source_app {
            Some(source) => self
                .exclusions
                .get(dest_app)
                .map(|sources| sources.contains(source))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Pins every matching service cluster of `request` to its forced target.
    ///
    /// Returns the number of substituted clusters.
    pub fn apply(
        &self,
        request: &mut SubscriptionRequest,
        source_app: Option<&str>,
    ) -> Result<usize> {
        let mut pins = Vec::new();
        for (sub_type, application, selection) in request.iter() {
            if !sub_type.tree_type().carries_routing() || self.is_excluded(application, source_app) {
                continue;
            }
            for cluster in &selection.clusters {
                if selection.is_pinned(cluster) {
                    continue;
                }
                if let Some(target) = self.lookup(cluster) {
                    pins.push((sub_type, application.to_string(), cluster.clone(), target.to_string()));
                }
            }
        }

        for (sub_type, application, cluster, target) in &pins {
            info!(
                application = %application,
                sub_type = %sub_type,
                cluster = %cluster,
                target = %target,
                "Force routing cluster"
            );
            request.pin_cluster(*sub_type, application, cluster, target)?;
            FORCE_ROUTED_CLUSTERS.inc();
        }
        Ok(pins.len())
    }
}

