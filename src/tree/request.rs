use std::collections::BTreeMap;
use std::collections::BTreeSet;

use super::validate_name;
use super::SubscriptionType;
use crate::WatchError;

/// Clusters requested for one `(type, application)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSelection {
    /// Logical cluster names as the client sees them; empty means all clusters
    pub clusters: BTreeSet<String>,
    /// Logical name -> physical cluster, bypassing resolution and hijack
    pub pinned: BTreeMap<String, String>,
    /// Resolve intent tokens even when the session is not in route mode
    pub intent_routing: bool,
}

impl ClusterSelection {
    pub fn is_all(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn is_pinned(
        &self,
        cluster: &str,
    ) -> bool {
        self.pinned.contains_key(cluster)
    }
}

/// Validated long-poll subscription body: `{type: {application: [cluster, ...]}}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    entries: BTreeMap<(SubscriptionType, String), ClusterSelection>,
}

impl SubscriptionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WatchError> {
        let raw: BTreeMap<String, BTreeMap<String, Vec<String>>> = serde_json::from_slice(bytes)
            .map_err(|e| WatchError::InvalidSubscription(format!("malformed request body: {e}")))?;

        let mut request = Self::new();
        for (sub_type, applications) in raw {
            let sub_type: SubscriptionType = sub_type.parse()?;
            for (application, clusters) in applications {
                request.watch(sub_type, &application)?;
                for cluster in clusters {
                    request.limit_cluster_name(sub_type, &application, &cluster)?;
                }
            }
        }

        if request.is_empty() {
            return Err(WatchError::InvalidSubscription("nothing to watch".to_string()));
        }
        Ok(request)
    }

    /// Registers interest in every cluster of `application`
    pub fn watch(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> Result<&mut ClusterSelection, WatchError> {
        validate_name("application", application)?;
        Ok(self.entries.entry((sub_type, application.to_string())).or_default())
    }

    /// Narrows `application` to `cluster` (additive across calls)
    pub fn limit_cluster_name(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
        cluster: &str,
    ) -> Result<(), WatchError> {
        validate_name("cluster", cluster)?;
        self.watch(sub_type, application)?.clusters.insert(cluster.to_string());
        Ok(())
    }

    /// Serves `logical` from `physical` without resolving it
    pub fn pin_cluster(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
        logical: &str,
        physical: &str,
    ) -> Result<(), WatchError> {
        validate_name("cluster", logical)?;
        validate_name("cluster", physical)?;
        let selection = self.watch(sub_type, application)?;
        selection.clusters.insert(logical.to_string());
        selection.pinned.insert(logical.to_string(), physical.to_string());
        Ok(())
    }

    /// Unions `other` into this request
    pub fn merge(
        &mut self,
        other: &SubscriptionRequest,
    ) {
        for ((sub_type, application), selection) in &other.entries {
            let target = self.entries.entry((*sub_type, application.clone())).or_default();
            target.clusters.extend(selection.clusters.iter().cloned());
            target
                .pinned
                .extend(selection.pinned.iter().map(|(k, v)| (k.clone(), v.clone())));
            target.intent_routing |= selection.intent_routing;
        }
    }

    pub fn get(
        &self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> Option<&ClusterSelection> {
        self.entries.get(&(sub_type, application.to_string()))
    }

    pub fn get_mut(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> Option<&mut ClusterSelection> {
        self.entries.get_mut(&(sub_type, application.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionType, &str, &ClusterSelection)> {
        self.entries
            .iter()
            .map(|((sub_type, application), selection)| (*sub_type, application.as_str(), selection))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
