//! Materialized copy of one `/<type>/<application>` subtree.
//!
//! The tree keeps three levels: the application node, its cluster nodes and
//! the key nodes under each cluster. Every applied mutation bumps the
//! revision and yields a normalized [`TreeChange`]; replays of nodes that are
//! already known are folded into updates so the tree stays idempotent across
//! store reconnections.

use std::collections::BTreeMap;

use tracing::debug;

use crate::store::NodeData;
use crate::store::StoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Depth of a changed node inside the subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLevel {
    Application,
    Cluster { cluster: String },
    Key { cluster: String, key: String },
}

impl NodeLevel {
    /// Cluster and application nodes carry metadata the routing layer reads
    pub fn is_structural(&self) -> bool {
        !matches!(self, NodeLevel::Key { .. })
    }
}

/// One normalized mutation of the mirror tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub revision: u64,
    pub kind: ChangeKind,
    pub level: NodeLevel,
    /// New value for creates/updates, `None` for deletes
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterNode {
    /// Cluster node payload; `None` until the node itself has been seen
    pub data: Option<NodeData>,
    pub keys: BTreeMap<String, NodeData>,
}

impl ClusterNode {
    pub fn value(&self) -> &str {
        self.data.as_ref().map(|d| d.value.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct MirrorTree {
    root: String,
    application: Option<NodeData>,
    clusters: BTreeMap<String, ClusterNode>,
    revision: u64,
}

impl MirrorTree {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            application: None,
            clusters: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Revision of the last applied change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn application_data(&self) -> Option<&NodeData> {
        self.application.as_ref()
    }

    pub fn application_value(&self) -> &str {
        self.application.as_ref().map(|d| d.value.as_str()).unwrap_or("")
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &String> {
        self.clusters.keys()
    }

    pub fn cluster(
        &self,
        name: &str,
    ) -> Option<&ClusterNode> {
        self.clusters.get(name)
    }

    pub fn has_cluster(
        &self,
        name: &str,
    ) -> bool {
        self.clusters.contains_key(name)
    }

    pub fn key(
        &self,
        cluster: &str,
        key: &str,
    ) -> Option<&NodeData> {
        self.clusters.get(cluster).and_then(|c| c.keys.get(key))
    }

    /// (path, value) of every key node, in path order
    pub fn list_instance_nodes(&self) -> Vec<(String, String)> {
        let mut nodes = Vec::new();
        for (cluster, node) in &self.clusters {
            for (key, data) in &node.keys {
                nodes.push((format!("{}/{}/{}", self.root, cluster, key), data.value.clone()));
            }
        }
        nodes
    }

    /// Maps an absolute store path onto a level of this tree.
    ///
    /// Paths outside the root or deeper than key level return `None`.
    pub fn classify(
        &self,
        path: &str,
    ) -> Option<NodeLevel> {
        let rest = path.strip_prefix(self.root.as_str())?;
        if rest.is_empty() {
            return Some(NodeLevel::Application);
        }
        let rest = rest.strip_prefix('/')?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(cluster), None, None) if !cluster.is_empty() => Some(NodeLevel::Cluster {
                cluster: cluster.to_string(),
            }),
            (Some(cluster), Some(key), None) if !cluster.is_empty() && !key.is_empty() => Some(NodeLevel::Key {
                cluster: cluster.to_string(),
                key: key.to_string(),
            }),
            _ => None,
        }
    }

    /// Applies one low-level store callback.
    ///
    /// Returns the normalized change, or `None` when the event does not
    /// modify the tree (out-of-scope paths, deletes of unknown nodes,
    /// non-node events).
    pub fn apply(
        &mut self,
        event: &StoreEvent,
    ) -> Option<TreeChange> {
        let (path, data) = match event {
            StoreEvent::NodeCreated { path, data } | StoreEvent::NodeUpdated { path, data } => (path, Some(data)),
            StoreEvent::NodeDeleted { path } => (path, None),
            StoreEvent::Initialized | StoreEvent::Connection(_) => return None,
        };

        let Some(level) = self.classify(path) else {
            debug!(path, root = %self.root, "Ignoring node outside mirrored levels");
            return None;
        };

        let kind = match data {
            Some(data) => self.upsert(&level, data.clone()),
            None => {
                if !self.remove(&level) {
                    return None;
                }
                ChangeKind::Deleted
            }
        };

        self.revision += 1;
        Some(TreeChange {
            revision: self.revision,
            kind,
            level,
            value: data.map(|d| d.value.clone()),
        })
    }

    fn upsert(
        &mut self,
        level: &NodeLevel,
        data: NodeData,
    ) -> ChangeKind {
        match level {
            NodeLevel::Application => match self.application.replace(data) {
                Some(_) => ChangeKind::Updated,
                None => ChangeKind::Created,
            },
            NodeLevel::Cluster { cluster } => {
                let node = self.clusters.entry(cluster.clone()).or_default();
                match node.data.replace(data) {
                    Some(_) => ChangeKind::Updated,
                    None => ChangeKind::Created,
                }
            }
            NodeLevel::Key { cluster, key } => {
                let node = self.clusters.entry(cluster.clone()).or_default();
                match node.keys.insert(key.clone(), data) {
                    Some(_) => ChangeKind::Updated,
                    None => ChangeKind::Created,
                }
            }
        }
    }

    fn remove(
        &mut self,
        level: &NodeLevel,
    ) -> bool {
        match level {
            NodeLevel::Application => {
                let existed = self.application.is_some() || !self.clusters.is_empty();
                self.application = None;
                self.clusters.clear();
                existed
            }
            NodeLevel::Cluster { cluster } => self.clusters.remove(cluster).is_some(),
            NodeLevel::Key { cluster, key } => self
                .clusters
                .get_mut(cluster)
                .map(|node| node.keys.remove(key).is_some())
                .unwrap_or(false),
        }
    }
}
