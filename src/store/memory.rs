use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use super::parent_path;
use super::ConnectionState;
use super::CoordinationStore;
use super::NodeData;
use super::Stat;
use super::StoreEvent;
use crate::utils::time::now_millis;
use crate::Result;
use crate::StoreError;

struct SubtreeRegistration {
    root: String,
    sender: mpsc::UnboundedSender<StoreEvent>,
}

impl SubtreeRegistration {
    fn covers(
        &self,
        path: &str,
    ) -> bool {
        is_under(path, &self.root)
    }
}

/// In-process coordination store
///
/// Every mutation is applied and fanned out to subtree watches while the
/// node map is write-locked, so watches observe mutations in commit order
/// and a new watch never misses a write racing with its replay.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, NodeData>>,
    watches: DashMap<u64, SubtreeRegistration>,
    next_watch_id: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("nodes", &self.nodes.read().len())
            .field("watches", &self.watches.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a session state change on every open watch
    pub fn emit_connection(
        &self,
        state: ConnectionState,
    ) {
        let _nodes = self.nodes.write();
        for registration in self.watches.iter() {
            let _ = registration.sender.send(StoreEvent::Connection(state));
        }
    }

    /// Number of live subtree watches
    pub fn watch_count(&self) -> usize {
        self.watches.retain(|_, r| !r.sender.is_closed());
        self.watches.len()
    }

    fn dispatch(
        &self,
        path: &str,
        event: StoreEvent,
    ) {
        let mut closed = Vec::new();
        for registration in self.watches.iter() {
            if !registration.covers(path) {
                continue;
            }
            if registration.sender.send(event.clone()).is_err() {
                closed.push(*registration.key());
            }
        }
        for id in closed {
            trace!(watch_id = id, "Subtree watch dropped by receiver");
            self.watches.remove(&id);
        }
    }

    fn insert_node(
        &self,
        nodes: &mut BTreeMap<String, NodeData>,
        path: &str,
        value: &str,
    ) -> Stat {
        let now = now_millis();
        let stat = Stat {
            version: 0,
            created_at: now,
            modified_at: now,
            child_count: 0,
        };
        nodes.insert(
            path.to_string(),
            NodeData {
                value: value.to_string(),
                stat,
            },
        );
        if let Some(parent) = parent_path(path) {
            if let Some(parent) = nodes.get_mut(parent) {
                parent.stat.child_count += 1;
            }
        }
        self.dispatch(
            path,
            StoreEvent::NodeCreated {
                path: path.to_string(),
                data: NodeData {
                    value: value.to_string(),
                    stat,
                },
            },
        );
        stat
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(
        &self,
        path: &str,
    ) -> Result<Option<NodeData>> {
        validate_path(path)?;
        Ok(self.nodes.read().get(path).cloned())
    }

    async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        validate_path(path)?;
        let nodes = self.nodes.read();
        if path != "/" && !nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()).into());
        }
        Ok(direct_children(&nodes, path))
    }

    async fn create(
        &self,
        path: &str,
        value: &str,
        make_parents: bool,
    ) -> Result<Stat> {
        validate_path(path)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()).into());
        }

        let mut missing = Vec::new();
        let mut cursor = parent_path(path);
        while let Some(parent) = cursor {
            if parent == "/" || nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent_path(parent);
        }
        if !missing.is_empty() && !make_parents {
            return Err(StoreError::NoNode(missing[0].clone()).into());
        }
        for parent in missing.iter().rev() {
            self.insert_node(&mut nodes, parent, "");
        }

        debug!(path, "Node created");
        Ok(self.insert_node(&mut nodes, path, value))
    }

    async fn set(
        &self,
        path: &str,
        value: &str,
        expected_version: Option<i32>,
    ) -> Result<Stat> {
        validate_path(path)?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;

        if let Some(expected) = expected_version {
            if node.stat.version != expected {
                return Err(StoreError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                }
                .into());
            }
        }

        node.value = value.to_string();
        node.stat.version += 1;
        node.stat.modified_at = now_millis();
        let data = node.clone();
        let stat = data.stat;

        self.dispatch(
            path,
            StoreEvent::NodeUpdated {
                path: path.to_string(),
                data,
            },
        );
        Ok(stat)
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
        recursive: bool,
    ) -> Result<()> {
        validate_path(path)?;
        let mut nodes = self.nodes.write();
        let node = nodes.get(path).ok_or_else(|| StoreError::NoNode(path.to_string()))?;

        if let Some(expected) = expected_version {
            if node.stat.version != expected {
                return Err(StoreError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                }
                .into());
            }
        }

        let mut doomed: Vec<String> = nodes
            .keys()
            .filter(|p| p.as_str() != path && is_under(p, path))
            .cloned()
            .collect();
        if !doomed.is_empty() && !recursive {
            return Err(StoreError::NotEmpty(path.to_string()).into());
        }

        // Deepest first, the way a recursive delete reaches the server
        doomed.sort_by(|a, b| b.matches('/').count().cmp(&a.matches('/').count()).then(b.cmp(a)));
        doomed.push(path.to_string());

        for victim in doomed {
            nodes.remove(&victim);
            if let Some(parent) = parent_path(&victim) {
                if let Some(parent) = nodes.get_mut(parent) {
                    parent.stat.child_count = parent.stat.child_count.saturating_sub(1);
                }
            }
            self.dispatch(&victim, StoreEvent::NodeDeleted { path: victim.clone() });
        }

        debug!(path, "Node deleted");
        Ok(())
    }

    async fn watch_subtree(
        &self,
        root: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>> {
        validate_path(root)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        // Writers are blocked until the replay is queued and the watch registered.
        let nodes = self.nodes.write();
        for (path, data) in nodes.iter().filter(|(p, _)| is_under(p, root)) {
            let _ = sender.send(StoreEvent::NodeCreated {
                path: path.clone(),
                data: data.clone(),
            });
        }
        let _ = sender.send(StoreEvent::Initialized);

        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.watches.insert(
            id,
            SubtreeRegistration {
                root: root.to_string(),
                sender,
            },
        );
        drop(nodes);

        debug!(watch_id = id, root, "Subtree watch registered");
        Ok(receiver)
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()).into());
    }
    Ok(())
}

fn is_under(
    path: &str,
    root: &str,
) -> bool {
    if root == "/" {
        return true;
    }
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

fn direct_children(
    nodes: &BTreeMap<String, NodeData>,
    path: &str,
) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .keys()
        .filter_map(|p| p.strip_prefix(&prefix))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_string)
        .collect()
}
