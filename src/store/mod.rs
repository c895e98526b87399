//! Coordination store
//!
//! The engine consumes a ZooKeeper-like tree of versioned nodes through the
//! [`CoordinationStore`] trait: point reads, versioned writes and a
//! subtree watch that replays the current subtree before streaming live
//! mutations. The store itself lives outside this crate; [`MemoryStore`] is
//! the in-process implementation used by tests and the development server.

mod memory;
pub use memory::*;


use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::Result;

/// Node metadata maintained by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every write
    pub version: i32,
    /// Creation time in milliseconds since epoch
    pub created_at: u64,
    /// Last modification time in milliseconds since epoch
    pub modified_at: u64,
    /// Number of direct children
    pub child_count: u32,
}

/// Value and stat of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub value: String,
    pub stat: Stat,
}

/// Session state changes reported by the store client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Suspended,
    Lost,
    Reconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            ConnectionState::Suspended => "suspended",
            ConnectionState::Lost => "lost",
            ConnectionState::Reconnected => "reconnected",
        };
        f.write_str(s)
    }
}

/// Low-level callbacks emitted by a subtree watch
///
/// A watch first replays every existing node under the root as
/// `NodeCreated`, then emits `Initialized` exactly once, then streams live
/// mutations in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    NodeCreated { path: String, data: NodeData },
    NodeUpdated { path: String, data: NodeData },
    NodeDeleted { path: String },
    Initialized,
    Connection(ConnectionState),
}

/// Read/watch/write-with-version primitives of the coordination store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn get(
        &self,
        path: &str,
    ) -> Result<Option<NodeData>>;

    async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>>;

    /// Creates a node, optionally creating missing parents with empty values
    async fn create(
        &self,
        path: &str,
        value: &str,
        make_parents: bool,
    ) -> Result<Stat>;

    /// Overwrites a node value.
    ///
    /// With `expected_version` set, the write fails with
    /// `StoreError::VersionConflict` unless the node is still at that version.
    async fn set(
        &self,
        path: &str,
        value: &str,
        expected_version: Option<i32>,
    ) -> Result<Stat>;

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
        recursive: bool,
    ) -> Result<()>;

    /// Starts watching every node at or below `root`
    async fn watch_subtree(
        &self,
        root: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>>;
}

/// Joins path segments into an absolute store path
pub fn join_path(segments: &[&str]) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(segment.trim_matches('/'));
    }
    path
}

/// Returns the parent of an absolute path, `None` for the root
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
