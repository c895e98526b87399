//! Arbor Error Hierarchy
//!
//! Defines the error types surfaced by the watch/diff/push engine,
//! categorized by the layer that produced them.
//!
//! Malformed metadata never shows up here: it is recovered locally and
//! degrades to "no mapping" with a logged warning.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

use crate::tree::TreeType;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Coordination store failures (missing nodes, version conflicts, closed sessions)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Watch session failures raised before the stream starts
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration validation failures
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Background task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSenderClosed(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Node does not exist
    #[error("No node at path {0}")]
    NoNode(String),

    /// Node already exists
    #[error("Node already exists at path {0}")]
    NodeExists(String),

    /// Optimistic concurrency check failed; callers may retry
    #[error("Version conflict at {path} (expected: {expected}, actual: {actual})")]
    VersionConflict {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Node still has children and a non-recursive delete was requested
    #[error("Node {0} is not empty")]
    NotEmpty(String),

    /// Path is not a well-formed absolute path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Store session is gone
    #[error("Coordination store session closed")]
    SessionClosed,

    /// Value could not be encoded before writing
    #[error("Failed to encode value for {path}: {reason}")]
    Encode { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The subscription request was rejected before any holder was created
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// The first full snapshot of a subtree did not load in time
    #[error("Holder {application}/{tree_type} not initialized after {timeout:?}")]
    HolderInitTimeout {
        application: String,
        tree_type: TreeType,
        timeout: Duration,
    },

    /// The holder was closed while a caller was waiting on it
    #[error("Holder {application}/{tree_type} closed")]
    HolderClosed {
        application: String,
        tree_type: TreeType,
    },

    /// Operations on a watcher in the wrong lifecycle state
    #[error("Watcher is {0}, operation not allowed")]
    IllegalState(&'static str),

    /// Startup gate was shut down
    #[error("Holder startup gate closed")]
    GateClosed,
}

impl Error {
    /// Whether the failure is caused by the caller's request rather than the server
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Watch(WatchError::InvalidSubscription(_)))
    }

    /// Whether the failure is an initialization timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Watch(WatchError::HolderInitTimeout { .. }))
    }

    /// Whether a versioned write may be retried
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::VersionConflict { .. }))
    }
}
