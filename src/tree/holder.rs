//! Holder: the live mirror of one `(application, type)` subtree.
//!
//! A holder owns exactly one writer task. The task drains the store's
//! subtree watch, applies each callback to the [`MirrorTree`] under the write
//! lock and, once the lock is released, publishes the normalized change on a
//! broadcast change log. Watchers read the tree through [`TreeHolder::read`]
//! and follow the change log; revision numbers let them discard changes they
//! already observed through a snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::HolderKey;
use super::MirrorTree;
use super::TreeChange;
use super::TreeType;
use crate::route::ClusterMeta;
use crate::store::ConnectionState;
use crate::store::CoordinationStore;
use crate::store::StoreEvent;
use crate::Result;
use crate::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    New,
    Starting,
    Initialized,
    /// Store session suspended or lost after initialization; data is kept
    Suspended,
    Closed,
}

impl HolderState {
    /// Whether the mirror has loaded its first full snapshot
    pub fn is_ready(&self) -> bool {
        matches!(self, HolderState::Initialized | HolderState::Suspended)
    }
}

/// Entry of a holder's change log
#[derive(Debug, Clone, PartialEq)]
pub enum HolderEvent {
    Changed(TreeChange),
    Connection(ConnectionState),
    Closed,
}

pub struct TreeHolder {
    key: HolderKey,
    store: Arc<dyn CoordinationStore>,
    tree: Arc<RwLock<MirrorTree>>,
    state: Arc<watch::Sender<HolderState>>,
    changes: broadcast::Sender<HolderEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TreeHolder {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TreeHolder")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl TreeHolder {
    pub fn new(
        key: HolderKey,
        store: Arc<dyn CoordinationStore>,
        change_log_capacity: usize,
    ) -> Self {
        let (state, _) = watch::channel(HolderState::New);
        let (changes, _) = broadcast::channel(change_log_capacity.max(1));
        let tree = MirrorTree::new(key.root_path());
        Self {
            key,
            store,
            tree: Arc::new(RwLock::new(tree)),
            state: Arc::new(state),
            changes,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &HolderKey {
        &self.key
    }

    pub fn state(&self) -> HolderState {
        *self.state.borrow()
    }

    /// Read access to the mirror; the guard must not be held across awaits
    pub fn read(&self) -> RwLockReadGuard<'_, MirrorTree> {
        self.tree.read()
    }

    /// Subscribes to the change log.
    ///
    /// Subscribe before taking a snapshot through [`Self::read`] so no change
    /// falls between the two.
    pub fn subscribe(&self) -> broadcast::Receiver<HolderEvent> {
        self.changes.subscribe()
    }

    /// Starts watching the subtree and spawns the writer task.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn start(&self) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == HolderState::New {
                *state = HolderState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Ok(());
        }

        let root = self.key.root_path();
        debug!(holder = %self.key, root, "Starting holder");

        let events = match self.store.watch_subtree(&root).await {
            Ok(events) => events,
            Err(e) => {
                warn!(holder = %self.key, error = %e, "Failed to watch subtree");
                self.close();
                return Err(e);
            }
        };

        let writer = HolderWriter {
            key: self.key.clone(),
            tree: self.tree.clone(),
            state: self.state.clone(),
            changes: self.changes.clone(),
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(writer.run(events, cancel));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Waits until the first full snapshot is loaded.
    ///
    /// # Errors
    /// - `WatchError::HolderInitTimeout` when `timeout` elapses first
    /// - `WatchError::HolderClosed` when the holder closes while waiting
    pub async fn block_until_initialized(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            rx.wait_for(|state| state.is_ready() || *state == HolderState::Closed)
                .await
                .map(|state| *state)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(_) => Err(WatchError::HolderClosed {
                application: self.key.application.clone(),
                tree_type: self.key.tree_type,
            }
            .into()),
            Err(_) => Err(WatchError::HolderInitTimeout {
                application: self.key.application.clone(),
                tree_type: self.key.tree_type,
                timeout,
            }
            .into()),
        }
    }

    /// Stops the writer task and wakes every follower of the change log.
    pub fn close(&self) {
        let closed_now = self.state.send_if_modified(|state| {
            if *state == HolderState::Closed {
                false
            } else {
                *state = HolderState::Closed;
                true
            }
        });
        if !closed_now {
            return;
        }

        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        let _ = self.changes.send(HolderEvent::Closed);
        info!(holder = %self.key, "Holder closed");
    }

    /// (path, value) of every instance key
    pub fn list_instance_nodes(&self) -> Vec<(String, String)> {
        self.read().list_instance_nodes()
    }

    /// Decoded `info` metadata per cluster; empty `clusters` means all.
    ///
    /// Only service trees carry `info`; other types yield an empty map.
    pub fn list_service_info(
        &self,
        clusters: &[String],
    ) -> BTreeMap<String, Map<String, Value>> {
        if self.key.tree_type != TreeType::Service {
            return BTreeMap::new();
        }

        let tree = self.read();
        let names: Vec<String> = if clusters.is_empty() {
            tree.cluster_names().cloned().collect()
        } else {
            clusters.to_vec()
        };

        names
            .into_iter()
            .filter_map(|name| {
                let node = tree.cluster(&name)?;
                let path = format!("{}/{}", tree.root(), name);
                let meta = ClusterMeta::parse(node.value(), &path);
                Some((name, meta.info))
            })
            .collect()
    }
}

impl Drop for TreeHolder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Single writer of one mirror tree
struct HolderWriter {
    key: HolderKey,
    tree: Arc<RwLock<MirrorTree>>,
    state: Arc<watch::Sender<HolderState>>,
    changes: broadcast::Sender<HolderEvent>,
}

impl HolderWriter {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<StoreEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(holder = %self.key, "Writer task cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        warn!(holder = %self.key, "Store watch ended, closing holder");
                        self.close();
                        break;
                    }
                }
            }
        }
    }

    fn handle(
        &self,
        event: StoreEvent,
    ) {
        match event {
            StoreEvent::Initialized => {
                self.state.send_if_modified(|state| {
                    if *state == HolderState::Starting {
                        *state = HolderState::Initialized;
                        true
                    } else {
                        false
                    }
                });
                let revision = self.tree.read().revision();
                info!(holder = %self.key, revision, "Holder initialized");
            }
            StoreEvent::Connection(connection) => {
                self.on_connection(connection);
                let _ = self.changes.send(HolderEvent::Connection(connection));
            }
            event => {
                let change = self.tree.write().apply(&event);
                if let Some(change) = change {
                    trace!(holder = %self.key, revision = change.revision, level = ?change.level, "Change applied");
                    // No receivers is fine: nobody is watching this holder right now.
                    let _ = self.changes.send(HolderEvent::Changed(change));
                }
            }
        }
    }

    fn on_connection(
        &self,
        connection: ConnectionState,
    ) {
        let next = match connection {
            ConnectionState::Suspended | ConnectionState::Lost => {
                warn!(holder = %self.key, %connection, "Store connection degraded");
                HolderState::Suspended
            }
            ConnectionState::Reconnected => {
                info!(holder = %self.key, "Store connection restored");
                HolderState::Initialized
            }
        };

        self.state.send_if_modified(|state| {
            let allowed = match next {
                HolderState::Suspended => *state == HolderState::Initialized,
                HolderState::Initialized => *state == HolderState::Suspended,
                _ => false,
            };
            if allowed {
                *state = next;
            }
            allowed
        });
    }

    fn close(&self) {
        let closed_now = self.state.send_if_modified(|state| {
            if *state == HolderState::Closed {
                false
            } else {
                *state = HolderState::Closed;
                true
            }
        });
        if closed_now {
            let _ = self.changes.send(HolderEvent::Closed);
        }
    }
}
