//! Shared fixtures for unit tests: seeded stores, hubs and watch contexts.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::CleanerConfig;
use crate::config::HijackConfig;
use crate::config::HubConfig;
use crate::config::RouteConfig;
use crate::config::WatcherConfig;
use crate::route::RoutePolicy;
use crate::store::CoordinationStore;
use crate::store::MemoryStore;
use crate::store::NodeData;
use crate::store::Stat;
use crate::store::StoreEvent;
use crate::tree::MirrorTree;
use crate::tree::TreeHolderCleaner;
use crate::tree::TreeHub;
use crate::tree::WatchContext;
use crate::Result;

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Creates every `(path, value)` node, parents included
pub(crate) async fn seed(
    store: &MemoryStore,
    nodes: &[(&str, &str)],
) {
    for (path, value) in nodes {
        store.create(path, value, true).await.unwrap();
    }
}

/// Mirror of `root` holding the given `(path, value)` nodes
pub(crate) fn mirror_tree(
    root: &str,
    nodes: &[(&str, &str)],
) -> MirrorTree {
    let mut tree = MirrorTree::new(root);
    for (path, value) in nodes {
        tree.apply(&StoreEvent::NodeCreated {
            path: path.to_string(),
            data: NodeData {
                value: value.to_string(),
                stat: Stat::default(),
            },
        });
    }
    tree
}

pub(crate) fn hub_config() -> HubConfig {
    HubConfig {
        init_timeout_in_ms: TEST_TIMEOUT.as_millis() as u64,
        ..HubConfig::default()
    }
}

pub(crate) fn new_hub(store: Arc<dyn CoordinationStore>) -> Arc<TreeHub> {
    hub_with(store, hub_config(), CleanerConfig::default())
}

pub(crate) fn hub_with(
    store: Arc<dyn CoordinationStore>,
    config: HubConfig,
    cleaner: CleanerConfig,
) -> Arc<TreeHub> {
    Arc::new(TreeHub::new(store, config, TreeHolderCleaner::from_config(cleaner)))
}

pub(crate) fn route_config(ezones: &[&str]) -> RouteConfig {
    RouteConfig {
        ezones: ezones.iter().map(|e| e.to_string()).collect(),
        ..RouteConfig::default()
    }
}

pub(crate) fn policy(
    route: RouteConfig,
    hijack: HijackConfig,
) -> RoutePolicy {
    RoutePolicy::new(route, hijack)
}

/// Watch context without life-span jitter
pub(crate) fn watch_context(
    hub: Arc<TreeHub>,
    policy: RoutePolicy,
) -> Arc<WatchContext> {
    Arc::new(WatchContext {
        hub,
        policy: Arc::new(arc_swap::ArcSwap::from_pointee(policy)),
        config: WatcherConfig {
            life_span_jitter_in_secs: 0,
            ..WatcherConfig::default()
        },
        dependency: None,
    })
}

/// Store whose subtree watch registration is slow and observable
pub(crate) struct SlowWatchStore {
    inner: MemoryStore,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    registered: AtomicUsize,
    entered: Mutex<Vec<String>>,
}

impl SlowWatchStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            registered: AtomicUsize::new(0),
            entered: Mutex::new(Vec::new()),
        }
    }

    /// Highest number of registrations observed running at once
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Subtree roots in the order their registrations began
    pub(crate) fn entered(&self) -> Vec<String> {
        self.entered.lock().clone()
    }
}

#[async_trait]
impl CoordinationStore for SlowWatchStore {
    async fn get(
        &self,
        path: &str,
    ) -> Result<Option<NodeData>> {
        self.inner.get(path).await
    }

    async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        self.inner.get_children(path).await
    }

    async fn create(
        &self,
        path: &str,
        value: &str,
        make_parents: bool,
    ) -> Result<Stat> {
        self.inner.create(path, value, make_parents).await
    }

    async fn set(
        &self,
        path: &str,
        value: &str,
        expected_version: Option<i32>,
    ) -> Result<Stat> {
        self.inner.set(path, value, expected_version).await
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
        recursive: bool,
    ) -> Result<()> {
        self.inner.delete(path, expected_version, recursive).await
    }

    async fn watch_subtree(
        &self,
        root: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>> {
        self.entered.lock().push(root.to_string());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let receiver = self.inner.watch_subtree(root).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.registered.fetch_add(1, Ordering::SeqCst);
        receiver
    }
}
