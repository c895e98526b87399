use std::sync::Arc;

use arbor::config::ArborConfig;
use arbor::dependency::StoreDependencyRecorder;
use arbor::route::RoutePolicy;
use arbor::server::LongPollService;
use arbor::store::CoordinationStore;
use arbor::store::MemoryStore;
use arbor::tree::TreeHolderCleaner;
use arbor::tree::TreeHub;
use arbor::tree::WatchContext;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Running arbor wiring over an in-memory store
pub struct TestServer {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<TreeHub>,
    pub service: Arc<LongPollService>,
}

/// Defaults with life-span jitter removed so `life_span=1` sessions end after one second
pub fn test_config() -> ArborConfig {
    let mut config = ArborConfig::default();
    config.watcher.life_span_jitter_in_secs = 0;
    config.server.keepalive_interval_in_secs = 60;
    config
}

pub async fn start(
    config: ArborConfig,
    nodes: &[(&str, &str)],
) -> TestServer {
    enable_logger();
    let config = config.validate().unwrap();

    let store = Arc::new(MemoryStore::new());
    for (path, value) in nodes {
        store.create(path, value, true).await.unwrap();
    }

    let shared: Arc<dyn CoordinationStore> = store.clone();
    let hub = Arc::new(TreeHub::new(
        shared.clone(),
        config.hub.clone(),
        TreeHolderCleaner::from_config(config.cleaner.clone()),
    ));
    let context = Arc::new(WatchContext {
        hub: hub.clone(),
        policy: RoutePolicy::shared(config.route.clone(), config.hijack.clone()),
        config: config.watcher.clone(),
        dependency: StoreDependencyRecorder::from_config(shared, &config.dependency),
    });
    let service = Arc::new(LongPollService::new(context, config.server.keepalive_interval()));

    TestServer { store, hub, service }
}

/// Parses an NDJSON body
pub fn lines(body: &[u8]) -> Vec<Value> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}
