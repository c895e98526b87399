use std::sync::Arc;

use arbor::config::ArborConfig;
use arbor::dependency::StoreDependencyRecorder;
use arbor::metrics;
use arbor::route::RoutePolicy;
use arbor::route::SharedPolicy;
use arbor::server;
use arbor::server::LongPollService;
use arbor::store::CoordinationStore;
use arbor::store::MemoryStore;
use arbor::tree::TreeHolderCleaner;
use arbor::tree::TreeHub;
use arbor::tree::WatchContext;
use arbor::Error;
use arbor::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_observability();

    let settings = ArborConfig::new()?.validate()?;
    info!(?settings, "Configuration loaded");

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let cleaner = TreeHolderCleaner::from_config(settings.cleaner.clone());
    let hub = Arc::new(TreeHub::new(store.clone(), settings.hub.clone(), cleaner));
    let cleaner_handle = hub.spawn_cleaner(graceful_rx.clone());

    let policy = RoutePolicy::shared(settings.route.clone(), settings.hijack.clone());
    tokio::spawn(reload_on_hangup(policy.clone(), graceful_rx.clone()));

    let context = Arc::new(WatchContext {
        hub: hub.clone(),
        policy,
        config: settings.watcher.clone(),
        dependency: StoreDependencyRecorder::from_config(store, &settings.dependency),
    });
    let service = Arc::new(LongPollService::new(context, settings.server.keepalive_interval()));

    if settings.monitoring.prometheus_enabled {
        tokio::spawn(metrics::start_server(
            settings.monitoring.prometheus_port,
            graceful_rx.clone(),
        ));
    }

    // Listen on Shutdown Signal
    tokio::spawn(async {
        if let Err(e) = graceful_shutdown(graceful_tx).await {
            error!("Failed to shutdown: {:?}", e);
        }
    });

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = server::start_server(settings.server.socket_addr()?, service, graceful_rx).await {
        error!("server stops: {:?}", e);
    }

    hub.close_all();
    if let Some(handle) = cleaner_handle {
        handle.await?;
    }

    info!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(format!("SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::Fatal(format!("SIGTERM handler: {e}")))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    info!("Shutdown server..");
    graceful_tx.send(()).map_err(|e| {
        error!("Failed to send shutdown signal: {}", e);
        Error::SignalSenderClosed(format!("Failed to send shutdown signal: {}", e))
    })?;

    info!("Shutdown completed");
    Ok(())
}

/// Re-reads the configuration on SIGHUP and swaps the routing policy
async fn reload_on_hangup(
    policy: SharedPolicy,
    mut shutdown: watch::Receiver<()>,
) {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sighup.recv() => {
                info!("SIGHUP detected, reloading routing policy.");
                match ArborConfig::new().and_then(ArborConfig::validate) {
                    Ok(settings) => RoutePolicy::reload(&policy, settings.route, settings.hijack),
                    Err(e) => error!("Routing policy not reloaded: {:?}", e),
                }
            }
        }
    }
}

fn init_observability() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
