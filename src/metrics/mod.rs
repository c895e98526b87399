//! Prometheus collectors and the `/metrics` endpoint.
//!
//! Collectors are process-wide statics; [`start_server`] registers them in
//! [`REGISTRY`] and serves the text exposition format until shutdown.


use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref HOLDERS_GAUGE: IntGauge =
        IntGauge::new("holders", "Holders currently registered in the hub")
            .expect("metric can not be created");

    pub static ref HOLDER_INIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("holder_init_seconds", "Time from startup permit request to first full snapshot")
            .buckets(exponential_buckets(0.001, 2.0, 15).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref HOLDER_INIT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("holder_init_failures", "Holders that failed to initialize"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref WATCHERS_GAUGE: IntGauge =
        IntGauge::new("watchers", "Long-poll sessions currently streaming")
            .expect("metric can not be created");

    pub static ref WATCH_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_messages", "Messages pushed to watch sessions"),
        &["message"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_RESYNCS: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_resyncs", "Scoped full dumps forced inside a running session"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref HIJACK_DIAGNOSTICS: IntCounterVec = IntCounterVec::new(
        Opts::new("hijack_diagnostics", "Routing inconsistencies observed while preparing hijack"),
        &["kind", "mode"]
    )
    .expect("metric can not be created");

    pub static ref FORCE_ROUTED_CLUSTERS: IntCounter =
        IntCounter::new("force_routed_clusters", "Requested clusters substituted by force routing")
            .expect("metric can not be created");

    pub static ref CLEANER_EVICTIONS: IntCounter =
        IntCounter::new("cleaner_evictions", "Idle holders closed by the cleaner")
            .expect("metric can not be created");

    pub static ref CLEANER_SWEEP_FAILURES: IntCounter =
        IntCounter::new("cleaner_sweep_failures", "Cleaner sweeps that ended with an error")
            .expect("metric can not be created");

    pub static ref DEPENDENCY_DECLARATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("dependency_declarations", "Passive dependency writes by outcome"),
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HOLDERS_GAUGE.clone()),
        Box::new(HOLDER_INIT_DURATION.clone()),
        Box::new(HOLDER_INIT_FAILURES.clone()),
        Box::new(WATCHERS_GAUGE.clone()),
        Box::new(WATCH_MESSAGES.clone()),
        Box::new(WATCH_RESYNCS.clone()),
        Box::new(HIJACK_DIAGNOSTICS.clone()),
        Box::new(FORCE_ROUTED_CLUSTERS.clone()),
        Box::new(CLEANER_EVICTIONS.clone()),
        Box::new(CLEANER_SWEEP_FAILURES.clone()),
        Box::new(DEPENDENCY_DECLARATIONS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            error!("collector can not be registered: {}", e);
        }
    }
}

pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and(warp::get()).and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        let _ = shutdown_signal.changed().await;
    });
    info!(%addr, "Metrics server listening");
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(encode_registry(&REGISTRY))
}

/// Renders every collector of `registry` in the text exposition format
pub(crate) fn encode_registry(registry: &Registry) -> String {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
