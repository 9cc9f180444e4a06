use std::sync::Once;

use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    pub static ref EVENTS_INGESTED: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_ingested_total", "chain nodes committed"),
        &["resource"]
    )
    .expect("metric can not be created");

    pub static ref EVENTS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_dropped_total", "raw events dropped before commit"),
        &["resource", "reason"]
    )
    .expect("metric can not be created");

    pub static ref CURSOR_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_cursor_conflicts_total", "duplicate cursors met while ingesting"),
        &["resource", "stage"]
    )
    .expect("metric can not be created");

    pub static ref BATCH_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_batch_retries_total", "batches handed back for retry"),
        &["resource"]
    )
    .expect("metric can not be created");

    pub static ref STORE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_store_errors_total", "primary store and cache failures"),
        &["resource", "store"]
    )
    .expect("metric can not be created");

    pub static ref FLOW_FATAL_ALARMS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_fatal_alarms_total", "anomalies that need an operator"),
        &["resource", "kind"]
    )
    .expect("metric can not be created");

    pub static ref TOKEN_RESETS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_token_resets_total", "watch tokens reset after resume point loss"),
        &["resource"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_watch_requests_total", "watch requests by mode"),
        &["resource", "mode"]
    )
    .expect("metric can not be created");

    pub static ref CHAIN_NODES_PURGED: IntCounterVec = IntCounterVec::new(
        Opts::new("event_chain_nodes_purged_total", "expired chain nodes removed"),
        &["resource"]
    )
    .expect("metric can not be created");

    pub static ref BATCH_DURATION_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("event_chain_batch_duration_ms", "batch handling latency in ms")
            .buckets(exponential_buckets(1.0, 2.0, 14).expect("valid buckets")),
        &["resource"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

/// Registers every collector on [`REGISTRY`]; later calls are no-ops.
pub fn register_custom_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(EVENTS_INGESTED.clone()),
            Box::new(EVENTS_DROPPED.clone()),
            Box::new(CURSOR_CONFLICTS.clone()),
            Box::new(BATCH_RETRIES.clone()),
            Box::new(STORE_ERRORS.clone()),
            Box::new(FLOW_FATAL_ALARMS.clone()),
            Box::new(TOKEN_RESETS.clone()),
            Box::new(WATCH_REQUESTS.clone()),
            Box::new(CHAIN_NODES_PURGED.clone()),
            Box::new(BATCH_DURATION_MS.clone()),
        ];
        for c in collectors {
            if let Err(e) = REGISTRY.register(c) {
                error!("collector can not be registered: {:?}", e);
            }
        }
    });
}

/// Records an anomaly that must never pass silently.
pub fn alarm(
    resource: &str,
    kind: &str,
) {
    FLOW_FATAL_ALARMS.with_label_values(&[resource, kind]).inc();
}

pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics();

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    info!("metrics endpoint listening on port {}", port);
    let (_, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_text())
}

/// Custom collectors followed by autometrics' own series, in text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    let mut res = String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("custom metrics could not be from_utf8'd: {}", e);
        String::default()
    });

    res.push_str(&prometheus_exporter::encode_http_response().into_body());
    res
}
