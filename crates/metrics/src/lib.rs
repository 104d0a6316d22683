//! Metrics and tracing setup for meshdb.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a meshdb node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Document API ──
    pub doc_puts: IntCounter,
    pub doc_gets: IntCounter,
    pub doc_deletes: IntCounter,

    // ── Merge engine ──
    pub batches_merged: IntCounter,
    pub entries_merged: IntCounter,
    pub resolver_fallbacks: IntCounter,

    // ── Sync ──
    pub sync_rounds: IntCounter,
    pub sync_pulls: IntCounter,
    pub sync_pushes: IntCounter,
    pub sync_noops: IntCounter,
    pub sync_failures: IntCounter,
    pub msgs_sent_by_type: IntCounterVec,
    pub msgs_received_by_type: IntCounterVec,
    pub handshake_failures: IntCounter,
    pub request_latency_secs: HistogramVec,

    // ── Discovery ──
    pub beacons_sent: IntCounter,
    pub beacons_received: IntCounter,
    pub peers_alive: IntGauge,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for request latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let doc_puts = IntCounter::with_opts(Opts::new(
            "meshdb_doc_puts_total",
            "Local document PUT operations",
        ))
        .expect("doc_puts counter");
        let doc_gets = IntCounter::with_opts(Opts::new(
            "meshdb_doc_gets_total",
            "Local document GET operations",
        ))
        .expect("doc_gets counter");
        let doc_deletes = IntCounter::with_opts(Opts::new(
            "meshdb_doc_deletes_total",
            "Local document DELETE operations",
        ))
        .expect("doc_deletes counter");

        let batches_merged = IntCounter::with_opts(Opts::new(
            "meshdb_batches_merged_total",
            "Remote oplog batches applied",
        ))
        .expect("batches_merged counter");
        let entries_merged = IntCounter::with_opts(Opts::new(
            "meshdb_entries_merged_total",
            "Remote oplog entries applied",
        ))
        .expect("entries_merged counter");
        let resolver_fallbacks = IntCounter::with_opts(Opts::new(
            "meshdb_resolver_fallbacks_total",
            "Resolver errors that fell back to last-write-wins",
        ))
        .expect("resolver_fallbacks counter");

        let sync_rounds = IntCounter::with_opts(Opts::new(
            "meshdb_sync_rounds_total",
            "Anti-entropy rounds started",
        ))
        .expect("sync_rounds counter");
        let sync_pulls = IntCounter::with_opts(Opts::new(
            "meshdb_sync_pulls_total",
            "Sync sessions that pulled remote changes",
        ))
        .expect("sync_pulls counter");
        let sync_pushes = IntCounter::with_opts(Opts::new(
            "meshdb_sync_pushes_total",
            "Sync sessions that pushed local changes",
        ))
        .expect("sync_pushes counter");
        let sync_noops = IntCounter::with_opts(Opts::new(
            "meshdb_sync_noops_total",
            "Sync sessions with equal clocks",
        ))
        .expect("sync_noops counter");
        let sync_failures = IntCounter::with_opts(Opts::new(
            "meshdb_sync_failures_total",
            "Sync sessions that ended in an error",
        ))
        .expect("sync_failures counter");

        let msgs_sent_by_type = IntCounterVec::new(
            Opts::new("meshdb_msgs_sent_by_type_total", "Wire messages sent, by type"),
            &["msg_type"],
        )
        .expect("msgs_sent_by_type counter vec");
        let msgs_received_by_type = IntCounterVec::new(
            Opts::new(
                "meshdb_msgs_received_by_type_total",
                "Wire messages received, by type",
            ),
            &["msg_type"],
        )
        .expect("msgs_received_by_type counter vec");

        let handshake_failures = IntCounter::with_opts(Opts::new(
            "meshdb_handshake_failures_total",
            "Rejected or failed handshakes",
        ))
        .expect("handshake_failures counter");

        let request_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "meshdb_request_latency_seconds",
                "Sync request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["msg_type", "direction"],
        )
        .expect("request_latency_secs histogram");

        let beacons_sent = IntCounter::with_opts(Opts::new(
            "meshdb_beacons_sent_total",
            "Discovery beacons broadcast",
        ))
        .expect("beacons_sent counter");
        let beacons_received = IntCounter::with_opts(Opts::new(
            "meshdb_beacons_received_total",
            "Discovery beacons received",
        ))
        .expect("beacons_received counter");
        let peers_alive = IntGauge::with_opts(Opts::new(
            "meshdb_peers_alive",
            "Peers currently in the directory",
        ))
        .expect("peers_alive gauge");

        // Register all metrics
        registry
            .register(Box::new(doc_puts.clone()))
            .expect("register doc_puts");
        registry
            .register(Box::new(doc_gets.clone()))
            .expect("register doc_gets");
        registry
            .register(Box::new(doc_deletes.clone()))
            .expect("register doc_deletes");
        registry
            .register(Box::new(batches_merged.clone()))
            .expect("register batches_merged");
        registry
            .register(Box::new(entries_merged.clone()))
            .expect("register entries_merged");
        registry
            .register(Box::new(resolver_fallbacks.clone()))
            .expect("register resolver_fallbacks");
        registry
            .register(Box::new(sync_rounds.clone()))
            .expect("register sync_rounds");
        registry
            .register(Box::new(sync_pulls.clone()))
            .expect("register sync_pulls");
        registry
            .register(Box::new(sync_pushes.clone()))
            .expect("register sync_pushes");
        registry
            .register(Box::new(sync_noops.clone()))
            .expect("register sync_noops");
        registry
            .register(Box::new(sync_failures.clone()))
            .expect("register sync_failures");
        registry
            .register(Box::new(msgs_sent_by_type.clone()))
            .expect("register msgs_sent_by_type");
        registry
            .register(Box::new(msgs_received_by_type.clone()))
            .expect("register msgs_received_by_type");
        registry
            .register(Box::new(handshake_failures.clone()))
            .expect("register handshake_failures");
        registry
            .register(Box::new(request_latency_secs.clone()))
            .expect("register request_latency_secs");
        registry
            .register(Box::new(beacons_sent.clone()))
            .expect("register beacons_sent");
        registry
            .register(Box::new(beacons_received.clone()))
            .expect("register beacons_received");
        registry
            .register(Box::new(peers_alive.clone()))
            .expect("register peers_alive");

        Self {
            registry,
            doc_puts,
            doc_gets,
            doc_deletes,
            batches_merged,
            entries_merged,
            resolver_fallbacks,
            sync_rounds,
            sync_pulls,
            sync_pushes,
            sync_noops,
            sync_failures,
            msgs_sent_by_type,
            msgs_received_by_type,
            handshake_failures,
            request_latency_secs,
            beacons_sent,
            beacons_received,
            peers_alive,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a request latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_request_timer(msg_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .request_latency_secs
        .with_label_values(&[msg_type, direction])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.sync_rounds.get();
        m.sync_rounds.inc();
        m.sync_rounds.inc();
        assert_eq!(m.sync_rounds.get(), before + 2);

        m.doc_puts.inc();
        m.doc_gets.inc();
        m.doc_deletes.inc();

        m.msgs_sent_by_type.with_label_values(&["get_clock"]).inc();
        m.msgs_sent_by_type
            .with_label_values(&["pull_changes"])
            .inc();

        m.peers_alive.set(3);
        assert_eq!(m.peers_alive.get(), 3);
    }

    #[test]
    fn test_encode_metrics_format() {
        // Ensure at least one counter is incremented
        metrics().beacons_sent.inc();

        let output = encode_metrics();
        assert!(output.contains("meshdb_sync_rounds_total"));
        assert!(output.contains("meshdb_beacons_sent_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_histogram_records() {
        let m = metrics();

        m.request_latency_secs
            .with_label_values(&["test_msg", "outbound"])
            .observe(0.005);
        m.request_latency_secs
            .with_label_values(&["test_msg", "outbound"])
            .observe(0.010);

        let h: Histogram = m
            .request_latency_secs
            .with_label_values(&["test_msg", "outbound"]);
        assert_eq!(h.get_sample_count(), 2);
        assert!((h.get_sample_sum() - 0.015).abs() < 1e-9);
    }
}
