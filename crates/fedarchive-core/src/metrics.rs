//! Prometheus metrics helpers for the archiver.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fedarchive_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics().unwrap();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("crawl_servers_discovered_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`crawl_`, `media_`)
//! - Suffix: unit or type (`_total`, `_registered`)
//! - Labels: `role` and `stage` only, to keep cardinality bounded by code paths

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Must be called once at startup before any metrics are recorded.
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_crawl_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
#[cfg(test)]
fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning so a busy port is reported to the
/// caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_crawl_metrics() {
    // =========================================================================
    // Discovery / Manager
    // =========================================================================

    describe_counter!(
        "crawl_servers_discovered_total",
        "Servers processed for the first time by the crawl manager"
    );
    describe_counter!(
        "crawl_servers_rejected_total",
        "Servers whose platform name or URL cannot be used as an archive path"
    );
    describe_counter!(
        "crawl_servers_out_of_scope_total",
        "Servers recorded as known but excluded by the scope filter"
    );
    describe_gauge!("crawl_known_servers", "Number of distinct server URLs seen");
    describe_gauge!(
        "crawl_archivers_registered",
        "Number of archiver sessions in the registry"
    );
    describe_gauge!(
        "crawl_explorers_registered",
        "Number of explorer sessions in the registry"
    );

    // =========================================================================
    // Sessions
    // =========================================================================

    describe_counter!(
        "crawl_sessions_started_total",
        "Sessions started (label: role)"
    );
    describe_counter!(
        "crawl_session_reconnects_total",
        "Reconnect attempts after a transient failure (label: role)"
    );
    describe_counter!(
        "crawl_session_failures_total",
        "Session failures (labels: role, stage)"
    );

    // =========================================================================
    // Download queue / Media
    // =========================================================================

    describe_counter!(
        "crawl_download_items_total",
        "Download items queued by archiver sessions"
    );
    describe_counter!(
        "crawl_download_overflow_total",
        "Download items routed to the overflow file because the queue was full"
    );
    describe_counter!("media_downloads_total", "Assets downloaded and saved");
    describe_counter!(
        "media_download_failures_total",
        "Asset downloads that failed"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter labelled with a session role.
#[inline]
pub fn increment_role(name: &'static str, role: &'static str) {
    metrics::counter!(name, "role" => role).increment(1);
}

/// Increment a counter without labels.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
