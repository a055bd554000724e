use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

pub const CYCLES_TOTAL: &str = "ingest.cycles_total";
pub const CYCLES_FAILED_TOTAL: &str = "ingest.cycles_failed_total";
pub const RECORDS_FETCHED_TOTAL: &str = "ingest.records_fetched_total";
pub const RECORDS_MALFORMED_TOTAL: &str = "ingest.records_malformed_total";
pub const RECORDS_FILTERED_TOTAL: &str = "ingest.records_filtered_total";
pub const UPSERTS_TOTAL: &str = "ingest.upserts_total";
pub const WRITE_FAILURES_TOTAL: &str = "ingest.write_failures_total";
pub const REAUTH_TOTAL: &str = "ingest.reauth_total";
pub const PRUNED_TOTAL: &str = "ingest.pruned_total";
pub const LAST_SUCCESS_TIMESTAMP: &str = "ingest.last_success_timestamp";
pub const CYCLE_DURATION_MS: &str = "ingest.cycle_duration_ms";

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        // Buckets: 10ms .. 30s, cycles are dominated by the upstream fetch
        .set_buckets_for_metric(
            Matcher::Full(CYCLE_DURATION_MS.to_string()),
            &[
                10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            ],
        )
        .context("failed to set buckets for cycle duration")?
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!("Serving Prometheus metrics on {}", addr);
    Ok(())
}

/// Install the exporter when a port is configured, then register every
/// ingest metric at zero.
///
/// The recorder has to be installed first: zeros recorded before it exist go
/// to the no-op recorder and never show up in a scrape.
pub fn init_ingest_metrics(port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        start_metrics_server(port)?;
    }
    initialize_ingest_metrics();
    Ok(())
}

/// Register every ingest metric at zero so dashboards see them before the
/// first event.
fn initialize_ingest_metrics() {
    for name in [
        CYCLES_TOTAL,
        CYCLES_FAILED_TOTAL,
        RECORDS_FETCHED_TOTAL,
        RECORDS_MALFORMED_TOTAL,
        RECORDS_FILTERED_TOTAL,
        UPSERTS_TOTAL,
        WRITE_FAILURES_TOTAL,
        REAUTH_TOTAL,
        PRUNED_TOTAL,
    ] {
        metrics::counter!(name).absolute(0);
    }
    metrics::gauge!(LAST_SUCCESS_TIMESTAMP).set(0.0);
}
