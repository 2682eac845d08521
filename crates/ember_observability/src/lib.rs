//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ember=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

pub fn record_active_connections(count: usize) {
    metrics::gauge!("ember_active_connections").set(count as f64);
}

/// Record one extended-protocol operation.
/// `op` is one of `parse`, `bind`, `execute`, `describe`, `close`;
/// `path` names how it was served (`plan`, `light_proxy`, `batch`, ...).
pub fn record_prepared_stmt_op(op: &str, path: &str) {
    metrics::counter!(
        "ember_prepared_stmt_ops_total",
        "op" => op.to_string(),
        "path" => path.to_string()
    )
    .increment(1);
}

pub fn record_prepared_stmt_parse_duration_us(duration_us: u64, success: bool) {
    metrics::histogram!(
        "ember_prepared_stmt_parse_duration_us",
        "success" => success.to_string()
    )
    .record(duration_us as f64);
}

pub fn record_prepared_stmt_execute_duration_us(duration_us: u64, success: bool) {
    metrics::histogram!(
        "ember_prepared_stmt_execute_duration_us",
        "success" => success.to_string()
    )
    .record(duration_us as f64);
}

pub fn record_prepared_stmt_param_count(count: usize) {
    metrics::histogram!("ember_prepared_stmt_param_count").record(count as f64);
}

pub fn record_prepared_stmt_active(count: usize) {
    metrics::gauge!("ember_prepared_stmt_active").set(count as f64);
}

pub fn record_prepared_stmt_portals_active(count: usize) {
    metrics::gauge!("ember_prepared_stmt_portals_active").set(count as f64);
}

/// A statement that could not take the single-shard fast path.
pub fn record_light_proxy_fallback(reason: &str) {
    metrics::counter!(
        "ember_light_proxy_fallback_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Sub-messages sent to shards by one batch bind-execute.
pub fn record_batch_dispatch(param_sets: usize, shard_messages: usize) {
    metrics::histogram!("ember_batch_param_sets").record(param_sets as f64);
    metrics::histogram!("ember_batch_shard_messages").record(shard_messages as f64);
}

pub fn record_shard_dispatch(path: &str) {
    metrics::counter!("ember_shard_dispatch_total", "path" => path.to_string()).increment(1);
}

pub fn record_txn_metrics(action: &str) {
    metrics::counter!("ember_txn_total", "action" => action.to_string()).increment(1);
}

/// Errors reported to clients, by SQLSTATE.
pub fn record_error(sqlstate: &str) {
    metrics::counter!("ember_errors_total", "sqlstate" => sqlstate.to_string()).increment(1);
}
