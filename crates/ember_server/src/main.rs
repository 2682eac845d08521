use anyhow::Result;
use clap::Parser;

use ember_cluster::{AdmissionControl, LocalCluster};
use ember_common::config::EmberConfig;
use ember_protocol_pg::server::PgServer;

#[derive(Parser, Debug)]
#[command(name = "ember", about = "Ember: PG extended-query front end over hash-sharded storage")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "ember.toml")]
    config: String,

    /// PG listen address (overrides config).
    #[arg(long)]
    pg_addr: Option<String>,

    /// Number of in-process shards (overrides config).
    #[arg(long)]
    shards: Option<u64>,

    /// Metrics listen address (overrides config; empty disables).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml_str = EmberConfig::default()
            .to_toml()
            .unwrap_or_else(|e| format!("# failed to serialize default config: {e}"));
        println!("{toml_str}");
        return Ok(());
    }

    ember_observability::init_tracing();
    tracing::info!("starting ember");

    let mut config = load_config(&cli.config);
    if let Some(addr) = cli.pg_addr {
        config.server.pg_listen_addr = addr;
    }
    if let Some(shards) = cli.shards {
        config.router.shard_count = shards;
    }
    if let Some(addr) = cli.metrics_addr {
        config.server.metrics_addr = addr;
    }
    anyhow::ensure!(config.router.shard_count > 0, "shard_count must be at least 1");
    tracing::info!(?config, "effective configuration");

    if !config.server.metrics_addr.is_empty() {
        if let Err(e) = ember_observability::init_metrics(&config.server.metrics_addr) {
            tracing::warn!(error = %e, "failed to initialize metrics");
        }
    }

    let admission = AdmissionControl::new(
        config.server.max_active_statements,
        config.server.max_connections,
    );
    let cluster = LocalCluster::new(config.router.shard_count, admission);
    let server = PgServer::new(
        config.server.pg_listen_addr.clone(),
        cluster,
        config.session.clone(),
    );

    server
        .run_with_shutdown(async {
            let reason = wait_for_shutdown_signal().await;
            tracing::info!("{reason}, shutting down");
        })
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!("ember stopped");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning which signal fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}

fn load_config(path: &str) -> EmberConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match EmberConfig::from_toml(&content) {
            Ok(config) => {
                tracing::info!(path, "loaded config");
                config
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to parse config, using defaults");
                EmberConfig::default()
            }
        },
        Err(_) => {
            tracing::info!(path, "config file not found, using defaults");
            EmberConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["ember", "--pg-addr", "0.0.0.0:6000", "--shards", "8"]);
        assert_eq!(cli.pg_addr.as_deref(), Some("0.0.0.0:6000"));
        assert_eq!(cli.shards, Some(8));
        assert_eq!(cli.config, "ember.toml");
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config("/nonexistent/ember.toml");
        assert_eq!(config.router.shard_count, 4);
        assert!(config.session.enable_light_proxy);
    }
}
