use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aprs_gateway::aprs_client::AprsClientConfigBuilder;
use aprs_gateway::config::{env_int, env_or, GatewayConfig};
use aprs_gateway::gateway::Gateway;
use aprs_gateway::multi_client::MultiClient;
use aprs_gateway::outbox::Outbox;
use aprs_gateway::store::{DocumentStore, HttpDocumentStore};

#[derive(Parser)]
#[command(name = "aprs-gateway")]
#[command(about = "Resilient APRS-IS gateway with redundant sessions and reliable replies")]
#[command(version)]
struct Cli {
    /// Amateur radio callsign for this gateway
    #[arg(long, default_value = "KI7QIV-10")]
    callsign: String,

    /// APRS-IS server-side filter expression
    #[arg(long, default_value = "p/KI7QIV")]
    filter: String,

    /// APRS-IS server hostname (overridable via APRS_ADDR)
    #[arg(long, default_value = "noam.aprs2.net")]
    server: String,

    /// APRS-IS server port (overridable via APRS_PORT)
    #[arg(long, default_value_t = 14580)]
    port: u16,

    /// Number of parallel APRS-IS sessions (overridable via APRS_CHANNELS)
    #[arg(long, default_value_t = 3)]
    channels: usize,

    /// Respond to received beacon packets.
    ///
    /// WARNING: responses are transmitted over amateur radio
    /// frequencies. Licensed operators only.
    #[arg(long)]
    respond: bool,

    /// Credentials file for the document store
    #[arg(long, default_value = "/etc/jheidel-aprs/key.json")]
    credentials: PathBuf,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Export Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Cli {
    /// Applies environment overrides on top of the parsed flags.
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            callsign: self.callsign,
            filter: self.filter,
            server: env_or("APRS_ADDR", self.server),
            port: env_int("APRS_PORT", self.port),
            channels: env_int("APRS_CHANNELS", self.channels),
            respond: self.respond,
            credentials: self.credentials,
            debug: self.debug,
            metrics_port: self.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Cli::parse().into_config();

    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    ensure!(config.channels >= 1, "at least one channel is required");
    info!(
        "starting gateway as {} against {}:{} ({} channels)",
        config.callsign, config.server, config.port, config.channels
    );
    if config.respond {
        warn!("responses enabled: replies will be transmitted on amateur radio frequencies");
    }

    if let Some(port) = config.metrics_port {
        aprs_gateway::metrics::init_metrics(port)?;
    }

    // Store problems at startup are fatal; once running, store errors
    // only cost individual records.
    let store =
        HttpDocumentStore::from_credentials_file(&config.credentials).context("store init")?;
    store.ping().await.context("store init")?;
    let store: Arc<dyn DocumentStore> = Arc::new(store);

    let cancel = CancellationToken::new();
    let outbox = Outbox::spawn(cancel.clone());

    let client_config = AprsClientConfigBuilder::new()
        .server(config.server.clone())
        .port(config.port)
        .callsign(config.callsign.clone())
        .filter(config.filter.clone())
        .build();
    let connection_timeout = client_config.connection_timeout;

    let multi = MultiClient::new(client_config, config.channels, outbox.clone());
    let health = multi.health();
    let packets = multi.run(cancel.clone());

    let gateway = Gateway::new(store, outbox, config.respond);
    let gateway_task = tokio::spawn(gateway.run(cancel.clone(), packets));

    // Periodic liveness report across all sessions.
    tokio::spawn({
        let health = health.clone();
        let cancel = cancel.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // First tick completes immediately.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match health.last_line_age() {
                            Some(age) if age <= connection_timeout => {
                                info!("healthy: last server line {age:?} ago");
                            }
                            Some(age) => {
                                warn!("unhealthy: no server line for {age:?}");
                            }
                            None => {
                                warn!("unhealthy: no server line received yet");
                            }
                        }
                    }
                }
            }
        }
    });

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();
    let _ = gateway_task.await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
