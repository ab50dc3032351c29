use sessiongate::config::Config;
use sessiongate::docker::DockerGateway;
use sessiongate::gateway::{NoopGateway, SharedGateway};
use sessiongate::proxy::ProxyServer;
use sessiongate::reaper::IdleReaper;
use sessiongate::route::{RouteTable, RouteTableConfig};
use sessiongate::store::RouteStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiongate=debug".parse()?),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    log_config(&config);

    if config.uses_default_api_key() {
        warn!("Using the default API key; set server.api_key before exposing /api");
    }

    let gateway: SharedGateway = if config.docker.enabled {
        Arc::new(DockerGateway::new(config.docker.host.clone()))
    } else {
        info!("Docker disabled, containers will not be torn down");
        Arc::new(NoopGateway)
    };

    // A corrupt store must stop startup rather than be overwritten
    let table = RouteTable::restore(
        RouteStore::new(&config.routes.storage),
        gateway,
        RouteTableConfig {
            idle_threshold: config.routes.idle_timeout(),
            sweep_interval: config.routes.sweep_interval(),
        },
    )
    .map_err(|e| {
        error!(error = %e, "Failed to restore route table");
        e
    })?;

    if let Err(e) = table.persist() {
        error!(error = %e, "Failed to write route store");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = IdleReaper::new(Arc::clone(&table));
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let proxy = ProxyServer::new(&config.server, Arc::clone(&table), shutdown_rx.clone())?;
    let pool_stats = proxy.pool().stats();
    info!(addr = %proxy.bind_addr(), "Starting proxy listener");
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    if let Err(e) = table.persist() {
        error!(error = %e, "Failed to write route store on shutdown");
    }

    info!(
        routes = table.len(),
        forwarded = pool_stats.get_total_requests(),
        failed = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn log_config(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting session proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        path_prefix = %config.server.path_prefix,
        cookie_name = %config.server.cookie_name,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        tunnel_idle_timeout_secs = config.server.tunnel_idle_timeout_secs,
        "Connection settings"
    );
    info!(
        storage = %config.routes.storage.display(),
        idle_timeout_secs = config.routes.idle_timeout_secs,
        sweep_interval_secs = config.routes.sweep_interval_secs,
        "Route settings"
    );
    info!(
        enabled = config.docker.enabled,
        host = ?config.docker.host,
        "Docker settings"
    );
}
