mod api;
mod config;
mod discovery;
mod mdns;
mod proxy;
mod store;
mod store_manager;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::discovery::DiscoveryCache;
use crate::mdns::MdnsTransport;
use crate::proxy::Gateway;
use crate::store::db::DeviceDb;
use crate::store_manager::StoreHandle;

const DEFAULT_CONFIG_PATH: &str = "/etc/device-gateway/gatewayd.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("device_gatewayd=info"))
        )
        .init();

    tracing::info!("Starting device-gatewayd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Only an explicitly named file has to exist
    let config = if Path::new(&config_path).exists() || config_path != DEFAULT_CONFIG_PATH {
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?;
        tracing::info!("Loaded config from {}", config_path);
        config
    } else {
        tracing::info!("No config at {}, using defaults", config_path);
        Config::default()
    };

    let db = DeviceDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let initial_devices = db.list()?;
    let initial_hash = store::hash::compute_hash(&initial_devices);
    tracing::info!("{} known devices, hash {}", initial_devices.len(), initial_hash);

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store = StoreHandle::spawn(db, hash_tx);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let transport = Arc::new(MdnsTransport::new(mdns_daemon.clone()));
    let (cache, events_rx) =
        DiscoveryCache::new(transport, store.clone(), config.discovery.clone());
    cache.start().await?;

    let cancel = CancellationToken::new();

    let loop_cancel = cancel.clone();
    let loop_cache = cache.clone();
    let loop_handle = tokio::spawn(async move {
        if let Err(e) = discovery::run(loop_cache, events_rx, loop_cancel).await {
            tracing::error!("Discovery loop error: {}", e);
        }
    });

    let gateway = Gateway::new(config.proxy.clone())?;
    tracing::info!(
        "Proxying {}/* via {} header (timeout {} ms, digest auth {})",
        config.proxy.mount,
        config.proxy.target_header,
        config.proxy.timeout_ms,
        if config.proxy.auth.is_some() { "on" } else { "off" }
    );

    let app_state = api::routes::AppState {
        discovery: cache.clone(),
        gateway: Arc::new(gateway),
        hash_rx,
        service_type: config.discovery.service_type.clone(),
        check_period_secs: config.discovery.check_period_secs,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = tokio::join!(loop_handle, server_handle);

    cache.shutdown().await;

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
