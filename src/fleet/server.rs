use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::db::{DbHandle, FleetDb};
use super::hub::{FleetHub, HubSettings};
use super::ws;
use crate::hub_config::HubToml;

/// Configuration for the hub server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    pub settings: HubSettings,
}

impl ServerConfig {
    pub fn from_config(config: &HubToml) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            settings: HubSettings::from_config(config),
        }
    }
}

/// Build the full application router: HTTP API plus both websocket namespaces.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router(state.clone())
        .route("/devices", get(ws::devices_handler))
        .route("/clients", get(ws::clients_handler))
        .with_state(state)
}

/// Open (creating if needed) the SQLite database at `path`.
pub fn open_database(path: &std::path::Path) -> Result<FleetDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    FleetDb::new(path).context("Failed to initialize fleet database")
}

/// Start the hub and serve until ctrl-c.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config.db_path)?;
    let store = Arc::new(DbHandle::new(db));
    if config.settings.device_token.is_none() {
        warn!("no device token configured, every device connection will be rejected");
    }
    if config.settings.client_token.is_none() {
        warn!("no client token configured, dashboards and the HTTP API are locked");
    }

    let hub = FleetHub::start(store, config.settings.clone());
    let state = Arc::new(AppState::from_hub(&hub, &config.settings));

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "fleet hub listening");

    // Plugins close their sockets first so open websockets do not hold up
    // the graceful shutdown.
    let (devices, clients) = (hub.devices.clone(), hub.clients.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            devices.shutdown();
            clients.shutdown();
        })
        .await
        .context("Server error");

    hub.shutdown().await;
    served?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
