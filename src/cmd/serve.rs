//! Server commands: `fleet-hub serve` and `fleet-hub init-db`.

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use fleet_hub::fleet::server::{ServerConfig, open_database, start_server};
use fleet_hub::hub_config::HubToml;

pub async fn cmd_serve(
    config: HubToml,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let mut server = ServerConfig::from_config(&config);
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(db_path) = db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= dev;

    start_server(server).await
}

pub fn cmd_init_db(config: &HubToml, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    open_database(&db_path)?;
    println!("Fleet database initialized at {}", db_path.display());
    Ok(())
}
