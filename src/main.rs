use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use fleet_hub::hub_config::{HubToml, LogFormat};
use fleet_hub::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "fleet-hub")]
#[command(version, about = "Realtime coordination hub for an edge device fleet")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to fleet.toml
    #[arg(long, global = true, default_value = "fleet.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and the /devices and /clients websocket namespaces
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [server].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, listen on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables, then exit
    InitDb {
        /// Database path (overrides [server].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default fleet.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // A broken config file is reported by the command itself; logging still
    // needs to come up first.
    let format = HubToml::load_or_default(&cli.config)
        .map(|c| c.logging.format)
        .unwrap_or(LogFormat::Pretty);
    init_logging(cli.verbose, format);

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            let config = HubToml::load_or_default(&cli.config)?;
            cmd::cmd_serve(config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path } => {
            let config = HubToml::load_or_default(&cli.config)?;
            cmd::cmd_init_db(&config, db_path.clone())?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
