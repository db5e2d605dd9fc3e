//! Configuration view and validation commands: `fleet-hub config`.

use std::path::Path;

use anyhow::Result;

use fleet_hub::hub_config::{CLIENT_TOKEN_ENV, DEVICE_TOKEN_ENV, HubToml};

use super::super::ConfigCommands;

fn secret(value: Option<String>) -> &'static str {
    if value.is_some() { "<set>" } else { "<unset>" }
}

fn print_config(toml: &HubToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  db_path = \"{}\"", toml.server.db_path.display());
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();
    println!("[auth]");
    println!("  device_token = {}", secret(toml.auth.device_token.clone()));
    println!("  client_token = {}", secret(toml.auth.client_token.clone()));
    println!();
    println!("[pagination]");
    println!("  page_size = {}", toml.pagination.page_size);
    println!();
    println!("[logging]");
    println!("  format = {:?}", toml.logging.format);
    println!();
}

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fleet Hub Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                let toml = HubToml::load(config_path)?;
                print_config(&toml);

                println!("Effective values (with env overrides):");
                println!("  device_token = {} ({})", secret(toml.device_token()), DEVICE_TOKEN_ENV);
                println!("  client_token = {} ({})", secret(toml.client_token()), CLIENT_TOKEN_ENV);
                println!("  page_size = {}", toml.page_size());
                println!();
            } else {
                println!("No fleet.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_config(&HubToml::default());
                println!("Run 'fleet-hub config init' to create a fleet.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                HubToml::load(config_path)?
            } else {
                println!("No fleet.toml found. Checking defaults.");
                HubToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("fleet.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            HubToml::default().save(config_path)?;

            println!("Created fleet.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, dev_mode");
            println!("  - [auth] device_token, client_token");
            println!("  - [pagination] page_size");
            println!();
        }
    }

    Ok(())
}
