//! `fleet.toml` configuration.
//!
//! Every section and field carries a serde default, so an empty or missing file
//! yields a usable (if locked-down) configuration. Shared secrets can also come
//! from the environment, which wins over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use fleet_common::DEFAULT_PAGE_SIZE;

/// Environment variable overriding `[auth].device_token`.
pub const DEVICE_TOKEN_ENV: &str = "FLEET_DEVICE_TOKEN";
/// Environment variable overriding `[auth].client_token`.
pub const CLIENT_TOKEN_ENV: &str = "FLEET_CLIENT_TOKEN";

/// HTTP and websocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database holding templates, plans and device records
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS and listen on all interfaces
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".fleet/fleet.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Shared secrets for the two namespaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Pre-shared secret every device agent presents
    #[serde(default)]
    pub device_token: Option<String>,
    /// Operator secret for dashboards and the HTTP API
    #[serde(default)]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationSection {
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl Default for PaginationSection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// The complete fleet.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub pagination: PaginationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl HubToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fleet.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fleet.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Device secret, with the environment taking precedence over the file.
    pub fn device_token(&self) -> Option<String> {
        std::env::var(DEVICE_TOKEN_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.auth.device_token.clone())
    }

    /// Operator secret, with the environment taking precedence over the file.
    pub fn client_token(&self) -> Option<String> {
        std::env::var(CLIENT_TOKEN_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.auth.client_token.clone())
    }

    /// Configured page size, falling back to the default for non-positive values.
    pub fn page_size(&self) -> i64 {
        if self.pagination.page_size > 0 {
            self.pagination.page_size
        } else {
            DEFAULT_PAGE_SIZE
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.device_token().is_none() {
            warnings.push(format!(
                "No device token configured ([auth].device_token or {}); every device connection will be rejected",
                DEVICE_TOKEN_ENV
            ));
        }
        if self.client_token().is_none() {
            warnings.push(format!(
                "No client token configured ([auth].client_token or {}); dashboards and the HTTP API will be rejected",
                CLIENT_TOKEN_ENV
            ));
        }
        if self.pagination.page_size <= 0 {
            warnings.push(format!(
                "[pagination].page_size = {} is not positive; using {}",
                self.pagination.page_size, DEFAULT_PAGE_SIZE
            ));
        }
        if self.server.port == 0 {
            warnings.push("[server].port = 0 binds a random port".to_string());
        }
        warnings
    }
}
