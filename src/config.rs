//! Configuration read from `fieldops.toml`.
//!
//! Layered: file defaults, then `FIELDOPS_DB` / `FIELDOPS_PORT` from the
//! environment (a `.env` file is loaded at startup), then CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8470
//! dev_mode = false
//!
//! [database]
//! path = "fieldops.db"
//!
//! [logging]
//! filter = "info,tower_http=debug"
//! json = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::office::server::ServerConfig;

pub const CONFIG_FILE: &str = "fieldops.toml";
pub const DB_ENV: &str = "FIELDOPS_DB";
pub const PORT_ENV: &str = "FIELDOPS_PORT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served admin frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8470
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fieldops.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// The complete fieldops.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FieldOpsToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FieldOpsToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fieldops.toml")
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize fieldops.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FIELDOPS_DB` and `FIELDOPS_PORT` on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var(DB_ENV)
            && !path.trim().is_empty()
        {
            self.database.path = PathBuf::from(path.trim());
        }
        if let Ok(port) = std::env::var(PORT_ENV)
            && !port.trim().is_empty()
        {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", PORT_ENV, port))?;
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.database.path.clone(),
            dev_mode: self.server.dev_mode,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.host.trim().is_empty() {
            warnings.push("server.host is empty".to_string());
        }
        if self.server.port == 0 {
            warnings.push("server.port 0 picks a random port on every start".to_string());
        }
        if self.database.path.as_os_str().is_empty() {
            warnings.push("database.path is empty".to_string());
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.logging.filter) {
            warnings.push(format!(
                "Invalid logging.filter '{}': {}",
                self.logging.filter, e
            ));
        }
        if self.server.dev_mode && self.server.host != "127.0.0.1" && self.server.host != "localhost" {
            warnings.push(format!(
                "dev_mode enables permissive CORS while listening on {}",
                self.server.host
            ));
        }

        warnings
    }
}
