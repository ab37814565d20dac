//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `serve`   | `Serve`               |
//! | `users`   | `InitDb`, `Users`     |
//! | `import`  | `Import`              |
//! | `report`  | `Report`              |
//! | `config`  | `Config`              |

pub mod config;
pub mod import;
pub mod report;
pub mod serve;
pub mod users;

pub use config::cmd_config;
pub use import::cmd_import;
pub use report::cmd_report;
pub use serve::cmd_serve;
pub use users::{cmd_init_db, cmd_users};

use anyhow::{Context, Result};
use fieldops::config::{FieldOpsToml, LoggingSection};
use fieldops::office::FieldDb;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use super::Cli;

/// Effective settings: file, then environment, then CLI flags.
pub fn load_settings(cli: &Cli) -> Result<FieldOpsToml> {
    let mut settings = FieldOpsToml::load_or_default(&cli.config)?;
    settings.apply_env()?;
    if let Some(db) = &cli.db {
        settings.database.path = db.clone();
    }
    Ok(settings)
}

/// Logs go to stderr so report output on stdout stays clean. `RUST_LOG`
/// wins over the configured filter; `--verbose` wins over both.
pub fn init_tracing(logging: &LoggingSection, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&logging.filter)
                .with_context(|| format!("Invalid logging.filter '{}'", logging.filter))?,
        }
    };

    if logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

pub fn open_db(settings: &FieldOpsToml) -> Result<FieldDb> {
    let path = &settings.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    FieldDb::new(path).with_context(|| format!("Failed to open database {}", path.display()))
}
