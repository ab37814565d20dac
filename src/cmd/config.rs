//! Config file inspection, validation and scaffolding — `fieldops config`.

use std::path::Path;

use anyhow::{Result, bail};
use fieldops::config::FieldOpsToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let mut toml = FieldOpsToml::load_or_default(config_path)?;
            toml.apply_env()?;

            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("[server]");
            println!("host = \"{}\"", toml.server.host);
            println!("port = {}", toml.server.port);
            println!("dev_mode = {}", toml.server.dev_mode);
            println!();
            println!("[database]");
            println!("path = \"{}\"", toml.database.path.display());
            println!();
            println!("[logging]");
            println!("filter = \"{}\"", toml.logging.filter);
            println!("json = {}", toml.logging.json);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file at {}; defaults apply.", config_path.display());
                return Ok(());
            }
            let toml = FieldOpsToml::load(config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
                println!("{} warning(s)", warnings.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                bail!("{} already exists", config_path.display());
            }
            FieldOpsToml::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
