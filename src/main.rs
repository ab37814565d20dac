use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fieldops")]
#[command(version, about = "Field-service and inventory back office")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = fieldops::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Database file. Overrides fieldops.toml and FIELDOPS_DB.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Username recorded as the author of history entries
    #[arg(long, global = true, env = "FIELDOPS_USER")]
    pub user: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to serve on (overrides config and FIELDOPS_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and optionally its first admin user
    InitDb {
        /// Username of an admin account to create
        #[arg(long)]
        admin: Option<String>,
    },
    /// Manage back-office users
    Users {
        #[command(subcommand)]
        command: Option<UsersCommands>,
    },
    /// Load devices, materials or work items from a CSV export
    Import {
        /// devices, materials or work-items
        kind: String,

        /// CSV file to load
        file: PathBuf,

        /// Receiving warehouse id (devices only)
        #[arg(long)]
        warehouse: Option<i64>,
    },
    /// Build a report and print it
    Report {
        /// Report slug; omit to list the available reports
        slug: Option<String>,

        /// Comma separated grouping fields
        #[arg(long)]
        group_by: Option<String>,

        /// Output format: json or csv
        #[arg(long, default_value = "csv")]
        format: String,

        /// Filter value as field=value (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum UsersCommands {
    /// List users
    List,
    /// Add a user
    Add {
        username: String,

        /// admin, technician, network_technician or uninstall_technician
        #[arg(long, default_value = "technician")]
        role: String,

        #[arg(long, default_value = "")]
        full_name: String,
    },
    /// Deactivate a user
    Deactivate { username: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check the configuration file for problems
    Validate,
    /// Write a default fieldops.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Config commands must work on a broken file, so they skip settings.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let settings = cmd::load_settings(&cli)?;
    cmd::init_tracing(&settings.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&settings, *port, host.clone(), *dev).await?;
        }
        Commands::InitDb { admin } => cmd::cmd_init_db(&settings, admin.as_deref())?,
        Commands::Users { command } => cmd::cmd_users(&settings, command.clone())?,
        Commands::Import {
            kind,
            file,
            warehouse,
        } => cmd::cmd_import(&settings, &cli, kind, file, *warehouse)?,
        Commands::Report {
            slug,
            group_by,
            format,
            filters,
        } => cmd::cmd_report(
            &settings,
            slug.as_deref(),
            group_by.as_deref(),
            format,
            filters,
        )?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
