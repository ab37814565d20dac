//! CSV import command — `fieldops import`.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use fieldops::config::FieldOpsToml;
use fieldops::errors::FieldOpsError;
use fieldops::import::{ImportKind, import_file};

use super::super::Cli;
use super::open_db;

pub fn cmd_import(
    settings: &FieldOpsToml,
    cli: &Cli,
    kind: &str,
    file: &Path,
    warehouse: Option<i64>,
) -> Result<()> {
    let kind: ImportKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    let db = open_db(settings)?;

    // Device custody changes are recorded in history under a user.
    let actor = match (kind, cli.user.as_deref()) {
        (ImportKind::Devices, None) => {
            return Err(anyhow!("Importing devices requires --user or FIELDOPS_USER"));
        }
        (_, Some(username)) => db
            .get_user_by_username(username)?
            .ok_or_else(|| FieldOpsError::UnknownUser(username.to_string()))?
            .id,
        (_, None) => 0,
    };

    let summary = import_file(&db, kind, file, warehouse, actor)
        .with_context(|| format!("Failed to import {}", file.display()))?;

    for warning in &summary.warnings {
        eprintln!("warning: {}", warning);
    }
    println!(
        "Imported {} {}, skipped {}",
        summary.imported,
        kind.as_str(),
        summary.skipped
    );
    Ok(())
}
