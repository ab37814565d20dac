//! Report command — `fieldops report`.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use fieldops::config::FieldOpsToml;
use fieldops::report::{ReportRegistry, build_report, export};

use super::open_db;

fn parse_filters(filters: &[String]) -> Result<BTreeMap<String, String>> {
    filters
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| anyhow!("Invalid filter '{}': expected field=value", raw))
        })
        .collect()
}

pub fn cmd_report(
    settings: &FieldOpsToml,
    slug: Option<&str>,
    group_by: Option<&str>,
    format: &str,
    filters: &[String],
) -> Result<()> {
    let registry = ReportRegistry::builtin();

    let Some(slug) = slug else {
        for def in registry.list() {
            println!("{:<22} {}", def.slug, def.title);
        }
        return Ok(());
    };

    let def = registry
        .get(slug)
        .ok_or_else(|| anyhow!("Unknown report '{}'", slug))?;
    if format != "csv" && format != "json" {
        bail!("Invalid report format: {}", format);
    }
    let params = parse_filters(filters)?;
    let group_by: Vec<String> = group_by
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let db = open_db(settings)?;
    let output = build_report(&db, def, &params, &group_by)?;

    if format == "csv" {
        print!("{}", export::to_csv(&output)?);
    } else {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialize report")?;
        println!("{}", json);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters() {
        let params = parse_filters(&["owner=kovacs".into(), "closed_at_from = 2024-01-01".into()])
            .unwrap();
        assert_eq!(params["owner"], "kovacs");
        assert_eq!(params["closed_at_from"], "2024-01-01");
        assert!(parse_filters(&["owner".into()]).is_err());
    }
}
