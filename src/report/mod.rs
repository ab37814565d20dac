//! Tabular reports over tickets and material consumption.
//!
//! ```text
//! ReportSource ──▶ Vec<Record> ──▶ builder::run_report(def, form, group_by)
//!                                        │
//!                        ┌───────────────┴──────────────┐
//!                   ReportTable                     PivotTable
//!              (groups, captions, totals)     (row keys × dynamic columns)
//!                        │                              │
//!                        └────────── export::to_csv ────┘
//! ```
//!
//! - [`config`]: report definitions, field catalogs, filter forms, registry
//! - [`builder`]: sort, group, total and pivot records
//! - [`export`]: CSV rendering of built reports

pub mod builder;
pub mod config;
pub mod export;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use serde::Serialize;

use crate::office::FieldDb;
use crate::office::models::NO_OWNER;

pub use builder::{PivotTable, ReportOutput, ReportTable, RowKind, run_report};
pub use config::{FilterForm, ReportDefinition, ReportModel, ReportRegistry};

/// One value of a report record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
}

/// A flat record keyed by dotted field path (`city.name`, `material.price`).
pub type Record = BTreeMap<String, Cell>;

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(i) => Some(i as f64),
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Calendar date of date-like cells, also parsing SQLite timestamps.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(dt) => Some(dt.date()),
            Self::Text(s) => parse_timestamp(s).map(|dt| dt.date()),
            _ => None,
        }
    }

    /// Text used in group captions; nulls read as `None`.
    pub fn caption_text(&self) -> String {
        match self {
            Self::Null => NO_OWNER.to_string(),
            other => other.to_string(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Date(_) | Self::DateTime(_) => 3,
            Self::Text(_) => 4,
        }
    }

    /// Total order used for sorting and grouping. Nulls sort first.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Date(_) | Self::DateTime(_), Self::Date(_) | Self::DateTime(_)) => {
                self.as_datetime().cmp(&other.as_datetime())
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map(Cell::Text).unwrap_or(Cell::Null)
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn timestamp_cell(raw: Option<String>) -> Cell {
    match raw {
        Some(s) => parse_timestamp(&s).map(Cell::DateTime).unwrap_or(Cell::Text(s)),
        None => Cell::Null,
    }
}

/// Where report records come from.
pub trait ReportSource {
    fn records(&self, model: ReportModel) -> Result<Vec<Record>>;
}

impl ReportSource for FieldDb {
    fn records(&self, model: ReportModel) -> Result<Vec<Record>> {
        let (sql, columns): (&str, &[&str]) = match model {
            ReportModel::Ticket => (
                "SELECT t.id, t.ext_id, t.kind, t.status, t.address, ci.name, ci.zip, ci.primer,
                        u.username, c.name, c.mt_id, t.created_at, t.closed_at, p.name,
                        COALESCE((SELECT GROUP_CONCAT(tt.name, ', ') FROM ticket_ticket_types ttt
                                  JOIN ticket_types tt ON tt.id = ttt.ticket_type_id
                                  WHERE ttt.ticket_id = t.id), '')
                 FROM tickets t
                 JOIN cities ci ON ci.id = t.city_id
                 JOIN clients c ON c.id = t.client_id
                 LEFT JOIN users u ON u.id = t.owner_id
                 LEFT JOIN payoffs p ON p.id = t.payoff_id
                 ORDER BY t.id",
                &[
                    "id",
                    "ext_id",
                    "kind",
                    "status",
                    "address",
                    "city.name",
                    "city.zip",
                    "city.primer",
                    "owner",
                    "client.name",
                    "client.mt_id",
                    "created_at",
                    "closed_at",
                    "payoff",
                    "ticket_types",
                ],
            ),
            ReportModel::TicketMaterial => (
                "SELECT tm.id, t.ext_id, t.closed_at, u.username, m.name, m.sn, mc.name, m.unit,
                        m.price, m.comes_from, tm.amount, tm.created_at
                 FROM ticket_materials tm
                 JOIN tickets t ON t.id = tm.ticket_id
                 JOIN materials m ON m.id = tm.material_id
                 JOIN material_categories mc ON mc.id = m.category_id
                 LEFT JOIN users u ON u.id = t.owner_id
                 ORDER BY tm.id",
                &[
                    "id",
                    "ticket.ext_id",
                    "ticket.closed_at",
                    "owner",
                    "material.name",
                    "material.sn",
                    "material.category",
                    "material.unit",
                    "material.price",
                    "material.comes_from",
                    "amount",
                    "created_at",
                ],
            ),
        };

        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare report query")?;
        let rows = stmt
            .query_map([], |row| {
                let mut record = Record::new();
                for (idx, name) in columns.iter().enumerate() {
                    let value: SqlValue = row.get(idx)?;
                    record.insert(name.to_string(), sql_cell(name, value));
                }
                Ok(record)
            })
            .context("Failed to query report records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read report record")?);
        }
        Ok(records)
    }
}

fn sql_cell(field: &str, value: SqlValue) -> Cell {
    let is_timestamp = field.ends_with("created_at") || field.ends_with("closed_at");
    match value {
        SqlValue::Null => Cell::Null,
        SqlValue::Integer(i) => Cell::Int(i),
        SqlValue::Real(f) => Cell::Float(f),
        SqlValue::Text(s) if is_timestamp => timestamp_cell(Some(s)),
        SqlValue::Text(s) => Cell::Text(s),
        SqlValue::Blob(_) => Cell::Null,
    }
}

/// Options for one filter of a report, as offered to clients.
#[derive(Debug, Clone, Serialize)]
pub struct FilterOptions {
    pub field: String,
    pub label: String,
    pub kind: config::FilterKind,
    /// Value/label pairs for choice filters; empty otherwise.
    pub choices: Vec<(String, String)>,
}

/// Load records for a definition and build it with filters and grouping
/// bound from request parameters.
pub fn build_report(
    source: &impl ReportSource,
    def: &ReportDefinition,
    params: &BTreeMap<String, String>,
    group_by: &[String],
) -> Result<ReportOutput> {
    let form = FilterForm::from_query(def, params)?;
    let group_by = def.resolve_group_by(group_by)?;
    let records = source.records(def.model)?;
    tracing::debug!(
        report = %def.slug,
        records = records.len(),
        group_by = ?group_by,
        "Building report"
    );
    Ok(run_report(def, records, &form, &group_by))
}

pub fn filter_options(source: &impl ReportSource, def: &ReportDefinition) -> Result<Vec<FilterOptions>> {
    let records = source.records(def.model)?;
    Ok(def
        .filters
        .iter()
        .map(|filter| FilterOptions {
            field: filter.field.clone(),
            label: filter
                .label
                .clone()
                .unwrap_or_else(|| def.label_for(&filter.field)),
            kind: filter.kind,
            choices: match filter.kind {
                config::FilterKind::Choice => config::choices(&filter.field, &records),
                _ => Vec::new(),
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nulls_sort_first_and_numbers_compare_across_types() {
        let mut cells = vec![
            Cell::text("b"),
            Cell::Int(3),
            Cell::Null,
            Cell::Float(2.5),
            Cell::text("a"),
        ];
        cells.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            cells,
            vec![
                Cell::Null,
                Cell::Float(2.5),
                Cell::Int(3),
                Cell::text("a"),
                Cell::text("b")
            ]
        );
    }

    #[test]
    fn test_as_date_reads_sqlite_timestamps() {
        let cell = Cell::text("2024-03-05 14:00:00");
        assert_eq!(cell.as_date(), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(timestamp_cell(None), Cell::Null);
        assert!(matches!(
            timestamp_cell(Some("2024-03-05 14:00:00".into())),
            Cell::DateTime(_)
        ));
    }

    #[test]
    fn test_display_and_caption_text() {
        assert_eq!(Cell::Null.to_string(), "");
        assert_eq!(Cell::Null.caption_text(), "None");
        assert_eq!(Cell::Int(7).caption_text(), "7");
    }

    #[test]
    fn test_build_report_groups_and_rejects_unknown_grouping() -> Result<()> {
        let f = crate::office::db::tests::fixture()?;
        let registry = ReportRegistry::builtin();
        let def = registry.get("summary").unwrap();

        let output = build_report(&f.db, def, &BTreeMap::new(), &["city.name".to_string()])?;
        match output {
            ReportOutput::Table(table) => {
                assert_eq!(table.groups.len(), 1);
                assert_eq!(table.groups[0].value, Cell::text("Szeged"));
                assert_eq!(table.groups[0].rows.len(), 1);
            }
            other => panic!("Expected table, got {:?}", other),
        }

        let err = build_report(&f.db, def, &BTreeMap::new(), &["address".to_string()]).unwrap_err();
        assert!(err.to_string().contains("cannot group"));
        Ok(())
    }

    #[test]
    fn test_filter_options_list_distinct_choices() -> Result<()> {
        let f = crate::office::db::tests::fixture()?;
        f.db.set_city_primer(f.ticket.city_id, Some("P-1"))?;
        let registry = ReportRegistry::builtin();
        let options = filter_options(&f.db, registry.get("summary").unwrap())?;

        let primer = options.iter().find(|o| o.field == "city.primer").unwrap();
        assert_eq!(primer.choices.len(), 2);
        assert_eq!(primer.choices[1], ("P-1".to_string(), "P-1".to_string()));
        let closed = options.iter().find(|o| o.field == "closed_at").unwrap();
        assert!(closed.choices.is_empty());
        Ok(())
    }
}
