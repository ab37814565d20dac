//! Report definitions: which fields a report shows, how they are labelled,
//! filtered, ordered, grouped and totalled.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;

use super::{Cell, Record};
use crate::errors::FieldOpsError;

/// Marker sent by filter forms that have no filters at all.
pub const ALL_MARKER: &str = "__all__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportModel {
    Ticket,
    TicketMaterial,
}

impl ReportModel {
    /// Field paths a record of this model carries, with their default labels.
    pub fn catalog(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Ticket => &[
                ("id", "Id"),
                ("ext_id", "Ticket id"),
                ("kind", "Kind"),
                ("status", "Status"),
                ("address", "Address"),
                ("city.name", "City"),
                ("city.zip", "Zip"),
                ("city.primer", "Primer"),
                ("owner", "Technician"),
                ("client.name", "Client"),
                ("client.mt_id", "MT id"),
                ("created_at", "Created"),
                ("closed_at", "Closed at"),
                ("payoff", "Payoff"),
                ("ticket_types", "Ticket types"),
            ],
            Self::TicketMaterial => &[
                ("id", "Id"),
                ("ticket.ext_id", "Ticket id"),
                ("ticket.closed_at", "Ticket closed"),
                ("owner", "Technician"),
                ("material.name", "Material"),
                ("material.sn", "Material number"),
                ("material.category", "Category"),
                ("material.unit", "Unit"),
                ("material.price", "Unit price"),
                ("material.comes_from", "Provider"),
                ("amount", "Amount"),
                ("created_at", "Recorded"),
            ],
        }
    }

    pub fn label_of(&self, field: &str) -> Option<&'static str> {
        self.catalog()
            .iter()
            .find(|(path, _)| *path == field)
            .map(|(_, label)| *label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Choice,
    DateRange,
    Text,
    Boolean,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterDef {
    pub field: String,
    pub kind: FilterKind,
    pub label: Option<String>,
}

impl FilterDef {
    pub fn new(field: &str, kind: FilterKind) -> Self {
        Self {
            field: field.to_string(),
            kind,
            label: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalKind {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl TotalKind {
    /// Aggregate a column. Numeric aggregates skip non-numeric cells;
    /// `Count` counts non-null cells.
    pub fn apply<'a>(&self, cells: impl IntoIterator<Item = &'a Cell>) -> Cell {
        let cells: Vec<&Cell> = cells.into_iter().collect();
        if *self == Self::Count {
            return Cell::Int(cells.iter().filter(|c| !c.is_null()).count() as i64);
        }
        let all_int = cells
            .iter()
            .filter(|c| c.as_f64().is_some())
            .all(|c| matches!(c, Cell::Int(_)));
        let numbers: Vec<f64> = cells.iter().filter_map(|c| c.as_f64()).collect();
        if numbers.is_empty() {
            return match self {
                Self::Sum => Cell::Int(0),
                _ => Cell::Null,
            };
        }
        let value = match self {
            Self::Sum => numbers.iter().sum(),
            Self::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
            Self::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => unreachable!("handled above"),
        };
        if all_int && *self != Self::Avg {
            Cell::Int(value as i64)
        } else {
            Cell::Float(value)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalSpec {
    pub field: String,
    pub kind: TotalKind,
}

/// A column computed from the other fields of a record.
#[derive(Clone)]
pub struct ExtraColumn {
    pub name: String,
    pub label: String,
    pub compute: fn(&Record) -> Cell,
}

impl std::fmt::Debug for ExtraColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtraColumn")
            .field("name", &self.name)
            .field("label", &self.label)
            .finish()
    }
}

/// Rewrites one field of every record before filtering.
#[derive(Clone)]
pub struct ValueOverride {
    pub field: String,
    pub apply: fn(&Cell) -> Cell,
}

impl std::fmt::Debug for ValueOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueOverride")
            .field("field", &self.field)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PivotSpec {
    pub row_fields: Vec<String>,
    pub column_field: String,
    pub value_field: String,
    pub aggregate: TotalKind,
    pub with_total: bool,
}

#[derive(Debug, Clone)]
pub struct ReportDefinition {
    pub slug: String,
    pub title: String,
    pub model: ReportModel,
    pub fields: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub filters: Vec<FilterDef>,
    pub order_by: Vec<String>,
    pub group_by_choices: Vec<String>,
    pub default_group_by: Vec<String>,
    pub totals: Vec<TotalSpec>,
    pub group_totals: bool,
    pub only_totals: bool,
    pub extra_columns: Vec<ExtraColumn>,
    pub value_overrides: Vec<ValueOverride>,
    pub pivot: Option<PivotSpec>,
}

impl ReportDefinition {
    pub fn new(slug: &str, title: &str, model: ReportModel) -> Self {
        Self {
            slug: slug.to_string(),
            title: title.to_string(),
            model,
            fields: Vec::new(),
            labels: BTreeMap::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            group_by_choices: Vec::new(),
            default_group_by: Vec::new(),
            totals: Vec::new(),
            group_totals: false,
            only_totals: false,
            extra_columns: Vec::new(),
            value_overrides: Vec::new(),
            pivot: None,
        }
    }

    /// Label of a field: explicit override, then catalog default, then the path.
    pub fn label_for(&self, field: &str) -> String {
        if let Some(label) = self.labels.get(field) {
            return label.clone();
        }
        if let Some(extra) = self.extra_columns.iter().find(|c| c.name == field) {
            return extra.label.clone();
        }
        self.model
            .label_of(field)
            .map(str::to_string)
            .unwrap_or_else(|| field.to_string())
    }

    /// Output columns: configured fields followed by computed ones.
    pub fn columns(&self) -> Vec<String> {
        self.fields
            .iter()
            .cloned()
            .chain(self.extra_columns.iter().map(|c| c.name.clone()))
            .collect()
    }

    /// Validate a requested grouping against the allowed choices. An empty
    /// request falls back to the default grouping.
    pub fn resolve_group_by(&self, requested: &[String]) -> Result<Vec<String>, FieldOpsError> {
        if requested.is_empty() {
            return Ok(self.default_group_by.clone());
        }
        for field in requested {
            if !self.group_by_choices.contains(field) {
                return Err(FieldOpsError::Validation(format!(
                    "cannot group report '{}' by '{}'",
                    self.slug, field
                )));
            }
        }
        Ok(requested.to_vec())
    }
}

/// Column headers of a definition, skipping ignored fields.
pub fn column_labels(def: &ReportDefinition, ignore: &[&str]) -> Vec<String> {
    def.columns()
        .iter()
        .filter(|f| !ignore.contains(&f.as_str()))
        .map(|f| def.label_for(f))
        .collect()
}

/// Options of a choice filter: distinct non-empty values, sorted, after an
/// empty "no filter" entry.
pub fn choices(field: &str, records: &[Record]) -> Vec<(String, String)> {
    let distinct: BTreeSet<String> = records
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|c| !c.is_null())
        .map(|c| c.to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let mut out = vec![(String::new(), "-------".to_string())];
    out.extend(distinct.into_iter().map(|v| (v.clone(), v)));
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Equals { field: String, value: String },
    DateRange {
        field: String,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    Contains { field: String, needle: String },
    Boolean { field: String, value: bool },
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        let cell = |field: &str| record.get(field).cloned().unwrap_or(Cell::Null);
        match self {
            Self::Equals { field, value } => cell(field).to_string() == *value,
            Self::DateRange { field, from, to } => match cell(field).as_date() {
                Some(date) => {
                    from.is_none_or(|f| date >= f) && to.is_none_or(|t| date <= t)
                }
                None => false,
            },
            Self::Contains { field, needle } => {
                cell(field).to_string().to_lowercase().contains(needle)
            }
            Self::Boolean { field, value } => match cell(field) {
                Cell::Bool(b) => b == *value,
                Cell::Int(i) => (i != 0) == *value,
                _ => !*value,
            },
        }
    }
}

/// Filter values bound from query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterForm {
    conditions: Vec<Condition>,
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, FieldOpsError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        FieldOpsError::Validation(format!("'{}' is not a valid date for {}", raw, field))
    })
}

impl FilterForm {
    pub fn from_query(
        def: &ReportDefinition,
        params: &BTreeMap<String, String>,
    ) -> Result<Self, FieldOpsError> {
        let value = |key: &str| {
            params
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty() && *v != ALL_MARKER)
        };

        let mut conditions = Vec::new();
        for filter in &def.filters {
            let field = filter.field.clone();
            match filter.kind {
                FilterKind::Choice => {
                    if let Some(v) = value(&filter.field) {
                        conditions.push(Condition::Equals {
                            field,
                            value: v.to_string(),
                        });
                    }
                }
                FilterKind::Text => {
                    if let Some(v) = value(&filter.field) {
                        conditions.push(Condition::Contains {
                            field,
                            needle: v.to_lowercase(),
                        });
                    }
                }
                FilterKind::Boolean => {
                    if let Some(v) = value(&filter.field) {
                        conditions.push(Condition::Boolean {
                            field,
                            value: matches!(v, "true" | "True" | "1"),
                        });
                    }
                }
                FilterKind::DateRange => {
                    let from = value(&format!("{}_from", filter.field))
                        .map(|v| parse_date(&filter.field, v))
                        .transpose()?;
                    let to = value(&format!("{}_to", filter.field))
                        .map(|v| parse_date(&filter.field, v))
                        .transpose()?;
                    if from.is_some() || to.is_some() {
                        conditions.push(Condition::DateRange { field, from, to });
                    }
                }
            }
        }
        Ok(Self { conditions })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

/// Named report definitions.
#[derive(Debug, Clone, Default)]
pub struct ReportRegistry {
    reports: BTreeMap<String, ReportDefinition>,
}

impl ReportRegistry {
    pub fn register(&mut self, def: ReportDefinition) {
        self.reports.insert(def.slug.clone(), def);
    }

    pub fn get(&self, slug: &str) -> Option<&ReportDefinition> {
        self.reports.get(slug)
    }

    pub fn list(&self) -> Vec<&ReportDefinition> {
        self.reports.values().collect()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(summary());
        registry.register(material_usage());
        registry.register(technician_workload());
        registry
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn date_only(cell: &Cell) -> Cell {
    cell.as_date().map(Cell::Date).unwrap_or(Cell::Null)
}

fn line_value(record: &Record) -> Cell {
    let amount = record.get("amount").and_then(Cell::as_f64);
    let price = record.get("material.price").and_then(Cell::as_f64);
    match (amount, price) {
        (Some(a), Some(p)) => Cell::Float(a * p),
        _ => Cell::Null,
    }
}

fn summary() -> ReportDefinition {
    let mut def = ReportDefinition::new("summary", "Summary list", ReportModel::Ticket);
    def.fields = strings(&["ext_id", "city.name", "address", "city.primer", "owner", "closed_at"]);
    def.filters = vec![
        FilterDef::new("city.primer", FilterKind::Choice),
        FilterDef::new("owner", FilterKind::Choice),
        FilterDef::new("closed_at", FilterKind::DateRange),
    ];
    def.order_by = strings(&["ext_id"]);
    def.labels.insert("owner".into(), "Owner".into());
    def.labels.insert("closed_at".into(), "Closed".into());
    def.group_by_choices = strings(&["owner", "city.primer", "city.name"]);
    def.value_overrides.push(ValueOverride {
        field: "closed_at".into(),
        apply: date_only,
    });
    def
}

fn material_usage() -> ReportDefinition {
    let mut def = ReportDefinition::new(
        "material_usage",
        "Material usage",
        ReportModel::TicketMaterial,
    );
    def.fields = strings(&[
        "ticket.ext_id",
        "owner",
        "material.name",
        "material.unit",
        "amount",
        "material.price",
    ]);
    def.filters = vec![
        FilterDef::new("owner", FilterKind::Choice),
        FilterDef::new("material.comes_from", FilterKind::Choice),
        FilterDef::new("created_at", FilterKind::DateRange),
        FilterDef::new("material.name", FilterKind::Text),
    ];
    def.order_by = strings(&["ticket.ext_id", "material.name"]);
    def.group_by_choices = strings(&["material.category", "owner"]);
    def.default_group_by = strings(&["material.category"]);
    def.extra_columns.push(ExtraColumn {
        name: "value".into(),
        label: "Value".into(),
        compute: line_value,
    });
    def.totals = vec![
        TotalSpec {
            field: "amount".into(),
            kind: TotalKind::Sum,
        },
        TotalSpec {
            field: "value".into(),
            kind: TotalKind::Sum,
        },
    ];
    def.group_totals = true;
    def
}

fn technician_workload() -> ReportDefinition {
    let mut def = ReportDefinition::new(
        "technician_workload",
        "Technician workload",
        ReportModel::Ticket,
    );
    def.fields = strings(&["owner", "status"]);
    def.filters = vec![
        FilterDef::new("kind", FilterKind::Choice),
        FilterDef::new("created_at", FilterKind::DateRange),
    ];
    def.pivot = Some(PivotSpec {
        row_fields: strings(&["owner"]),
        column_field: "status".into(),
        value_field: "id".into(),
        aggregate: TotalKind::Count,
        with_total: true,
    });
    def
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Cell)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_prefer_override_then_catalog_then_path() {
        let def = ReportRegistry::builtin().get("summary").cloned().unwrap();
        assert_eq!(
            column_labels(&def, &[]),
            vec!["Ticket id", "City", "Address", "Primer", "Owner", "Closed"]
        );
        assert_eq!(column_labels(&def, &["address"]).len(), 5);
        assert_eq!(def.label_for("no.such.field"), "no.such.field");
    }

    #[test]
    fn test_choices_are_sorted_distinct_with_empty_first() {
        let records = vec![
            record(&[("owner", Cell::text("szabo"))]),
            record(&[("owner", Cell::Null)]),
            record(&[("owner", Cell::text("kovacs"))]),
            record(&[("owner", Cell::text("szabo"))]),
            record(&[("owner", Cell::text(""))]),
        ];
        assert_eq!(
            choices("owner", &records),
            vec![
                ("".to_string(), "-------".to_string()),
                ("kovacs".to_string(), "kovacs".to_string()),
                ("szabo".to_string(), "szabo".to_string()),
            ]
        );
    }

    #[test]
    fn test_filter_form_binds_query_params() {
        let def = ReportRegistry::builtin().get("summary").cloned().unwrap();
        let form = FilterForm::from_query(
            &def,
            &query(&[
                ("owner", "kovacs"),
                ("city.primer", ""),
                ("closed_at_from", "2024-03-01"),
                ("unknown", "x"),
            ]),
        )
        .unwrap();

        let closed = |day: &str| Cell::text(format!("{} 10:00:00", day));
        assert!(form.matches(&record(&[
            ("owner", Cell::text("kovacs")),
            ("closed_at", closed("2024-03-01"))
        ])));
        assert!(!form.matches(&record(&[
            ("owner", Cell::text("kovacs")),
            ("closed_at", closed("2024-02-28"))
        ])));
        assert!(!form.matches(&record(&[
            ("owner", Cell::text("szabo")),
            ("closed_at", closed("2024-03-02"))
        ])));
        // Open tickets have no closing date and fall outside any range.
        assert!(!form.matches(&record(&[
            ("owner", Cell::text("kovacs")),
            ("closed_at", Cell::Null)
        ])));
    }

    #[test]
    fn test_filter_form_ignores_all_marker_and_rejects_bad_dates() {
        let def = ReportRegistry::builtin().get("summary").cloned().unwrap();
        let form = FilterForm::from_query(&def, &query(&[("owner", ALL_MARKER)])).unwrap();
        assert!(form.is_empty());

        let err = FilterForm::from_query(&def, &query(&[("closed_at_to", "03/01/2024")])).unwrap_err();
        assert!(err.to_string().contains("not a valid date"));
    }

    #[test]
    fn test_boolean_and_text_filters() {
        let mut def = ReportDefinition::new("t", "T", ReportModel::Ticket);
        def.filters = vec![
            FilterDef::new("paid", FilterKind::Boolean),
            FilterDef::new("client.name", FilterKind::Text),
        ];
        let form = FilterForm::from_query(&def, &query(&[("paid", "True"), ("client.name", "ANNA")])).unwrap();
        assert!(form.matches(&record(&[
            ("paid", Cell::Bool(true)),
            ("client.name", Cell::text("Nagy Anna"))
        ])));
        assert!(!form.matches(&record(&[
            ("paid", Cell::Int(0)),
            ("client.name", Cell::text("Nagy Anna"))
        ])));
    }

    #[test]
    fn test_total_kinds() {
        let cells = [Cell::Int(2), Cell::Null, Cell::Int(4), Cell::text("x")];
        assert_eq!(TotalKind::Sum.apply(&cells), Cell::Int(6));
        assert_eq!(TotalKind::Count.apply(&cells), Cell::Int(3));
        assert_eq!(TotalKind::Avg.apply(&cells), Cell::Float(3.0));
        assert_eq!(TotalKind::Min.apply(&cells), Cell::Int(2));
        assert_eq!(TotalKind::Max.apply(&[Cell::Float(1.5), Cell::Int(1)]), Cell::Float(1.5));
        assert_eq!(TotalKind::Avg.apply(&[Cell::Null]), Cell::Null);
    }

    #[test]
    fn test_group_by_must_be_an_allowed_choice() {
        let def = ReportRegistry::builtin().get("material_usage").cloned().unwrap();
        assert_eq!(def.resolve_group_by(&[]).unwrap(), vec!["material.category"]);
        assert_eq!(
            def.resolve_group_by(&["owner".to_string()]).unwrap(),
            vec!["owner"]
        );
        assert!(def.resolve_group_by(&["amount".to_string()]).is_err());
    }

    #[test]
    fn test_registry_lists_builtin_reports() {
        let registry = ReportRegistry::builtin();
        let slugs: Vec<&str> = registry.list().iter().map(|d| d.slug.as_str()).collect();
        assert_eq!(slugs, vec!["material_usage", "summary", "technician_workload"]);
        assert!(registry.get("osszesito").is_none());
    }
}
