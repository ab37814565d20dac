//! Turns records into nested, annotated report rows.

use std::cmp::Ordering;

use serde::Serialize;

use super::config::{PivotSpec, ReportDefinition, TotalKind};
use super::{Cell, FilterForm, Record};

#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub field: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportGroup {
    pub field: String,
    pub value: Cell,
    pub caption: String,
    pub depth: usize,
    pub rows: Vec<Vec<Cell>>,
    pub subgroups: Vec<ReportGroup>,
    /// Aligned with the report columns; columns without a total are `Null`.
    pub totals: Option<Vec<Cell>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportTable {
    pub title: String,
    pub columns: Vec<Column>,
    pub group_by: Vec<String>,
    /// Value rows when the report is not grouped.
    pub rows: Vec<Vec<Cell>>,
    pub groups: Vec<ReportGroup>,
    pub grand_totals: Option<Vec<Cell>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Caption,
    Value,
    GroupTotal,
    GrandTotal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlatRow {
    pub kind: RowKind,
    pub depth: usize,
    pub caption: Option<String>,
    pub cells: Vec<Cell>,
}

impl ReportTable {
    /// Rows in display order, ready for tabular export.
    pub fn flatten(&self) -> Vec<FlatRow> {
        let mut out = Vec::new();
        push_rows(&mut out, &self.rows, 0);
        for group in &self.groups {
            flatten_group(group, &mut out);
        }
        if let Some(totals) = &self.grand_totals {
            out.push(FlatRow {
                kind: RowKind::GrandTotal,
                depth: 0,
                caption: None,
                cells: totals.clone(),
            });
        }
        out
    }
}

fn push_rows(out: &mut Vec<FlatRow>, rows: &[Vec<Cell>], depth: usize) {
    out.extend(rows.iter().map(|cells| FlatRow {
        kind: RowKind::Value,
        depth,
        caption: None,
        cells: cells.clone(),
    }));
}

fn flatten_group(group: &ReportGroup, out: &mut Vec<FlatRow>) {
    out.push(FlatRow {
        kind: RowKind::Caption,
        depth: group.depth,
        caption: Some(group.caption.clone()),
        cells: Vec::new(),
    });
    push_rows(out, &group.rows, group.depth);
    for sub in &group.subgroups {
        flatten_group(sub, out);
    }
    if let Some(totals) = &group.totals {
        out.push(FlatRow {
            kind: RowKind::GroupTotal,
            depth: group.depth,
            caption: None,
            cells: totals.clone(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PivotRow {
    pub keys: Vec<Cell>,
    pub cells: Vec<Cell>,
    pub total: Option<Cell>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivotTable {
    pub title: String,
    pub row_labels: Vec<String>,
    pub columns: Vec<String>,
    pub with_total: bool,
    pub rows: Vec<PivotRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportOutput {
    Table(ReportTable),
    Pivot(PivotTable),
}

fn field_cell(record: &Record, field: &str) -> Cell {
    record.get(field).cloned().unwrap_or(Cell::Null)
}

fn cmp_by(fields: &[String], a: &Record, b: &Record) -> Ordering {
    for field in fields {
        let ord = field_cell(a, field).sort_cmp(&field_cell(b, field));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Apply overrides, computed columns and the filter form.
fn prepare(def: &ReportDefinition, records: Vec<Record>, form: &FilterForm) -> Vec<Record> {
    records
        .into_iter()
        .map(|mut record| {
            for ov in &def.value_overrides {
                let current = field_cell(&record, &ov.field);
                record.insert(ov.field.clone(), (ov.apply)(&current));
            }
            for extra in &def.extra_columns {
                let value = (extra.compute)(&record);
                record.insert(extra.name.clone(), value);
            }
            record
        })
        .filter(|record| form.matches(record))
        .collect()
}

/// Build a report from raw records. Pivot definitions produce a pivot table,
/// everything else a grouped table.
pub fn run_report(
    def: &ReportDefinition,
    records: Vec<Record>,
    form: &FilterForm,
    group_by: &[String],
) -> ReportOutput {
    match &def.pivot {
        Some(spec) => {
            let records = prepare(def, records, form);
            let mut table = pivot(&records, spec);
            table.title = def.title.clone();
            table.row_labels = spec.row_fields.iter().map(|f| def.label_for(f)).collect();
            ReportOutput::Pivot(table)
        }
        None => ReportOutput::Table(build_table(def, records, form, group_by)),
    }
}

pub fn build_table(
    def: &ReportDefinition,
    records: Vec<Record>,
    form: &FilterForm,
    group_by: &[String],
) -> ReportTable {
    let mut records = prepare(def, records, form);

    let sort_keys: Vec<String> = group_by
        .iter()
        .chain(def.order_by.iter())
        .cloned()
        .collect();
    // `sort_by` is stable, so equal keys keep source order.
    records.sort_by(|a, b| cmp_by(&sort_keys, a, b));

    let fields = def.columns();
    let columns: Vec<Column> = fields
        .iter()
        .map(|f| Column {
            field: f.clone(),
            label: def.label_for(f),
        })
        .collect();

    let refs: Vec<&Record> = records.iter().collect();
    let grand_totals = if def.totals.is_empty() {
        None
    } else {
        Some(totals_row(def, &fields, &refs))
    };
    let (rows, groups) = if group_by.is_empty() {
        (value_rows(def, &fields, &refs), Vec::new())
    } else {
        (Vec::new(), group(def, &fields, &refs, group_by, 0))
    };

    tracing::debug!(
        report = %def.slug,
        records = records.len(),
        groups = groups.len(),
        "Report built"
    );

    ReportTable {
        title: def.title.clone(),
        columns,
        group_by: group_by.to_vec(),
        rows,
        groups,
        grand_totals,
    }
}

fn value_rows(def: &ReportDefinition, fields: &[String], records: &[&Record]) -> Vec<Vec<Cell>> {
    if def.only_totals {
        return Vec::new();
    }
    records
        .iter()
        .map(|r| fields.iter().map(|f| field_cell(r, f)).collect())
        .collect()
}

fn totals_row(def: &ReportDefinition, fields: &[String], records: &[&Record]) -> Vec<Cell> {
    fields
        .iter()
        .map(|field| match def.totals.iter().find(|t| &t.field == field) {
            Some(spec) => {
                let cells: Vec<Cell> = records
                    .iter()
                    .map(|r| field_cell(r, field))
                    .collect();
                spec.kind.apply(&cells)
            }
            None => Cell::Null,
        })
        .collect()
}

fn group(
    def: &ReportDefinition,
    fields: &[String],
    records: &[&Record],
    group_by: &[String],
    depth: usize,
) -> Vec<ReportGroup> {
    let Some((field, rest)) = group_by.split_first() else {
        return Vec::new();
    };
    let label = def.label_for(field);

    // Records arrive sorted by the group fields, so equal values are adjacent.
    let mut groups = Vec::new();
    let mut start = 0;
    while start < records.len() {
        let value = field_cell(records[start], field);
        let mut end = start + 1;
        while end < records.len()
            && field_cell(records[end], field).sort_cmp(&value) == Ordering::Equal
        {
            end += 1;
        }
        let members = &records[start..end];
        let (rows, subgroups) = if rest.is_empty() {
            (value_rows(def, fields, members), Vec::new())
        } else {
            (Vec::new(), group(def, fields, members, rest, depth + 1))
        };
        let totals = (def.group_totals && !def.totals.is_empty())
            .then(|| totals_row(def, fields, members));
        groups.push(ReportGroup {
            field: field.clone(),
            caption: format!("{}: {}", label, value.caption_text()),
            value,
            depth,
            rows,
            subgroups,
            totals,
        });
        start = end;
    }
    groups
}

/// Cross-tabulate records: one row per distinct row key, one column per
/// distinct value of the column field.
pub fn pivot(records: &[Record], spec: &PivotSpec) -> PivotTable {
    let mut column_values: Vec<Cell> = Vec::new();
    for record in records {
        let value = field_cell(record, &spec.column_field);
        if !column_values.iter().any(|c| c.sort_cmp(&value) == Ordering::Equal) {
            column_values.push(value);
        }
    }
    column_values.sort_by(|a, b| a.sort_cmp(b));

    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| cmp_by(&spec.row_fields, a, b));

    let empty_cell = || match spec.aggregate {
        TotalKind::Count => Cell::Int(0),
        _ => Cell::Null,
    };

    let mut rows = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let mut end = start + 1;
        while end < sorted.len() && cmp_by(&spec.row_fields, sorted[start], sorted[end]) == Ordering::Equal {
            end += 1;
        }
        let members = &sorted[start..end];
        let keys: Vec<Cell> = spec
            .row_fields
            .iter()
            .map(|f| field_cell(members[0], f))
            .collect();
        let cells = column_values
            .iter()
            .map(|col| {
                let values: Vec<Cell> = members
                    .iter()
                    .filter(|r| field_cell(r, &spec.column_field).sort_cmp(col) == Ordering::Equal)
                    .map(|r| field_cell(r, &spec.value_field))
                    .collect();
                if values.is_empty() {
                    empty_cell()
                } else {
                    spec.aggregate.apply(&values)
                }
            })
            .collect();
        let total = spec.with_total.then(|| {
            let values: Vec<Cell> = members
                .iter()
                .map(|r| field_cell(r, &spec.value_field))
                .collect();
            spec.aggregate.apply(&values)
        });
        rows.push(PivotRow { keys, cells, total });
        start = end;
    }

    PivotTable {
        title: String::new(),
        row_labels: spec.row_fields.clone(),
        columns: column_values.iter().map(|c| c.caption_text()).collect(),
        with_total: spec.with_total,
        rows,
    }
}
