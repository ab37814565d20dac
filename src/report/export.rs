//! CSV rendering of built reports.

use anyhow::{Context, Result};

use super::builder::{PivotTable, ReportOutput, ReportTable, RowKind};

const TOTAL_LABEL: &str = "Total";

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV writer: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

/// Header row of labels; captions go in the first column. Total rows carry
/// the `Total` label in the first column, ahead of any total already there.
pub fn table_to_csv(table: &ReportTable) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let width = table.columns.len();
    writer
        .write_record(table.columns.iter().map(|c| c.label.as_str()))
        .context("Failed to write CSV header")?;

    for row in table.flatten() {
        let record: Vec<String> = match row.kind {
            RowKind::Caption => {
                let mut cells = vec![String::new(); width.max(1)];
                cells[0] = row.caption.unwrap_or_default();
                cells
            }
            RowKind::Value => row.cells.iter().map(|c| c.to_string()).collect(),
            RowKind::GroupTotal | RowKind::GrandTotal => {
                let mut cells: Vec<String> = row.cells.iter().map(|c| c.to_string()).collect();
                if let Some(first) = cells.first_mut() {
                    *first = if first.is_empty() {
                        TOTAL_LABEL.to_string()
                    } else {
                        format!("{}: {}", TOTAL_LABEL, first)
                    };
                }
                cells
            }
        };
        writer
            .write_record(&record)
            .context("Failed to write CSV row")?;
    }
    finish(writer)
}

pub fn pivot_to_csv(table: &PivotTable) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<String> = table.row_labels.clone();
    header.extend(table.columns.iter().cloned());
    if table.with_total {
        header.push(TOTAL_LABEL.to_string());
    }
    writer
        .write_record(&header)
        .context("Failed to write CSV header")?;

    for row in &table.rows {
        let mut record: Vec<String> = row.keys.iter().map(|c| c.caption_text()).collect();
        record.extend(row.cells.iter().map(|c| c.to_string()));
        if let Some(total) = &row.total {
            record.push(total.to_string());
        }
        writer
            .write_record(&record)
            .context("Failed to write CSV row")?;
    }
    finish(writer)
}

pub fn to_csv(output: &ReportOutput) -> Result<String> {
    match output {
        ReportOutput::Table(table) => table_to_csv(table),
        ReportOutput::Pivot(table) => pivot_to_csv(table),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::builder::{Column, PivotRow, ReportGroup};
    use crate::report::Cell;

    #[test]
    fn test_grouped_table_csv_layout() -> Result<()> {
        let table = ReportTable {
            title: "Usage".into(),
            columns: vec![
                Column {
                    field: "material.name".into(),
                    label: "Material".into(),
                },
                Column {
                    field: "amount".into(),
                    label: "Amount".into(),
                },
            ],
            group_by: vec!["owner".into()],
            rows: vec![],
            groups: vec![ReportGroup {
                field: "owner".into(),
                value: Cell::text("kovacs"),
                caption: "Technician: kovacs".into(),
                depth: 0,
                rows: vec![vec![Cell::text("UTP, cat5"), Cell::Float(2.5)]],
                subgroups: vec![],
                totals: Some(vec![Cell::Null, Cell::Float(2.5)]),
            }],
            grand_totals: Some(vec![Cell::Null, Cell::Float(2.5)]),
        };
        let csv = table_to_csv(&table)?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Material,Amount",
                "Technician: kovacs,",
                "\"UTP, cat5\",2.5",
                "Total,2.5",
                "Total,2.5",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_total_label_kept_when_first_column_is_summed() -> Result<()> {
        let table = ReportTable {
            title: "Amounts".into(),
            columns: vec![
                Column {
                    field: "amount".into(),
                    label: "Amount".into(),
                },
                Column {
                    field: "material.name".into(),
                    label: "Material".into(),
                },
            ],
            group_by: vec![],
            rows: vec![
                vec![Cell::Float(1.5), Cell::text("Drop cable")],
                vec![Cell::Float(2.0), Cell::text("Patch cord")],
            ],
            groups: vec![],
            grand_totals: Some(vec![Cell::Float(3.5), Cell::Null]),
        };
        let csv = table_to_csv(&table)?;
        assert_eq!(csv.lines().last(), Some("Total: 3.5,"));
        Ok(())
    }

    #[test]
    fn test_pivot_csv_has_total_column() -> Result<()> {
        let table = PivotTable {
            title: "Workload".into(),
            row_labels: vec!["Technician".into()],
            columns: vec!["closed_done".into(), "new".into()],
            with_total: true,
            rows: vec![PivotRow {
                keys: vec![Cell::Null],
                cells: vec![Cell::Int(0), Cell::Int(2)],
                total: Some(Cell::Int(2)),
            }],
        };
        let csv = to_csv(&ReportOutput::Pivot(table))?;
        assert_eq!(csv, "Technician,closed_done,new,Total\nNone,0,2,2\n");
        Ok(())
    }
}
