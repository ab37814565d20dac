//! Initial data loaders for spreadsheet exports saved as CSV.
//!
//! Each loader reads positional columns (the source sheets have no stable
//! headers), runs in one transaction and reports what it did in an
//! [`ImportSummary`].

mod materials;

use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::office::FieldDb;
use crate::office::db::NewWorkItem;
use crate::office::forms::clean_text;
use crate::office::models::OwnerRef;

pub use materials::import_materials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Devices,
    Materials,
    WorkItems,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Devices => "devices",
            Self::Materials => "materials",
            Self::WorkItems => "work-items",
        }
    }
}

impl FromStr for ImportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devices" => Ok(Self::Devices),
            "materials" => Ok(Self::Materials),
            "work-items" | "work_items" => Ok(Self::WorkItems),
            _ => Err(format!("Invalid import kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

impl ImportSummary {
    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
        self.skipped += 1;
    }
}

/// All rows of a headerless CSV, ragged rows allowed.
pub(crate) fn read_rows(reader: impl Read) -> Result<Vec<Vec<String>>> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in csv.records() {
        let record = record.context("Failed to read CSV row")?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

pub(crate) fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.trim()).unwrap_or("")
}

/// Spreadsheet numbers often come out as `123.0`; keep them integral.
pub(crate) fn integer_text(raw: &str) -> String {
    match raw.trim().parse::<f64>() {
        Ok(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", n as i64),
        _ => raw.trim().to_string(),
    }
}

pub(crate) fn number(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

/// Load a file of the given kind. Devices need a receiving warehouse.
pub fn import_file(
    db: &FieldDb,
    kind: ImportKind,
    path: &Path,
    warehouse_id: Option<i64>,
    actor: i64,
) -> Result<ImportSummary> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let summary = match kind {
        ImportKind::Devices => {
            let warehouse_id =
                warehouse_id.context("Importing devices requires a warehouse")?;
            import_devices(db, file, warehouse_id, actor)?
        }
        ImportKind::Materials => import_materials(db, file)?,
        ImportKind::WorkItems => import_work_items(db, file)?,
    };
    tracing::info!(
        kind = kind.as_str(),
        imported = summary.imported,
        skipped = summary.skipped,
        "Import finished"
    );
    Ok(summary)
}

/// Device inventory export: `class, group, type, code, sn, ...` with a header row.
pub fn import_devices(
    db: &FieldDb,
    reader: impl Read,
    warehouse_id: i64,
    actor: i64,
) -> Result<ImportSummary> {
    db.require_warehouse(warehouse_id)?;
    let rows = read_rows(reader)?;
    let mut summary = ImportSummary::default();

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to begin transaction")?;
    for (line, row) in rows.iter().enumerate().skip(1) {
        let type_name = clean_text(cell(row, 2));
        let sn = clean_text(cell(row, 4));
        if sn.is_empty() || type_name.is_empty() {
            summary.warn(format!("line {}: missing type or serial number", line + 1));
            continue;
        }
        if !db.get_devices_by_sn(&sn)?.is_empty() {
            summary.warn(format!("line {}: duplicate serial number {}", line + 1, sn));
            continue;
        }
        let dev_type = db.get_or_create_device_type(&type_name)?;
        let device = db.create_device(&sn, dev_type.id, None, None)?;
        db.apply_owner(device.device.id, OwnerRef::Warehouse(warehouse_id), actor)?;
        summary.imported += 1;
    }
    tx.commit().context("Failed to commit device import")?;
    Ok(summary)
}

/// Work item price list: `name, art number, art price, remark, deleted,
/// bulk price, given price` with a header row.
pub fn import_work_items(db: &FieldDb, reader: impl Read) -> Result<ImportSummary> {
    let rows = read_rows(reader)?;
    let mut summary = ImportSummary::default();

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to begin transaction")?;
    for row in rows.iter().skip(1) {
        let deleted = cell(row, 4).parse::<f64>().map(|v| v != 0.0).unwrap_or(true);
        if deleted {
            summary.skipped += 1;
            continue;
        }
        let remark = clean_text(cell(row, 3));
        db.create_work_item(&NewWorkItem {
            name: clean_text(cell(row, 0)),
            art_number: integer_text(cell(row, 1)),
            remark: (!remark.is_empty()).then_some(remark),
            art_price: number(cell(row, 2)).round() as i64,
            bulk_price: number(cell(row, 5)).round() as i64,
            given_price: number(cell(row, 6)).round() as i64,
        })?;
        summary.imported += 1;
    }
    tx.commit().context("Failed to commit work item import")?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::office::models::UserRole;

    #[test]
    fn test_import_devices_owned_by_warehouse_and_skips_known_serials() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let admin = db.create_user("admin", "", UserRole::Admin)?;
        let wh = db.create_warehouse("Central", None)?;
        let csv = "class,group,type,code,sn,status\n\
                   A,B,\"ont   huawei\",1,SN-1,ok\n\
                   A,B,STB,2,SN-2,ok\n\
                   A,B,STB,3,,ok\n\
                   A,B,STB,2,SN-2,ok\n";

        let summary = import_devices(&db, csv.as_bytes(), wh.id, admin.id)?;
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.warnings.len(), 2);
        assert_eq!(summary.warnings[1], "line 5: duplicate serial number SN-2");

        let held = db.devices_of(OwnerRef::Warehouse(wh.id))?;
        assert_eq!(held.len(), 2);
        assert!(held.iter().any(|d| d.type_name == "Ont huawei"));
        Ok(())
    }

    #[test]
    fn test_import_work_items_skips_deleted_rows() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let csv = "name,number,price,remark,deleted,bulk,given\n\
                   cable  pulling,101.0,1500,per  metre ,0,1200,1000\n\
                   Old job,102,900,,1,0,0\n\
                   Socket mount,103,800,,0,,\n";

        let summary = import_work_items(&db, csv.as_bytes())?;
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 1);

        let items = db.list_work_items()?;
        assert_eq!(items[0].name, "Cable pulling");
        assert_eq!(items[0].art_number, "101");
        assert_eq!(items[0].remark.as_deref(), Some("Per metre"));
        assert_eq!(items[0].bulk_price, 1200);
        assert_eq!(items[1].given_price, 0);
        assert!(items[1].remark.is_none());
        Ok(())
    }

    #[test]
    fn test_import_file_requires_warehouse_for_devices() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("devices.csv");
        std::fs::write(&path, "h\n")?;
        let err = import_file(&db, ImportKind::Devices, &path, None, 1).unwrap_err();
        assert!(err.to_string().contains("requires a warehouse"));
        assert_eq!("work-items".parse::<ImportKind>(), Ok(ImportKind::WorkItems));
        Ok(())
    }
}
