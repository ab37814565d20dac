use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result};

use super::{ImportSummary, cell, integer_text, number, read_rows};
use crate::office::FieldDb;
use crate::office::db::NewMaterial;
use crate::office::forms::clean_text;
use crate::office::models::{Provider, Technology, Unit};

/// Rows before the first material line.
const HEADER_ROWS: usize = 5;
/// Footer rows (signatures, sums) after the last material line.
const FOOTER_ROWS: usize = 5;

/// Nested category headings of the material price list.
///
/// Rows without a material number are headings. Consecutive headings are
/// queued and, at the next material, replace the tail of the current stack
/// when there are fewer of them, or the whole stack otherwise. A blank
/// heading row resets everything.
#[derive(Debug, Default)]
struct CategoryStack {
    current: Vec<String>,
    queued: Vec<String>,
}

impl CategoryStack {
    fn reset(&mut self) {
        self.current.clear();
        self.queued.clear();
    }

    fn queue(&mut self, name: String) {
        self.queued.push(name);
    }

    fn resolve(&mut self) -> String {
        if !self.queued.is_empty() {
            let queued = std::mem::take(&mut self.queued);
            if queued.len() < self.current.len() {
                let offset = self.current.len() - queued.len();
                for (i, name) in queued.into_iter().enumerate() {
                    self.current[offset + i] = name;
                }
            } else {
                self.current = queued;
            }
        }
        self.current.join(" | ")
    }
}

fn provider(raw: &str) -> Option<Provider> {
    match raw.trim().parse::<f64>().ok()? as i64 {
        1 => Some(Provider::Mt),
        3 => Some(Provider::Contractor),
        _ => None,
    }
}

/// Material price list: number in column 1, name in 3, unit in 4, price in 6
/// and provider code in 9.
pub fn import_materials(db: &FieldDb, reader: impl Read) -> Result<ImportSummary> {
    let rows = read_rows(reader)?;
    let mut summary = ImportSummary::default();
    let end = rows.len().saturating_sub(FOOTER_ROWS);
    let mut stack = CategoryStack::default();
    let mut seen = HashSet::new();

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to begin transaction")?;
    for (line, row) in rows.iter().enumerate().take(end).skip(HEADER_ROWS) {
        let sn = integer_text(cell(row, 1));
        let name = clean_text(cell(row, 3));

        if sn.is_empty() {
            if !cell(row, 0).is_empty() {
                continue;
            }
            if name.is_empty() {
                stack.reset();
            } else {
                stack.queue(name);
            }
            continue;
        }

        let category = stack.resolve();
        if category.is_empty() {
            summary.warn(format!("line {}: material without category: {}", line + 1, name));
            continue;
        }
        if !seen.insert(sn.clone()) || db.get_material_by_sn(&sn)?.is_some() {
            summary.warn(format!("line {}: duplicate material number {}", line + 1, sn));
            continue;
        }

        let raw_unit = cell(row, 4).to_lowercase();
        let unit = match raw_unit.parse::<Unit>() {
            Ok(unit) => unit,
            Err(_) => {
                tracing::warn!(line = line + 1, unit = %raw_unit, "Unknown unit, using db");
                Unit::Db
            }
        };
        let category_id = db.get_or_create_material_category(&category)?.id;
        db.create_material(&NewMaterial {
            sn,
            name,
            price: number(cell(row, 6)).round() as i64,
            fav: false,
            unit,
            remark: None,
            comes_from: provider(cell(row, 9)),
            technology: Technology::All,
            category_id,
        })?;
        summary.imported += 1;
    }
    tx.commit().context("Failed to commit material import")?;
    Ok(summary)
}
