//! Transfers of devices and materials between warehouses.
//!
//! A movement is drafted first and only changes custody and stock when it
//! is finalized. Finalizing is all-or-nothing.

use anyhow::{Context, Result};
use rusqlite::params;

use super::db::{FieldDb, now_stamp};
use super::models::{
    MaterialMovement, MovementDetail, MovementItem, MovementStatus, NoteKind, NoteTarget, OwnerRef,
};
use crate::errors::FieldOpsError;

impl FieldDb {
    pub fn create_movement(
        &self,
        source_warehouse_id: i64,
        target_warehouse_id: i64,
        items: &[MovementItem],
        remark: Option<&str>,
        actor: i64,
    ) -> Result<MovementDetail> {
        if source_warehouse_id == target_warehouse_id {
            return Err(FieldOpsError::Validation(
                "source and target warehouse must differ".into(),
            )
            .into());
        }
        for id in [source_warehouse_id, target_warehouse_id] {
            let wh = self.require_warehouse(id)?;
            if !wh.is_active {
                return Err(FieldOpsError::Validation(format!(
                    "warehouse '{}' is not active",
                    wh.name
                ))
                .into());
            }
        }
        if items.is_empty() {
            return Err(FieldOpsError::Validation("a movement needs at least one item".into()).into());
        }
        for item in items {
            match *item {
                MovementItem::Device { device_id } => {
                    let device = self.require_device(device_id)?;
                    if device.owner != Some(OwnerRef::Warehouse(source_warehouse_id)) {
                        return Err(FieldOpsError::WrongCustodian {
                            device_id,
                            expected: self.owner_label(Some(OwnerRef::Warehouse(source_warehouse_id)))?,
                        }
                        .into());
                    }
                }
                MovementItem::Material { material_id, amount } => {
                    if self.get_material(material_id)?.is_none() {
                        return Err(FieldOpsError::not_found("Material", material_id).into());
                    }
                    if amount <= 0.0 {
                        return Err(FieldOpsError::Validation(format!(
                            "amount of material {} must be positive",
                            material_id
                        ))
                        .into());
                    }
                }
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO material_movements (source_warehouse_id, target_warehouse_id, status, remark, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_warehouse_id,
                target_warehouse_id,
                MovementStatus::Draft.as_str(),
                remark,
                actor
            ],
        )
        .context("Failed to insert movement")?;
        let id = tx.last_insert_rowid();
        for item in items {
            let (device_id, material_id, amount) = match *item {
                MovementItem::Device { device_id } => (Some(device_id), None, None),
                MovementItem::Material { material_id, amount } => {
                    (None, Some(material_id), Some(amount))
                }
            };
            tx.execute(
                "INSERT INTO movement_items (movement_id, device_id, material_id, amount)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, device_id, material_id, amount],
            )
            .context("Failed to insert movement item")?;
        }
        tx.commit().context("Failed to commit movement")?;

        self.movement_detail(id)?
            .context("Movement not found after insert")
    }

    pub fn movement_detail(&self, id: i64) -> Result<Option<MovementDetail>> {
        let movement = match self.get_movement(id)? {
            Some(m) => m,
            None => return Ok(None),
        };
        Ok(Some(MovementDetail {
            items: self.movement_items(id)?,
            notes: self.list_notes(NoteTarget::Movement(id))?,
            movement,
        }))
    }

    /// Carry out a drafted movement: devices change custody, stock moves from
    /// source to target. Any failure rolls back every change.
    pub fn finalize_movement(&self, id: i64, actor: i64) -> Result<MaterialMovement> {
        let movement = self
            .get_movement(id)?
            .ok_or_else(|| FieldOpsError::not_found("Movement", id))?;
        if movement.status != MovementStatus::Draft {
            return Err(FieldOpsError::MovementFinalized { id }.into());
        }
        let items = self.movement_items(id)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let (mut devices, mut materials) = (0usize, 0usize);
        for item in &items {
            match *item {
                MovementItem::Device { device_id } => {
                    self.apply_owner(
                        device_id,
                        OwnerRef::Warehouse(movement.target_warehouse_id),
                        actor,
                    )?;
                    devices += 1;
                }
                MovementItem::Material { material_id, amount } => {
                    self.adjust_stock(movement.source_warehouse_id, material_id, -amount)?;
                    self.adjust_stock(movement.target_warehouse_id, material_id, amount)?;
                    materials += 1;
                }
            }
        }
        tx.execute(
            "UPDATE material_movements SET status = ?1, finalized_at = ?2 WHERE id = ?3",
            params![MovementStatus::Finalized.as_str(), now_stamp(), id],
        )
        .context("Failed to finalize movement")?;
        let remark = format!(
            "{} -> {}: {} device(s), {} material line(s)",
            self.owner_label(Some(OwnerRef::Warehouse(movement.source_warehouse_id)))?,
            self.owner_label(Some(OwnerRef::Warehouse(movement.target_warehouse_id)))?,
            devices,
            materials
        );
        self.create_note(NoteTarget::Movement(id), NoteKind::StatusChange, &remark, actor)?;
        tx.commit().context("Failed to commit movement finalization")?;

        tracing::info!(movement_id = id, devices, materials, "Movement finalized");
        self.get_movement(id)?
            .context("Movement not found after finalize")
    }

    /// Book incoming stock into a warehouse.
    pub fn receive_stock(&self, warehouse_id: i64, material_id: i64, amount: f64) -> Result<f64> {
        if amount <= 0.0 {
            return Err(FieldOpsError::Validation("received amount must be positive".into()).into());
        }
        self.require_warehouse(warehouse_id)?;
        if self.get_material(material_id)?.is_none() {
            return Err(FieldOpsError::not_found("Material", material_id).into());
        }
        self.adjust_stock(warehouse_id, material_id, amount)?;
        self.stock_amount(warehouse_id, material_id)
    }
}
