//! Device custody bookkeeping.

use anyhow::{Context, Result};
use rusqlite::params;

use super::db::{FieldDb, now_stamp};
use super::models::{DeviceWithOwner, NO_OWNER, NoteKind, NoteTarget, OwnerRef};
use crate::errors::FieldOpsError;

impl FieldDb {
    /// Human-readable owner label used in history notes.
    pub fn owner_label(&self, owner: Option<OwnerRef>) -> Result<String> {
        let label = match owner {
            None => NO_OWNER.to_string(),
            Some(OwnerRef::Technician(id)) => match self.get_user(id)? {
                Some(user) => format!("technician:{}", user.username),
                None => format!("technician:#{}", id),
            },
            Some(OwnerRef::Client(id)) => match self.get_client(id)? {
                Some(client) => format!("client:{}", client.mt_id),
                None => format!("client:#{}", id),
            },
            Some(OwnerRef::Warehouse(id)) => match self.get_warehouse(id)? {
                Some(wh) => format!("warehouse:{}", wh.name),
                None => format!("warehouse:#{}", id),
            },
        };
        Ok(label)
    }

    /// Point the device at a new custodian. Returns whether the owner changed.
    /// Runs inside the caller's transaction, if any.
    pub(crate) fn apply_owner(&self, device_id: i64, owner: OwnerRef, actor: i64) -> Result<bool> {
        let device = self.require_device(device_id)?;
        if device.owner == Some(owner) {
            return Ok(false);
        }
        let remark = format!(
            "{} -> {}",
            self.owner_label(device.owner)?,
            self.owner_label(Some(owner))?
        );
        self.conn
            .execute(
                "INSERT INTO device_owners (device_id, owner_kind, owner_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET owner_kind = excluded.owner_kind, owner_id = excluded.owner_id",
                params![device_id, owner.kind_str(), owner.id()],
            )
            .context("Failed to upsert device owner")?;
        self.create_note(NoteTarget::Device(device_id), NoteKind::OwnerChange, &remark, actor)?;
        tracing::debug!(device_id, %remark, "Device owner changed");
        Ok(true)
    }

    pub fn assign_owner(&self, device_id: i64, owner: OwnerRef, actor: i64) -> Result<DeviceWithOwner> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.apply_owner(device_id, owner, actor)?;
        tx.commit().context("Failed to commit owner change")?;
        self.require_device(device_id)
    }

    /// Uninstall a device at a client: the acting technician takes it back.
    pub fn remove_device_from_ticket(
        &self,
        ticket_id: i64,
        device_id: i64,
        actor: i64,
    ) -> Result<DeviceWithOwner> {
        let ticket = self.require_ticket(ticket_id)?;
        let device = self.require_device(device_id)?;
        let client_owner = OwnerRef::Client(ticket.client_id);
        if device.owner != Some(client_owner) {
            return Err(FieldOpsError::WrongCustodian {
                device_id,
                expected: self.owner_label(Some(client_owner))?,
            }
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.apply_owner(device_id, OwnerRef::Technician(actor), actor)?;
        tx.execute(
            "UPDATE devices SET returned_at = ?1 WHERE id = ?2",
            params![now_stamp(), device_id],
        )
        .context("Failed to stamp device return")?;
        let remark = format!("Removed device {} ({})", device.device.sn, device.type_name);
        self.create_note(NoteTarget::Ticket(ticket_id), NoteKind::OwnerChange, &remark, actor)?;
        tx.commit().context("Failed to commit device removal")?;

        tracing::info!(ticket_id, device_id, "Device removed from client");
        self.require_device(device_id)
    }
}
