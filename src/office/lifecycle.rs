//! Side effects of saving a ticket.
//!
//! A save compares the stored row with the requested changes and derives
//! the history notes, the implied status, and the `closed_at` stamp before
//! writing anything. Planning is a pure function (`plan_transition`) so the
//! rules can be tested without a database; `FieldDb::save_ticket` applies a
//! plan inside one transaction.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Deserializer};

use super::db::{FieldDb, now_stamp};
use super::models::{NO_OWNER, NoteKind, NoteTarget, Technology, Ticket, TicketStatus};
use crate::errors::FieldOpsError;

/// Requested changes to a ticket. `None` leaves a field untouched;
/// `owner_id: Some(None)` clears the owner.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketUpdate {
    #[serde(default, deserialize_with = "present")]
    pub owner_id: Option<Option<i64>>,
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub technology: Option<Technology>,
}

/// Distinguishes a missing key from an explicit `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedStamp {
    Keep,
    Stamp,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub owner_id: Option<i64>,
    pub status: TicketStatus,
    pub owner_changed: bool,
    pub status_changed: bool,
    pub closed: ClosedStamp,
}

pub fn plan_transition(stored: &Ticket, update: &TicketUpdate) -> Transition {
    let owner_id = update.owner_id.unwrap_or(stored.owner_id);
    let mut status = update.status.unwrap_or(stored.status);
    let owner_changed = owner_id != stored.owner_id;

    if owner_changed {
        if status == TicketStatus::New && owner_id.is_some() {
            status = TicketStatus::Assigned;
        } else if status != TicketStatus::New && owner_id.is_none() {
            status = TicketStatus::New;
        }
    }

    let closed = match (stored.status.is_closed(), status.is_closed()) {
        (false, true) => ClosedStamp::Stamp,
        (true, false) => ClosedStamp::Clear,
        _ => ClosedStamp::Keep,
    };

    Transition {
        owner_id,
        status,
        owner_changed,
        status_changed: status != stored.status,
        closed,
    }
}

impl FieldDb {
    fn owner_name(&self, owner_id: Option<i64>) -> Result<String> {
        match owner_id {
            Some(id) => Ok(self
                .get_user(id)?
                .map(|u| u.username)
                .unwrap_or_else(|| format!("#{}", id))),
            None => Ok(NO_OWNER.to_string()),
        }
    }

    /// Save ticket changes, recording owner and status history in the same
    /// transaction as the row update.
    pub fn save_ticket(&self, id: i64, update: &TicketUpdate, actor: i64) -> Result<Ticket> {
        let stored = self.require_ticket(id)?;
        let plan = plan_transition(&stored, update);
        if let Some(owner_id) = plan.owner_id
            && plan.owner_changed
            && self.get_user(owner_id)?.is_none()
        {
            return Err(FieldOpsError::not_found("User", owner_id).into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if plan.owner_changed {
            let remark = format!(
                "{} -> {}",
                self.owner_name(stored.owner_id)?,
                self.owner_name(plan.owner_id)?
            );
            self.create_note(NoteTarget::Ticket(id), NoteKind::OwnerChange, &remark, actor)?;
        }
        if plan.status_changed {
            let remark = format!("{} -> {}", stored.status.as_str(), plan.status.as_str());
            self.create_note(NoteTarget::Ticket(id), NoteKind::StatusChange, &remark, actor)?;
            tracing::info!(
                ticket_id = id,
                from = stored.status.as_str(),
                to = plan.status.as_str(),
                "Ticket status changed"
            );
        }

        let closed_at = match plan.closed {
            ClosedStamp::Keep => stored.closed_at.clone(),
            ClosedStamp::Stamp => Some(now_stamp()),
            ClosedStamp::Clear => None,
        };
        let address = update.address.as_deref().unwrap_or(&stored.address);
        let technology = update.technology.unwrap_or(stored.technology);

        tx.execute(
            "UPDATE tickets SET owner_id = ?1, status = ?2, closed_at = ?3, address = ?4, technology = ?5
             WHERE id = ?6",
            params![
                plan.owner_id,
                plan.status.as_str(),
                closed_at,
                address,
                technology.code(),
                id
            ],
        )
        .context("Failed to update ticket")?;
        tx.commit().context("Failed to commit ticket save")?;

        self.require_ticket(id)
    }
}
