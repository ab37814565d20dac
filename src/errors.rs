//! Typed errors for the back office.
//!
//! Storage code returns `anyhow::Result` and raises a `FieldOpsError` when a
//! business rule rejects the request, so that callers (the HTTP layer and the
//! CLI) can recover the cause with `downcast_ref` and pick a status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FieldOpsError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("missing keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("Insufficient stock of material {material_id} in warehouse {warehouse_id}: have {available}, need {requested}")]
    InsufficientStock {
        warehouse_id: i64,
        material_id: i64,
        available: f64,
        requested: f64,
    },

    #[error("Movement {id} is already finalized")]
    MovementFinalized { id: i64 },

    #[error("Device {device_id} is not held by {expected}")]
    WrongCustodian { device_id: i64, expected: String },

    #[error("Unknown user '{0}'")]
    UnknownUser(String),
}

impl FieldOpsError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Find a `FieldOpsError` anywhere in an anyhow chain.
pub fn domain_error(err: &anyhow::Error) -> Option<&FieldOpsError> {
    err.chain().find_map(|e| e.downcast_ref::<FieldOpsError>())
}
