//! Back office: tickets, devices, warehouses and their bookkeeping.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────────┐  HTTP  ┌──────────────────────────────────────────────┐
//! │ Field client│ ─────> │ server.rs  (axum Router, ServerConfig)       │
//! │ Back office │ <───── │   └─ api.rs  (handlers, AppState, Actor)     │
//! └─────────────┘        │        │ DbHandle::call                      │
//!                        │        v                                     │
//!                        │ forms.rs      payload validation, intake     │
//!                        │ lifecycle.rs  ticket save side effects       │
//!                        │ ownership.rs  device custody                 │
//!                        │ movement.rs   warehouse transfers            │
//!                        │        │                                     │
//!                        │        v                                     │
//!                        │ db.rs  (FieldDb, SQLite, migrations)         │
//!                        └──────────────────────────────────────────────┘
//! ```
//!
//! Every mutation that writes more than one row runs in a single
//! transaction, so a rejected rule leaves no partial state behind.

pub mod api;
pub mod db;
pub mod forms;
pub mod lifecycle;
pub mod models;
pub mod movement;
pub mod ownership;
pub mod server;

pub use db::{DbHandle, FieldDb};
