use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use super::models::*;
use crate::errors::FieldOpsError;

/// Async-safe handle to the back-office database.
///
/// Wraps `FieldDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FieldDb>>,
}

impl DbHandle {
    pub fn new(db: FieldDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FieldDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for the CLI, startup
    /// and tests; never from a request handler.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FieldDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FieldDb {
    pub(crate) conn: Connection,
}

/// Stock amounts are rounded to this many units per 1.
const STOCK_PRECISION: f64 = 1_000_000.0;

/// Round a stock level to `STOCK_PRECISION`; drift just below zero becomes zero.
fn round_stock(amount: f64) -> f64 {
    let rounded = (amount * STOCK_PRECISION).round() / STOCK_PRECISION;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Timestamp in the same shape SQLite's `datetime('now')` produces.
pub(crate) fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a text column into one of the model enums.
pub(crate) fn parse_col<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn technology_col(idx: usize, code: i64) -> rusqlite::Result<Technology> {
    Technology::from_code(code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, e.into())
    })
}

fn additional_col(idx: usize, raw: String) -> rusqlite::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(e) => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )),
    }
}

const USER_COLUMNS: &str = "id, username, full_name, role, is_active";
const TICKET_COLUMNS: &str = "id, kind, ext_id, client_id, city_id, address, owner_id, status, technology, additional, payoff_id, created_at, created_by, closed_at";
const CLIENT_COLUMNS: &str = "id, mt_id, name, city_id, address, phone, created_at, created_by";
const DEVICE_COLUMNS: &str = "d.id, d.sn, d.card_sn, d.type_id, d.connected_device_id, d.valid, d.remark, d.returned_at, d.created_at, t.name, o.owner_kind, o.owner_id";
const MATERIAL_COLUMNS: &str = "id, sn, name, price, fav, unit, remark, comes_from, technology, category_id";
const NOTE_COLUMNS: &str = "id, target_kind, target_id, kind, is_history, remark, created_at, created_by";
const MOVEMENT_COLUMNS: &str = "id, source_warehouse_id, target_warehouse_id, status, remark, created_at, created_by, finalized_at";

fn map_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        role: parse_col(3, row.get(3)?)?,
        is_active: row.get(4)?,
    })
}

pub(crate) fn map_ticket(row: &Row) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        kind: parse_col(1, row.get(1)?)?,
        ext_id: row.get(2)?,
        client_id: row.get(3)?,
        city_id: row.get(4)?,
        address: row.get(5)?,
        owner_id: row.get(6)?,
        status: parse_col(7, row.get(7)?)?,
        technology: technology_col(8, row.get(8)?)?,
        additional: additional_col(9, row.get(9)?)?,
        payoff_id: row.get(10)?,
        created_at: row.get(11)?,
        created_by: row.get(12)?,
        closed_at: row.get(13)?,
    })
}

fn map_client(row: &Row) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        mt_id: row.get(1)?,
        name: row.get(2)?,
        city_id: row.get(3)?,
        address: row.get(4)?,
        phone: row.get(5)?,
        created_at: row.get(6)?,
        created_by: row.get(7)?,
    })
}

fn map_city(row: &Row) -> rusqlite::Result<City> {
    Ok(City {
        id: row.get(0)?,
        name: row.get(1)?,
        zip: row.get(2)?,
        primer: row.get(3)?,
        onuk: row.get(4)?,
    })
}

fn map_device(row: &Row) -> rusqlite::Result<DeviceWithOwner> {
    let owner_kind: Option<String> = row.get(10)?;
    let owner_id: Option<i64> = row.get(11)?;
    let owner = match (owner_kind, owner_id) {
        (Some(kind), Some(id)) => Some(OwnerRef::from_parts(&kind, id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, e.into())
        })?),
        _ => None,
    };
    Ok(DeviceWithOwner {
        device: Device {
            id: row.get(0)?,
            sn: row.get(1)?,
            card_sn: row.get(2)?,
            type_id: row.get(3)?,
            connected_device_id: row.get(4)?,
            valid: row.get(5)?,
            remark: row.get(6)?,
            returned_at: row.get(7)?,
            created_at: row.get(8)?,
        },
        type_name: row.get(9)?,
        owner,
    })
}

fn map_material(row: &Row) -> rusqlite::Result<Material> {
    let comes_from: Option<String> = row.get(7)?;
    Ok(Material {
        id: row.get(0)?,
        sn: row.get(1)?,
        name: row.get(2)?,
        price: row.get(3)?,
        fav: row.get(4)?,
        unit: parse_col(5, row.get(5)?)?,
        remark: row.get(6)?,
        comes_from: comes_from.map(|c| parse_col(7, c)).transpose()?,
        technology: technology_col(8, row.get(8)?)?,
        category_id: row.get(9)?,
    })
}

pub(crate) fn map_note(row: &Row) -> rusqlite::Result<Note> {
    let target_kind: String = row.get(1)?;
    let target_id: i64 = row.get(2)?;
    Ok(Note {
        id: row.get(0)?,
        target: NoteTarget::from_parts(&target_kind, target_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        kind: parse_col(3, row.get(3)?)?,
        is_history: row.get(4)?,
        remark: row.get(5)?,
        created_at: row.get(6)?,
        created_by: row.get(7)?,
    })
}

pub(crate) fn map_movement(row: &Row) -> rusqlite::Result<MaterialMovement> {
    Ok(MaterialMovement {
        id: row.get(0)?,
        source_warehouse_id: row.get(1)?,
        target_warehouse_id: row.get(2)?,
        status: parse_col(3, row.get(3)?)?,
        remark: row.get(4)?,
        created_at: row.get(5)?,
        created_by: row.get(6)?,
        finalized_at: row.get(7)?,
    })
}

/// Which tickets the list view shows, by lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Open,
    Closed,
    All,
    /// Open tickets owned by the acting user.
    OwnOpen,
    /// Every ticket owned by the acting user.
    OwnAll,
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "all" => Ok(Self::All),
            "own_open" => Ok(Self::OwnOpen),
            "own_all" => Ok(Self::OwnAll),
            _ => Err(format!("Invalid status filter: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayoffFilter {
    #[default]
    Any,
    /// Tickets not yet attached to any payoff.
    Unsettled,
    Payoff(i64),
}

#[derive(Debug, Clone, Default)]
pub struct TicketQuery {
    pub status: StatusFilter,
    pub owner_id: Option<i64>,
    pub kind: Option<TicketKind>,
    pub payoff: PayoffFilter,
    pub search: Option<String>,
    /// Acting user, needed by the `own_*` status filters.
    pub actor_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub kind: TicketKind,
    pub ext_id: String,
    pub client_id: i64,
    pub city_id: i64,
    pub address: String,
    pub technology: Technology,
    pub additional: Map<String, Value>,
    /// Overrides the creation time (the field API sends the original mail date).
    pub created_at: Option<String>,
    pub ticket_type_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct NewMaterial {
    pub sn: String,
    pub name: String,
    pub price: i64,
    pub fav: bool,
    pub unit: Unit,
    pub remark: Option<String>,
    pub comes_from: Option<Provider>,
    pub technology: Technology,
    pub category_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub name: String,
    pub art_number: String,
    pub remark: Option<String>,
    pub art_price: i64,
    pub bulk_price: i64,
    pub given_price: i64,
}

impl FieldDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    full_name TEXT NOT NULL DEFAULT '',
                    role TEXT NOT NULL DEFAULT 'technician',
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS cities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    zip INTEGER NOT NULL,
                    primer TEXT,
                    onuk TEXT,
                    UNIQUE(name, zip)
                );

                CREATE TABLE IF NOT EXISTS clients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    mt_id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    city_id INTEGER NOT NULL REFERENCES cities(id),
                    address TEXT NOT NULL,
                    phone TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS ticket_types (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    remark TEXT
                );

                CREATE TABLE IF NOT EXISTS payoffs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tickets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL DEFAULT 'installation',
                    ext_id TEXT NOT NULL,
                    client_id INTEGER NOT NULL REFERENCES clients(id),
                    city_id INTEGER NOT NULL REFERENCES cities(id),
                    address TEXT NOT NULL,
                    owner_id INTEGER REFERENCES users(id),
                    status TEXT NOT NULL DEFAULT 'new',
                    technology INTEGER NOT NULL DEFAULT 0,
                    additional TEXT NOT NULL DEFAULT '{}',
                    payoff_id INTEGER REFERENCES payoffs(id),
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id),
                    closed_at TEXT,
                    UNIQUE(kind, ext_id)
                );

                CREATE TABLE IF NOT EXISTS ticket_ticket_types (
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    ticket_type_id INTEGER NOT NULL REFERENCES ticket_types(id),
                    PRIMARY KEY (ticket_id, ticket_type_id)
                );

                CREATE TABLE IF NOT EXISTS notes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_kind TEXT NOT NULL,
                    target_id INTEGER NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'comment',
                    is_history INTEGER NOT NULL DEFAULT 0,
                    remark TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS attachments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    data TEXT NOT NULL,
                    remark TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS device_types (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    sn_pattern TEXT,
                    technology INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS devices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sn TEXT NOT NULL,
                    card_sn TEXT,
                    type_id INTEGER NOT NULL REFERENCES device_types(id),
                    connected_device_id INTEGER REFERENCES devices(id),
                    valid INTEGER NOT NULL DEFAULT 1,
                    remark TEXT,
                    returned_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS device_owners (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    device_id INTEGER NOT NULL UNIQUE REFERENCES devices(id) ON DELETE CASCADE,
                    owner_kind TEXT NOT NULL,
                    owner_id INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS warehouses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    location TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS material_categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    remark TEXT
                );

                CREATE TABLE IF NOT EXISTS materials (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sn TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    price INTEGER NOT NULL DEFAULT 0,
                    fav INTEGER NOT NULL DEFAULT 0,
                    unit TEXT NOT NULL DEFAULT 'db',
                    remark TEXT,
                    comes_from TEXT,
                    technology INTEGER NOT NULL DEFAULT 0,
                    category_id INTEGER NOT NULL REFERENCES material_categories(id)
                );

                CREATE TABLE IF NOT EXISTS ticket_materials (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    material_id INTEGER NOT NULL REFERENCES materials(id),
                    amount REAL NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS work_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    art_number TEXT NOT NULL DEFAULT '0',
                    remark TEXT,
                    art_price INTEGER NOT NULL DEFAULT 0,
                    bulk_price INTEGER NOT NULL DEFAULT 0,
                    given_price INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS ticket_work_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    work_item_id INTEGER NOT NULL REFERENCES work_items(id),
                    amount REAL NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS stock_levels (
                    warehouse_id INTEGER NOT NULL REFERENCES warehouses(id),
                    material_id INTEGER NOT NULL REFERENCES materials(id),
                    amount REAL NOT NULL DEFAULT 0 CHECK (amount >= 0),
                    PRIMARY KEY (warehouse_id, material_id)
                );

                CREATE TABLE IF NOT EXISTS material_movements (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_warehouse_id INTEGER NOT NULL REFERENCES warehouses(id),
                    target_warehouse_id INTEGER NOT NULL REFERENCES warehouses(id),
                    status TEXT NOT NULL DEFAULT 'draft',
                    remark TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_by INTEGER NOT NULL REFERENCES users(id),
                    finalized_at TEXT
                );

                CREATE TABLE IF NOT EXISTS movement_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    movement_id INTEGER NOT NULL REFERENCES material_movements(id) ON DELETE CASCADE,
                    device_id INTEGER REFERENCES devices(id),
                    material_id INTEGER REFERENCES materials(id),
                    amount REAL
                );

                CREATE INDEX IF NOT EXISTS idx_tickets_owner ON tickets(owner_id);
                CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
                CREATE INDEX IF NOT EXISTS idx_notes_target ON notes(target_kind, target_id);
                CREATE INDEX IF NOT EXISTS idx_devices_sn ON devices(sn);
                CREATE INDEX IF NOT EXISTS idx_device_owners_owner ON device_owners(owner_kind, owner_id);
                CREATE INDEX IF NOT EXISTS idx_ticket_materials_ticket ON ticket_materials(ticket_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, username: &str, full_name: &str, role: UserRole) -> Result<User> {
        let exists = self.get_user_by_username(username)?.is_some();
        if exists {
            return Err(FieldOpsError::Duplicate {
                entity: "user",
                key: username.to_string(),
            }
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO users (username, full_name, role) VALUES (?1, ?2, ?3)",
                params![username, full_name, role.as_str()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                map_user,
            )
            .optional()
            .context("Failed to query user by username")
    }

    /// Users, optionally only active ones, ordered by username.
    pub fn list_users(&self, only_active: bool) -> Result<Vec<User>> {
        let sql = if only_active {
            format!("SELECT {USER_COLUMNS} FROM users WHERE is_active = 1 ORDER BY username")
        } else {
            format!("SELECT {USER_COLUMNS} FROM users ORDER BY username")
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_users")?;
        let rows = stmt.query_map([], map_user).context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?);
        }
        Ok(users)
    }

    pub fn set_user_active(&self, id: i64, is_active: bool) -> Result<User> {
        self.conn
            .execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                params![is_active, id],
            )
            .context("Failed to update user")?;
        self.get_user(id)?
            .ok_or_else(|| FieldOpsError::not_found("User", id).into())
    }

    // ── Cities & clients ──────────────────────────────────────────────

    pub fn get_or_create_city(&self, name: &str, zip: i64) -> Result<City> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO cities (name, zip) VALUES (?1, ?2)",
                params![name, zip],
            )
            .context("Failed to insert city")?;
        self.conn
            .query_row(
                "SELECT id, name, zip, primer, onuk FROM cities WHERE name = ?1 AND zip = ?2",
                params![name, zip],
                map_city,
            )
            .context("City not found after insert")
    }

    pub fn get_city(&self, id: i64) -> Result<Option<City>> {
        self.conn
            .query_row(
                "SELECT id, name, zip, primer, onuk FROM cities WHERE id = ?1",
                params![id],
                map_city,
            )
            .optional()
            .context("Failed to query city")
    }

    pub fn set_city_primer(&self, id: i64, primer: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cities SET primer = ?1 WHERE id = ?2",
                params![primer, id],
            )
            .context("Failed to update city primer")?;
        Ok(())
    }

    pub fn create_client(
        &self,
        mt_id: &str,
        name: &str,
        city_id: i64,
        address: &str,
        phone: &str,
        created_by: i64,
    ) -> Result<Client> {
        self.conn
            .execute(
                "INSERT INTO clients (mt_id, name, city_id, address, phone, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![mt_id, name, city_id, address, phone, created_by],
            )
            .context("Failed to insert client")?;
        let id = self.conn.last_insert_rowid();
        self.get_client(id)?.context("Client not found after insert")
    }

    pub fn get_client(&self, id: i64) -> Result<Option<Client>> {
        self.conn
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id],
                map_client,
            )
            .optional()
            .context("Failed to query client")
    }

    pub fn get_client_by_mt_id(&self, mt_id: &str) -> Result<Option<Client>> {
        self.conn
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE mt_id = ?1"),
                params![mt_id],
                map_client,
            )
            .optional()
            .context("Failed to query client by mt_id")
    }

    pub fn client_detail(&self, id: i64) -> Result<Option<ClientDetail>> {
        let client = match self.get_client(id)? {
            Some(c) => c,
            None => return Ok(None),
        };
        let city = self
            .get_city(client.city_id)?
            .context("Client city not found")?;
        let tickets = self
            .list_tickets(&TicketQuery {
                status: StatusFilter::All,
                ..Default::default()
            })?
            .into_iter()
            .filter(|t| t.client_mt_id == client.mt_id)
            .collect();
        let devices = self.devices_of(OwnerRef::Client(id))?;
        Ok(Some(ClientDetail {
            client,
            city,
            tickets,
            devices,
        }))
    }

    // ── Ticket types & payoffs ────────────────────────────────────────

    pub fn get_or_create_ticket_type(&self, name: &str) -> Result<TicketType> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO ticket_types (name) VALUES (?1)",
                params![name],
            )
            .context("Failed to insert ticket type")?;
        self.conn
            .query_row(
                "SELECT id, name, remark FROM ticket_types WHERE name = ?1",
                params![name],
                |row| {
                    Ok(TicketType {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        remark: row.get(2)?,
                    })
                },
            )
            .context("Ticket type not found after insert")
    }

    pub fn ticket_type_names(&self, ticket_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tt.name FROM ticket_types tt
                 JOIN ticket_ticket_types ttt ON ttt.ticket_type_id = tt.id
                 WHERE ttt.ticket_id = ?1 ORDER BY tt.name",
            )
            .context("Failed to prepare ticket_type_names")?;
        let rows = stmt
            .query_map(params![ticket_id], |row| row.get::<_, String>(0))
            .context("Failed to query ticket types")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("Failed to read ticket type row")?);
        }
        Ok(names)
    }

    pub fn create_payoff(&self, name: &str) -> Result<Payoff> {
        self.conn
            .execute("INSERT INTO payoffs (name) VALUES (?1)", params![name])
            .context("Failed to insert payoff")?;
        Ok(Payoff {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub fn list_payoffs(&self) -> Result<Vec<Payoff>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM payoffs ORDER BY id")
            .context("Failed to prepare list_payoffs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Payoff {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .context("Failed to query payoffs")?;
        let mut payoffs = Vec::new();
        for row in rows {
            payoffs.push(row.context("Failed to read payoff row")?);
        }
        Ok(payoffs)
    }

    // ── Tickets ───────────────────────────────────────────────────────

    /// Insert a ticket with its ticket types. Creation never records history;
    /// only later saves do (see `lifecycle`).
    pub fn create_ticket(&self, new: &NewTicket, created_by: i64) -> Result<Ticket> {
        if self.find_ticket_by_ext_id(new.kind, &new.ext_id)?.is_some() {
            return Err(FieldOpsError::Duplicate {
                entity: "ticket",
                key: new.ext_id.clone(),
            }
            .into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = self.insert_ticket(new, created_by)?;
        tx.commit().context("Failed to commit ticket insert")?;
        self.get_ticket(id)?.context("Ticket not found after insert")
    }

    /// Row inserts behind `create_ticket`, without a transaction of its own.
    pub(crate) fn insert_ticket(&self, new: &NewTicket, created_by: i64) -> Result<i64> {
        let additional = serde_json::to_string(&new.additional)
            .context("Failed to serialize ticket extras")?;
        let created_at = new.created_at.clone().unwrap_or_else(now_stamp);
        self.conn
            .execute(
                "INSERT INTO tickets (kind, ext_id, client_id, city_id, address, technology, additional, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.kind.as_str(),
                    new.ext_id,
                    new.client_id,
                    new.city_id,
                    new.address,
                    new.technology.code(),
                    additional,
                    created_at,
                    created_by
                ],
            )
            .context("Failed to insert ticket")?;
        let id = self.conn.last_insert_rowid();
        for type_id in &new.ticket_type_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO ticket_ticket_types (ticket_id, ticket_type_id) VALUES (?1, ?2)",
                    params![id, type_id],
                )
                .context("Failed to link ticket type")?;
        }
        Ok(id)
    }

    pub fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
                map_ticket,
            )
            .optional()
            .context("Failed to query ticket")
    }

    pub fn require_ticket(&self, id: i64) -> Result<Ticket> {
        self.get_ticket(id)?
            .ok_or_else(|| FieldOpsError::not_found("Ticket", id).into())
    }

    pub fn find_ticket_by_ext_id(&self, kind: TicketKind, ext_id: &str) -> Result<Option<Ticket>> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE kind = ?1 AND ext_id = ?2"),
                params![kind.as_str(), ext_id],
                map_ticket,
            )
            .optional()
            .context("Failed to query ticket by ext_id")
    }

    /// Replace the extension blob of a ticket.
    pub fn set_ticket_additional(&self, id: i64, additional: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(additional).context("Failed to serialize ticket extras")?;
        self.conn
            .execute(
                "UPDATE tickets SET additional = ?1 WHERE id = ?2",
                params![raw, id],
            )
            .context("Failed to update ticket extras")?;
        Ok(())
    }

    pub fn list_tickets(&self, query: &TicketQuery) -> Result<Vec<TicketSummary>> {
        let mut sql = String::from(
            "SELECT t.id, t.kind, t.ext_id, c.name, c.mt_id, ci.name, ci.zip, t.address,
                    COALESCE((SELECT GROUP_CONCAT(tt.name, ', ') FROM ticket_ticket_types ttt
                              JOIN ticket_types tt ON tt.id = ttt.ticket_type_id
                              WHERE ttt.ticket_id = t.id), ''),
                    u.username, t.status, t.created_at
             FROM tickets t
             JOIN clients c ON c.id = t.client_id
             JOIN cities ci ON ci.id = t.city_id
             LEFT JOIN users u ON u.id = t.owner_id
             WHERE 1 = 1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        let status_list = |statuses: &[TicketStatus]| {
            statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match query.status {
            StatusFilter::Open | StatusFilter::OwnOpen => {
                sql.push_str(&format!(
                    " AND t.status IN ({})",
                    status_list(&TicketStatus::OPEN)
                ));
            }
            StatusFilter::Closed => {
                sql.push_str(&format!(
                    " AND t.status IN ({})",
                    status_list(&TicketStatus::CLOSED)
                ));
            }
            StatusFilter::All | StatusFilter::OwnAll => {}
        }
        if matches!(query.status, StatusFilter::OwnOpen | StatusFilter::OwnAll) {
            let actor = query
                .actor_id
                .ok_or_else(|| FieldOpsError::Validation("own tickets need an acting user".into()))?;
            sql.push_str(" AND t.owner_id = ?");
            args.push(SqlValue::Integer(actor));
        }
        if let Some(owner_id) = query.owner_id {
            sql.push_str(" AND t.owner_id = ?");
            args.push(SqlValue::Integer(owner_id));
        }
        if let Some(kind) = query.kind {
            sql.push_str(" AND t.kind = ?");
            args.push(SqlValue::Text(kind.as_str().to_string()));
        }
        match query.payoff {
            PayoffFilter::Any => {}
            PayoffFilter::Unsettled => sql.push_str(" AND t.payoff_id IS NULL"),
            PayoffFilter::Payoff(id) => {
                sql.push_str(" AND t.payoff_id = ?");
                args.push(SqlValue::Integer(id));
            }
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let like = format!("%{}%", search.trim());
            sql.push_str(
                " AND (c.name LIKE ? OR c.mt_id LIKE ? OR t.ext_id LIKE ? OR EXISTS (
                    SELECT 1 FROM ticket_ticket_types ttt JOIN ticket_types tt ON tt.id = ttt.ticket_type_id
                    WHERE ttt.ticket_id = t.id AND tt.name LIKE ?))",
            );
            for _ in 0..4 {
                args.push(SqlValue::Text(like.clone()));
            }
        }
        sql.push_str(" ORDER BY t.created_at DESC, t.id DESC");

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tickets")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                let city_name: String = row.get(5)?;
                let zip: i64 = row.get(6)?;
                Ok(TicketSummary {
                    id: row.get(0)?,
                    kind: parse_col(1, row.get(1)?)?,
                    ext_id: row.get(2)?,
                    client_name: row.get(3)?,
                    client_mt_id: row.get(4)?,
                    city: format!("{} ({})", city_name, zip),
                    address: row.get(7)?,
                    ticket_types: row.get(8)?,
                    owner: row.get(9)?,
                    status: parse_col(10, row.get(10)?)?,
                    created_at: row.get(11)?,
                })
            })
            .context("Failed to query tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row.context("Failed to read ticket row")?);
        }
        Ok(tickets)
    }

    pub fn ticket_detail(&self, id: i64) -> Result<Option<TicketDetail>> {
        let ticket = match self.get_ticket(id)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let client = self
            .get_client(ticket.client_id)?
            .context("Ticket client not found")?;
        let city = self.get_city(ticket.city_id)?.context("Ticket city not found")?;
        let ticket_types = self.ticket_type_names(id)?;
        let owner = match ticket.owner_id {
            Some(uid) => self.get_user(uid)?.map(|u| u.username),
            None => None,
        };
        let notes = self.list_notes(NoteTarget::Ticket(id))?;
        let attachments = self.list_attachments(id)?;
        let materials = self.ticket_materials(id)?;
        let work_items = self.ticket_work_items(id)?;
        let devices = self.devices_of(OwnerRef::Client(ticket.client_id))?;
        Ok(Some(TicketDetail {
            ticket,
            client,
            city,
            ticket_types,
            owner,
            notes,
            attachments,
            materials,
            work_items,
            devices,
        }))
    }

    pub fn set_ticket_payoff(&self, id: i64, payoff_id: Option<i64>) -> Result<Ticket> {
        self.conn
            .execute(
                "UPDATE tickets SET payoff_id = ?1 WHERE id = ?2",
                params![payoff_id, id],
            )
            .context("Failed to update ticket payoff")?;
        self.require_ticket(id)
    }

    // ── Notes ─────────────────────────────────────────────────────────

    pub fn create_note(
        &self,
        target: NoteTarget,
        kind: NoteKind,
        remark: &str,
        created_by: i64,
    ) -> Result<Note> {
        self.conn
            .execute(
                "INSERT INTO notes (target_kind, target_id, kind, is_history, remark, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    target.kind_str(),
                    target.id(),
                    kind.as_str(),
                    kind.is_history(),
                    remark,
                    created_by
                ],
            )
            .context("Failed to insert note")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
                params![id],
                map_note,
            )
            .context("Note not found after insert")
    }

    /// Notes of a target, newest first.
    pub fn list_notes(&self, target: NoteTarget) -> Result<Vec<Note>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {NOTE_COLUMNS} FROM notes WHERE target_kind = ?1 AND target_id = ?2
                 ORDER BY created_at DESC, id DESC"
            ))
            .context("Failed to prepare list_notes")?;
        let rows = stmt
            .query_map(params![target.kind_str(), target.id()], map_note)
            .context("Failed to query notes")?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.context("Failed to read note row")?);
        }
        Ok(notes)
    }

    // ── Attachments ───────────────────────────────────────────────────

    /// Store an attachment. `encoded` must already be base64.
    pub fn create_attachment(
        &self,
        ticket_id: i64,
        name: &str,
        encoded: &str,
        remark: Option<&str>,
        created_by: i64,
    ) -> Result<Attachment> {
        self.conn
            .execute(
                "INSERT INTO attachments (ticket_id, name, data, remark, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ticket_id, name, encoded, remark, created_by],
            )
            .context("Failed to insert attachment")?;
        let id = self.conn.last_insert_rowid();
        self.get_attachment(id)?
            .context("Attachment not found after insert")
    }

    pub fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        self.conn
            .query_row(
                "SELECT id, ticket_id, name, remark, created_at, created_by FROM attachments WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Attachment {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        name: row.get(2)?,
                        remark: row.get(3)?,
                        created_at: row.get(4)?,
                        created_by: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query attachment")
    }

    /// Base64 payload of an attachment.
    pub fn get_attachment_data(&self, id: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT data FROM attachments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query attachment data")
    }

    pub fn list_attachments(&self, ticket_id: i64) -> Result<Vec<Attachment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, ticket_id, name, remark, created_at, created_by FROM attachments
                 WHERE ticket_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .context("Failed to prepare list_attachments")?;
        let rows = stmt
            .query_map(params![ticket_id], |row| {
                Ok(Attachment {
                    id: row.get(0)?,
                    ticket_id: row.get(1)?,
                    name: row.get(2)?,
                    remark: row.get(3)?,
                    created_at: row.get(4)?,
                    created_by: row.get(5)?,
                })
            })
            .context("Failed to query attachments")?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row.context("Failed to read attachment row")?);
        }
        Ok(attachments)
    }

    // ── Devices ───────────────────────────────────────────────────────

    pub fn get_or_create_device_type(&self, name: &str) -> Result<DeviceType> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO device_types (name) VALUES (?1)",
                params![name],
            )
            .context("Failed to insert device type")?;
        self.conn
            .query_row(
                "SELECT id, name, sn_pattern, technology FROM device_types WHERE name = ?1",
                params![name],
                |row| {
                    Ok(DeviceType {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        sn_pattern: row.get(2)?,
                        technology: technology_col(3, row.get(3)?)?,
                    })
                },
            )
            .context("Device type not found after insert")
    }

    pub fn create_device(
        &self,
        sn: &str,
        type_id: i64,
        card_sn: Option<&str>,
        remark: Option<&str>,
    ) -> Result<DeviceWithOwner> {
        self.conn
            .execute(
                "INSERT INTO devices (sn, type_id, card_sn, remark) VALUES (?1, ?2, ?3, ?4)",
                params![sn, type_id, card_sn, remark],
            )
            .context("Failed to insert device")?;
        let id = self.conn.last_insert_rowid();
        self.get_device(id)?.context("Device not found after insert")
    }

    pub fn get_device(&self, id: i64) -> Result<Option<DeviceWithOwner>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices d
                     JOIN device_types t ON t.id = d.type_id
                     LEFT JOIN device_owners o ON o.device_id = d.id
                     WHERE d.id = ?1"
                ),
                params![id],
                map_device,
            )
            .optional()
            .context("Failed to query device")
    }

    pub fn require_device(&self, id: i64) -> Result<DeviceWithOwner> {
        self.get_device(id)?
            .ok_or_else(|| FieldOpsError::not_found("Device", id).into())
    }

    /// Devices with a given serial number. Legacy data may hold duplicates.
    pub fn get_devices_by_sn(&self, sn: &str) -> Result<Vec<DeviceWithOwner>> {
        self.query_devices(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices d
                 JOIN device_types t ON t.id = d.type_id
                 LEFT JOIN device_owners o ON o.device_id = d.id
                 WHERE d.sn = ?1 ORDER BY d.id"
            ),
            vec![SqlValue::Text(sn.to_string())],
        )
    }

    /// Devices currently held by an owner, newest first.
    pub fn devices_of(&self, owner: OwnerRef) -> Result<Vec<DeviceWithOwner>> {
        self.query_devices(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices d
                 JOIN device_types t ON t.id = d.type_id
                 JOIN device_owners o ON o.device_id = d.id
                 WHERE o.owner_kind = ?1 AND o.owner_id = ?2
                 ORDER BY d.created_at DESC, d.id DESC"
            ),
            vec![
                SqlValue::Text(owner.kind_str().to_string()),
                SqlValue::Integer(owner.id()),
            ],
        )
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceWithOwner>> {
        self.query_devices(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices d
                 JOIN device_types t ON t.id = d.type_id
                 LEFT JOIN device_owners o ON o.device_id = d.id
                 ORDER BY d.id"
            ),
            Vec::new(),
        )
    }

    fn query_devices(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<DeviceWithOwner>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare device query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), map_device)
            .context("Failed to query devices")?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row.context("Failed to read device row")?);
        }
        Ok(devices)
    }

    // ── Warehouses & stock ────────────────────────────────────────────

    pub fn create_warehouse(&self, name: &str, location: Option<&str>) -> Result<Warehouse> {
        self.conn
            .execute(
                "INSERT INTO warehouses (name, location) VALUES (?1, ?2)",
                params![name, location],
            )
            .context("Failed to insert warehouse")?;
        let id = self.conn.last_insert_rowid();
        self.get_warehouse(id)?
            .context("Warehouse not found after insert")
    }

    pub fn get_warehouse(&self, id: i64) -> Result<Option<Warehouse>> {
        self.conn
            .query_row(
                "SELECT id, name, location, is_active FROM warehouses WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Warehouse {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        location: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query warehouse")
    }

    pub fn require_warehouse(&self, id: i64) -> Result<Warehouse> {
        self.get_warehouse(id)?
            .ok_or_else(|| FieldOpsError::not_found("Warehouse", id).into())
    }

    pub fn list_warehouses(&self) -> Result<Vec<Warehouse>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, location, is_active FROM warehouses ORDER BY name")
            .context("Failed to prepare list_warehouses")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Warehouse {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    location: row.get(2)?,
                    is_active: row.get(3)?,
                })
            })
            .context("Failed to query warehouses")?;
        let mut warehouses = Vec::new();
        for row in rows {
            warehouses.push(row.context("Failed to read warehouse row")?);
        }
        Ok(warehouses)
    }

    pub fn set_warehouse_active(&self, id: i64, is_active: bool) -> Result<Warehouse> {
        self.conn
            .execute(
                "UPDATE warehouses SET is_active = ?1 WHERE id = ?2",
                params![is_active, id],
            )
            .context("Failed to update warehouse")?;
        self.require_warehouse(id)
    }

    pub fn stock_amount(&self, warehouse_id: i64, material_id: i64) -> Result<f64> {
        let amount: Option<f64> = self
            .conn
            .query_row(
                "SELECT amount FROM stock_levels WHERE warehouse_id = ?1 AND material_id = ?2",
                params![warehouse_id, material_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query stock level")?;
        Ok(amount.unwrap_or(0.0))
    }

    /// Add (or with a negative delta, remove) stock. Never lets a level go below zero.
    ///
    /// Levels are kept at `STOCK_PRECISION` so that splitting a level into
    /// several moves does not leave float residue behind.
    pub(crate) fn adjust_stock(&self, warehouse_id: i64, material_id: i64, delta: f64) -> Result<()> {
        let available = self.stock_amount(warehouse_id, material_id)?;
        let level = round_stock(available + delta);
        if level < 0.0 {
            return Err(FieldOpsError::InsufficientStock {
                warehouse_id,
                material_id,
                available,
                requested: -delta,
            }
            .into());
        }
        let updated = self
            .conn
            .execute(
                "UPDATE stock_levels SET amount = ?3 WHERE warehouse_id = ?1 AND material_id = ?2",
                params![warehouse_id, material_id, level],
            )
            .context("Failed to update stock level")?;
        if updated == 0 {
            self.conn
                .execute(
                    "INSERT INTO stock_levels (warehouse_id, material_id, amount) VALUES (?1, ?2, ?3)",
                    params![warehouse_id, material_id, level],
                )
                .context("Failed to insert stock level")?;
        }
        Ok(())
    }

    pub fn stock_of(&self, warehouse_id: i64) -> Result<Vec<StockLevel>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.warehouse_id, s.material_id, m.name, m.unit, s.amount
                 FROM stock_levels s JOIN materials m ON m.id = s.material_id
                 WHERE s.warehouse_id = ?1 ORDER BY m.name",
            )
            .context("Failed to prepare stock_of")?;
        let rows = stmt
            .query_map(params![warehouse_id], |row| {
                Ok(StockLevel {
                    warehouse_id: row.get(0)?,
                    material_id: row.get(1)?,
                    material_name: row.get(2)?,
                    unit: parse_col(3, row.get(3)?)?,
                    amount: row.get(4)?,
                })
            })
            .context("Failed to query stock levels")?;
        let mut levels = Vec::new();
        for row in rows {
            levels.push(row.context("Failed to read stock row")?);
        }
        Ok(levels)
    }

    // ── Materials ─────────────────────────────────────────────────────

    pub fn get_or_create_material_category(&self, name: &str) -> Result<MaterialCategory> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO material_categories (name) VALUES (?1)",
                params![name],
            )
            .context("Failed to insert material category")?;
        self.conn
            .query_row(
                "SELECT id, name, remark FROM material_categories WHERE name = ?1",
                params![name],
                |row| {
                    Ok(MaterialCategory {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        remark: row.get(2)?,
                    })
                },
            )
            .context("Material category not found after insert")
    }

    pub fn create_material(&self, new: &NewMaterial) -> Result<Material> {
        if self.get_material_by_sn(&new.sn)?.is_some() {
            return Err(FieldOpsError::Duplicate {
                entity: "material",
                key: new.sn.clone(),
            }
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO materials (sn, name, price, fav, unit, remark, comes_from, technology, category_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.sn,
                    new.name,
                    new.price,
                    new.fav,
                    new.unit.as_str(),
                    new.remark,
                    new.comes_from.map(|p| p.as_str()),
                    new.technology.code(),
                    new.category_id
                ],
            )
            .context("Failed to insert material")?;
        let id = self.conn.last_insert_rowid();
        self.get_material(id)?.context("Material not found after insert")
    }

    pub fn get_material(&self, id: i64) -> Result<Option<Material>> {
        self.conn
            .query_row(
                &format!("SELECT {MATERIAL_COLUMNS} FROM materials WHERE id = ?1"),
                params![id],
                map_material,
            )
            .optional()
            .context("Failed to query material")
    }

    pub fn get_material_by_sn(&self, sn: &str) -> Result<Option<Material>> {
        self.conn
            .query_row(
                &format!("SELECT {MATERIAL_COLUMNS} FROM materials WHERE sn = ?1"),
                params![sn],
                map_material,
            )
            .optional()
            .context("Failed to query material by sn")
    }

    pub fn list_materials(&self) -> Result<Vec<Material>> {
        self.query_materials(
            &format!("SELECT {MATERIAL_COLUMNS} FROM materials ORDER BY name"),
            Vec::new(),
        )
    }

    /// Materials matching a technology, including the technology-agnostic ones.
    /// Favourites come first.
    pub fn materials_for_technology(&self, technology: Technology) -> Result<Vec<Material>> {
        self.query_materials(
            &format!(
                "SELECT {MATERIAL_COLUMNS} FROM materials
                 WHERE technology = ?1 OR technology = ?2
                 ORDER BY fav DESC, name"
            ),
            vec![
                SqlValue::Integer(technology.code()),
                SqlValue::Integer(Technology::All.code()),
            ],
        )
    }

    fn query_materials(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Material>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare material query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), map_material)
            .context("Failed to query materials")?;
        let mut materials = Vec::new();
        for row in rows {
            materials.push(row.context("Failed to read material row")?);
        }
        Ok(materials)
    }

    pub fn add_ticket_material(
        &self,
        ticket_id: i64,
        material_id: i64,
        amount: f64,
        created_by: i64,
    ) -> Result<TicketMaterial> {
        self.conn
            .execute(
                "INSERT INTO ticket_materials (ticket_id, material_id, amount, created_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ticket_id, material_id, amount, created_by],
            )
            .context("Failed to insert ticket material")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, ticket_id, material_id, amount, created_at, created_by
                 FROM ticket_materials WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TicketMaterial {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        material_id: row.get(2)?,
                        amount: row.get(3)?,
                        created_at: row.get(4)?,
                        created_by: row.get(5)?,
                    })
                },
            )
            .context("Ticket material not found after insert")
    }

    pub fn ticket_materials(&self, ticket_id: i64) -> Result<Vec<TicketMaterialLine>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tm.id, tm.ticket_id, tm.material_id, tm.amount, tm.created_at, tm.created_by,
                        m.name, mc.name, m.unit, m.comes_from
                 FROM ticket_materials tm
                 JOIN materials m ON m.id = tm.material_id
                 JOIN material_categories mc ON mc.id = m.category_id
                 WHERE tm.ticket_id = ?1 ORDER BY tm.created_at DESC, tm.id DESC",
            )
            .context("Failed to prepare ticket_materials")?;
        let rows = stmt
            .query_map(params![ticket_id], |row| {
                let comes_from: Option<String> = row.get(9)?;
                Ok(TicketMaterialLine {
                    line: TicketMaterial {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        material_id: row.get(2)?,
                        amount: row.get(3)?,
                        created_at: row.get(4)?,
                        created_by: row.get(5)?,
                    },
                    material_name: row.get(6)?,
                    category: row.get(7)?,
                    unit: parse_col(8, row.get(8)?)?,
                    comes_from: comes_from.map(|c| parse_col(9, c)).transpose()?,
                })
            })
            .context("Failed to query ticket materials")?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row.context("Failed to read ticket material row")?);
        }
        Ok(lines)
    }

    // ── Work items ────────────────────────────────────────────────────

    pub fn create_work_item(&self, new: &NewWorkItem) -> Result<WorkItem> {
        self.conn
            .execute(
                "INSERT INTO work_items (name, art_number, remark, art_price, bulk_price, given_price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.name,
                    new.art_number,
                    new.remark,
                    new.art_price,
                    new.bulk_price,
                    new.given_price
                ],
            )
            .context("Failed to insert work item")?;
        let id = self.conn.last_insert_rowid();
        self.get_work_item(id)?
            .context("Work item not found after insert")
    }

    pub fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
        self.conn
            .query_row(
                "SELECT id, name, art_number, remark, art_price, bulk_price, given_price
                 FROM work_items WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorkItem {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        art_number: row.get(2)?,
                        remark: row.get(3)?,
                        art_price: row.get(4)?,
                        bulk_price: row.get(5)?,
                        given_price: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query work item")
    }

    pub fn list_work_items(&self) -> Result<Vec<WorkItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, art_number, remark, art_price, bulk_price, given_price
                 FROM work_items ORDER BY art_number, name",
            )
            .context("Failed to prepare list_work_items")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WorkItem {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    art_number: row.get(2)?,
                    remark: row.get(3)?,
                    art_price: row.get(4)?,
                    bulk_price: row.get(5)?,
                    given_price: row.get(6)?,
                })
            })
            .context("Failed to query work items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read work item row")?);
        }
        Ok(items)
    }

    pub fn add_ticket_work_item(
        &self,
        ticket_id: i64,
        work_item_id: i64,
        amount: f64,
        created_by: i64,
    ) -> Result<TicketWorkItem> {
        self.conn
            .execute(
                "INSERT INTO ticket_work_items (ticket_id, work_item_id, amount, created_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ticket_id, work_item_id, amount, created_by],
            )
            .context("Failed to insert ticket work item")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, ticket_id, work_item_id, amount, created_at, created_by
                 FROM ticket_work_items WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TicketWorkItem {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        work_item_id: row.get(2)?,
                        amount: row.get(3)?,
                        created_at: row.get(4)?,
                        created_by: row.get(5)?,
                    })
                },
            )
            .context("Ticket work item not found after insert")
    }

    pub fn ticket_work_items(&self, ticket_id: i64) -> Result<Vec<TicketWorkItemLine>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tw.id, tw.ticket_id, tw.work_item_id, tw.amount, tw.created_at, tw.created_by,
                        w.name, w.art_number, w.bulk_price, w.given_price
                 FROM ticket_work_items tw JOIN work_items w ON w.id = tw.work_item_id
                 WHERE tw.ticket_id = ?1 ORDER BY tw.created_at DESC, tw.id DESC",
            )
            .context("Failed to prepare ticket_work_items")?;
        let rows = stmt
            .query_map(params![ticket_id], |row| {
                Ok(TicketWorkItemLine {
                    line: TicketWorkItem {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        work_item_id: row.get(2)?,
                        amount: row.get(3)?,
                        created_at: row.get(4)?,
                        created_by: row.get(5)?,
                    },
                    name: row.get(6)?,
                    art_number: row.get(7)?,
                    bulk_price: row.get(8)?,
                    given_price: row.get(9)?,
                })
            })
            .context("Failed to query ticket work items")?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row.context("Failed to read ticket work item row")?);
        }
        Ok(lines)
    }

    // ── Movements (rows only; rules live in `movement`) ───────────────

    pub fn get_movement(&self, id: i64) -> Result<Option<MaterialMovement>> {
        self.conn
            .query_row(
                &format!("SELECT {MOVEMENT_COLUMNS} FROM material_movements WHERE id = ?1"),
                params![id],
                map_movement,
            )
            .optional()
            .context("Failed to query movement")
    }

    pub fn movement_items(&self, movement_id: i64) -> Result<Vec<MovementItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT device_id, material_id, amount FROM movement_items
                 WHERE movement_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare movement_items")?;
        let rows = stmt
            .query_map(params![movement_id], |row| {
                let device_id: Option<i64> = row.get(0)?;
                let material_id: Option<i64> = row.get(1)?;
                let amount: Option<f64> = row.get(2)?;
                Ok((device_id, material_id, amount))
            })
            .context("Failed to query movement items")?;
        let mut items = Vec::new();
        for row in rows {
            let (device_id, material_id, amount) =
                row.context("Failed to read movement item row")?;
            let item = match (device_id, material_id) {
                (Some(device_id), _) => MovementItem::Device { device_id },
                (None, Some(material_id)) => MovementItem::Material {
                    material_id,
                    amount: amount.unwrap_or(0.0),
                },
                (None, None) => anyhow::bail!("Movement item without device or material"),
            };
            items.push(item);
        }
        Ok(items)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Database with one admin, one technician, a client and an open ticket.
    pub(crate) struct Fixture {
        pub db: FieldDb,
        pub admin: User,
        pub tech: User,
        pub client: Client,
        pub ticket: Ticket,
    }

    pub(crate) fn fixture() -> Result<Fixture> {
        let db = FieldDb::new_in_memory()?;
        let admin = db.create_user("admin", "Office Admin", UserRole::Admin)?;
        let tech = db.create_user("kovacs", "Kovács Béla", UserRole::Technician)?;
        let city = db.get_or_create_city("Szeged", 6720)?;
        let client = db.create_client("MT-100", "Nagy Anna", city.id, "Fő utca 1", "+3630", admin.id)?;
        let ticket_type = db.get_or_create_ticket_type("Internet installation")?;
        let ticket = db.create_ticket(
            &NewTicket {
                kind: TicketKind::Installation,
                ext_id: "EXT-1".into(),
                client_id: client.id,
                city_id: city.id,
                address: "Fő utca 1".into(),
                technology: Technology::Optical,
                additional: Map::new(),
                created_at: None,
                ticket_type_ids: vec![ticket_type.id],
            },
            admin.id,
        )?;
        Ok(Fixture {
            db,
            admin,
            tech,
            client,
            ticket,
        })
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('tickets', 'devices', 'device_owners', 'stock_levels')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 4);
        // Re-running migrations is harmless.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_file_database_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fieldops.db");
        {
            let db = FieldDb::new(&path)?;
            db.create_user("kovacs", "", UserRole::Technician)?;
        }
        let db = FieldDb::new(&path)?;
        assert!(db.get_user_by_username("kovacs")?.is_some());
        Ok(())
    }

    #[test]
    fn test_create_ticket_starts_new_without_history() -> Result<()> {
        let f = fixture()?;
        assert_eq!(f.ticket.status, TicketStatus::New);
        assert!(f.ticket.owner_id.is_none());
        assert!(f.ticket.closed_at.is_none());
        assert!(f.db.list_notes(NoteTarget::Ticket(f.ticket.id))?.is_empty());
        assert_eq!(
            f.db.ticket_type_names(f.ticket.id)?,
            vec!["Internet installation".to_string()]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_ext_id_is_rejected_per_kind() -> Result<()> {
        let f = fixture()?;
        let mut new = NewTicket {
            kind: TicketKind::Installation,
            ext_id: "EXT-1".into(),
            client_id: f.client.id,
            city_id: f.client.city_id,
            address: "x".into(),
            technology: Technology::All,
            additional: Map::new(),
            created_at: None,
            ticket_type_ids: vec![],
        };
        let err = f.db.create_ticket(&new, f.admin.id).unwrap_err();
        assert!(err.to_string().contains("duplicate ticket"));

        // Same external id on an uninstall ticket is a different ticket.
        new.kind = TicketKind::Uninstallation;
        let other = f.db.create_ticket(&new, f.admin.id)?;
        assert_eq!(other.kind, TicketKind::Uninstallation);
        Ok(())
    }

    #[test]
    fn test_get_or_create_city_is_idempotent() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let a = db.get_or_create_city("Pécs", 7600)?;
        let b = db.get_or_create_city("Pécs", 7600)?;
        let c = db.get_or_create_city("Pécs", 7621)?;
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.to_string(), "Pécs (7600)");
        Ok(())
    }

    #[test]
    fn test_list_tickets_filters() -> Result<()> {
        let f = fixture()?;
        let open = f.db.list_tickets(&TicketQuery::default())?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_name, "Nagy Anna");
        assert_eq!(open[0].city, "Szeged (6720)");
        assert_eq!(open[0].ticket_types, "Internet installation");

        let closed = f.db.list_tickets(&TicketQuery {
            status: StatusFilter::Closed,
            ..Default::default()
        })?;
        assert!(closed.is_empty());

        let found = f.db.list_tickets(&TicketQuery {
            status: StatusFilter::All,
            search: Some("MT-1".into()),
            ..Default::default()
        })?;
        assert_eq!(found.len(), 1);

        let by_type = f.db.list_tickets(&TicketQuery {
            search: Some("installation".into()),
            ..Default::default()
        })?;
        assert_eq!(by_type.len(), 1);

        let unsettled = f.db.list_tickets(&TicketQuery {
            payoff: PayoffFilter::Unsettled,
            ..Default::default()
        })?;
        assert_eq!(unsettled.len(), 1);

        let payoff = f.db.create_payoff("2024 March")?;
        f.db.set_ticket_payoff(f.ticket.id, Some(payoff.id))?;
        let settled = f.db.list_tickets(&TicketQuery {
            payoff: PayoffFilter::Payoff(payoff.id),
            ..Default::default()
        })?;
        assert_eq!(settled.len(), 1);
        let unsettled = f.db.list_tickets(&TicketQuery {
            payoff: PayoffFilter::Unsettled,
            ..Default::default()
        })?;
        assert!(unsettled.is_empty());
        Ok(())
    }

    #[test]
    fn test_own_filter_requires_actor() -> Result<()> {
        let f = fixture()?;
        let result = f.db.list_tickets(&TicketQuery {
            status: StatusFilter::OwnOpen,
            ..Default::default()
        });
        assert!(result.is_err());

        let mine = f.db.list_tickets(&TicketQuery {
            status: StatusFilter::OwnOpen,
            actor_id: Some(f.tech.id),
            ..Default::default()
        })?;
        assert!(mine.is_empty());
        Ok(())
    }

    #[test]
    fn test_stock_never_goes_negative() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let wh = db.create_warehouse("Central", None)?;
        let cat = db.get_or_create_material_category("Cables")?;
        let mat = db.create_material(&NewMaterial {
            sn: "100".into(),
            name: "UTP cable".into(),
            price: 120,
            fav: false,
            unit: Unit::M,
            remark: None,
            comes_from: Some(Provider::Mt),
            technology: Technology::Copper,
            category_id: cat.id,
        })?;
        db.adjust_stock(wh.id, mat.id, 10.0)?;
        db.adjust_stock(wh.id, mat.id, -4.0)?;
        assert_eq!(db.stock_amount(wh.id, mat.id)?, 6.0);
        let err = db.adjust_stock(wh.id, mat.id, -7.0).unwrap_err();
        assert!(err.to_string().contains("Insufficient stock"));
        assert_eq!(db.stock_amount(wh.id, mat.id)?, 6.0);
        Ok(())
    }

    #[test]
    fn test_stock_splits_into_fractional_moves_without_drift() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let wh = db.create_warehouse("Central", None)?;
        let cat = db.get_or_create_material_category("Cables")?;
        let mat = db.create_material(&NewMaterial {
            sn: "101".into(),
            name: "Fiber patch".into(),
            price: 40,
            fav: false,
            unit: Unit::M,
            remark: None,
            comes_from: None,
            technology: Technology::Optical,
            category_id: cat.id,
        })?;
        db.adjust_stock(wh.id, mat.id, 0.3)?;
        db.adjust_stock(wh.id, mat.id, -0.1)?;
        assert_eq!(db.stock_amount(wh.id, mat.id)?, 0.2);
        db.adjust_stock(wh.id, mat.id, -0.2)?;
        assert_eq!(db.stock_amount(wh.id, mat.id)?, 0.0);
        assert!(db.adjust_stock(wh.id, mat.id, -0.1).is_err());
        Ok(())
    }

    #[test]
    fn test_materials_for_technology_includes_all_and_favourites_first() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let cat = db.get_or_create_material_category("Misc")?;
        let mk = |sn: &str, name: &str, tech: Technology, fav: bool| NewMaterial {
            sn: sn.into(),
            name: name.into(),
            price: 0,
            fav,
            unit: Unit::Db,
            remark: None,
            comes_from: None,
            technology: tech,
            category_id: cat.id,
        };
        db.create_material(&mk("1", "Anchor", Technology::All, false))?;
        db.create_material(&mk("2", "Splice", Technology::Optical, false))?;
        db.create_material(&mk("3", "Connector", Technology::Optical, true))?;
        db.create_material(&mk("4", "F plug", Technology::Coax, false))?;

        let names: Vec<String> = db
            .materials_for_technology(Technology::Optical)?
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Connector", "Anchor", "Splice"]);
        Ok(())
    }

    #[test]
    fn test_ticket_detail_collects_related_rows() -> Result<()> {
        let f = fixture()?;
        f.db.create_note(NoteTarget::Ticket(f.ticket.id), NoteKind::Comment, "call first", f.admin.id)?;
        f.db.create_attachment(f.ticket.id, "photo.png", "aGVsbG8=", None, f.tech.id)?;
        let cat = f.db.get_or_create_material_category("Cables")?;
        let mat = f.db.create_material(&NewMaterial {
            sn: "55".into(),
            name: "Patch cord".into(),
            price: 900,
            fav: true,
            unit: Unit::Db,
            remark: None,
            comes_from: None,
            technology: Technology::Optical,
            category_id: cat.id,
        })?;
        f.db.add_ticket_material(f.ticket.id, mat.id, 2.0, f.tech.id)?;

        let detail = f.db.ticket_detail(f.ticket.id)?.expect("detail should exist");
        assert_eq!(detail.client.mt_id, "MT-100");
        assert_eq!(detail.notes.len(), 1);
        assert!(!detail.notes[0].is_history);
        assert_eq!(detail.attachments.len(), 1);
        assert!(detail.attachments[0].is_image());
        assert_eq!(detail.materials[0].category, "Cables");
        assert_eq!(detail.materials[0].line.amount, 2.0);
        assert!(f.db.ticket_detail(999)?.is_none());
        Ok(())
    }
}
