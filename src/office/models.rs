use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Owner name used in history remarks when nobody holds a ticket or device.
pub const NO_OWNER: &str = "None";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Technician,
    NetworkTechnician,
    UninstallTechnician,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Technician => "technician",
            Self::NetworkTechnician => "network_technician",
            Self::UninstallTechnician => "uninstall_technician",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "technician" => Ok(Self::Technician),
            "network_technician" => Ok(Self::NetworkTechnician),
            "uninstall_technician" => Ok(Self::UninstallTechnician),
            _ => Err(format!("Invalid user role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub role: UserRole,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    pub name: String,
    pub zip: i64,
    pub primer: Option<String>,
    pub onuk: Option<String>,
}

impl std::fmt::Display for City {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.zip)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub mt_id: String,
    pub name: String,
    pub city_id: i64,
    pub address: String,
    pub phone: String,
    pub created_at: String,
    pub created_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketType {
    pub id: i64,
    pub name: String,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payoff {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    Installation,
    Uninstallation,
    Network,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installation => "installation",
            Self::Uninstallation => "uninstallation",
            Self::Network => "network",
        }
    }
}

impl FromStr for TicketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installation" => Ok(Self::Installation),
            "uninstallation" => Ok(Self::Uninstallation),
            "network" => Ok(Self::Network),
            _ => Err(format!("Invalid ticket kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Assigned,
    InProgress,
    ClosedDone,
    ClosedUnsuccessful,
    Duplicate,
}

impl TicketStatus {
    pub const OPEN: [TicketStatus; 3] = [Self::New, Self::Assigned, Self::InProgress];
    pub const CLOSED: [TicketStatus; 3] =
        [Self::ClosedDone, Self::ClosedUnsuccessful, Self::Duplicate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::ClosedDone => "closed_done",
            Self::ClosedUnsuccessful => "closed_unsuccessful",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "closed_done" => Ok(Self::ClosedDone),
            "closed_unsuccessful" => Ok(Self::ClosedUnsuccessful),
            "duplicate" => Ok(Self::Duplicate),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

/// Network technology a ticket, device type or material belongs to.
/// `All` matches every technology when suggesting materials.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    #[default]
    All,
    Copper,
    Coax,
    Optical,
    Sat,
}

impl Technology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Copper => "copper",
            Self::Coax => "coax",
            Self::Optical => "optical",
            Self::Sat => "sat",
        }
    }

    /// Stable numeric code stored in the database.
    pub fn code(&self) -> i64 {
        match self {
            Self::All => 0,
            Self::Copper => 1,
            Self::Coax => 2,
            Self::Optical => 3,
            Self::Sat => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, String> {
        match code {
            0 => Ok(Self::All),
            1 => Ok(Self::Copper),
            2 => Ok(Self::Coax),
            3 => Ok(Self::Optical),
            4 => Ok(Self::Sat),
            _ => Err(format!("Invalid technology code: {}", code)),
        }
    }
}

impl FromStr for Technology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "copper" => Ok(Self::Copper),
            "coax" => Ok(Self::Coax),
            "optical" => Ok(Self::Optical),
            "sat" => Ok(Self::Sat),
            _ => Err(format!("Invalid technology: {}", s)),
        }
    }
}

/// Well-known keys of the free-form `additional` JSON object on a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketExtra {
    CollectableMoney,
    Remarks,
    Phone2,
}

impl TicketExtra {
    pub fn key(&self) -> &'static str {
        match self {
            Self::CollectableMoney => "collectable_money",
            Self::Remarks => "remarks",
            Self::Phone2 => "phone2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub kind: TicketKind,
    pub ext_id: String,
    pub client_id: i64,
    pub city_id: i64,
    pub address: String,
    pub owner_id: Option<i64>,
    pub status: TicketStatus,
    pub technology: Technology,
    pub additional: Map<String, Value>,
    pub payoff_id: Option<i64>,
    pub created_at: String,
    pub created_by: i64,
    pub closed_at: Option<String>,
}

impl Ticket {
    pub fn extra(&self, key: TicketExtra) -> Option<&Value> {
        self.additional.get(key.key())
    }

    pub fn set_extra(&mut self, key: TicketExtra, value: impl Into<Value>) {
        self.additional.insert(key.key().to_string(), value.into());
    }
}

/// Everything the ticket page shows in one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDetail {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub client: Client,
    pub city: City,
    pub ticket_types: Vec<String>,
    pub owner: Option<String>,
    pub notes: Vec<Note>,
    pub attachments: Vec<Attachment>,
    pub materials: Vec<TicketMaterialLine>,
    pub work_items: Vec<TicketWorkItemLine>,
    pub devices: Vec<DeviceWithOwner>,
}

/// Row of the ticket list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSummary {
    pub id: i64,
    pub kind: TicketKind,
    pub ext_id: String,
    pub client_name: String,
    pub client_mt_id: String,
    pub city: String,
    pub address: String,
    pub ticket_types: String,
    pub owner: Option<String>,
    pub status: TicketStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Comment,
    OwnerChange,
    StatusChange,
    Document,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::OwnerChange => "owner_change",
            Self::StatusChange => "status_change",
            Self::Document => "document",
        }
    }

    /// History notes are generated by the system, comments are typed by people.
    pub fn is_history(&self) -> bool {
        !matches!(self, Self::Comment)
    }
}

impl FromStr for NoteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comment" => Ok(Self::Comment),
            "owner_change" => Ok(Self::OwnerChange),
            "status_change" => Ok(Self::StatusChange),
            "document" => Ok(Self::Document),
            _ => Err(format!("Invalid note kind: {}", s)),
        }
    }
}

/// Generic reference to whatever a note is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NoteTarget {
    Ticket(i64),
    Device(i64),
    Client(i64),
    Movement(i64),
}

impl NoteTarget {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Ticket(_) => "ticket",
            Self::Device(_) => "device",
            Self::Client(_) => "client",
            Self::Movement(_) => "movement",
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            Self::Ticket(id) | Self::Device(id) | Self::Client(id) | Self::Movement(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self, String> {
        match kind {
            "ticket" => Ok(Self::Ticket(id)),
            "device" => Ok(Self::Device(id)),
            "client" => Ok(Self::Client(id)),
            "movement" => Ok(Self::Movement(id)),
            _ => Err(format!("Invalid note target: {}", kind)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub target: NoteTarget,
    pub kind: NoteKind,
    pub is_history: bool,
    pub remark: String,
    pub created_at: String,
    pub created_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub ticket_id: i64,
    pub name: String,
    pub remark: Option<String>,
    pub created_at: String,
    pub created_by: i64,
}

impl Attachment {
    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.name)
    }

    pub fn is_image(&self) -> bool {
        self.content_type().starts_with("image/")
    }
}

/// Content type served for an attachment name. Anything outside the known
/// extensions is served as HTML since most of them are ticket printouts.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        _ => "text/html",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: i64,
    pub name: String,
    pub sn_pattern: Option<String>,
    pub technology: Technology,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub sn: String,
    pub card_sn: Option<String>,
    pub type_id: i64,
    pub connected_device_id: Option<i64>,
    pub valid: bool,
    pub remark: Option<String>,
    pub returned_at: Option<String>,
    pub created_at: String,
}

/// Current custodian of a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    Technician(i64),
    Client(i64),
    Warehouse(i64),
}

impl OwnerRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Technician(_) => "technician",
            Self::Client(_) => "client",
            Self::Warehouse(_) => "warehouse",
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            Self::Technician(id) | Self::Client(id) | Self::Warehouse(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self, String> {
        match kind {
            "technician" => Ok(Self::Technician(id)),
            "client" => Ok(Self::Client(id)),
            "warehouse" => Ok(Self::Warehouse(id)),
            _ => Err(format!("Invalid owner kind: {}", kind)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceWithOwner {
    #[serde(flatten)]
    pub device: Device,
    pub type_name: String,
    pub owner: Option<OwnerRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLevel {
    pub warehouse_id: i64,
    pub material_id: i64,
    pub material_name: String,
    pub unit: Unit,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialCategory {
    pub id: i64,
    pub name: String,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Db,
    M,
    Km,
    Klt,
    Csom,
    Kg,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::M => "m",
            Self::Km => "km",
            Self::Klt => "klt",
            Self::Csom => "csom",
            Self::Kg => "kg",
        }
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "db" => Ok(Self::Db),
            "m" => Ok(Self::M),
            "km" => Ok(Self::Km),
            "klt" => Ok(Self::Klt),
            "csom" => Ok(Self::Csom),
            "kg" => Ok(Self::Kg),
            _ => Err(format!("Invalid unit: {}", s)),
        }
    }
}

/// Who supplies a material: the telecom operator or the contractor's own stock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Mt,
    Contractor,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mt => "mt",
            Self::Contractor => "contractor",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mt" => Ok(Self::Mt),
            "contractor" => Ok(Self::Contractor),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: i64,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMaterial {
    pub id: i64,
    pub ticket_id: i64,
    pub material_id: i64,
    pub amount: f64,
    pub created_at: String,
    pub created_by: i64,
}

/// Material consumption line as shown on the ticket page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMaterialLine {
    #[serde(flatten)]
    pub line: TicketMaterial,
    pub material_name: String,
    pub category: String,
    pub unit: Unit,
    pub comes_from: Option<Provider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub name: String,
    pub art_number: String,
    pub remark: Option<String>,
    pub art_price: i64,
    pub bulk_price: i64,
    pub given_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketWorkItem {
    pub id: i64,
    pub ticket_id: i64,
    pub work_item_id: i64,
    pub amount: f64,
    pub created_at: String,
    pub created_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketWorkItemLine {
    #[serde(flatten)]
    pub line: TicketWorkItem,
    pub name: String,
    pub art_number: String,
    pub bulk_price: i64,
    pub given_price: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MovementStatus {
    Draft,
    Finalized,
}

impl MovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Finalized => "finalized",
        }
    }
}

impl FromStr for MovementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("Invalid movement status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MovementItem {
    Device { device_id: i64 },
    Material { material_id: i64, amount: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialMovement {
    pub id: i64,
    pub source_warehouse_id: i64,
    pub target_warehouse_id: i64,
    pub status: MovementStatus,
    pub remark: Option<String>,
    pub created_at: String,
    pub created_by: i64,
    pub finalized_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementDetail {
    #[serde(flatten)]
    pub movement: MaterialMovement,
    pub items: Vec<MovementItem>,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDetail {
    #[serde(flatten)]
    pub client: Client,
    pub city: City,
    pub tickets: Vec<TicketSummary>,
    pub devices: Vec<DeviceWithOwner>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_status_round_trip_and_openness() {
        for status in TicketStatus::OPEN.iter().chain(TicketStatus::CLOSED.iter()) {
            assert_eq!(TicketStatus::from_str(status.as_str()).unwrap(), *status);
        }
        assert!(TicketStatus::New.is_open());
        assert!(TicketStatus::InProgress.is_open());
        assert!(TicketStatus::Duplicate.is_closed());
        assert!(TicketStatus::from_str("Lezárva").is_err());
    }

    #[test]
    fn test_content_type_for_known_and_unknown_extensions() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("scan.png"), "image/png");
        assert_eq!(content_type_for("report.pdf"), "application/pdf");
        assert_eq!(content_type_for("ticket.htm"), "text/html");
        assert_eq!(content_type_for("no_extension"), "text/html");
        assert_eq!(content_type_for("archive.zip"), "text/html");
        assert_eq!(content_type_for("notes.txt"), "text/html");
        assert_eq!(content_type_for("anim.gif"), "text/html");
    }

    #[test]
    fn test_ticket_extra_reads_and_writes_additional_blob() {
        let mut ticket = Ticket {
            id: 1,
            kind: TicketKind::Installation,
            ext_id: "T-1".into(),
            client_id: 1,
            city_id: 1,
            address: "Main 1".into(),
            owner_id: None,
            status: TicketStatus::New,
            technology: Technology::All,
            additional: Map::new(),
            payoff_id: None,
            created_at: String::new(),
            created_by: 1,
            closed_at: None,
        };
        assert!(ticket.extra(TicketExtra::CollectableMoney).is_none());
        ticket.set_extra(TicketExtra::CollectableMoney, "12000");
        assert_eq!(
            ticket.extra(TicketExtra::CollectableMoney),
            Some(&Value::from("12000"))
        );
    }

    #[test]
    fn test_owner_ref_serializes_with_kind_and_id() {
        let owner = OwnerRef::Warehouse(7);
        let json = serde_json::to_value(owner).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "warehouse", "id": 7}));
        assert_eq!(OwnerRef::from_parts("warehouse", 7).unwrap(), owner);
        assert!(OwnerRef::from_parts("garage", 7).is_err());
    }

    #[test]
    fn test_technology_codes() {
        for tech in [
            Technology::All,
            Technology::Copper,
            Technology::Coax,
            Technology::Optical,
            Technology::Sat,
        ] {
            assert_eq!(Technology::from_code(tech.code()).unwrap(), tech);
        }
        assert!(Technology::from_code(9).is_err());
    }
}
