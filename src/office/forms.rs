//! Input validation for everything users and field clients submit, plus the
//! default associations applied on save (`created_by`, device custody).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::db::{FieldDb, NewTicket};
use super::models::*;
use crate::errors::FieldOpsError;

/// Keys every field-client ticket payload must carry.
pub const REQUIRED_TICKET_KEYS: [&str; 9] = [
    "city", "zip", "street", "house_num", "name1", "phone1", "mt_id", "task_type", "ticket_id",
];

static BASE64_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z0-9+/]{4}){2,}(?:[A-Za-z0-9+/]{2}[AEIMQUYcgkosw048]=|[A-Za-z0-9+/][AQgw]==)",
    )
    .unwrap()
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize a spreadsheet cell: collapse whitespace, drop the space before
/// commas, strip quotes, and capitalize text that starts lowercase.
pub fn clean_text(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let cleaned = collapsed
        .replace(" ,", ",")
        .trim()
        .trim_matches('"')
        .trim()
        .to_string();
    match cleaned.chars().next() {
        Some(first) if first.is_ascii_lowercase() => {
            let mut out = first.to_ascii_uppercase().to_string();
            out.push_str(&cleaned[first.len_utf8()..].to_lowercase());
            out
        }
        _ => cleaned,
    }
}

/// Attachment payloads arrive either base64 encoded or as raw text. Short
/// words like `test` decode too, so the shape check comes first.
pub fn looks_base64(data: &str) -> bool {
    let data = data.trim();
    BASE64_LIKE.is_match(data) && STANDARD.decode(data).is_ok()
}

pub fn encode_attachment(data: &str) -> String {
    if looks_base64(data) {
        data.to_string()
    } else {
        STANDARD.encode(data.as_bytes())
    }
}

pub fn decode_attachment(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .context("Attachment data is not valid base64")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicePayload {
    pub sn: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub card_sn: Option<String>,
}

/// Ticket as sent by the field mail processor.
#[derive(Debug, Clone)]
pub struct CreateTicketPayload {
    pub ticket_id: String,
    pub city: String,
    pub zip: i64,
    pub street: String,
    pub house_num: String,
    pub name1: String,
    pub phone1: String,
    pub mt_id: String,
    pub task_types: Vec<String>,
    pub mail_date: Option<String>,
    pub remarks: Option<String>,
    pub collectable_money: Option<Value>,
    pub devices: Vec<DevicePayload>,
    pub html: Option<String>,
    pub attachments: BTreeMap<String, String>,
}

fn text_field(data: &Map<String, Value>, key: &str) -> Result<String, FieldOpsError> {
    match data.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FieldOpsError::Validation(format!("'{}' must be text", key))),
    }
}

fn optional_text(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

impl CreateTicketPayload {
    pub fn parse(data: &Value) -> Result<Self, FieldOpsError> {
        let data = data
            .as_object()
            .ok_or_else(|| FieldOpsError::Validation("payload must be a JSON object".into()))?;

        let mut missing: Vec<String> = REQUIRED_TICKET_KEYS
            .iter()
            .filter(|k| !data.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(FieldOpsError::MissingKeys(missing));
        }

        let zip = match &data["zip"] {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| FieldOpsError::Validation("'zip' must be a number".into()))?;

        let task_types = match data.get("task_type_list") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => vec![text_field(data, "task_type")?],
        };

        let devices = match data.get("devices") {
            Some(devices) => serde_json::from_value(devices.clone())
                .map_err(|e| FieldOpsError::Validation(format!("invalid devices: {}", e)))?,
            None => Vec::new(),
        };

        let attachments = match data.get("attachments") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(name, content)| {
                    content
                        .as_str()
                        .map(|c| (name.clone(), c.to_string()))
                        .ok_or_else(|| {
                            FieldOpsError::Validation(format!("attachment '{}' must be text", name))
                        })
                })
                .collect::<Result<_, _>>()?,
            _ => BTreeMap::new(),
        };

        let collectable_money = match data.get("collectable_money") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v.clone()),
        };

        Ok(Self {
            ticket_id: text_field(data, "ticket_id")?,
            city: text_field(data, "city")?,
            zip,
            street: text_field(data, "street")?,
            house_num: text_field(data, "house_num")?,
            name1: text_field(data, "name1")?,
            phone1: text_field(data, "phone1")?,
            mt_id: text_field(data, "mt_id")?,
            task_types,
            mail_date: optional_text(data, "mail_date"),
            remarks: optional_text(data, "remarks"),
            collectable_money,
            devices,
            html: optional_text(data, "html"),
            attachments,
        })
    }

    pub fn address(&self) -> String {
        format!("{} {}", self.street, self.house_num)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentUpload {
    pub ticket_id: i64,
    pub name: String,
    pub data: String,
    #[serde(default)]
    pub remark: Option<String>,
}

impl AttachmentUpload {
    pub fn validate(&self) -> Result<(), FieldOpsError> {
        if self.name.trim().is_empty() {
            return Err(FieldOpsError::Validation("attachment name is required".into()));
        }
        if self.data.is_empty() {
            return Err(FieldOpsError::Validation("attachment data is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketMaterialForm {
    pub material_id: i64,
    pub amount: f64,
}

impl TicketMaterialForm {
    pub fn validate(&self) -> Result<(), FieldOpsError> {
        if self.amount <= 0.0 {
            return Err(FieldOpsError::Validation("amount must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketWorkItemForm {
    pub work_item_id: i64,
    #[serde(default = "one")]
    pub amount: f64,
}

fn one() -> f64 {
    1.0
}

impl TicketWorkItemForm {
    pub fn validate(&self) -> Result<(), FieldOpsError> {
        if self.amount <= 0.0 {
            return Err(FieldOpsError::Validation("amount must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceForm {
    pub sn: String,
    pub type_name: String,
    #[serde(default)]
    pub card_sn: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub owner: Option<OwnerRef>,
}

impl DeviceForm {
    pub fn validate(&self) -> Result<(), FieldOpsError> {
        if self.sn.trim().is_empty() {
            return Err(FieldOpsError::Validation("serial number is required".into()));
        }
        if self.type_name.trim().is_empty() {
            return Err(FieldOpsError::Validation("device type is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteForm {
    pub remark: String,
}

impl NoteForm {
    pub fn validate(&self) -> Result<(), FieldOpsError> {
        if self.remark.trim().is_empty() {
            return Err(FieldOpsError::Validation("remark is required".into()));
        }
        Ok(())
    }
}

impl FieldDb {
    /// Create a ticket from a field-client payload together with its client,
    /// city, ticket types, notes, devices and attachments. Returns the new id.
    pub fn intake_ticket(
        &self,
        kind: TicketKind,
        payload: &CreateTicketPayload,
        actor: i64,
    ) -> Result<i64> {
        if self.find_ticket_by_ext_id(kind, &payload.ticket_id)?.is_some() {
            return Err(FieldOpsError::Duplicate {
                entity: "ticket",
                key: payload.ticket_id.clone(),
            }
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let city = self.get_or_create_city(&payload.city, payload.zip)?;
        let address = payload.address();
        let client = match self.get_client_by_mt_id(&payload.mt_id)? {
            Some(client) => client,
            None => self.create_client(
                &payload.mt_id,
                &payload.name1,
                city.id,
                &address,
                &payload.phone1,
                actor,
            )?,
        };

        let mut ticket_type_ids = Vec::with_capacity(payload.task_types.len());
        for name in &payload.task_types {
            ticket_type_ids.push(self.get_or_create_ticket_type(name)?.id);
        }

        let mut additional = Map::new();
        if let Some(money) = &payload.collectable_money {
            additional.insert(TicketExtra::CollectableMoney.key().to_string(), money.clone());
        }
        let ticket_id = self.insert_ticket(
            &NewTicket {
                kind,
                ext_id: payload.ticket_id.clone(),
                client_id: client.id,
                city_id: city.id,
                address,
                technology: Technology::All,
                additional,
                created_at: payload.mail_date.clone(),
                ticket_type_ids,
            },
            actor,
        )?;
        let ticket = self.require_ticket(ticket_id)?;

        if let Some(remarks) = &payload.remarks {
            self.create_note(NoteTarget::Ticket(ticket.id), NoteKind::Comment, remarks, actor)?;
        }
        if let Some(money) = &payload.collectable_money {
            let amount = match money {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.create_note(
                NoteTarget::Ticket(ticket.id),
                NoteKind::Comment,
                &format!("Collect {}", amount),
                actor,
            )?;
        }

        for device in &payload.devices {
            let existing = self.get_devices_by_sn(&device.sn)?;
            if existing.len() > 1 {
                tracing::warn!(sn = %device.sn, count = existing.len(), "Duplicate device serial, left untouched");
                continue;
            }
            if existing.is_empty() {
                let dev_type = self.get_or_create_device_type(&device.type_name)?;
                let created =
                    self.create_device(&device.sn, dev_type.id, device.card_sn.as_deref(), None)?;
                self.apply_owner(created.device.id, OwnerRef::Client(client.id), actor)?;
            }
        }

        if let Some(html) = &payload.html {
            self.create_attachment(
                ticket.id,
                "ticket.html",
                &encode_attachment(html),
                Some("Original ticket as received from the operator"),
                actor,
            )?;
        }
        for (name, content) in &payload.attachments {
            self.create_attachment(ticket.id, name, &encode_attachment(content), None, actor)?;
        }

        tx.commit().context("Failed to commit ticket intake")?;
        tracing::info!(ticket_id = ticket.id, ext_id = %payload.ticket_id, kind = kind.as_str(), "Ticket received");
        Ok(ticket.id)
    }

    /// Store an uploaded attachment on an existing ticket and log it in the
    /// ticket history.
    pub fn upload_attachment(&self, upload: &AttachmentUpload, actor: i64) -> Result<Attachment> {
        upload.validate()?;
        self.require_ticket(upload.ticket_id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let attachment = self.create_attachment(
            upload.ticket_id,
            &upload.name,
            &encode_attachment(&upload.data),
            upload.remark.as_deref(),
            actor,
        )?;
        self.create_note(
            NoteTarget::Ticket(upload.ticket_id),
            NoteKind::Document,
            &format!("Attachment added: {}", upload.name),
            actor,
        )?;
        tx.commit().context("Failed to commit attachment")?;
        Ok(attachment)
    }

    /// Register a device; an owner given on the form becomes its custodian.
    pub fn save_device_form(&self, form: &DeviceForm, actor: i64) -> Result<DeviceWithOwner> {
        form.validate()?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let dev_type = self.get_or_create_device_type(form.type_name.trim())?;
        let device = self.create_device(
            form.sn.trim(),
            dev_type.id,
            form.card_sn.as_deref(),
            form.remark.as_deref(),
        )?;
        if let Some(owner) = form.owner {
            self.apply_owner(device.device.id, owner, actor)?;
        }
        tx.commit().context("Failed to commit device")?;
        self.require_device(device.device.id)
    }

    /// Add a comment to a ticket, device, client or movement.
    pub fn add_note(&self, target: NoteTarget, form: &NoteForm, actor: i64) -> Result<Note> {
        form.validate()?;
        let exists = match target {
            NoteTarget::Ticket(id) => self.get_ticket(id)?.is_some(),
            NoteTarget::Device(id) => self.get_device(id)?.is_some(),
            NoteTarget::Client(id) => self.get_client(id)?.is_some(),
            NoteTarget::Movement(id) => self.get_movement(id)?.is_some(),
        };
        if !exists {
            return Err(FieldOpsError::not_found(target.kind_str(), target.id()).into());
        }
        self.create_note(target, NoteKind::Comment, form.remark.trim(), actor)
    }

    pub fn record_ticket_material(
        &self,
        ticket_id: i64,
        form: &TicketMaterialForm,
        actor: i64,
    ) -> Result<TicketMaterial> {
        form.validate()?;
        self.require_ticket(ticket_id)?;
        if self.get_material(form.material_id)?.is_none() {
            return Err(FieldOpsError::not_found("Material", form.material_id).into());
        }
        self.add_ticket_material(ticket_id, form.material_id, form.amount, actor)
    }

    pub fn record_ticket_work_item(
        &self,
        ticket_id: i64,
        form: &TicketWorkItemForm,
        actor: i64,
    ) -> Result<TicketWorkItem> {
        form.validate()?;
        self.require_ticket(ticket_id)?;
        if self.get_work_item(form.work_item_id)?.is_none() {
            return Err(FieldOpsError::not_found("Work item", form.work_item_id).into());
        }
        self.add_ticket_work_item(ticket_id, form.work_item_id, form.amount, actor)
    }

    /// Materials offered when recording consumption on a ticket.
    pub fn material_suggestions(&self, ticket_id: i64) -> Result<Vec<Material>> {
        let ticket = self.require_ticket(ticket_id)?;
        self.materials_for_technology(ticket.technology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::domain_error;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "ticket_id": "T-900",
            "city": "Szeged",
            "zip": "6720",
            "street": "Kossuth utca",
            "house_num": "12/A",
            "name1": "Kiss Péter",
            "phone1": "+36301234567",
            "mt_id": "MT-77",
            "task_type": "Internet",
            "mail_date": "2024-03-01 08:15:00",
            "attachments": {}
        })
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  kábel   szerelés ,  ház "), "Kábel szerelés, ház");
        assert_eq!(clean_text("\"ONT Huawei\""), "ONT Huawei");
        assert_eq!(clean_text("utp CAT5"), "Utp cat5");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn test_base64_detection() {
        assert!(looks_base64("aGVsbG8gd29ybGQ="));
        assert!(!looks_base64("<html><body>hi</body></html>"));
        assert_eq!(encode_attachment("aGVsbG8gd29ybGQ="), "aGVsbG8gd29ybGQ=");
        assert_eq!(encode_attachment("<p>x</p>"), STANDARD.encode("<p>x</p>"));
        assert_eq!(decode_attachment("aGVsbG8gd29ybGQ=").unwrap(), b"hello world");
    }

    #[test]
    fn test_text_starting_like_base64_is_encoded() {
        let text = "QUJDREVGR0g= is the code";
        assert!(!looks_base64(text));
        let stored = encode_attachment(text);
        assert_eq!(decode_attachment(&stored).unwrap(), text.as_bytes());
        assert!(!looks_base64("test"));
    }

    #[test]
    fn test_payload_reports_all_missing_keys_sorted() {
        let err = CreateTicketPayload::parse(&json!({"city": "Szeged", "ticket_id": "1"})).unwrap_err();
        match err {
            FieldOpsError::MissingKeys(keys) => assert_eq!(
                keys,
                vec!["house_num", "mt_id", "name1", "phone1", "street", "task_type", "zip"]
            ),
            other => panic!("Expected MissingKeys, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_parses_zip_and_type_list() {
        let mut data = payload();
        data["zip"] = json!(6720);
        data["task_type_list"] = json!(["Internet", "TV"]);
        let parsed = CreateTicketPayload::parse(&data).unwrap();
        assert_eq!(parsed.zip, 6720);
        assert_eq!(parsed.task_types, vec!["Internet", "TV"]);
        assert_eq!(parsed.address(), "Kossuth utca 12/A");

        data["zip"] = json!("not a zip");
        assert!(CreateTicketPayload::parse(&data).is_err());
    }

    #[test]
    fn test_intake_creates_everything_once() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let admin = db.create_user("api", "", UserRole::Admin)?;
        let mut data = payload();
        data["remarks"] = json!("Call before arrival");
        data["collectable_money"] = json!("12000");
        data["devices"] = json!([{"sn": "ONT-55", "type": "ONT"}]);
        data["html"] = json!("<html>original</html>");
        data["attachments"] = json!({"photo.png": "aGVsbG8gd29ybGQ="});
        let parsed = CreateTicketPayload::parse(&data).unwrap();

        let id = db.intake_ticket(TicketKind::Installation, &parsed, admin.id)?;
        let detail = db.ticket_detail(id)?.unwrap();
        assert_eq!(detail.ticket.created_at, "2024-03-01 08:15:00");
        assert_eq!(detail.ticket.status, TicketStatus::New);
        assert_eq!(
            detail.ticket.extra(TicketExtra::CollectableMoney),
            Some(&json!("12000"))
        );
        assert_eq!(detail.client.mt_id, "MT-77");
        assert_eq!(detail.city.to_string(), "Szeged (6720)");
        assert_eq!(detail.ticket_types, vec!["Internet"]);
        let remarks: Vec<&str> = detail.notes.iter().map(|n| n.remark.as_str()).collect();
        assert!(remarks.contains(&"Call before arrival"));
        assert!(remarks.contains(&"Collect 12000"));
        assert!(detail.notes.iter().all(|n| !n.is_history));
        assert_eq!(detail.devices.len(), 1);
        assert_eq!(detail.devices[0].owner, Some(OwnerRef::Client(detail.client.id)));
        let names: Vec<&str> = detail.attachments.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"ticket.html"));
        assert!(names.contains(&"photo.png"));

        let err = db
            .intake_ticket(TicketKind::Installation, &parsed, admin.id)
            .unwrap_err();
        assert!(matches!(
            domain_error(&err),
            Some(FieldOpsError::Duplicate { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_intake_reuses_client_and_known_devices() -> Result<()> {
        let db = FieldDb::new_in_memory()?;
        let admin = db.create_user("api", "", UserRole::Admin)?;
        let wh = db.create_warehouse("Central", None)?;
        let dt = db.get_or_create_device_type("ONT")?;
        let dev = db.create_device("ONT-1", dt.id, None, None)?;
        db.assign_owner(dev.device.id, OwnerRef::Warehouse(wh.id), admin.id)?;

        let mut data = payload();
        data["devices"] = json!([{"sn": "ONT-1", "type": "ONT"}]);
        let first = CreateTicketPayload::parse(&data).unwrap();
        db.intake_ticket(TicketKind::Installation, &first, admin.id)?;
        data["ticket_id"] = json!("T-901");
        let second = CreateTicketPayload::parse(&data).unwrap();
        db.intake_ticket(TicketKind::Uninstallation, &second, admin.id)?;

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        // Known devices keep their custodian.
        assert_eq!(
            db.require_device(dev.device.id)?.owner,
            Some(OwnerRef::Warehouse(wh.id))
        );
        Ok(())
    }

    #[test]
    fn test_upload_attachment_records_document_note() -> Result<()> {
        let f = crate::office::db::tests::fixture()?;
        let att = f.db.upload_attachment(
            &AttachmentUpload {
                ticket_id: f.ticket.id,
                name: "report.pdf".into(),
                data: "plain text body".into(),
                remark: None,
            },
            f.tech.id,
        )?;
        assert_eq!(att.content_type(), "application/pdf");
        let stored = f.db.get_attachment_data(att.id)?.unwrap();
        assert_eq!(decode_attachment(&stored)?, b"plain text body");

        let notes = f.db.list_notes(NoteTarget::Ticket(f.ticket.id))?;
        assert_eq!(notes[0].kind, NoteKind::Document);
        assert!(notes[0].is_history);
        Ok(())
    }

    #[test]
    fn test_forms_reject_bad_input() -> Result<()> {
        let f = crate::office::db::tests::fixture()?;
        assert!(TicketMaterialForm { material_id: 1, amount: 0.0 }.validate().is_err());
        assert!(NoteForm { remark: "   ".into() }.validate().is_err());
        let err = f
            .db
            .add_note(NoteTarget::Device(404), &NoteForm { remark: "x".into() }, f.admin.id)
            .unwrap_err();
        assert!(matches!(domain_error(&err), Some(FieldOpsError::NotFound { .. })));

        let device = f.db.save_device_form(
            &DeviceForm {
                sn: " SN-77 ".into(),
                type_name: "Modem".into(),
                card_sn: None,
                remark: None,
                owner: Some(OwnerRef::Technician(f.tech.id)),
            },
            f.admin.id,
        )?;
        assert_eq!(device.device.sn, "SN-77");
        assert_eq!(device.owner, Some(OwnerRef::Technician(f.tech.id)));
        Ok(())
    }
}
