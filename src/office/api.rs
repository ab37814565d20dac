use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::db::{DbHandle, NewMaterial, NewWorkItem, PayoffFilter, StatusFilter, TicketQuery};
use super::forms::{
    AttachmentUpload, CreateTicketPayload, DeviceForm, NoteForm, TicketMaterialForm,
    TicketWorkItemForm, decode_attachment,
};
use super::lifecycle::TicketUpdate;
use super::models::{
    MovementItem, NoteTarget, OwnerRef, Provider, Technology, TicketKind, Unit, User, UserRole,
};
use crate::errors::{FieldOpsError, domain_error};
use crate::report::{self, ReportRegistry, export};

/// Header carrying the username of the acting user.
pub const ACTOR_HEADER: &str = "x-fieldops-user";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub reports: ReportRegistry,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    pub role: UserRole,
}

#[derive(Deserialize, Default)]
pub struct UserListQuery {
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Deserialize, Default)]
pub struct TicketListQuery {
    pub status: Option<String>,
    pub owner: Option<i64>,
    pub kind: Option<String>,
    pub payoff: Option<String>,
    pub q: Option<String>,
}

#[derive(Deserialize)]
pub struct SetPayoffRequest {
    pub payoff_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreatePayoffRequest {
    pub name: String,
}

#[derive(Deserialize, Default)]
pub struct DeviceListQuery {
    pub owner_kind: Option<String>,
    pub owner_id: Option<i64>,
    pub sn: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateWarehouseRequest {
    pub name: String,
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct ReceiveStockRequest {
    pub material_id: i64,
    pub amount: f64,
}

#[derive(Serialize)]
pub struct StockResponse {
    pub warehouse_id: i64,
    pub material_id: i64,
    pub amount: f64,
}

#[derive(Deserialize)]
pub struct CreateMaterialRequest {
    pub sn: String,
    pub name: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub fav: bool,
    pub unit: Unit,
    pub remark: Option<String>,
    pub comes_from: Option<Provider>,
    #[serde(default)]
    pub technology: Technology,
    pub category: String,
}

#[derive(Deserialize)]
pub struct CreateWorkItemRequest {
    pub name: String,
    pub art_number: String,
    pub remark: Option<String>,
    #[serde(default)]
    pub art_price: i64,
    #[serde(default)]
    pub bulk_price: i64,
    #[serde(default)]
    pub given_price: i64,
}

#[derive(Deserialize)]
pub struct CreateMovementRequest {
    pub source_warehouse_id: i64,
    pub target_warehouse_id: i64,
    pub items: Vec<MovementItem>,
    pub remark: Option<String>,
}

#[derive(Serialize)]
pub struct ReportSummary {
    pub slug: String,
    pub title: String,
    pub model: report::ReportModel,
    pub group_by_choices: Vec<String>,
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    MissingKeys(Vec<String>),
    Conflict(String),
    Unauthorized(String),
    Internal(String),
}

impl ApiError {
    fn from_domain(err: &FieldOpsError) -> Self {
        let msg = err.to_string();
        match err {
            FieldOpsError::NotFound { .. } => ApiError::NotFound(msg),
            FieldOpsError::Validation(_) => ApiError::BadRequest(msg),
            FieldOpsError::MissingKeys(keys) => ApiError::MissingKeys(keys.clone()),
            FieldOpsError::Duplicate { .. }
            | FieldOpsError::InsufficientStock { .. }
            | FieldOpsError::MovementFinalized { .. }
            | FieldOpsError::WrongCustodian { .. } => ApiError::Conflict(msg),
            FieldOpsError::UnknownUser(_) => ApiError::Unauthorized(msg),
        }
    }
}

impl From<FieldOpsError> for ApiError {
    fn from(err: FieldOpsError) -> Self {
        Self::from_domain(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match domain_error(&err) {
            Some(domain) => Self::from_domain(domain),
            None => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg}))
            }
            ApiError::MissingKeys(keys) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": {"missing_keys": keys}}),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({"error": msg})),
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, serde_json::json!({"error": msg}))
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ── Acting user ───────────────────────────────────────────────────────

/// The active user named by the `x-fieldops-user` header.
pub struct Actor(pub User);

async fn resolve_actor(state: &SharedState, headers: &HeaderMap) -> Result<User, ApiError> {
    let username = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", ACTOR_HEADER)))?
        .to_string();
    let lookup = username.clone();
    let user = state
        .db
        .call(move |db| db.get_user_by_username(&lookup))
        .await?;
    match user {
        Some(user) if user.is_active => Ok(user),
        _ => Err(FieldOpsError::UnknownUser(username).into()),
    }
}

impl FromRequestParts<SharedState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        resolve_actor(state, &parts.headers).await.map(Actor)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        // Field clients
        .route("/api/v1/ticket/create", post(field_create_ticket))
        .route("/api/v1/uninstall_ticket/create", post(field_create_uninstall_ticket))
        .route("/api/v1/ticket/attachment", post(field_add_attachment))
        .route("/api/v1/attachment/{id}", get(serve_attachment))
        .route("/api/v1/thumbnail/{id}", get(serve_thumbnail))
        // Back office
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket).patch(update_ticket))
        .route("/api/tickets/{id}/notes", post(add_ticket_note))
        .route("/api/tickets/{id}/materials", post(add_ticket_material))
        .route("/api/tickets/{id}/material-suggestions", get(material_suggestions))
        .route("/api/tickets/{id}/work-items", post(add_ticket_work_item))
        .route("/api/tickets/{id}/payoff", axum::routing::put(set_ticket_payoff))
        .route(
            "/api/tickets/{id}/devices/{device_id}/remove",
            post(remove_ticket_device),
        )
        .route("/api/payoffs", get(list_payoffs).post(create_payoff))
        .route("/api/clients/{id}", get(get_client))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/notes", post(add_device_note))
        .route("/api/devices/{id}/owner", axum::routing::put(set_device_owner))
        .route("/api/warehouses", get(list_warehouses).post(create_warehouse))
        .route(
            "/api/warehouses/{id}/stock",
            get(warehouse_stock).post(receive_stock),
        )
        .route("/api/materials", get(list_materials).post(create_material))
        .route("/api/work-items", get(list_work_items).post(create_work_item))
        .route("/api/movements", post(create_movement))
        .route("/api/movements/{id}", get(get_movement))
        .route("/api/movements/{id}/finalize", post(finalize_movement))
        .route("/api/reports", get(list_reports))
        .route("/api/reports/{slug}", get(run_report))
        .route("/api/reports/{slug}/filters", get(report_filters))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

// ── Field client handlers ─────────────────────────────────────────────

async fn intake(
    state: SharedState,
    actor: User,
    kind: TicketKind,
    data: Value,
) -> Result<impl IntoResponse, ApiError> {
    let payload = CreateTicketPayload::parse(&data)?;
    let ticket_id = state
        .db
        .call(move |db| db.intake_ticket(kind, &payload, actor.id))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"ticket_id": ticket_id})),
    ))
}

async fn field_create_ticket(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(data): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    intake(state, actor, TicketKind::Installation, data).await
}

async fn field_create_uninstall_ticket(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(data): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    intake(state, actor, TicketKind::Uninstallation, data).await
}

async fn field_add_attachment(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(upload): Json<AttachmentUpload>,
) -> Result<impl IntoResponse, ApiError> {
    let attachment = state
        .db
        .call(move |db| db.upload_attachment(&upload, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn load_attachment(
    state: &SharedState,
    id: i64,
) -> Result<(super::models::Attachment, Vec<u8>), ApiError> {
    let (attachment, data) = state
        .db
        .call(move |db| {
            let attachment = db.get_attachment(id)?;
            let data = db.get_attachment_data(id)?;
            Ok(attachment.zip(data))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Attachment {} not found", id)))?;
    let bytes = decode_attachment(&data)?;
    Ok((attachment, bytes))
}

async fn serve_attachment(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (attachment, bytes) = load_attachment(&state, id).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, attachment.content_type())],
        bytes,
    ))
}

/// Images are served unscaled; anything else gets an empty body.
async fn serve_thumbnail(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (attachment, bytes) = load_attachment(&state, id).await?;
    if !attachment.is_image() {
        return Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], Vec::new()));
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, attachment.content_type())],
        bytes,
    ))
}

// ── User handlers ─────────────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Query(query): Query<UserListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let only_active = query.active.unwrap_or(false);
    let users = state.db.call(move |db| db.list_users(only_active)).await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.trim().is_empty() {
        return Err(ApiError::BadRequest("username is required".into()));
    }
    let user = state
        .db
        .call(move |db| db.create_user(req.username.trim(), &req.full_name, req.role))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

// ── Ticket handlers ───────────────────────────────────────────────────

async fn list_tickets(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Query(query): Query<TicketListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => s.parse::<StatusFilter>().map_err(ApiError::BadRequest)?,
        None => StatusFilter::default(),
    };
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<TicketKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let payoff = match query.payoff.as_deref() {
        None | Some("") => PayoffFilter::Any,
        Some("empty") => PayoffFilter::Unsettled,
        Some(raw) => raw
            .parse::<i64>()
            .map(PayoffFilter::Payoff)
            .map_err(|_| ApiError::BadRequest(format!("Invalid payoff filter: {}", raw)))?,
    };
    let actor_id = match status {
        StatusFilter::OwnOpen | StatusFilter::OwnAll => Some(actor.id),
        _ => None,
    };
    let ticket_query = TicketQuery {
        status,
        owner_id: query.owner,
        kind,
        payoff,
        search: query.q.filter(|q| !q.trim().is_empty()),
        actor_id,
    };
    let tickets = state
        .db
        .call(move |db| db.list_tickets(&ticket_query))
        .await?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.ticket_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Ticket {} not found", id))),
    }
}

async fn update_ticket(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(update): Json<TicketUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .db
        .call(move |db| db.save_ticket(id, &update, actor.id))
        .await?;
    Ok(Json(ticket))
}

async fn add_ticket_note(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(form): Json<NoteForm>,
) -> Result<impl IntoResponse, ApiError> {
    let note = state
        .db
        .call(move |db| db.add_note(NoteTarget::Ticket(id), &form, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn add_ticket_material(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(form): Json<TicketMaterialForm>,
) -> Result<impl IntoResponse, ApiError> {
    let line = state
        .db
        .call(move |db| db.record_ticket_material(id, &form, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(line)))
}

async fn material_suggestions(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let materials = state.db.call(move |db| db.material_suggestions(id)).await?;
    Ok(Json(materials))
}

async fn add_ticket_work_item(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(form): Json<TicketWorkItemForm>,
) -> Result<impl IntoResponse, ApiError> {
    let line = state
        .db
        .call(move |db| db.record_ticket_work_item(id, &form, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(line)))
}

async fn set_ticket_payoff(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(_actor): Actor,
    Json(req): Json<SetPayoffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .db
        .call(move |db| db.set_ticket_payoff(id, req.payoff_id))
        .await?;
    Ok(Json(ticket))
}

async fn remove_ticket_device(
    State(state): State<SharedState>,
    Path((id, device_id)): Path<(i64, i64)>,
    Actor(actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let device = state
        .db
        .call(move |db| db.remove_device_from_ticket(id, device_id, actor.id))
        .await?;
    Ok(Json(device))
}

async fn list_payoffs(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let payoffs = state.db.call(|db| db.list_payoffs()).await?;
    Ok(Json(payoffs))
}

async fn create_payoff(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Json(req): Json<CreatePayoffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payoff = state.db.call(move |db| db.create_payoff(&req.name)).await?;
    Ok((StatusCode::CREATED, Json(payoff)))
}

// ── Client and device handlers ────────────────────────────────────────

async fn get_client(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.client_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Client {} not found", id))),
    }
}

async fn list_devices(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Query(query): Query<DeviceListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = match (query.owner_kind.as_deref(), query.owner_id) {
        (Some(kind), Some(id)) => {
            Some(OwnerRef::from_parts(kind, id).map_err(ApiError::BadRequest)?)
        }
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "owner_kind and owner_id must be given together".into(),
            ));
        }
    };
    let sn = query.sn.filter(|s| !s.trim().is_empty());
    let devices = state
        .db
        .call(move |db| match (owner, sn) {
            (Some(owner), _) => db.devices_of(owner),
            (None, Some(sn)) => db.get_devices_by_sn(sn.trim()),
            (None, None) => db.list_devices(),
        })
        .await?;
    Ok(Json(devices))
}

async fn get_device(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state.db.call(move |db| db.require_device(id)).await?;
    Ok(Json(device))
}

async fn create_device(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(form): Json<DeviceForm>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state
        .db
        .call(move |db| db.save_device_form(&form, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn add_device_note(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(form): Json<NoteForm>,
) -> Result<impl IntoResponse, ApiError> {
    let note = state
        .db
        .call(move |db| db.add_note(NoteTarget::Device(id), &form, actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn set_device_owner(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
    Json(owner): Json<OwnerRef>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state
        .db
        .call(move |db| db.assign_owner(id, owner, actor.id))
        .await?;
    Ok(Json(device))
}

// ── Warehouse, material and work item handlers ────────────────────────

async fn list_warehouses(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let warehouses = state.db.call(|db| db.list_warehouses()).await?;
    Ok(Json(warehouses))
}

async fn create_warehouse(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Json(req): Json<CreateWarehouseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("warehouse name is required".into()));
    }
    let warehouse = state
        .db
        .call(move |db| db.create_warehouse(req.name.trim(), req.location.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(warehouse)))
}

async fn warehouse_stock(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let stock = state
        .db
        .call(move |db| {
            db.require_warehouse(id)?;
            db.stock_of(id)
        })
        .await?;
    Ok(Json(stock))
}

async fn receive_stock(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(_actor): Actor,
    Json(req): Json<ReceiveStockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let material_id = req.material_id;
    let amount = state
        .db
        .call(move |db| db.receive_stock(id, material_id, req.amount))
        .await?;
    Ok(Json(StockResponse {
        warehouse_id: id,
        material_id,
        amount,
    }))
}

async fn list_materials(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let materials = state.db.call(|db| db.list_materials()).await?;
    Ok(Json(materials))
}

async fn create_material(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Json(req): Json<CreateMaterialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.sn.trim().is_empty() || req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("material number and name are required".into()));
    }
    let material = state
        .db
        .call(move |db| {
            let category = db.get_or_create_material_category(req.category.trim())?;
            db.create_material(&NewMaterial {
                sn: req.sn.trim().to_string(),
                name: req.name.trim().to_string(),
                price: req.price,
                fav: req.fav,
                unit: req.unit,
                remark: req.remark,
                comes_from: req.comes_from,
                technology: req.technology,
                category_id: category.id,
            })
        })
        .await?;
    Ok((StatusCode::CREATED, Json(material)))
}

async fn list_work_items(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.db.call(|db| db.list_work_items()).await?;
    Ok(Json(items))
}

async fn create_work_item(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Json(req): Json<CreateWorkItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("work item name is required".into()));
    }
    let item = state
        .db
        .call(move |db| {
            db.create_work_item(&NewWorkItem {
                name: req.name.trim().to_string(),
                art_number: req.art_number.trim().to_string(),
                remark: req.remark,
                art_price: req.art_price,
                bulk_price: req.bulk_price,
                given_price: req.given_price,
            })
        })
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

// ── Movement handlers ─────────────────────────────────────────────────

async fn create_movement(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(req): Json<CreateMovementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let movement = state
        .db
        .call(move |db| {
            db.create_movement(
                req.source_warehouse_id,
                req.target_warehouse_id,
                &req.items,
                req.remark.as_deref(),
                actor.id,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(movement)))
}

async fn get_movement(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.movement_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Movement {} not found", id))),
    }
}

async fn finalize_movement(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Actor(actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            db.finalize_movement(id, actor.id)?;
            db.movement_detail(id)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Movement {} not found", id)))?;
    Ok(Json(detail))
}

// ── Report handlers ───────────────────────────────────────────────────

async fn list_reports(State(state): State<SharedState>, Actor(_actor): Actor) -> impl IntoResponse {
    let reports: Vec<ReportSummary> = state
        .reports
        .list()
        .into_iter()
        .map(|def| ReportSummary {
            slug: def.slug.clone(),
            title: def.title.clone(),
            model: def.model,
            group_by_choices: def.group_by_choices.clone(),
        })
        .collect();
    Json(reports)
}

fn find_report(state: &SharedState, slug: &str) -> Result<report::ReportDefinition, ApiError> {
    state
        .reports
        .get(slug)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Report {} not found", slug)))
}

/// `group_by` is a comma separated list, `format` is `json` (default) or
/// `csv`; every other parameter binds a filter.
async fn run_report(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(slug): Path<String>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    let def = find_report(&state, &slug)?;
    let group_by: Vec<String> = params
        .remove("group_by")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let format = params.remove("format").unwrap_or_else(|| "json".to_string());
    if format != "json" && format != "csv" {
        return Err(ApiError::BadRequest(format!("Invalid report format: {}", format)));
    }

    let output = state
        .db
        .call(move |db| report::build_report(db, &def, &params, &group_by))
        .await?;

    if format == "csv" {
        let csv = export::to_csv(&output)?;
        let disposition = format!("attachment; filename=\"{}.csv\"", slug);
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            csv,
        )
            .into_response());
    }
    Ok(Json(output).into_response())
}

async fn report_filters(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let def = find_report(&state, &slug)?;
    let options = state
        .db
        .call(move |db| report::filter_options(db, &def))
        .await?;
    Ok(Json(options))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::office::FieldDb;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let db = FieldDb::new_in_memory().unwrap();
        db.create_user("admin", "Office Admin", UserRole::Admin).unwrap();
        Arc::new(AppState {
            db: DbHandle::new(db),
            reports: ReportRegistry::builtin(),
        })
    }

    fn test_app() -> Router {
        api_router().with_state(test_state())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header(ACTOR_HEADER, "admin")
            .body(Body::empty())
            .unwrap()
    }

    fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(ACTOR_HEADER, "admin")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn ticket_payload(ticket_id: &str) -> Value {
        serde_json::json!({
            "ticket_id": ticket_id,
            "city": "Szeged",
            "zip": 6720,
            "street": "Kossuth utca",
            "house_num": "12",
            "name1": "Kiss Péter",
            "phone1": "+36301234567",
            "mt_id": "MT-77",
            "task_type": "Internet",
            "remarks": "Call before arrival",
            "devices": [{"sn": "ONT-1", "type": "ONT"}]
        })
    }

    async fn create_field_ticket(app: &Router, ticket_id: &str) -> i64 {
        let response = app
            .clone()
            .oneshot(send_json("POST", "/api/v1/ticket/create", ticket_payload(ticket_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = body_json(response.into_body()).await;
        body["ticket_id"].as_i64().unwrap()
    }

    // 1. Health check
    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    // 2. Field ticket intake and duplicate rejection
    #[tokio::test]
    async fn test_field_ticket_create_and_duplicate() {
        let app = test_app();
        let id = create_field_ticket(&app, "T-1").await;

        let response = app.clone().oneshot(get_request(&format!("/api/tickets/{}", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: Value = body_json(response.into_body()).await;
        assert_eq!(detail["ext_id"], "T-1");
        assert_eq!(detail["address"], "Kossuth utca 12");
        assert_eq!(detail["client"]["mt_id"], "MT-77");
        assert_eq!(detail["devices"][0]["sn"], "ONT-1");
        assert_eq!(detail["notes"][0]["remark"], "Call before arrival");

        let response = app
            .oneshot(send_json("POST", "/api/v1/ticket/create", ticket_payload("T-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("T-1"));
    }

    // 3. Missing keys are reported together
    #[tokio::test]
    async fn test_field_ticket_missing_keys() {
        let app = test_app();
        let response = app
            .oneshot(send_json(
                "POST",
                "/api/v1/uninstall_ticket/create",
                serde_json::json!({"ticket_id": "T-2", "city": "Szeged"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        let keys: Vec<&str> = body["error"]["missing_keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec!["house_num", "mt_id", "name1", "phone1", "street", "task_type", "zip"]
        );
    }

    // 4. Unknown or missing acting user
    #[tokio::test]
    async fn test_actor_header_required_for_mutations() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/warehouses")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"name": "Central"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/api/warehouses")
            .header("content-type", "application/json")
            .header(ACTOR_HEADER, "ghost")
            .body(Body::from(serde_json::json!({"name": "Central"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Unknown user 'ghost'");
    }

    // Reads are as closed as writes
    #[tokio::test]
    async fn test_reads_require_known_actor() {
        let app = test_app();
        let ticket_id = create_field_ticket(&app, "T-9").await;
        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                "/api/v1/ticket/attachment",
                serde_json::json!({"ticket_id": ticket_id, "name": "a.html", "data": "<p>x</p>"}),
            ))
            .await
            .unwrap();
        let attachment: Value = body_json(response.into_body()).await;
        let id = attachment["id"].as_i64().unwrap();

        for uri in [
            format!("/api/v1/attachment/{}", id),
            format!("/api/v1/thumbnail/{}", id),
            "/api/users".to_string(),
            "/api/tickets?status=all".to_string(),
            format!("/api/tickets/{}", ticket_id),
            "/api/warehouses".to_string(),
            "/api/reports".to_string(),
        ] {
            let request = Request::builder()
                .method("GET")
                .uri(uri.as_str())
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }

        let response = app.oneshot(get_request("/api/users")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Only data that decodes is taken as already encoded
    #[tokio::test]
    async fn test_text_with_base64_prefix_round_trips() {
        let app = test_app();
        let ticket_id = create_field_ticket(&app, "T-10").await;
        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                "/api/v1/ticket/attachment",
                serde_json::json!({
                    "ticket_id": ticket_id,
                    "name": "code.html",
                    "data": "QUJDREVGR0g= is the code"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let attachment: Value = body_json(response.into_body()).await;
        let id = attachment["id"].as_i64().unwrap();

        let response = app
            .oneshot(get_request(&format!("/api/v1/attachment/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"QUJDREVGR0g= is the code");
    }

    // 5. Attachments are stored encoded and served raw
    #[tokio::test]
    async fn test_attachment_upload_and_download() {
        let app = test_app();
        let ticket_id = create_field_ticket(&app, "T-3").await;

        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                "/api/v1/ticket/attachment",
                serde_json::json!({"ticket_id": ticket_id, "name": "notes.txt", "data": "hello field"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let attachment: Value = body_json(response.into_body()).await;
        let id = attachment["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/v1/attachment/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello field");

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/v1/thumbnail/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());

        let response = app.oneshot(get_request("/api/v1/attachment/999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // 6. Assigning an owner moves a new ticket to assigned
    #[tokio::test]
    async fn test_patch_ticket_assigns_owner() {
        let state = test_state();
        let app = api_router().with_state(state.clone());
        let tech_id = state
            .db
            .lock_sync()
            .unwrap()
            .create_user("kovacs", "", UserRole::Technician)
            .unwrap()
            .id;
        let ticket_id = create_field_ticket(&app, "T-4").await;

        let response = app
            .clone()
            .oneshot(send_json(
                "PATCH",
                &format!("/api/tickets/{}", ticket_id),
                serde_json::json!({"owner_id": tech_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ticket: Value = body_json(response.into_body()).await;
        assert_eq!(ticket["status"], "assigned");
        assert_eq!(ticket["owner_id"], tech_id);

        let response = app
            .oneshot(get_request("/api/tickets?status=open&q=kiss"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let tickets: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["owner"], "kovacs");
    }

    // 7. Invalid list filters are rejected
    #[tokio::test]
    async fn test_list_tickets_rejects_bad_filters() {
        let app = test_app();
        let response = app.clone().oneshot(get_request("/api/tickets?status=pending")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = app.oneshot(get_request("/api/tickets?payoff=soon")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // 8. Finalizing a movement without stock conflicts
    #[tokio::test]
    async fn test_movement_finalize_needs_stock() {
        let app = test_app();
        let mut warehouse_ids = Vec::new();
        for name in ["Central", "Van 1"] {
            let response = app
                .clone()
                .oneshot(send_json("POST", "/api/warehouses", serde_json::json!({"name": name})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            let wh: Value = body_json(response.into_body()).await;
            warehouse_ids.push(wh["id"].as_i64().unwrap());
        }
        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                "/api/materials",
                serde_json::json!({"sn": "1001", "name": "UTP cable", "unit": "m", "category": "Cables"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let material: Value = body_json(response.into_body()).await;
        let material_id = material["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                "/api/movements",
                serde_json::json!({
                    "source_warehouse_id": warehouse_ids[0],
                    "target_warehouse_id": warehouse_ids[1],
                    "items": [{"type": "material", "material_id": material_id, "amount": 5.0}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let movement: Value = body_json(response.into_body()).await;
        let movement_id = movement["id"].as_i64().unwrap();
        assert_eq!(movement["status"], "draft");

        let finalize = format!("/api/movements/{}/finalize", movement_id);
        let response = app
            .clone()
            .oneshot(send_json("POST", &finalize, Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(send_json(
                "POST",
                &format!("/api/warehouses/{}/stock", warehouse_ids[0]),
                serde_json::json!({"material_id": material_id, "amount": 8.0}),
            ))
            .await
            .unwrap();
        let stock: Value = body_json(response.into_body()).await;
        assert_eq!(stock["amount"], 8.0);

        let response = app
            .clone()
            .oneshot(send_json("POST", &finalize, Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: Value = body_json(response.into_body()).await;
        assert_eq!(detail["status"], "finalized");

        let response = app
            .oneshot(get_request(&format!("/api/warehouses/{}/stock", warehouse_ids[1])))
            .await
            .unwrap();
        let levels: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(levels[0]["amount"], 5.0);
    }

    // 9. Reports as JSON and CSV
    #[tokio::test]
    async fn test_report_json_and_csv() {
        let app = test_app();
        create_field_ticket(&app, "T-5").await;

        let response = app.clone().oneshot(get_request("/api/reports")).await.unwrap();
        let reports: Vec<Value> = body_json(response.into_body()).await;
        assert!(reports.iter().any(|r| r["slug"] == "summary"));

        let response = app
            .clone()
            .oneshot(get_request("/api/reports/summary?group_by=city.name"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let output: Value = body_json(response.into_body()).await;
        assert_eq!(output["type"], "table");
        assert_eq!(output["groups"][0]["value"], "Szeged");

        let response = app
            .clone()
            .oneshot(get_request("/api/reports/summary?format=csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("T-5,Szeged"));

        let response = app
            .clone()
            .oneshot(get_request("/api/reports/summary?group_by=address"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get_request("/api/reports/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
