//! Route handlers and request/response bodies.
//!
//! Handlers run service calls on the blocking pool; the service itself is
//! synchronous and serializes through its own guard.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use super::error::{ApiError, ApiResult, ErrorCode};
use super::subscriptions::SubscriptionRegistry;
use crate::api::SaveOutcome;
use crate::bus::{BusMessage, SubscriptionId, Topic};
use crate::error::{Result, SyncError};
use crate::filter::SearchFilter;
use crate::service::RecordService;
use crate::types::{Actor, ClientId, MergeRegion, Permission, Record, Table, TableRow};

/// Poll timeout used when the client does not send one.
const DEFAULT_POLL_MS: u64 = 1_000;

/// Long-polls served at once unless configured otherwise.
pub const DEFAULT_MAX_POLLS: usize = 64;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RecordService>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Concurrent long-polls; each one occupies a blocking-pool thread.
    pub max_polls: usize,
}

impl AppState {
    pub fn new(service: Arc<RecordService>, idle_timeout: Duration, max_poll: Duration) -> Self {
        let subscriptions = Arc::new(SubscriptionRegistry::new(
            Arc::clone(service.bus()),
            idle_timeout,
            max_poll,
        ));
        Self {
            service,
            subscriptions,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    pub fn with_max_polls(mut self, max_polls: usize) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }
}

// ============================================================================
// BODIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub status: String,
    #[serde(flatten)]
    pub outcome: SaveOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub status: String,
    pub data: T,
}

impl<T> DataResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsResponse {
    pub status: String,
    pub permissions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueNumberBody {
    pub issue_number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteQuery {
    pub client_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Search filter in the bracket/brace syntax.
    pub q: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsernameQuery {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableNameBody {
    pub table_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveAllBody {
    pub table_name: String,
    #[serde(default)]
    pub data: Vec<TableRow>,
    #[serde(default)]
    pub merged_cells: Vec<MergeRegion>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveRowsBody {
    pub table_name: String,
    pub data: Vec<TableRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveMergesBody {
    pub table_name: String,
    pub merged_cells: Vec<MergeRegion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeBody {
    /// Empty means every channel.
    #[serde(default)]
    pub channels: Vec<Topic>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub subscription_id: SubscriptionId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollQuery {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub messages: Vec<BusMessage>,
}

// ============================================================================
// HELPERS
// ============================================================================

async fn run_blocking<T, F>(task: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::internal(format!("worker task failed: {}", e))),
    }
}

/// Parse an optional client id; blank counts as absent.
fn optional_client_id(raw: Option<&str>) -> Result<Option<ClientId>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map(Some),
        None => Ok(None),
    }
}

fn required_client_id(raw: Option<&str>) -> Result<ClientId> {
    optional_client_id(raw)?.ok_or_else(|| SyncError::InvalidClientId("missing".to_string()))
}

/// Remove a bookkeeping field from a request body, rendered as text.
fn take_text(fields: &mut Map<String, Value>, name: &str) -> Option<String> {
    match fields.remove(name)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// RECORD HANDLERS
// ============================================================================

/// POST /rn_record
pub async fn save_record(
    State(state): State<AppState>,
    body: std::result::Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<Json<SaveResponse>> {
    let Json(mut fields) = body?;
    let client_id = required_client_id(take_text(&mut fields, "client_id").as_deref())?;
    let username = take_text(&mut fields, "username").unwrap_or_default();
    let old_key = take_text(&mut fields, "old_issue_number");

    let actor = Actor::new(client_id, username);
    let record = Record::from_json_object(fields);
    let service = Arc::clone(&state.service);
    let outcome = run_blocking(move || service.save(&actor, record, old_key.as_deref())).await?;

    Ok(Json(SaveResponse {
        status: "success".to_string(),
        outcome,
    }))
}

/// GET /rn_record/:issue_number
pub async fn get_record(
    State(state): State<AppState>,
    Path(issue_number): Path<String>,
) -> ApiResult<Json<Record>> {
    let service = Arc::clone(&state.service);
    let record = run_blocking(move || service.get(&issue_number)).await?;
    Ok(Json(record))
}

/// POST /get_rn_record_by_issue_number
pub async fn get_record_by_body(
    State(state): State<AppState>,
    body: std::result::Result<Json<IssueNumberBody>, JsonRejection>,
) -> ApiResult<Json<Record>> {
    let Json(body) = body?;
    get_record(State(state), Path(body.issue_number)).await
}

/// DELETE /rn_record/:issue_number
pub async fn delete_record(
    State(state): State<AppState>,
    Path(issue_number): Path<String>,
    query: std::result::Result<Query<DeleteQuery>, QueryRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Query(query) = query?;
    let client_id = required_client_id(query.client_id.as_deref())?;
    let actor = Actor::new(client_id, query.username.unwrap_or_default());

    let service = Arc::clone(&state.service);
    run_blocking(move || service.delete(&actor, &issue_number)).await?;
    Ok(Json(StatusResponse::success()))
}

/// GET /rn_record_exists/:issue_number
pub async fn record_exists(
    State(state): State<AppState>,
    Path(issue_number): Path<String>,
) -> ApiResult<Json<ExistsResponse>> {
    let service = Arc::clone(&state.service);
    let exists = run_blocking(move || service.exists(&issue_number)).await?;
    Ok(Json(ExistsResponse { exists }))
}

/// POST /rn_record_exists
pub async fn record_exists_by_body(
    State(state): State<AppState>,
    body: std::result::Result<Json<IssueNumberBody>, JsonRejection>,
) -> ApiResult<Json<ExistsResponse>> {
    let Json(body) = body?;
    record_exists(State(state), Path(body.issue_number)).await
}

/// GET /rn_records, GET /get_all_rn_records
pub async fn list_records(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Record>>> {
    let Query(query) = query?;
    let filter = match query.q.as_deref() {
        Some(q) => SearchFilter::parse(q)?,
        None => SearchFilter::default(),
    };

    let service = Arc::clone(&state.service);
    let records = run_blocking(move || service.search(&filter)).await?;
    Ok(Json(records))
}

// ============================================================================
// TABLE HANDLERS
// ============================================================================

/// POST /save_all
pub async fn save_all(
    State(state): State<AppState>,
    body: std::result::Result<Json<SaveAllBody>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(body) = body?;
    let client_id = optional_client_id(body.client_id.as_deref())?;
    let table = Table::new(body.data, body.merged_cells);

    let service = Arc::clone(&state.service);
    run_blocking(move || service.save_all(client_id, &body.table_name, &table)).await?;
    Ok(Json(StatusResponse::success()))
}

/// POST /get_all
pub async fn get_all(
    State(state): State<AppState>,
    body: std::result::Result<Json<TableNameBody>, JsonRejection>,
) -> ApiResult<Json<DataResponse<Table>>> {
    let Json(body) = body?;
    let service = Arc::clone(&state.service);
    let table = run_blocking(move || service.get_table(&body.table_name)).await?;
    Ok(Json(DataResponse::success(table)))
}

/// POST /save_table
pub async fn save_table(
    State(state): State<AppState>,
    body: std::result::Result<Json<SaveRowsBody>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(body) = body?;
    let service = Arc::clone(&state.service);
    run_blocking(move || service.save_table_rows(&body.table_name, &body.data)).await?;
    Ok(Json(StatusResponse::success()))
}

/// POST /get_table
pub async fn get_table(
    State(state): State<AppState>,
    body: std::result::Result<Json<TableNameBody>, JsonRejection>,
) -> ApiResult<Json<DataResponse<Vec<TableRow>>>> {
    let Json(body) = body?;
    let service = Arc::clone(&state.service);
    let rows = run_blocking(move || service.get_table_rows(&body.table_name)).await?;
    Ok(Json(DataResponse::success(rows)))
}

/// POST /save_merged_cells
pub async fn save_merged_cells(
    State(state): State<AppState>,
    body: std::result::Result<Json<SaveMergesBody>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(body) = body?;
    let service = Arc::clone(&state.service);
    run_blocking(move || service.save_merged_cells(&body.table_name, &body.merged_cells)).await?;
    Ok(Json(StatusResponse::success()))
}

/// POST /get_merged_cells
pub async fn get_merged_cells(
    State(state): State<AppState>,
    body: std::result::Result<Json<TableNameBody>, JsonRejection>,
) -> ApiResult<Json<DataResponse<Vec<MergeRegion>>>> {
    let Json(body) = body?;
    let service = Arc::clone(&state.service);
    let regions = run_blocking(move || service.get_merged_cells(&body.table_name)).await?;
    Ok(Json(DataResponse::success(regions)))
}

// ============================================================================
// USERS & HEALTH
// ============================================================================

async fn lookup_permissions(state: AppState, username: String) -> ApiResult<Json<PermissionsResponse>> {
    let service = Arc::clone(&state.service);
    let Permission(bits) = run_blocking(move || service.permissions(&username)).await?;
    Ok(Json(PermissionsResponse {
        status: "success".to_string(),
        permissions: bits,
    }))
}

/// GET /get_permissions?username=
pub async fn get_permissions(
    State(state): State<AppState>,
    query: std::result::Result<Query<UsernameQuery>, QueryRejection>,
) -> ApiResult<Json<PermissionsResponse>> {
    let Query(query) = query?;
    lookup_permissions(state, query.username).await
}

/// POST /get_permissions
pub async fn get_permissions_by_body(
    State(state): State<AppState>,
    body: std::result::Result<Json<UsernameQuery>, JsonRejection>,
) -> ApiResult<Json<PermissionsResponse>> {
    let Json(body) = body?;
    lookup_permissions(state, body.username).await
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================================
// SUBSCRIPTION HANDLERS
// ============================================================================

/// POST /subscriptions
pub async fn open_subscription(
    State(state): State<AppState>,
    body: std::result::Result<Json<SubscribeBody>, JsonRejection>,
) -> ApiResult<Json<SubscribeResponse>> {
    let Json(body) = body?;
    let exclude = optional_client_id(body.client_id.as_deref())?;
    let channels = if body.channels.is_empty() {
        Topic::ALL.to_vec()
    } else {
        body.channels
    };

    let subscription_id = state.subscriptions.open(channels, exclude);
    Ok(Json(SubscribeResponse { subscription_id }))
}

/// GET /subscriptions/:id/poll?timeout_ms=
pub async fn poll_subscription(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    query: std::result::Result<Query<PollQuery>, QueryRejection>,
) -> ApiResult<Json<PollResponse>> {
    let Query(query) = query?;
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(DEFAULT_POLL_MS));

    let registry = Arc::clone(&state.subscriptions);
    let messages = run_blocking(move || registry.poll(SubscriptionId(id), timeout)).await?;
    Ok(Json(PollResponse { messages }))
}

/// DELETE /subscriptions/:id
pub async fn close_subscription(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<StatusResponse>> {
    if !state.subscriptions.close(SubscriptionId(id)) {
        return Err(ApiError::new(
            ErrorCode::SubscriptionNotFound,
            SyncError::SubscriptionNotFound(id).to_string(),
        ));
    }
    Ok(Json(StatusResponse::success()))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the full router. Record and table routes share a limit of
/// `workers` in-flight requests. Long-polls have their own limit of
/// `state.max_polls`, so waiting pollers cannot crowd out record handlers.
pub fn router(state: AppState, workers: usize) -> Router {
    let records = Router::new()
        .route("/rn_record", post(save_record))
        .route("/rn_record/:issue_number", get(get_record).delete(delete_record))
        .route("/get_rn_record_by_issue_number", post(get_record_by_body))
        .route("/rn_record_exists/:issue_number", get(record_exists))
        .route("/rn_record_exists", post(record_exists_by_body))
        .route("/rn_records", get(list_records))
        .route("/get_all_rn_records", get(list_records))
        .route("/save_all", post(save_all))
        .route("/get_all", post(get_all))
        .route("/save_table", post(save_table))
        .route("/get_table", post(get_table))
        .route("/save_merged_cells", post(save_merged_cells))
        .route("/get_merged_cells", post(get_merged_cells))
        .route(
            "/get_permissions",
            get(get_permissions).post(get_permissions_by_body),
        )
        .layer(ConcurrencyLimitLayer::new(workers.max(1)));

    let polls = Router::new()
        .route("/subscriptions/:id/poll", get(poll_subscription))
        .layer(ConcurrencyLimitLayer::new(state.max_polls.max(1)));

    let subscriptions = Router::new()
        .route("/subscriptions", post(open_subscription))
        .route("/subscriptions/:id", delete(close_subscription))
        .merge(polls);

    Router::new()
        .route("/health", get(health))
        .merge(records)
        .merge(subscriptions)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
