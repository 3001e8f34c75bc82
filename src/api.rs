use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::db::{FileDetail, FileMetadata, FileMetadataUpdate, FileStatus, LibraryStats};
use crate::logger::SensorRecord;
use crate::notifier::LiveNotifier;
use crate::scheduler::{InboxMonitor, MonitorStatus};
use crate::services::library_service::BulkDeleteResult;
use crate::services::{
    ExportBody, ExportFormat, FileListResponse, IngestError, IngestRequest, IngestService,
    LibraryError, LibraryQuery, LibraryService,
};
use crate::utils::parse_tag_list;

#[derive(Clone)]
pub struct AppState {
    pub ingest_service: IngestService,
    pub library_service: LibraryService,
    pub notifier: LiveNotifier,
    pub monitor: InboxMonitor,
}

/// JSON error body: `{ "error": <kind>, "detail": <message> }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    detail: String,
}

impl ApiError {
    pub fn bad_request(kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error",
            detail: detail.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind,
            detail: &self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let kind = match &e {
            IngestError::InvalidFilename(_) => "invalid_filename",
            IngestError::NoDataExtracted { .. } => "no_data_extracted",
            IngestError::ConversionFailed(_) => "conversion_failed",
            IngestError::Storage(_) | IngestError::ReadFailed(_) => "storage_error",
            IngestError::StoreWriteFailed { .. } => "store_write_failed",
        };
        let status = match &e {
            IngestError::InvalidFilename(_)
            | IngestError::NoDataExtracted { .. }
            | IngestError::ConversionFailed(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind,
            detail: e.to_string(),
        }
    }
}

impl From<LibraryError> for ApiError {
    fn from(e: LibraryError) -> Self {
        match e {
            LibraryError::NotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                kind: "not_found",
                detail: e.to_string(),
            },
            LibraryError::Database(_) => {
                error!("Library store error: {}", e);
                Self::internal(e.to_string())
            }
            LibraryError::Export(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "export_failed",
                detail: e.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub monitoring: bool,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub records_added: usize,
    pub filename: String,
    pub file_id: i64,
    pub status: FileStatus,
    pub version: i64,
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    pub filename: Option<String>,
}

#[derive(Serialize)]
pub struct DataResponse {
    pub data: Vec<SensorRecord>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub deleted: FileMetadata,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Serialize)]
pub struct MonitorResponse {
    pub message: String,
    pub status: MonitorStatus,
}

pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/data", get(get_data))
        .route("/files", get(list_files))
        .route("/files/stats", get(file_stats))
        .route("/files/bulk-delete", post(bulk_delete_files))
        .route(
            "/files/{id}",
            get(get_file).patch(update_file).delete(delete_file),
        )
        .route("/files/{id}/export", get(export_file))
        .route("/monitor/start", post(start_monitor))
        .route("/monitor/stop", post(stop_monitor))
        .route("/monitor/status", get(monitor_status))
        .route("/ws", get(live_socket))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

#[instrument(skip(state))]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Health check requested");
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        monitoring: state.monitor.is_running(),
    };
    (StatusCode::OK, Json(response))
}

#[instrument(skip(state, multipart))]
async fn ingest(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut tags = Vec::new();
    let mut category = None;
    let mut description = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("invalid_upload", e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_upload", e.body_text()))?;
                upload = Some((filename, bytes.to_vec()));
            }
            "tags" | "category" | "description" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_upload", e.body_text()))?;
                match name.as_str() {
                    "tags" => tags = parse_tag_list(&text),
                    "category" => category = Some(text),
                    _ => description = Some(text),
                }
            }
            other => debug!("Ignoring multipart field {}", other),
        }
    }

    let Some((filename, bytes)) = upload else {
        warn!("Ingest request without a file part");
        return Err(ApiError::bad_request(
            "missing_file",
            "multipart field 'file' is required",
        ));
    };

    let mut request = IngestRequest::new(filename, bytes).with_tags(tags);
    if let Some(category) = category {
        request = request.with_category(category);
    }
    if let Some(description) = description {
        request = request.with_description(description);
    }

    let summary = state.ingest_service.ingest(request).await?;

    Ok(Json(IngestResponse {
        message: format!(
            "Processed {} with {} records",
            summary.filename, summary.records_added
        ),
        records_added: summary.records_added,
        filename: summary.filename,
        file_id: summary.file_id,
        status: summary.status,
        version: summary.version,
    }))
}

#[instrument(skip(state))]
async fn get_data(
    State(state): State<AppState>,
    Query(query): Query<DataQuery>,
) -> Result<Json<DataResponse>, ApiError> {
    let data = state
        .library_service
        .records(query.filename.as_deref())
        .await?;

    info!("Returning {} records", data.len());
    Ok(Json(DataResponse {
        count: data.len(),
        data,
        timestamp: Utc::now(),
    }))
}

#[instrument(skip(state))]
async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<LibraryQuery>,
) -> Result<Json<FileListResponse>, ApiError> {
    debug!(
        "Listing files (page={}, page_size={})",
        query.page, query.page_size
    );
    let response = state.library_service.list(&query).await?;

    info!(
        "Retrieved {} files (page {}/{}, total={})",
        response.files.len(),
        response.page,
        response.total_pages,
        response.total_files
    );
    Ok(Json(response))
}

#[instrument(skip(state))]
async fn file_stats(State(state): State<AppState>) -> Result<Json<LibraryStats>, ApiError> {
    Ok(Json(state.library_service.stats().await?))
}

#[instrument(skip(state), fields(file_id = %id))]
async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<FileDetail>, ApiError> {
    let detail = state.library_service.get_detail(id).await?;
    info!(
        "Retrieved {} with {} records",
        detail.metadata.filename,
        detail.records.len()
    );
    Ok(Json(detail))
}

#[instrument(skip(state, update), fields(file_id = %id))]
async fn update_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<FileMetadataUpdate>,
) -> Result<Json<FileMetadata>, ApiError> {
    Ok(Json(state.library_service.update(id, update).await?))
}

#[instrument(skip(state), fields(file_id = %id))]
async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.library_service.delete(id).await?;
    Ok(Json(DeleteResponse {
        message: format!("Deleted {}", deleted.filename),
        deleted,
    }))
}

#[instrument(skip(state, body))]
async fn bulk_delete_files(
    State(state): State<AppState>,
    Json(body): Json<BulkDeleteRequest>,
) -> Result<Json<BulkDeleteResult>, ApiError> {
    if body.ids.is_empty() {
        return Err(ApiError::bad_request("invalid_request", "no ids given"));
    }
    Ok(Json(state.library_service.bulk_delete(&body.ids).await?))
}

#[instrument(skip(state), fields(file_id = %id))]
async fn export_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let response = match state.library_service.export(id, query.format).await? {
        ExportBody::Json(export) => Json(export).into_response(),
        ExportBody::Csv { filename, body } => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            body,
        )
            .into_response(),
    };
    Ok(response)
}

#[instrument(skip(state))]
async fn start_monitor(State(state): State<AppState>) -> Json<MonitorResponse> {
    let message = if state.monitor.start() {
        "Monitoring started"
    } else {
        "Monitoring already running"
    };
    Json(MonitorResponse {
        message: message.to_string(),
        status: state.monitor.status(),
    })
}

#[instrument(skip(state))]
async fn stop_monitor(State(state): State<AppState>) -> Json<MonitorResponse> {
    let message = if state.monitor.stop().await {
        "Monitoring stopped"
    } else {
        "Monitoring was not running"
    };
    Json(MonitorResponse {
        message: message.to_string(),
        status: state.monitor.status(),
    })
}

async fn monitor_status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(state.monitor.status())
}

async fn live_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_live_socket(socket, state.notifier))
}

/// Forward notifier events to one WebSocket until either side goes away
async fn handle_live_socket(mut socket: WebSocket, notifier: LiveNotifier) {
    let mut subscription = match notifier.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Failed to load snapshot for live subscriber: {}", e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let id = subscription.id;

    loop {
        tokio::select! {
            event = subscription.events.recv() => {
                // None: the notifier dropped this subscriber
                let Some(event) = event else { break };
                let json = match serde_json::to_string(event.as_ref()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize live event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    debug!("Live subscriber {} went away during send", id);
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    notifier.unsubscribe(id).await;
}
