//! History endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::routes::AppState;
use crate::config::{HistoryStorage, SupabaseConfig};
use crate::history::{
    HistoryError, HistoryRecord, HistoryStats, RecordPage, RecordStatus, RecordUpdate,
    ScanAllReport, SyncReport,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/history", post(create_record).get(list_records))
        .route("/api/history/search", get(search_records))
        .route("/api/history/stats", get(get_statistics))
        .route("/api/history/scan-all", post(scan_all_tasks))
        .route("/api/history/scan/:task_id", get(scan_task))
        .route("/api/history/storage", post(set_storage))
        .route(
            "/api/history/:id",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route("/api/history/:id/download", get(download_zip))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRecordBody {
    pub title: String,
    #[serde(default)]
    pub outline: Value,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub keyword: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageBody {
    pub mode: String,
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_key: Option<String>,
}

fn error_response(e: HistoryError) -> (StatusCode, String) {
    let status = match &e {
        HistoryError::NotFound(_) | HistoryError::TaskDirMissing(_) => StatusCode::NOT_FOUND,
        HistoryError::NoTaskImages(_)
        | HistoryError::InvalidTaskId(_)
        | HistoryError::SupabaseUnavailable => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("History request failed: {}", e);
    }
    (status, e.to_string())
}

fn not_found(id: &str) -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("History record not found: {}", id),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/history - Create a record.
async fn create_record(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRecordBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if body.title.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "title is required".to_string()));
    }
    let id = state
        .history
        .create_record(&body.title, &body.outline, body.task_id.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "record_id": id })))
}

/// GET /api/history - List records, newest first.
async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<RecordPage>, (StatusCode, String)> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            RecordStatus::parse(s)
                .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Unknown status: {}", s)))?,
        ),
        None => None,
    };
    state
        .history
        .list_records(query.page, query.page_size, status)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/history/search?keyword= - Title search.
async fn search_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let records = state
        .history
        .search_records(query.keyword.trim())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "records": records })))
}

/// GET /api/history/stats - Record counts by status.
async fn get_statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HistoryStats>, (StatusCode, String)> {
    state
        .history
        .get_statistics()
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/history/:id
async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<HistoryRecord>, (StatusCode, String)> {
    state
        .history
        .get_record(&id)
        .await
        .map_err(error_response)?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// PUT /api/history/:id - Partial update.
async fn update_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<RecordUpdate>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if state
        .history
        .update_record(&id, &update)
        .await
        .map_err(error_response)?
    {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(not_found(&id))
    }
}

/// DELETE /api/history/:id - Delete a record and its images.
async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if state
        .history
        .delete_record(&id)
        .await
        .map_err(error_response)?
    {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(not_found(&id))
    }
}

/// GET /api/history/scan/:task_id - Sync one task directory.
async fn scan_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<SyncReport>, (StatusCode, String)> {
    state
        .history
        .scan_task(&task_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/history/scan-all - Sync every task directory.
async fn scan_all_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ScanAllReport>, (StatusCode, String)> {
    state
        .history
        .scan_all_tasks()
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/history/:id/download - Zip of the record's page images.
async fn download_zip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let (filename, bytes) = state
        .history
        .export_zip(&id)
        .await
        .map_err(error_response)?;
    let disposition = format!(
        "attachment; filename=\"images.zip\"; filename*=UTF-8''{}",
        urlencoding::encode(&filename)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// POST /api/history/storage - Switch the record backend.
async fn set_storage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StorageBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let mode = match body.mode.as_str() {
        "local" => HistoryStorage::Local,
        "supabase" => HistoryStorage::Supabase,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Unknown storage mode: {}", other),
            ))
        }
    };
    let credentials = match (body.supabase_url, body.supabase_key) {
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
            Some(SupabaseConfig { url, key })
        }
        _ => None,
    };

    state
        .history
        .set_storage_mode(mode, credentials.as_ref())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "mode": mode.as_str() })))
}
