//! Generation endpoints.
//!
//! `/api/generate` and `/api/retry-failed` answer with server-sent events;
//! each pipeline event becomes one SSE event named after it.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::routes::AppState;
use crate::generation::{
    thumbnail_filename, GenerateImagesRequest, GenerationError, GenerationEvent, Page,
    SingleImageResult,
};
use crate::history::is_safe_segment;
use crate::tasks::TaskStatus;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/images/:task_id/:filename", get(get_image))
        .route("/api/retry", post(retry_single))
        .route("/api/regenerate", post(regenerate))
        .route("/api/retry-failed", post(retry_failed))
        .route("/api/task/:task_id", get(get_task_state))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub full_outline: String,
    /// Base64 images, optionally as data URIs.
    #[serde(default)]
    pub user_images: Vec<String>,
    #[serde(default)]
    pub user_topic: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SingleImageBody {
    pub task_id: String,
    pub page: Page,
    #[serde(default = "default_true")]
    pub use_reference: bool,
}

#[derive(Debug, Deserialize)]
pub struct RetryFailedBody {
    pub task_id: String,
    #[serde(default)]
    pub pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    #[serde(default)]
    pub thumbnail: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn error_response(e: GenerationError) -> (StatusCode, String) {
    let status = match e {
        GenerationError::EmptyPages | GenerationError::InvalidTaskId(_) => StatusCode::BAD_REQUEST,
        GenerationError::Config(_) | GenerationError::Provider(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

/// Decode a base64 upload, stripping a `data:...;base64,` prefix.
fn decode_user_image(encoded: &str) -> Option<Vec<u8>> {
    let data = match encoded.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .ok()
        .filter(|bytes| !bytes.is_empty())
}

fn decode_user_images(images: &[String]) -> Vec<Vec<u8>> {
    images
        .iter()
        .enumerate()
        .filter_map(|(i, encoded)| {
            let decoded = decode_user_image(encoded);
            if decoded.is_none() {
                tracing::warn!("Skipping user image {}: invalid base64", i);
            }
            decoded
        })
        .collect()
}

fn to_sse(
    events: impl Stream<Item = GenerationEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.data().to_string()),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn single_image_response(result: SingleImageResult) -> (StatusCode, Json<SingleImageResult>) {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/generate - Render a deck, streaming progress.
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    if body.pages.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "pages must not be empty".to_string()));
    }

    let service = state.image_service().await.map_err(error_response)?;
    let request = GenerateImagesRequest {
        user_images: decode_user_images(&body.user_images),
        pages: body.pages,
        task_id: body.task_id,
        full_outline: body.full_outline,
        user_topic: body.user_topic,
    };
    let events = service.generate_images(request).map_err(error_response)?;
    Ok(to_sse(events))
}

/// GET /api/images/:task_id/:filename - Serve a page image.
///
/// With `?thumbnail=true` the thumbnail is served when one exists.
async fn get_image(
    State(state): State<Arc<AppState>>,
    Path((task_id, filename)): Path<(String, String)>,
    Query(query): Query<ImageQuery>,
) -> Result<Response, (StatusCode, String)> {
    if !is_safe_segment(&task_id) || !is_safe_segment(&filename) {
        return Err((StatusCode::BAD_REQUEST, "Invalid image path".to_string()));
    }
    let task_dir = state.config.history_dir.join(&task_id);

    let mut candidates = Vec::with_capacity(2);
    if query.thumbnail {
        candidates.push(task_dir.join(thumbnail_filename(&filename)));
    }
    candidates.push(task_dir.join(&filename));

    for path in candidates {
        if let Ok(bytes) = tokio::fs::read(&path).await {
            let mime = image::guess_format(&bytes)
                .map(|f| f.to_mime_type())
                .unwrap_or("application/octet-stream");
            return Ok((
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, "public, max-age=3600"),
                ],
                bytes,
            )
                .into_response());
        }
    }

    Err((
        StatusCode::NOT_FOUND,
        format!("Image {}/{} not found", task_id, filename),
    ))
}

/// POST /api/retry - Retry one failed page.
async fn retry_single(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SingleImageBody>,
) -> Result<(StatusCode, Json<SingleImageResult>), (StatusCode, String)> {
    let service = state.image_service().await.map_err(error_response)?;
    let result = service
        .retry_single_image(&body.task_id, body.page, body.use_reference)
        .await;
    Ok(single_image_response(result))
}

/// POST /api/regenerate - Replace one page.
async fn regenerate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SingleImageBody>,
) -> Result<(StatusCode, Json<SingleImageResult>), (StatusCode, String)> {
    let service = state.image_service().await.map_err(error_response)?;
    let result = service
        .regenerate_image(&body.task_id, body.page, body.use_reference)
        .await;
    Ok(single_image_response(result))
}

/// POST /api/retry-failed - Retry a set of pages, streaming outcomes.
async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RetryFailedBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    if body.pages.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "pages must not be empty".to_string()));
    }
    let service = state.image_service().await.map_err(error_response)?;
    let events = service
        .retry_failed_images(&body.task_id, body.pages)
        .map_err(error_response)?;
    Ok(to_sse(events))
}

/// GET /api/task/:task_id - In-memory state of a task.
async fn get_task_state(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatus>, (StatusCode, String)> {
    state
        .tasks
        .status(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", task_id)))
}

#[cfg(test)]
mod tests {
    use super::super::routes::test_support;
    use super::*;
    use axum::routing::post as post_route;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_decode_user_image_strips_data_uri() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"png-bytes");
        assert_eq!(decode_user_image(&encoded).unwrap(), b"png-bytes");
        assert_eq!(
            decode_user_image(&format!("data:image/png;base64,{}", encoded)).unwrap(),
            b"png-bytes"
        );
        assert!(decode_user_image("not base64!").is_none());
        assert!(decode_user_image("").is_none());
    }

    #[tokio::test]
    async fn test_task_and_image_lookups() {
        let temp = tempdir().unwrap();
        let state = test_support::state(temp.path());
        let task_dir = state.config.history_dir.join("t1");
        std::fs::create_dir_all(&task_dir).unwrap();
        let full = crate::imaging::test_png(40, 40);
        let thumb = crate::imaging::test_png(10, 10);
        std::fs::write(task_dir.join("0.png"), &full).unwrap();
        std::fs::write(task_dir.join("thumb_0.png"), &thumb).unwrap();
        std::fs::write(task_dir.join("1.png"), &full).unwrap();
        state.tasks.create("t1", 2, "", "").await;
        state.tasks.record_success("t1", 0, "0.png").await;

        let base = test_support::spawn(state).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/api/images/t1/0.png", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "image/png");
        assert_eq!(resp.bytes().await.unwrap().to_vec(), full);

        let resp = client
            .get(format!("{}/api/images/t1/0.png?thumbnail=true", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.bytes().await.unwrap().to_vec(), thumb);

        // No thumbnail on disk: the original is served.
        let resp = client
            .get(format!("{}/api/images/t1/1.png?thumbnail=true", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.bytes().await.unwrap().to_vec(), full);

        let resp = client.get(format!("{}/api/images/t1/9.png", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let body: serde_json::Value = client
            .get(format!("{}/api/task/t1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["generated"]["0"], "0.png");
        assert_eq!(body["has_cover"], false);

        let resp = client.get(format!("{}/api/task/missing", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_pages() {
        let temp = tempdir().unwrap();
        let base = test_support::spawn(test_support::state(temp.path())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/generate", base))
            .json(&json!({"pages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/api/retry-failed", base))
            .json(&json!({"task_id": "t1", "pages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    /// Provider stub answering the images endpoint with a small PNG.
    async fn spawn_provider() -> String {
        let png = base64::engine::general_purpose::STANDARD.encode(crate::imaging::test_png(16, 16));
        let app = Router::new().route(
            "/v1/images/generations",
            post_route(move || {
                let png = png.clone();
                async move { Json(json!({"data": [{"b64_json": png}]})) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_generate_streams_events_end_to_end() {
        let temp = tempdir().unwrap();
        let provider = spawn_provider().await;
        std::fs::write(
            temp.path().join("image_providers.yaml"),
            format!(
                "active_provider: stub\nproviders:\n  stub:\n    type: openai_compatible\n    api_key: k\n    base_url: {}\n    model: test-model\n",
                provider
            ),
        )
        .unwrap();
        let state = test_support::state(temp.path());
        let base = test_support::spawn(state.clone()).await;
        let client = reqwest::Client::new();

        let text = client
            .post(format!("{}/api/generate", base))
            .json(&json!({
                "task_id": "deck-1",
                "pages": [
                    {"index": 0, "image_prompt": "cover"},
                    {"index": 1, "image_prompt": "page one"}
                ],
                "full_outline": "cover, page one"
            }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(text.contains("event: progress"));
        assert!(text.contains("event: complete"));
        assert!(text.contains("\"image_url\":\"/api/images/deck-1/1.png\""));
        let finish = text.find("event: finish").unwrap();
        assert!(text[finish..].contains("\"success\":true"));

        assert!(state.config.history_dir.join("deck-1").join("1.png").exists());
        let status = state.tasks.status("deck-1").await.unwrap();
        assert_eq!(status.generated.len(), 2);
        assert!(status.has_cover);

        let resp = client
            .post(format!("{}/api/retry", base))
            .json(&json!({"task_id": "deck-1", "page": {"index": 1, "image_prompt": "again"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["image_url"], "/api/images/deck-1/1.png");
    }
}
