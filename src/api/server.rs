use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;

use crate::analytics::SessionHandle;
use crate::camera::list_devices;
use crate::storage::DetectionStore;

use super::stream;

const DEFAULT_LIST_LIMIT: usize = 10;

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionHandle>,
    pub store: Arc<dyn DetectionStore>,
    pub captures_dir: PathBuf,
    pub dev_root: PathBuf,
}

impl AppState {
    pub fn new(
        session: Arc<SessionHandle>,
        store: Arc<dyn DetectionStore>,
        captures_dir: PathBuf,
    ) -> Self {
        Self {
            session,
            store,
            captures_dir,
            dev_root: PathBuf::from("/dev"),
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    processing: bool,
    cooldown: f64,
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct UpdateDetection {
    species: String,
    confidence: f32,
    interesting_fact: String,
}

pub fn router(state: AppState) -> Router {
    let captures = ServeDir::new(&state.captures_dir);

    Router::new()
        .route("/", get(index_handler))
        .route("/assets/{*path}", get(static_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/api/cameras", get(cameras_handler))
        .route("/api/cameras/{index}", post(set_camera_handler))
        .route("/api/debug/{enabled}", post(debug_handler))
        .route("/api/status", get(status_handler))
        .route(
            "/api/detections",
            get(list_detections_handler).delete(clear_detections_handler),
        )
        .route(
            "/api/detections/{id}",
            put(update_detection_handler).delete(delete_detection_handler),
        )
        .nest_service("/captures", captures)
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "index.html not found").into_response(),
    }
}

async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    match Assets::get(&path) {
        Some(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn video_feed_handler(State(state): State<AppState>) -> Response {
    let frames = stream::mjpeg_stream(state.session.subscribe());
    (
        [
            (header::CONTENT_TYPE, stream::content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn cameras_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(list_devices(&state.dev_root))
}

async fn set_camera_handler(
    State(state): State<AppState>,
    Path(index): Path<u32>,
) -> impl IntoResponse {
    state.session.set_frame_source(&index.to_string());
    Json(json!({
        "status": "success",
        "message": format!("Switched to camera {index}"),
    }))
}

async fn debug_handler(
    State(state): State<AppState>,
    Path(enabled): Path<String>,
) -> impl IntoResponse {
    let enabled = enabled.eq_ignore_ascii_case("true");
    state.session.set_debug_override(enabled);
    Json(json!({ "status": "success", "debug_mode": enabled }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.session.status();
    Json(StatusResponse {
        processing: status.in_flight,
        cooldown: status.cooldown_remaining_secs,
    })
}

async fn list_detections_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.store.list(limit) {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn update_detection_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateDetection>,
) -> Response {
    match state
        .store
        .update(id, &body.species, body.confidence, &body.interesting_fact)
    {
        Ok(true) => Json(json!({ "status": "success" })).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "detection not found").into_response(),
        Err(e) => store_failure(e),
    }
}

async fn delete_detection_handler(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete(id) {
        Ok(true) => Json(json!({ "status": "success" })).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "detection not found").into_response(),
        Err(e) => store_failure(e),
    }
}

async fn clear_detections_handler(State(state): State<AppState>) -> Response {
    let records = match state.store.clear() {
        Ok(n) => n,
        Err(e) => return store_failure(e),
    };
    let files = remove_captures(&state.captures_dir).await;

    tracing::info!(records, files, "cleared all detections");
    Json(json!({ "status": "success", "message": "All detections cleared" })).into_response()
}

/// Delete regular files and symlinks directly under `dir`. Individual
/// failures are logged and skipped.
async fn remove_captures(dir: &FsPath) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to read captures directory");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = match entry.file_type().await {
            Ok(t) => t.is_file() || t.is_symlink(),
            Err(_) => false,
        };
        if !is_file {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete capture"),
        }
    }
    removed
}

fn store_failure(e: crate::storage::StoreError) -> Response {
    tracing::error!(error = %e, "detection store failure");
    (StatusCode::INTERNAL_SERVER_ERROR, "detection store error").into_response()
}
