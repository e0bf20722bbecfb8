use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use cvd_lens_common::color::Filter;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::session::{Command, Status};
use crate::source::mjpeg;
use crate::surface::{Snapshot, SurfaceError, SurfaceReader};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<Status>,
    pub surfaces: Vec<SurfaceReader>,
    pub jpeg_quality: u8,
}

impl AppState {
    fn surface(&self, name: &str) -> Option<&SurfaceReader> {
        self.surfaces.iter().find(|s| s.name() == name)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/filters", get(list_filters))
        .route("/filter/:name", put(put_filter))
        .route("/start", post(post_start))
        .route("/pause", post(post_pause))
        .route("/surfaces", get(list_surfaces))
        .route("/surfaces/:name/frame.jpg", get(surface_frame))
        .route("/surfaces/:name/stream", get(surface_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn session_gone() -> Response {
    error!("session task is gone");
    error_body(StatusCode::SERVICE_UNAVAILABLE, "session is not running")
}

async fn encode(snapshot: Snapshot, quality: u8) -> Result<Vec<u8>, SurfaceError> {
    tokio::task::spawn_blocking(move || snapshot.encode_jpeg(quality))
        .await
        .map_err(|e| SurfaceError::Encode(e.to_string()))?
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(state.status.borrow().clone())
}

/// GET /filters
async fn list_filters() -> Json<Vec<&'static str>> {
    Json(Filter::ALL.iter().map(|f| f.name()).collect())
}

/// PUT /filter/:name. Takes effect from the next rendered frame.
async fn put_filter(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let (reply, rx) = oneshot::channel();
    if state
        .commands
        .send(Command::SetFilter { name, reply })
        .await
        .is_err()
    {
        return session_gone();
    }
    match rx.await {
        Ok(Ok(filter)) => {
            info!(%filter, "filter selected");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Err(e)) => error_body(StatusCode::BAD_REQUEST, e),
        Err(_) => session_gone(),
    }
}

/// POST /start. 409 while a start is in flight or the camera is running.
async fn post_start(State(state): State<Arc<AppState>>) -> Response {
    if !state.status.borrow().start_enabled {
        return error_body(
            StatusCode::CONFLICT,
            "camera is starting or already running",
        );
    }
    match state.commands.send(Command::Start).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => session_gone(),
    }
}

/// POST /pause
async fn post_pause(State(state): State<Arc<AppState>>) -> Response {
    match state.commands.send(Command::Pause).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => session_gone(),
    }
}

/// GET /surfaces
async fn list_surfaces(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.surfaces.iter().map(|s| s.name().to_string()).collect())
}

/// GET /surfaces/:name/frame.jpg: the last presented frame.
async fn surface_frame(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(reader) = state.surface(&name) else {
        return error_body(StatusCode::NOT_FOUND, format!("no surface named '{name}'"));
    };
    let Some(snapshot) = reader.latest() else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "nothing presented yet");
    };
    match encode(snapshot, state.jpeg_quality).await {
        Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Err(e) => {
            error!(error = %e, surface = name, "JPEG encode failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// GET /surfaces/:name/stream: MJPEG, one part per presented frame.
async fn surface_stream(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(reader) = state.surface(&name).cloned() else {
        return error_body(StatusCode::NOT_FOUND, format!("no surface named '{name}'"));
    };
    info!(surface = name, "MJPEG viewer connected");

    let quality = state.jpeg_quality;
    let parts = futures_util::stream::unfold(reader, move |mut reader| async move {
        let snapshot = reader.next().await?;
        let part = encode(snapshot, quality)
            .await
            .map(|jpeg| mjpeg::encode_part(mjpeg::DEFAULT_BOUNDARY, &jpeg));
        Some((part, reader))
    });

    let content_type = format!(
        "multipart/x-mixed-replace; boundary={}",
        mjpeg::DEFAULT_BOUNDARY
    );
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(parts))
        .unwrap_or_else(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e))
}
