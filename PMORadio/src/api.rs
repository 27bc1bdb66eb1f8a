//! Routes HTTP : santé, stations, historique et fichiers audio.

use crate::ws;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use pmoradio::reaction::clean_radio_name;
use pmoradio::{BackendStatus, ParamsGenerator, RadioHandle, StationManager, TrackRenderer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::debug;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub radio: RadioHandle,
    pub stations: StationManager,
    pub params: Arc<dyn ParamsGenerator>,
    pub renderer: Arc<dyn TrackRenderer>,
    pub min_free_mb: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/radios", get(list_radios))
        .route("/api/radios/{name}/history", get(radio_history))
        .route("/audio/{radio}/{file}", get(serve_audio))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    renderer: BackendStatus,
    params: BackendStatus,
    free_mb: Option<f64>,
    disk_ok: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (renderer, params) = tokio::join!(state.renderer.health(), state.params.health());
    let free_mb = pmoutils::free_space_mb(state.stations.radios_dir());
    let disk_ok = free_mb.map_or(true, |mb| mb >= state.min_free_mb);
    Json(HealthResponse {
        ok: renderer.ok && params.ok && disk_ok,
        renderer,
        params,
        free_mb,
        disk_ok,
    })
}

async fn list_radios(State(state): State<AppState>) -> impl IntoResponse {
    let radios = state.stations.summaries();
    let current = radios
        .iter()
        .find(|r| r.is_current)
        .map(|r| r.name.clone())
        .unwrap_or_default();
    Json(serde_json::json!({ "radios": radios, "current": current }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn radio_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let station = state
        .stations
        .open(&name)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Ok(Json(serde_json::json!({
        "radio": station.name(),
        "tracks": station.history(limit),
    })))
}

/// Sert un fichier de `tracks/` ou, à défaut, de `favorites/`.
async fn serve_audio(
    State(state): State<AppState>,
    Path((radio, file)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    if is_traversal(&radio, &file) {
        debug!(%radio, %file, "rejected audio path");
        return Err(StatusCode::FORBIDDEN);
    }
    let station = state
        .stations
        .open(&radio)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let path = station.audio_file(&file).ok_or(StatusCode::NOT_FOUND)?;
    let audio = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let length = audio.metadata().await.map(|m| m.len()).ok();

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }
    response
        .body(Body::from_stream(ReaderStream::new(audio)))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn is_traversal(radio: &str, file: &str) -> bool {
    clean_radio_name(radio) != radio
        || file.contains("..")
        || file.contains('/')
        || file.contains('\\')
}
