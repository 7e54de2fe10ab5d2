//! Companion file service
//!
//! Serves the generated index and the artifact files over HTTP: the
//! index document, per-id artifact downloads, and a health probe. An
//! optional access token gates the index and artifact routes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use crate::config::ARTIFACT_EXT;

/// Request header carrying the access token
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Configuration for the file service
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory of artifact files (`<id>.lua`)
    pub games_dir: PathBuf,
    /// Generated index document
    pub index_path: PathBuf,
    /// When set, requests must carry the matching token header
    pub access_token: Option<String>,
}

struct ServeState {
    config: ServerConfig,
}

/// Build the service router.
pub fn router(config: ServerConfig) -> Router {
    let state = Arc::new(ServeState { config });
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/games_index.json", get(handle_index))
        .route("/lua/{id}", get(handle_artifact))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(config: ServerConfig, addr: SocketAddr) -> Result<()> {
    let app = router(config);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("File service listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn authorized(state: &ServeState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.access_token else {
        return true;
    };
    let presented = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    presented == Some(expected.as_str())
}

async fn handle_health(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
    // The probe reports degraded (but still 200) when the index is missing,
    // so monitoring can tell "up" from "up and serving".
    let index_ready = state.config.index_path.exists();
    Json(json!({
        "status": if index_ready { "ok" } else { "no-index" },
        "index_ready": index_ready,
    }))
}

async fn handle_index(
    State(state): State<Arc<ServeState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid or missing access token"})),
        )
            .into_response();
    }

    match std::fs::read_to_string(&state.config.index_path) {
        Ok(payload) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            payload,
        )
            .into_response(),
        Err(e) => {
            warn!("Index read failed: {e}");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Index not generated yet"})),
            )
                .into_response()
        }
    }
}

async fn handle_artifact(
    State(state): State<Arc<ServeState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "Invalid or missing access token").into_response();
    }

    // Clients may request either `<id>` or `<id>.lua`.
    let file_name = if id.ends_with(&format!(".{ARTIFACT_EXT}")) {
        id.clone()
    } else {
        format!("{id}.{ARTIFACT_EXT}")
    };

    // The id comes from the URL; never let it walk out of the games dir.
    if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
        return (StatusCode::BAD_REQUEST, "Invalid identifier").into_response();
    }

    // Raw bytes; artifact files are not guaranteed to be valid UTF-8.
    let path = state.config.games_dir.join(&file_name);
    match std::fs::read(&path) {
        Ok(body) => (StatusCode::OK, [("content-type", "text/plain")], body).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "No patch for this identifier").into_response()
        }
        Err(e) => {
            warn!("Artifact read failed for {}: {e}", path.display());
            (StatusCode::INTERNAL_SERVER_ERROR, "Artifact unreadable").into_response()
        }
    }
}
