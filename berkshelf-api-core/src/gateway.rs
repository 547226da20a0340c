//! HTTP surface of the index server.
//!
//! - `GET /universe`: the served universe, or 503 with `Retry-After` until the cache is warmed.
//! - `GET /status`: liveness and cache state.
//! - `GET /cookbooks/:name/:version[?nocache=true]`: the cookbook packaged as a gzip tarball.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::archive::{archive_file_name, ArchiveStore};
use crate::cache_manager::CacheManager;
use crate::worker::WorkerHandle;

/// Seconds clients are told to wait while the cache warms.
pub const RETRY_AFTER_SECS: u64 = 600;

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<CacheManager>,
    pub workers: Arc<Vec<WorkerHandle>>,
    pub archives: ArchiveStore,
    /// Process start; survives group restarts.
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
    pub version: String,
    pub cache_status: String,
    pub uptime: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub nocache: Option<String>,
}

impl DownloadQuery {
    /// A bare `?nocache` or any value except `false`/`0` forces a refetch.
    pub fn nocache(&self) -> bool {
        match self.nocache.as_deref() {
            None => false,
            Some(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0"),
        }
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version pattern is a valid regex"))
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/universe", get(universe))
        .route("/status", get(status))
        .route("/cookbooks/:name/:version", get(download))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain open connections.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: GatewayState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!(%addr, "Gateway stopped");
    Ok(())
}

async fn universe(State(state): State<GatewayState>) -> Response {
    if !state.manager.is_warmed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
        )
            .into_response();
    }
    let snapshot = state.manager.current();
    match serde_json::to_vec(&snapshot.universe) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to serialize universe");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn status(State(state): State<GatewayState>) -> Json<StatusBody> {
    let cache_status = if state.manager.is_warmed() { "ok" } else { "warming" };
    Json(StatusBody {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_status: cache_status.to_string(),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

async fn download(
    State(state): State<GatewayState>,
    Path((name, version)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let span = info_span!("download", %request_id, name = %name, version = %version);
    serve_archive(state, name, version, query.nocache())
        .instrument(span)
        .await
}

async fn serve_archive(state: GatewayState, name: String, version: String, nocache: bool) -> Response {
    if !version_pattern().is_match(&version) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let snapshot = state.manager.current();
    let Some(origin) = snapshot.origin(&name, &version) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(worker) = state.workers.iter().find(|w| w.index() == origin.worker) else {
        warn!(worker = origin.worker, "Owning worker is not running");
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let path = match state.archives.fetch(worker, &origin.remote, nocache).await {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "Cookbook download failed");
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to open archive");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let disposition = format!("attachment; filename=\"{}\"", archive_file_name(&name, &version));
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}
