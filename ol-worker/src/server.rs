// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker HTTP surface.
//!
//! `/run/{name}` forwards the request to the function manager; the
//! `/registry` routes manage the code archives the functions are pulled
//! from. Everything else is introspection.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use ol_core::blob::BlobStore;
use ol_core::error::{PullError, SandboxError, WorkerError};
use ol_core::lambda_config::{extract_config_from_tar_gz, LambdaConfig};
use ol_core::{FunctionManager, FunctionName};

use crate::metrics;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Clone)]
pub struct AppState {
    manager: Arc<FunctionManager>,
}

impl AppState {
    fn store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(self.manager.store())
    }
}

/// Worker errors rendered as `status + message`.
#[derive(Debug)]
pub struct ApiError(WorkerError);

impl<E: Into<WorkerError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (status, format!("{}\n", self.0)).into_response()
    }
}

pub fn router(manager: Arc<FunctionManager>) -> Router {
    Router::new()
        .route("/run/{name}", any(run))
        .route("/run/{name}/{*path}", any(run_subpath))
        .route("/pid", get(pid))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/debug", get(debug))
        .route("/metrics", get(prometheus_metrics))
        .route("/registry", get(registry_list))
        .route(
            "/registry/{name}",
            post(registry_upload)
                .delete(registry_delete)
                .get(registry_fetch)
                // archives routinely carry data files past axum's 2 MB default
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/registry/{name}/config", get(registry_config))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

async fn run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    invoke(state, name, request).await
}

async fn run_subpath(
    State(state): State<AppState>,
    Path((name, _path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    invoke(state, name, request).await
}

async fn invoke(state: AppState, name: String, request: Request) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| SandboxError::Transport {
            reason: format!("reading request body: {}", e),
        })?;

    let started = Instant::now();
    let result = state
        .manager
        .invoke(&name, axum::http::Request::from_parts(parts, body))
        .await;

    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status_code(),
    };
    metrics::observe_invocation(&name, status.as_u16(), started.elapsed().as_secs_f64());

    Ok(result?.map(Body::from))
}

async fn pid() -> String {
    format!("{}\n", std::process::id())
}

async fn status() -> &'static str {
    "ready\n"
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats())
}

async fn debug(State(state): State<AppState>) -> String {
    state.manager.debug_string()
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&state.manager.stats()),
    )
}

fn archive_key(name: &str) -> Result<(FunctionName, String), ApiError> {
    let name = FunctionName::new(name)?;
    let key = format!("{}{}", name, ARCHIVE_SUFFIX);
    Ok((name, key))
}

/// Run blocking blob I/O off the async workers.
async fn blocking<T, F>(op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PullError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| WorkerError::Syscall {
            syscall: "spawn_blocking",
            message: e.to_string(),
        })?
        .map_err(ApiError::from)
}

async fn registry_list(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let store = state.store();
    let keys = blocking(move || store.list("")).await?;
    let names = keys
        .iter()
        .filter_map(|key| key.strip_suffix(ARCHIVE_SUFFIX))
        .map(str::to_string)
        .collect();
    Ok(Json(names))
}

/// Accept an archive only if its `ol.yaml` (when present) parses.
async fn registry_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (name, key) = archive_key(&name)?;
    let store = state.store();

    let config = blocking(move || {
        let config = extract_config_from_tar_gz(Cursor::new(&body))?;
        let mut writer = store.writer(&key)?;
        writer.write_all(&body).map_err(|source| PullError::Io {
            context: "writing archive",
            source,
        })?;
        writer.commit()?;
        Ok(config)
    })
    .await?;

    tracing::info!(
        function = %name,
        http_methods = ?config.allowed_http_methods(),
        "Uploaded function"
    );
    Ok(StatusCode::CREATED)
}

async fn registry_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (name, key) = archive_key(&name)?;
    let store = state.store();
    blocking(move || store.delete(&key)).await?;

    state.manager.kill(&name).await;
    tracing::info!(function = %name, "Deleted function");
    Ok(StatusCode::OK)
}

/// Archives are only served to workers through the blob store.
async fn registry_fetch(Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    archive_key(&name)?;
    Err(WorkerError::NotImplemented {
        feature: "archive download",
    }
    .into())
}

async fn registry_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LambdaConfig>, ApiError> {
    let (_, key) = archive_key(&name)?;
    let store = state.store();
    let config = blocking(move || extract_config_from_tar_gz(store.reader(&key)?)).await?;
    Ok(Json(config))
}
