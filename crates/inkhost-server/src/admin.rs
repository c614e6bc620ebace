use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use inkhost_runtime::{RuntimeStatusInfo, SsrError};
use serde::{Deserialize, Serialize};

use crate::state::{ADMIN_SCOPE, AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorBody { message: message.into() })).into_response()
}

fn error_response(e: SsrError) -> Response {
    let code = match e {
        SsrError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SsrError::NotRunning(_) | SsrError::NotInstalled(_) => StatusCode::NOT_FOUND,
        SsrError::SpawnFailed { .. }
        | SsrError::ActivationPersistFailed(_)
        | SsrError::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(code, e.to_string())
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    name: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    #[serde(flatten)]
    info: RuntimeStatusInfo,
    is_current: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:name/start", post(start))
        .route("/:name/stop", post(stop))
        .route("/:name/activate", post(activate))
        .route("/:name/status", get(status))
        .route("/deactivate", post(deactivate))
        .route("/list", get(list))
}

/// Starts a runtime without touching the activation flag. Meant for warming a
/// theme up or smoke-testing it before switching traffic over.
async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Response {
    let port = body
        .and_then(|Json(b)| b.port)
        .unwrap_or(state.default_ssr_port);

    match state.supervisor.start(&name, port).await {
        Ok(()) => (StatusCode::OK, Json(StartResponse { name, port })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.supervisor.stop(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn activate(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let port = state.default_ssr_port;
    match state.coordinator.activate(ADMIN_SCOPE, &name, port).await {
        Ok(()) => (StatusCode::OK, Json(StartResponse { name, port })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn deactivate(State(state): State<AppState>) -> Response {
    match state.coordinator.deactivate(ADMIN_SCOPE).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn status(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    (StatusCode::OK, Json(state.supervisor.status(&name))).into_response()
}

async fn list(State(state): State<AppState>) -> Response {
    let current = match state.catalog.current_theme(ADMIN_SCOPE).await {
        Ok(v) => v,
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("catalog error: {e}"),
            );
        }
    };

    let entries: Vec<ListEntry> = state
        .supervisor
        .list_installed()
        .into_iter()
        .map(|info| ListEntry {
            is_current: current.as_deref() == Some(info.name.as_str()),
            info,
        })
        .collect();

    (StatusCode::OK, Json(entries)).into_response()
}
