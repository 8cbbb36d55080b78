//! HTTP request handlers.
//!
//! Handlers validate the request shape and delegate to the registry; error
//! kinds map onto HTTP statuses here and nowhere else.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::{
    state::ServerState,
    types::{ConsoleRequest, DeleteParams, ErrorResponse, StartRequest, StopRequest},
};
use crate::{config::MachineDef, config::MachineStatus, MachinedError};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /machines`.
pub async fn list_machines(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.registry().machines().await)
}

/// Handler for `POST /machines`.
pub async fn create_machine(
    State(state): State<ServerState>,
    Json(def): Json<MachineDef>,
) -> Response {
    match state.registry().add_machine(def).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `GET /machines/:name`.
pub async fn get_machine(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    match state.registry().machine(&name).await {
        Ok(machine) => Json(machine).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `PUT /machines/:name`.
pub async fn update_machine(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(def): Json<MachineDef>,
) -> Response {
    match state.registry().update_machine(&name, def).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `DELETE /machines/:name`.
pub async fn delete_machine(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Response {
    match state.registry().delete_machine(&name, params.force).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `POST /machines/:name/start`.
pub async fn start_machine(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(request): Json<StartRequest>,
) -> Response {
    if request.status != MachineStatus::Running {
        return error_response(MachinedError::Validation(format!(
            "invalid start request: status must be 'running', got '{}'",
            request.status
        )));
    }
    match state.registry().start_machine(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `POST /machines/:name/stop`.
pub async fn stop_machine(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(request): Json<StopRequest>,
) -> Response {
    if request.status != MachineStatus::Stopped {
        return error_response(MachinedError::Validation(format!(
            "invalid stop request: status must be 'stopped', got '{}'",
            request.status
        )));
    }
    match state.registry().stop_machine(&name, request.force).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for `POST /machines/:name/console`.
pub async fn machine_console(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(request): Json<ConsoleRequest>,
) -> Response {
    match state.registry().machine_console(&name, request.kind).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Maps an error kind onto an HTTP status and JSON body.
pub fn error_response(error: MachinedError) -> Response {
    let status = match &error {
        MachinedError::NotFound(_) => StatusCode::NOT_FOUND,
        MachinedError::AlreadyExists(_) | MachinedError::Busy(_) => StatusCode::CONFLICT,
        MachinedError::Validation(_) | MachinedError::PathTooLong { .. } => {
            StatusCode::BAD_REQUEST
        }
        MachinedError::AssetMissing(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %error, "request failed");
    } else {
        tracing::debug!(error = %error, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
