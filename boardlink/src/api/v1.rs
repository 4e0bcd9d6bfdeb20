//! API version 1 endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::ports;
use crate::supervisor::SupervisorHandle;
use crate::supervisor_cmd::ConnectionSummary;
use crate::tracing::prelude::*;

/// Shared application state for API endpoints.
#[derive(Debug, Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
}

impl AppState {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self { supervisor }
    }
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
    };
    (status, Json(body)).into_response()
}

/// Health check endpoint handler.
///
/// Returns a simple OK status to verify the API is running.
async fn health() -> &'static str {
    "OK"
}

/// List serial ports a board could be attached to.
///
/// Only devices whose name looks like a USB, ACM or COM port are
/// reported, in enumeration order.
///
/// # Example
/// ```bash
/// curl http://localhost:7786/api/v1/serialports
/// ```
async fn list_serial_ports() -> Response {
    match tokio::task::spawn_blocking(ports::list_board_ports).await {
        Ok(Ok(names)) => Json(names).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "Serial port enumeration failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// List every deployed connection with its state and status.
async fn list_connections(State(state): State<AppState>) -> Response {
    match state.supervisor.list().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// A single connection by node id.
async fn get_connection(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let list = match state.supervisor.list().await {
        Ok(list) => list,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    };
    match list.into_iter().find(|c: &ConnectionSummary| c.id == id) {
        Some(summary) => Json(summary).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("connection '{}' not found", id),
        ),
    }
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/serialports", get(list_serial_ports))
        .route("/connections", get(list_connections))
        .route("/connections/:id", get(get_connection))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::lifecycle::next_event;
    use crate::supervisor::Supervisor;
    use axum::body::to_bytes;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn spawn_state() -> AppState {
        let (supervisor, handle) = Supervisor::new();
        tokio::spawn(supervisor.run());
        AppState::new(handle)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(health().await, "OK");
    }

    #[tokio::test]
    async fn connections_report_state_and_status() {
        let state = spawn_state();
        let config: NodeConfig =
            serde_json::from_value(json!({"id": "n1", "connectionType": "carrier-pigeon"}))
                .unwrap();
        let mut deployed = state.supervisor.deploy(config).await.unwrap();
        next_event(&mut deployed.events, Duration::from_secs(3)).await;

        let response = list_connections(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["id"], "n1");
        assert_eq!(body[0]["state"], "ioError");
        assert_eq!(body[0]["status"]["fill"], "red");
        assert_eq!(body[0]["status"]["text"], "error");

        let one = get_connection(State(state.clone()), Path("n1".into())).await;
        assert_eq!(one.status(), StatusCode::OK);
        let missing = get_connection(State(state), Path("nope".into())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stopped_supervisor_is_unavailable() {
        let state = spawn_state();
        state.supervisor.shutdown().await.unwrap();
        let response = list_connections(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
