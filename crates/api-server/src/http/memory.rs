use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use shared::models::StatusResponse;
use tracing::info;

use super::AppState;
use super::errors::bad_request_response;

pub(super) async fn clear_memory(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return bad_request_response("invalid_session_id", "Session id must not be empty");
    }

    state.orchestrator.sessions().clear(session_id).await;
    info!(session_id, "cleared conversation history");

    Json(StatusResponse {
        status: "success".to_string(),
        message: format!("Conversation history cleared for session {session_id}"),
    })
    .into_response()
}
