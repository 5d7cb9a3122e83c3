use axum::Json;
use axum::extract::State;
use shared::models::HealthResponse;

use super::AppState;

const SERVICE_NAME: &str = "SecureRAG";

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.orchestrator.model_name().to_string(),
        vector_store: state.knowledge_base.index_exists(),
        documents_path: state.knowledge_base.docs_path_exists(),
        memory_enabled: true,
        session_backend: state.orchestrator.sessions().backend().as_str().to_string(),
    })
}
