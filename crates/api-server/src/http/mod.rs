use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use shared::orchestrator::QueryOrchestrator;
use shared::retrieval::KnowledgeBase;
use tower_http::cors::CorsLayer;

mod documents;
mod errors;
mod health;
mod memory;
mod observability;
mod query;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: QueryOrchestrator,
    pub knowledge_base: Arc<KnowledgeBase>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/query", post(query::query))
        .route("/query/stream", post(query::query_stream))
        .route("/documents", get(documents::list_documents))
        .route("/documents/upload", post(documents::upload_document))
        .route("/documents/{filename}", delete(documents::delete_document))
        .route("/memory/{session_id}", delete(memory::clear_memory))
        .layer(middleware::from_fn(
            observability::request_observability_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
