use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::models::{ErrorBody, ErrorResponse};
use shared::orchestrator::QueryError;
use shared::retrieval::KnowledgeBaseError;
use tracing::{error, warn};

pub(super) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
        .into_response()
}

pub(super) fn bad_request_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

pub(super) fn internal_error_response() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Unexpected server error",
    )
}

pub(super) fn query_error_response(err: QueryError) -> Response {
    match err {
        QueryError::InvalidInput(message) => bad_request_response("invalid_query", &message),
        QueryError::Timeout => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "generation_timeout",
            "The query timed out",
        ),
        QueryError::GenerationUnavailable(message) => {
            warn!(error = %message, "generation unavailable");
            error_response(
                StatusCode::BAD_GATEWAY,
                "generation_unavailable",
                "The language model is unavailable",
            )
        }
        QueryError::RetrievalUnavailable(message) => {
            warn!(error = %message, "retrieval unavailable");
            error_response(
                StatusCode::BAD_GATEWAY,
                "retrieval_unavailable",
                "Document retrieval is unavailable",
            )
        }
    }
}

pub(super) fn knowledge_base_error_response(err: KnowledgeBaseError) -> Response {
    match err {
        KnowledgeBaseError::UnsupportedFileType(extension) => bad_request_response(
            "unsupported_file_type",
            &format!("Unsupported file type {extension}. Allowed: .txt, .md, .pdf"),
        ),
        KnowledgeBaseError::InvalidFilename(_) => {
            bad_request_response("invalid_filename", "Filename is invalid")
        }
        KnowledgeBaseError::InvalidDocument(_) => {
            bad_request_response("invalid_document", "Document text could not be extracted")
        }
        KnowledgeBaseError::DocumentNotFound(_) => error_response(
            StatusCode::NOT_FOUND,
            "document_not_found",
            "Document not found",
        ),
        KnowledgeBaseError::Embedding(err) => {
            warn!(error = %err, "embedding provider failed during rebuild");
            error_response(
                StatusCode::BAD_GATEWAY,
                "embedding_unavailable",
                "The embedding provider is unavailable",
            )
        }
        other => {
            error!(error = %other, "knowledge base operation failed");
            internal_error_response()
        }
    }
}
