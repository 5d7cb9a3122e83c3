use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use shared::models::{DocumentUploadResponse, ListDocumentsResponse, StatusResponse};
use tracing::{info, warn};

use super::AppState;
use super::errors::{bad_request_response, knowledge_base_error_response};

const UPLOAD_FIELD: &str = "file";

pub(super) async fn list_documents(State(state): State<AppState>) -> Response {
    match state.knowledge_base.list_documents().await {
        Ok(documents) => Json(ListDocumentsResponse {
            count: documents.len(),
            documents,
        })
        .into_response(),
        Err(err) => knowledge_base_error_response(err),
    }
}

pub(super) async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let (filename, bytes) = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return bad_request_response("missing_file", "Multipart field 'file' is required");
            }
            Err(err) => {
                warn!(error = %err, "failed to read multipart upload");
                return bad_request_response("invalid_upload", "Upload body is malformed");
            }
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let Some(filename) = field.file_name().map(str::to_string) else {
            return bad_request_response("invalid_filename", "Uploaded file has no filename");
        };
        match field.bytes().await {
            Ok(bytes) => break (filename, bytes),
            Err(err) => {
                warn!(error = %err, "failed to read uploaded file");
                return bad_request_response("invalid_upload", "Upload body is malformed");
            }
        }
    };

    let size = bytes.len();
    match state
        .knowledge_base
        .save_document(&filename, bytes.to_vec())
        .await
    {
        Ok(saved) => {
            info!(filename = %saved.filename, size, "document uploaded");
            Json(DocumentUploadResponse {
                filename: saved.filename,
                status: "success".to_string(),
                message: "Document uploaded and indexed successfully".to_string(),
                document_count: saved.document_count,
            })
            .into_response()
        }
        Err(err) => knowledge_base_error_response(err),
    }
}

pub(super) async fn delete_document(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match state.knowledge_base.delete_document(&filename).await {
        Ok(()) => Json(StatusResponse {
            status: "success".to_string(),
            message: format!("Document {filename} deleted and vector store rebuilt"),
        })
        .into_response(),
        Err(err) => knowledge_base_error_response(err),
    }
}
