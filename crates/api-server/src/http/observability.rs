use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use shared::models::StructuredAnswer;
use shared::orchestrator::{QueryError, StreamEvent};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(super) const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub(super) struct RequestContext {
    pub(super) request_id: String,
    pub(super) started_at: Instant,
}

/// Assigns the request id and logs every request once. NDJSON query streams
/// are only announced here; their completion is logged by [`StreamTrace`]
/// when the body ends.
pub(super) async fn request_observability_middleware(mut req: Request, next: Next) -> Response {
    let request_id = resolve_request_id(&req);
    let started_at = Instant::now();
    req.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        started_at,
    });

    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header_value,
        );
    }

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    if is_ndjson(&response) {
        debug!(request_id = %request_id, route = %route, status, "query stream opened");
    } else if status >= 500 {
        warn!(
            request_id = %request_id,
            method = %method,
            route = %route,
            status,
            latency_ms,
            "request failed"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            route = %route,
            status,
            latency_ms,
            "request completed"
        );
    }

    response
}

fn is_ndjson(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(NDJSON_CONTENT_TYPE))
}

/// Outcome label for a finished blocking query.
pub(super) fn query_outcome(result: &Result<StructuredAnswer, QueryError>) -> &'static str {
    match result {
        Ok(answer) if answer.is_fallback() => "fallback",
        Ok(_) => "answered",
        Err(QueryError::InvalidInput(_)) => "invalid_query",
        Err(QueryError::Timeout) => "generation_timeout",
        Err(QueryError::GenerationUnavailable(_)) => "generation_unavailable",
        Err(QueryError::RetrievalUnavailable(_)) => "retrieval_unavailable",
    }
}

/// Follows one NDJSON query stream and logs its outcome when dropped, which
/// happens when the body finishes or the client goes away.
#[derive(Debug)]
pub(super) struct StreamTrace {
    request_id: String,
    session_id: Option<String>,
    started_at: Instant,
    fragments: usize,
    retracted: bool,
    outcome: Option<&'static str>,
}

impl StreamTrace {
    pub(super) fn new(context: &RequestContext, session_id: Option<String>) -> Self {
        Self {
            request_id: context.request_id.clone(),
            session_id,
            started_at: context.started_at,
            fragments: 0,
            retracted: false,
            outcome: None,
        }
    }

    pub(super) fn record(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Fragment(_) => self.fragments += 1,
            StreamEvent::Retract => self.retracted = true,
            StreamEvent::Answer(answer) if answer.is_fallback() => self.outcome = Some("fallback"),
            StreamEvent::Answer(_) => self.outcome = Some("answered"),
            StreamEvent::Error(_) => self.outcome = Some("error"),
        }
    }

    fn outcome(&self) -> &'static str {
        self.outcome.unwrap_or("client_disconnected")
    }
}

impl Drop for StreamTrace {
    fn drop(&mut self) {
        info!(
            request_id = %self.request_id,
            session_id = self.session_id.as_deref().unwrap_or(""),
            outcome = self.outcome(),
            fragments = self.fragments,
            retracted = self.retracted,
            latency_ms = self.started_at.elapsed().as_millis() as u64,
            "query stream finished"
        );
    }
}

fn resolve_request_id(req: &Request) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn normalize_request_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_REQUEST_ID_LEN {
        return None;
    }

    let valid = trimmed
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'));
    valid.then(|| trimmed.to_string())
}
