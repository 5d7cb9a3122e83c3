use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use shared::models::{QueryRequest, StreamMessage};
use shared::orchestrator::StreamEvent;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use super::AppState;
use super::errors::{bad_request_response, query_error_response};
use super::observability::{NDJSON_CONTENT_TYPE, RequestContext, StreamTrace, query_outcome};

pub(super) async fn query(
    State(state): State<AppState>,
    Extension(request_context): Extension<RequestContext>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let req = match parse_query_request(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let result = state
        .orchestrator
        .query(&req.query, req.session_id.as_deref())
        .await;
    info!(
        request_id = %request_context.request_id,
        session_id = req.session_id.as_deref().unwrap_or(""),
        outcome = query_outcome(&result),
        "query finished"
    );

    match result {
        Ok(answer) => Json(answer).into_response(),
        Err(err) => query_error_response(err),
    }
}

/// Streams newline-delimited JSON events. Disconnecting the client drops the
/// body stream, which cancels the query.
pub(super) async fn query_stream(
    State(state): State<AppState>,
    Extension(request_context): Extension<RequestContext>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let req = match parse_query_request(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let mut trace = StreamTrace::new(&request_context, req.session_id.clone());
    let stream = match state.orchestrator.query_stream(&req.query, req.session_id) {
        Ok(stream) => stream,
        Err(err) => {
            trace.record(&StreamEvent::Error(err.to_string()));
            return query_error_response(err);
        }
    };

    let (events, cancel_on_drop) = stream.into_parts();
    let body = ReceiverStream::new(events).map(move |event| {
        let _cancel_on_drop = &cancel_on_drop;
        trace.record(&event);
        Ok::<_, Infallible>(ndjson_line(event))
    });

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response()
}

fn parse_query_request(
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<QueryRequest, Response> {
    match payload {
        Ok(Json(req)) => Ok(req),
        Err(rejection) => {
            warn!(
                status = rejection.status().as_u16(),
                error = %rejection,
                "rejected query body"
            );
            Err(bad_request_response(
                "invalid_request",
                &format!(
                    "Request body must be JSON with a string \"query\" field: {}",
                    rejection.body_text()
                ),
            ))
        }
    }
}

fn ndjson_line(event: StreamEvent) -> String {
    let message = match event {
        StreamEvent::Fragment(text) => StreamMessage::Fragment { text },
        StreamEvent::Retract => StreamMessage::Retract,
        StreamEvent::Answer(answer) => StreamMessage::Answer(answer),
        StreamEvent::Error(message) => StreamMessage::Error { message },
    };

    let mut line = serde_json::to_string(&message).unwrap_or_else(|err| {
        error!(error = %err, "failed to encode stream event");
        r#"{"type":"error","message":"failed to encode stream event"}"#.to_string()
    });
    line.push('\n');
    line
}
