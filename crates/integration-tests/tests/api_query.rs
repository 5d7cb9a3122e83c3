mod support;

use axum::http::{Method, StatusCode};
use serde_json::{Value, json};
use shared::models::FALLBACK_ANSWER_TEXT;
use shared::orchestrator::OrchestratorConfig;
use shared::session::SessionStore;
use tower::ServiceExt;

use support::{
    GenerationErrorKind, StubReply, build_test_app, build_test_app_with_config, error_code,
    refund_answer_json, request, send_json, send_raw, test_orchestrator_config,
};

#[tokio::test]
async fn health_reports_service_state() {
    let app = build_test_app(Vec::new()).await;

    let response = send_json(&app.router, request(Method::GET, "/health", None)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "healthy");
    assert_eq!(response.body["service"], "SecureRAG");
    assert_eq!(response.body["model"], "stub-model");
    assert_eq!(response.body["vector_store"], true);
    assert_eq!(response.body["documents_path"], true);
    assert_eq!(response.body["memory_enabled"], true);
    assert_eq!(response.body["session_backend"], "memory");
}

#[tokio::test]
async fn query_answers_refund_policy_from_retrieved_document() {
    let app = build_test_app(vec![StubReply::Text(refund_answer_json())]).await;

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/query",
            Some(json!({
                "query": "What is the refund policy?",
                "session_id": "s1"
            })),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.body,
        json!({
            "answer": "Refunds are accepted within 30 days of purchase.",
            "confidence": "high",
            "sources": ["refund.txt"]
        })
    );

    let prompts = app.generator.prompts().await;
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].system.contains("Source: refund.txt"));
    assert!(prompts[0].system.contains("refunds are accepted within 30 days"));
    assert_eq!(app.sessions.get("s1").await.len(), 2);
}

#[tokio::test]
async fn query_rejects_invalid_input_with_error_envelope() {
    let app = build_test_app(vec![StubReply::Text(refund_answer_json())]).await;

    for query in ["", "  ", "hi"] {
        let response = send_json(
            &app.router,
            request(Method::POST, "/query", Some(json!({ "query": query }))),
        )
        .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response.body), Some("invalid_query"));
    }

    assert!(app.generator.prompts().await.is_empty());
}

#[tokio::test]
async fn query_returns_fallback_when_generation_keeps_failing() {
    let app = build_test_app(vec![
        StubReply::Fail(GenerationErrorKind::Unavailable),
        StubReply::Fail(GenerationErrorKind::Unavailable),
        StubReply::Fail(GenerationErrorKind::Unavailable),
    ])
    .await;

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/query",
            Some(json!({ "query": "What is the refund policy?", "session_id": "s1" })),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["answer"], FALLBACK_ANSWER_TEXT);
    assert_eq!(response.body["confidence"], "low");
    assert_eq!(response.body["sources"], json!([]));
    assert!(app.sessions.get("s1").await.is_empty());
}

#[tokio::test]
async fn query_maps_generation_failures_to_gateway_errors() {
    let config = OrchestratorConfig {
        fallback_on_generation_failure: false,
        max_retries: 1,
        ..test_orchestrator_config()
    };
    let app = build_test_app_with_config(
        vec![
            StubReply::Fail(GenerationErrorKind::Unavailable),
            StubReply::Fail(GenerationErrorKind::Timeout),
        ],
        config,
    )
    .await;
    let body = json!({ "query": "What is the refund policy?" });

    let unavailable = send_json(
        &app.router,
        request(Method::POST, "/query", Some(body.clone())),
    )
    .await;
    assert_eq!(unavailable.status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&unavailable.body), Some("generation_unavailable"));

    let timed_out = send_json(&app.router, request(Method::POST, "/query", Some(body))).await;
    assert_eq!(timed_out.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_code(&timed_out.body), Some("generation_timeout"));
}

#[tokio::test]
async fn follow_up_query_sees_previous_turns_until_memory_is_cleared() {
    let app = build_test_app(vec![
        StubReply::Text(refund_answer_json()),
        StubReply::Text(refund_answer_json()),
        StubReply::Text(refund_answer_json()),
    ])
    .await;
    let ask = |query: &str| {
        request(
            Method::POST,
            "/query",
            Some(json!({ "query": query, "session_id": "customer-7" })),
        )
    };

    send_json(&app.router, ask("What is the refund policy?")).await;
    send_json(&app.router, ask("Does it cover sale items?")).await;

    let cleared = send_json(
        &app.router,
        request(Method::DELETE, "/memory/customer-7", None),
    )
    .await;
    assert_eq!(cleared.status, StatusCode::OK);
    assert_eq!(cleared.body["status"], "success");
    assert!(app.sessions.get("customer-7").await.is_empty());

    send_json(&app.router, ask("What is the refund policy?")).await;

    let prompts = app.generator.prompts().await;
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[0].user.contains("Conversation so far"));
    assert!(prompts[1].user.contains("User: What is the refund policy?"));
    assert!(!prompts[2].user.contains("Conversation so far"));
}

#[tokio::test]
async fn stream_emits_ndjson_fragments_then_answer() {
    let json = refund_answer_json();
    let (head, tail) = json.split_at(24);
    let app = build_test_app(vec![StubReply::Stream(vec![
        head.to_string(),
        tail.to_string(),
    ])])
    .await;

    let response = send_raw(
        &app.router,
        request(
            Method::POST,
            "/query/stream",
            Some(json!({ "query": "What is the refund policy?", "session_id": "s1" })),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.content_type.as_deref(),
        Some("application/x-ndjson")
    );

    let events = response
        .body
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("each line is json"))
        .collect::<Vec<_>>();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], json!({ "type": "fragment", "text": head }));
    assert_eq!(events[1], json!({ "type": "fragment", "text": tail }));
    assert_eq!(events[2]["type"], "answer");
    assert_eq!(events[2]["confidence"], "high");
    assert_eq!(events[2]["sources"], json!(["refund.txt"]));
    assert_eq!(app.sessions.get("s1").await.len(), 2);
}

#[tokio::test]
async fn stream_rejects_invalid_input_before_streaming() {
    let app = build_test_app(Vec::new()).await;

    let response = send_json(
        &app.router,
        request(Method::POST, "/query/stream", Some(json!({ "query": " " }))),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.body), Some("invalid_query"));
}

#[tokio::test]
async fn stream_reports_generation_failure_as_error_event() {
    let config = OrchestratorConfig {
        max_retries: 1,
        ..test_orchestrator_config()
    };
    let app = build_test_app_with_config(
        vec![StubReply::Fail(GenerationErrorKind::Unavailable)],
        config,
    )
    .await;

    let response = send_raw(
        &app.router,
        request(
            Method::POST,
            "/query/stream",
            Some(json!({ "query": "What is the refund policy?" })),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let events = response
        .body
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("each line is json"))
        .collect::<Vec<_>>();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");
}

#[tokio::test]
async fn malformed_query_bodies_use_error_envelope() {
    let app = build_test_app(Vec::new()).await;

    for (path, body) in [
        ("/query", "{\"query\": "),
        ("/query", "{\"session_id\": \"s1\"}"),
        ("/query/stream", "{\"query\": 42}"),
    ] {
        let response = send_json(
            &app.router,
            axum::http::Request::builder()
                .method(Method::POST)
                .uri(path)
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(axum::body::Body::from(body))
                .expect("request should build"),
        )
        .await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{path} {body}");
        assert_eq!(error_code(&response.body), Some("invalid_request"));
        assert!(response.body["error"]["message"].is_string());
    }

    assert!(app.generator.prompts().await.is_empty());
}

#[tokio::test]
async fn responses_carry_request_id() {
    let app = build_test_app(Vec::new()).await;

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .header("x-request-id", "client-req-9")
                .body(axum::body::Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("request should succeed");

    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("client-req-9")
    );
}
