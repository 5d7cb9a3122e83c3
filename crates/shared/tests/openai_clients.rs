use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use shared::llm::{
    GenerationError, Generator, GeneratorConfig, ModelRoute, OpenAiGenerator, Prompt,
};
use shared::retrieval::{Embedder, EmbedderConfig, EmbeddingError, OpenAiEmbedder};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};

#[derive(Debug, Clone)]
enum MockReply {
    Json { status: StatusCode, body: Value },
    EventStream(String),
}

#[derive(Debug, Clone)]
struct TestServerState {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    seen_payloads: Arc<Mutex<Vec<Value>>>,
    seen_auth_headers: Arc<Mutex<Vec<String>>>,
}

impl TestServerState {
    fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            seen_payloads: Arc::new(Mutex::new(Vec::new())),
            seen_auth_headers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn seen_models(&self) -> Vec<String> {
        self.seen_payloads
            .lock()
            .await
            .iter()
            .filter_map(|payload| payload.get("model").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

#[tokio::test]
async fn generator_sends_prompt_and_returns_content() {
    let state = TestServerState::with_replies(vec![completion_reply(answer_json())]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let text = generator
        .generate(&test_prompt())
        .await
        .expect("completion should succeed");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert_eq!(text, answer_json());
    let payloads = state.seen_payloads.lock().await.clone();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["model"], "primary-model");
    assert_eq!(payloads[0]["stream"], false);
    assert_eq!(payloads[0]["response_format"]["type"], "json_object");
    assert_eq!(payloads[0]["messages"][0]["role"], "system");
    assert_eq!(payloads[0]["messages"][1]["content"], "Question: What is the refund policy?");

    let seen_auth_headers = state.seen_auth_headers.lock().await.clone();
    assert_eq!(seen_auth_headers, vec!["Bearer test-openai-key".to_string()]);
}

#[tokio::test]
async fn generator_falls_back_to_secondary_model_on_transient_failure() {
    let state = TestServerState::with_replies(vec![
        provider_error_reply(StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        completion_reply(answer_json()),
    ]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let text = generator
        .generate(&test_prompt())
        .await
        .expect("fallback model should answer");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert_eq!(text, answer_json());
    assert_eq!(
        state.seen_models().await,
        vec!["primary-model".to_string(), "fallback-model".to_string()]
    );
}

#[tokio::test]
async fn generator_does_not_fall_back_on_auth_failure() {
    let state = TestServerState::with_replies(vec![provider_error_reply(
        StatusCode::UNAUTHORIZED,
        "invalid_api_key",
    )]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let err = generator
        .generate(&test_prompt())
        .await
        .expect_err("auth failure should surface");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    match err {
        GenerationError::Rejected(message) => {
            assert!(message.contains("status=401"));
            assert!(message.contains("invalid_api_key"));
        }
        other => panic!("expected rejected error, got {other:?}"),
    }
    assert!(!GenerationError::Rejected(String::new()).is_transient());
    assert_eq!(state.seen_models().await, vec!["primary-model".to_string()]);
}

#[tokio::test]
async fn generator_reports_unavailable_when_every_model_fails() {
    let state = TestServerState::with_replies(vec![
        provider_error_reply(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
        provider_error_reply(StatusCode::BAD_GATEWAY, "upstream_gateway"),
    ]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let err = generator
        .generate(&test_prompt())
        .await
        .expect_err("both models fail");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert!(err.is_transient());
    assert_eq!(state.seen_models().await.len(), 2);
}

#[tokio::test]
async fn generator_rejects_unparseable_completion() {
    let state = TestServerState::with_replies(vec![
        MockReply::Json {
            status: StatusCode::OK,
            body: json!({ "choices": [] }),
        },
        MockReply::Json {
            status: StatusCode::OK,
            body: json!({ "unexpected": true }),
        },
    ]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let err = generator
        .generate(&test_prompt())
        .await
        .expect_err("malformed completion should fail");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert!(matches!(err, GenerationError::InvalidPayload(_)));
}

#[tokio::test]
async fn generator_streams_fragments_in_order() {
    let body = [
        sse_line(json!({"choices": [{"delta": {"role": "assistant"}}]})),
        sse_line(json!({"choices": [{"delta": {"content": "{\"answer\": "}}]})),
        sse_line(json!({"choices": [{"delta": {"content": "\"Refunds within 30 days.\"}"}}]})),
        "data: [DONE]\n\n".to_string(),
    ]
    .concat();
    let state = TestServerState::with_replies(vec![MockReply::EventStream(body)]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let (fragment_tx, mut fragment_rx) = mpsc::channel(16);
    let text = generator
        .generate_stream(&test_prompt(), fragment_tx)
        .await
        .expect("stream should succeed");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    let mut fragments = Vec::new();
    while let Some(fragment) = fragment_rx.recv().await {
        fragments.push(fragment);
    }
    assert_eq!(
        fragments,
        vec![
            "{\"answer\": ".to_string(),
            "\"Refunds within 30 days.\"}".to_string()
        ]
    );
    assert_eq!(text, fragments.concat());

    let payloads = state.seen_payloads.lock().await.clone();
    assert_eq!(payloads[0]["stream"], true);
}

#[tokio::test]
async fn generator_stream_falls_back_before_any_fragment() {
    let body = [
        sse_line(json!({"choices": [{"delta": {"content": "hello"}}]})),
        "data: [DONE]\n\n".to_string(),
    ]
    .concat();
    let state = TestServerState::with_replies(vec![
        provider_error_reply(StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        MockReply::EventStream(body),
    ]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let generator = OpenAiGenerator::new(generator_config(url)).expect("generator should build");
    let (fragment_tx, _fragment_rx) = mpsc::channel(16);
    let text = generator
        .generate_stream(&test_prompt(), fragment_tx)
        .await
        .expect("fallback stream should succeed");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert_eq!(text, "hello");
    assert_eq!(
        state.seen_models().await,
        vec!["primary-model".to_string(), "fallback-model".to_string()]
    );
}

#[tokio::test]
async fn embedder_returns_vectors_in_input_order() {
    let state = TestServerState::with_replies(vec![MockReply::Json {
        status: StatusCode::OK,
        body: json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        }),
    }]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state.clone()).await;

    let embedder = OpenAiEmbedder::new(embedder_config(url)).expect("embedder should build");
    let inputs = vec!["first".to_string(), "second".to_string()];
    let vectors = embedder.embed(&inputs).await.expect("embedding should succeed");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    let payloads = state.seen_payloads.lock().await.clone();
    assert_eq!(payloads[0]["model"], "text-embedding-3-small");
    assert_eq!(payloads[0]["input"], json!(["first", "second"]));
}

#[tokio::test]
async fn embedder_rejects_mismatched_vector_count() {
    let state = TestServerState::with_replies(vec![MockReply::Json {
        status: StatusCode::OK,
        body: json!({ "data": [{ "index": 0, "embedding": [1.0] }] }),
    }]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state).await;

    let embedder = OpenAiEmbedder::new(embedder_config(url)).expect("embedder should build");
    let inputs = vec!["first".to_string(), "second".to_string()];
    let err = embedder
        .embed(&inputs)
        .await
        .expect_err("short response should fail");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    assert!(matches!(err, EmbeddingError::InvalidPayload(_)));
}

#[tokio::test]
async fn embedder_surfaces_provider_status() {
    let state = TestServerState::with_replies(vec![provider_error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        "server_error",
    )]);
    let (url, shutdown_tx, server_task) = spawn_test_server(state).await;

    let embedder = OpenAiEmbedder::new(embedder_config(url)).expect("embedder should build");
    let err = embedder
        .embed(&["only".to_string()])
        .await
        .expect_err("provider failure should surface");

    shutdown_tx.send(()).expect("shutdown signal should send");
    server_task.await.expect("server task should join");

    match err {
        EmbeddingError::ProviderFailure(message) => assert_eq!(message, "status=500"),
        other => panic!("expected provider failure, got {other:?}"),
    }
}

fn generator_config(base_url: String) -> GeneratorConfig {
    GeneratorConfig {
        chat_completions_url: format!("{base_url}/chat/completions"),
        api_key: "test-openai-key".to_string(),
        timeout_ms: 5_000,
        temperature: 0.0,
        model_route: ModelRoute {
            primary_model: "primary-model".to_string(),
            fallback_model: Some("fallback-model".to_string()),
        },
    }
}

fn embedder_config(base_url: String) -> EmbedderConfig {
    EmbedderConfig {
        embeddings_url: format!("{base_url}/embeddings"),
        api_key: "test-openai-key".to_string(),
        model: "text-embedding-3-small".to_string(),
        timeout_ms: 5_000,
    }
}

fn test_prompt() -> Prompt {
    Prompt {
        system: "Answer from the context.".to_string(),
        user: "Question: What is the refund policy?".to_string(),
    }
}

fn answer_json() -> String {
    json!({
        "answer": "Refunds are accepted within 30 days of purchase.",
        "confidence": "high",
        "sources": ["refund.txt"]
    })
    .to_string()
}

fn completion_reply(content: String) -> MockReply {
    MockReply::Json {
        status: StatusCode::OK,
        body: json!({
            "id": "chatcmpl-test",
            "model": "provider-model",
            "choices": [
                {
                    "message": {
                        "role": "assistant",
                        "content": content
                    }
                }
            ]
        }),
    }
}

fn provider_error_reply(status: StatusCode, code: &str) -> MockReply {
    MockReply::Json {
        status,
        body: json!({
            "error": {
                "code": code,
                "message": "provider failure"
            }
        }),
    }
}

fn sse_line(chunk: Value) -> String {
    format!("data: {chunk}\n\n")
}

async fn spawn_test_server(
    state: TestServerState,
) -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/chat/completions", post(test_provider_handler))
        .route("/embeddings", post(test_provider_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let local_addr = listener
        .local_addr()
        .expect("listener address should resolve");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });

        server.await.expect("test server should run");
    });

    (format!("http://{local_addr}"), shutdown_tx, server_task)
}

async fn test_provider_handler(
    State(state): State<TestServerState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    state.seen_payloads.lock().await.push(payload);

    if let Some(value) = headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
    {
        state.seen_auth_headers.lock().await.push(value.to_string());
    }

    let reply = state
        .replies
        .lock()
        .await
        .pop_front()
        .unwrap_or(MockReply::Json {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": {
                    "code": "exhausted_test_replies"
                }
            }),
        });

    match reply {
        MockReply::Json { status, body } => (status, Json(body)).into_response(),
        MockReply::EventStream(body) => {
            (StatusCode::OK, [(CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
    }
}
