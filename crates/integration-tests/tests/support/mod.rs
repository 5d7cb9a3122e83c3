#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use api_server::http::{AppState, build_router};
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use shared::llm::{GenerationError, GenerationFuture, Generator, Prompt};
use shared::orchestrator::{OrchestratorConfig, QueryOrchestrator};
use shared::retrieval::{Embedder, EmbeddingFuture, KnowledgeBase, KnowledgeBaseConfig};
use shared::session::{MemorySessionStore, SessionStore};
use shared::validation::ResponseValidator;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};
use tower::ServiceExt;

pub const REFUND_POLICY_TEXT: &str = "Refund policy: refunds are accepted within 30 days of purchase with a receipt.";
const KEYWORDS: [&str; 5] = ["refund", "shipping", "warranty", "password", "invoice"];

/// Counts keyword hits; the trailing constant keeps every vector non-zero.
#[derive(Debug, Clone, Default)]
pub struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> EmbeddingFuture<'a> {
        Box::pin(async move {
            Ok(texts
                .iter()
                .map(|text| {
                    let lowered = text.to_lowercase();
                    let mut vector = KEYWORDS
                        .iter()
                        .map(|keyword| lowered.matches(*keyword).count() as f32)
                        .collect::<Vec<_>>();
                    vector.push(0.1);
                    vector
                })
                .collect())
        })
    }
}

#[derive(Clone)]
pub enum StubReply {
    Text(String),
    Fail(GenerationErrorKind),
    Stream(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
pub enum GenerationErrorKind {
    Unavailable,
    Timeout,
}

#[derive(Clone, Default)]
pub struct StubGenerator {
    replies: Arc<Mutex<VecDeque<StubReply>>>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
}

impl StubGenerator {
    pub fn with_replies(replies: Vec<StubReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().await.clone()
    }

    async fn next_reply(&self, prompt: &Prompt) -> StubReply {
        self.prompts.lock().await.push(prompt.clone());
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or(StubReply::Fail(GenerationErrorKind::Unavailable))
    }
}

fn stub_error(kind: GenerationErrorKind) -> GenerationError {
    match kind {
        GenerationErrorKind::Unavailable => {
            GenerationError::Unavailable("status=503 code=overloaded".to_string())
        }
        GenerationErrorKind::Timeout => GenerationError::Timeout,
    }
}

impl Generator for StubGenerator {
    fn generate<'a>(&'a self, prompt: &'a Prompt) -> GenerationFuture<'a> {
        Box::pin(async move {
            match self.next_reply(prompt).await {
                StubReply::Text(text) => Ok(text),
                StubReply::Fail(kind) => Err(stub_error(kind)),
                StubReply::Stream(parts) => Ok(parts.concat()),
            }
        })
    }

    fn generate_stream<'a>(
        &'a self,
        prompt: &'a Prompt,
        sink: mpsc::Sender<String>,
    ) -> GenerationFuture<'a> {
        Box::pin(async move {
            match self.next_reply(prompt).await {
                StubReply::Text(text) => {
                    let _ = sink.send(text.clone()).await;
                    Ok(text)
                }
                StubReply::Fail(kind) => Err(stub_error(kind)),
                StubReply::Stream(parts) => {
                    for part in &parts {
                        let _ = sink.send(part.clone()).await;
                    }
                    Ok(parts.concat())
                }
            }
        })
    }

    fn model_name(&self) -> &str {
        "stub-model"
    }
}

pub struct TestApp {
    pub router: axum::Router,
    pub generator: StubGenerator,
    pub sessions: MemorySessionStore,
    pub knowledge_base: Arc<KnowledgeBase>,
    pub workdir: TempDir,
}

pub fn test_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_base_backoff_ms: 0,
        generation_timeout: Duration::from_secs(2),
        retrieval_timeout: Duration::from_secs(2),
        ..OrchestratorConfig::default()
    }
}

pub async fn build_test_app(replies: Vec<StubReply>) -> TestApp {
    build_test_app_with_config(replies, test_orchestrator_config()).await
}

pub async fn build_test_app_with_config(
    replies: Vec<StubReply>,
    config: OrchestratorConfig,
) -> TestApp {
    let workdir = tempfile::tempdir().expect("temp dir should be created");
    let docs_path = workdir.path().join("documents");
    fs::create_dir_all(&docs_path).expect("docs dir should be created");
    fs::write(docs_path.join("refund.txt"), REFUND_POLICY_TEXT).expect("doc should be written");

    let knowledge_base = Arc::new(KnowledgeBase::new(
        KnowledgeBaseConfig {
            docs_path,
            vector_store_path: workdir.path().join("index"),
            chunk_size: 200,
            chunk_overlap: 20,
            embedding_model: "keyword-test".to_string(),
        },
        Arc::new(KeywordEmbedder),
    ));
    knowledge_base
        .load_or_build(false)
        .await
        .expect("knowledge base should build");

    let generator = StubGenerator::with_replies(replies);
    let sessions = MemorySessionStore::new(config.session_limits());
    let session_store: Arc<dyn SessionStore> = Arc::new(sessions.clone());
    let orchestrator = QueryOrchestrator::new(
        knowledge_base.clone(),
        Arc::new(generator.clone()),
        ResponseValidator::with_limits(config.answer_limits),
        session_store,
        config,
    );

    let router = build_router(AppState {
        orchestrator,
        knowledge_base: knowledge_base.clone(),
    });

    TestApp {
        router,
        generator,
        sessions,
        knowledge_base,
        workdir,
    }
}

pub fn refund_answer_json() -> String {
    json!({
        "answer": "Refunds are accepted within 30 days of purchase.",
        "confidence": "high",
        "sources": ["refund.txt"]
    })
    .to_string()
}

pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Value,
}

pub struct RawResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: String,
}

pub async fn send_json(app: &axum::Router, request: Request<Body>) -> JsonResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");
    let body = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));

    JsonResponse { status, body }
}

pub async fn send_raw(app: &axum::Router, request: Request<Body>) -> RawResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");

    RawResponse {
        status,
        content_type,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

pub fn request(method: Method, uri: &str, json_body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    match json_body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    }
}

pub fn multipart_upload(uri: &str, field: &str, filename: &str, content: &str) -> Request<Body> {
    let boundary = "securerag-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         {content}\r\n\
         --{boundary}--\r\n"
    );

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .expect("request should build")
}

pub fn error_code(body: &Value) -> Option<&str> {
    body.get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
}
