use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::generator::{GenerationError, GenerationFuture, Generator, Prompt};

#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub primary_model: String,
    pub fallback_model: Option<String>,
}

impl ModelRoute {
    fn candidate_models(&self) -> Vec<&str> {
        let mut candidates = Vec::new();
        if !self.primary_model.is_empty() {
            candidates.push(self.primary_model.as_str());
        }

        if let Some(fallback_model) = self.fallback_model.as_deref()
            && !fallback_model.is_empty()
            && fallback_model != self.primary_model
        {
            candidates.push(fallback_model);
        }

        candidates
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub chat_completions_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub temperature: f32,
    pub model_route: ModelRoute,
}

#[derive(Debug, Error)]
pub enum GeneratorConfigError {
    #[error("failed to build llm http client: {0}")]
    HttpClient(String),
}

/// Chat-completions client. It makes one request per model and leaves
/// retries to the caller; a failing primary model falls through to the
/// fallback model when the failure allows it.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: GeneratorConfig,
}

impl OpenAiGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GeneratorConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| GeneratorConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    fn request_body(&self, model: &str, prompt: &Prompt, stream: bool) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user }
            ],
            "response_format": {
                "type": "json_object"
            },
            "temperature": self.config.temperature,
            "stream": stream
        })
    }

    async fn send(
        &self,
        model: &str,
        prompt: &Prompt,
        stream: bool,
    ) -> Result<reqwest::Response, AttemptError> {
        let response = self
            .client
            .post(&self.config.chat_completions_url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(model, prompt, stream))
            .send()
            .await
            .map_err(|err| AttemptError::from_request_error(&err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let provider_code = parse_provider_error_code(&body);
        let message = format!("status={} code={provider_code}", status.as_u16());
        let error = if is_transient_status(status) {
            GenerationError::Unavailable(message)
        } else {
            GenerationError::Rejected(message)
        };
        Err(AttemptError {
            error,
            fallback_allowed: status != StatusCode::UNAUTHORIZED
                && status != StatusCode::FORBIDDEN,
        })
    }

    async fn complete_once(&self, model: &str, prompt: &Prompt) -> Result<String, AttemptError> {
        let response = self.send(model, prompt, false).await?;
        let body = response.text().await.map_err(|_| {
            AttemptError::fallback(GenerationError::InvalidPayload(
                "response_body_read_failed".to_string(),
            ))
        })?;

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|_| {
            AttemptError::fallback(GenerationError::InvalidPayload(
                "response_json_parse_failed".to_string(),
            ))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| {
                AttemptError::fallback(GenerationError::InvalidPayload(
                    "missing_choice".to_string(),
                ))
            })?
            .message
            .content;

        match content {
            Value::String(text) => Ok(text),
            value @ Value::Object(_) => Ok(value.to_string()),
            _ => Err(AttemptError::fallback(GenerationError::InvalidPayload(
                "unsupported_content_shape".to_string(),
            ))),
        }
    }

    async fn stream_once(
        &self,
        model: &str,
        prompt: &Prompt,
        sink: &mpsc::Sender<String>,
        emitted: &mut bool,
    ) -> Result<String, AttemptError> {
        let mut response = self.send(model, prompt, true).await?;
        let mut lines = SseLineBuffer::default();
        let mut text = String::new();

        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|err| AttemptError::from_request_error(&err))?;
            let Some(chunk) = chunk else {
                break;
            };

            for event in lines.push(&chunk) {
                let data = match event {
                    SseEvent::Done => return Ok(text),
                    SseEvent::Data(data) => data,
                };
                let Some(fragment) = parse_stream_fragment(&data)? else {
                    continue;
                };

                text.push_str(&fragment);
                if sink.send(fragment).await.is_err() {
                    return Err(AttemptError::fallback(GenerationError::Unavailable(
                        "stream consumer disconnected".to_string(),
                    )));
                }
                *emitted = true;
            }
        }

        debug!(model, "stream ended without done marker");
        Ok(text)
    }
}

impl Generator for OpenAiGenerator {
    fn generate<'a>(&'a self, prompt: &'a Prompt) -> GenerationFuture<'a> {
        Box::pin(async move {
            let candidate_models = self.config.model_route.candidate_models();

            for (index, model) in candidate_models.iter().enumerate() {
                match self.complete_once(model, prompt).await {
                    Ok(text) => return Ok(text),
                    Err(attempt_err) => {
                        let has_more_candidates = index + 1 < candidate_models.len();
                        if has_more_candidates && attempt_err.fallback_allowed {
                            warn!(model, error = %attempt_err.error, "primary model failed, trying fallback model");
                            continue;
                        }
                        return Err(attempt_err.error);
                    }
                }
            }

            Err(GenerationError::Rejected(
                "no_model_candidates".to_string(),
            ))
        })
    }

    fn generate_stream<'a>(
        &'a self,
        prompt: &'a Prompt,
        sink: mpsc::Sender<String>,
    ) -> GenerationFuture<'a> {
        Box::pin(async move {
            let candidate_models = self.config.model_route.candidate_models();
            let mut emitted = false;

            for (index, model) in candidate_models.iter().enumerate() {
                match self.stream_once(model, prompt, &sink, &mut emitted).await {
                    Ok(text) => return Ok(text),
                    Err(attempt_err) => {
                        let has_more_candidates = index + 1 < candidate_models.len();
                        // Fragments already sent cannot be taken back.
                        if has_more_candidates && attempt_err.fallback_allowed && !emitted {
                            warn!(model, error = %attempt_err.error, "primary model stream failed, trying fallback model");
                            continue;
                        }
                        return Err(attempt_err.error);
                    }
                }
            }

            Err(GenerationError::Rejected(
                "no_model_candidates".to_string(),
            ))
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model_route.primary_model
    }
}

#[derive(Debug)]
struct AttemptError {
    error: GenerationError,
    fallback_allowed: bool,
}

impl AttemptError {
    fn fallback(error: GenerationError) -> Self {
        Self {
            error,
            fallback_allowed: true,
        }
    }

    fn from_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::fallback(GenerationError::Timeout)
        } else {
            Self::fallback(GenerationError::Unavailable(
                "request_unavailable".to_string(),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent event byte stream into `data:` payloads. Bytes are
/// held until a full line arrives so multi-byte characters split across
/// chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };

            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}

fn parse_stream_fragment(data: &str) -> Result<Option<String>, AttemptError> {
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|_| {
        AttemptError::fallback(GenerationError::InvalidPayload(
            "stream_chunk_parse_failed".to_string(),
        ))
    })?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        code: Option<Value>,
    }

    let parsed = serde_json::from_str::<ProviderErrorEnvelope>(body).ok();
    let Some(provider_error_code) = parsed
        .and_then(|envelope| envelope.error)
        .and_then(|details| details.code)
    else {
        return "unknown".to_string();
    };

    match provider_error_code {
        Value::String(code) => code,
        Value::Number(code) => code.to_string(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelRoute, SseEvent, SseLineBuffer, parse_provider_error_code, parse_stream_fragment};

    #[test]
    fn sse_buffer_joins_lines_split_across_chunks() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());

        let events = buffer.push(b"tent\":\"Hi\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn sse_buffer_ignores_comments_and_keeps_utf8_intact() {
        let mut buffer = SseLineBuffer::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let split = line
            .iter()
            .position(|byte| *byte == 0xC3)
            .expect("multi-byte char present");

        assert!(buffer.push(b": keep-alive\n").is_empty());
        assert!(buffer.push(&line[..=split]).is_empty());
        let events = buffer.push(&line[split + 1..]);

        let SseEvent::Data(data) = &events[0] else {
            panic!("expected data event");
        };
        let fragment = parse_stream_fragment(data)
            .expect("chunk should parse")
            .expect("chunk has content");
        assert_eq!(fragment, "é");
    }

    #[test]
    fn role_only_chunks_have_no_fragment() {
        let fragment = parse_stream_fragment(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)
            .expect("chunk should parse");
        assert!(fragment.is_none());
    }

    #[test]
    fn fallback_model_is_skipped_when_same_as_primary() {
        let route = ModelRoute {
            primary_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o".to_string()),
        };
        assert_eq!(route.candidate_models(), vec!["gpt-4o"]);
    }

    #[test]
    fn provider_error_code_is_extracted() {
        assert_eq!(
            parse_provider_error_code(r#"{"error":{"code":"rate_limit_exceeded"}}"#),
            "rate_limit_exceeded"
        );
        assert_eq!(parse_provider_error_code("oops"), "unknown");
    }
}
