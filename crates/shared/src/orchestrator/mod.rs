use std::sync::Arc;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::llm::{GenerationError, Generator, Prompt, build_prompt};
use crate::models::{ConversationTurn, RetrievedChunk, SessionHistory, StructuredAnswer};
use crate::retrieval::Retriever;
use crate::session::{SessionGuard, SessionLocks, SessionStore};
use crate::validation::ResponseValidator;

mod config;
mod state;
mod stream;

pub use config::OrchestratorConfig;
pub use state::QueryState;
pub use stream::{QueryStream, StreamEvent};

use state::QueryLifecycle;

const QUERY_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidInput(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("query timed out")]
    Timeout,
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),
}

/// Runs one question through retrieval, generation and validation, and keeps
/// the session history. Queries sharing a session id run one at a time in
/// arrival order; everything else runs concurrently.
#[derive(Clone)]
pub struct QueryOrchestrator {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    validator: ResponseValidator,
    sessions: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
    locks: SessionLocks,
}

impl QueryOrchestrator {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        validator: ResponseValidator,
        sessions: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            retriever,
            generator,
            validator,
            sessions,
            config,
            locks: SessionLocks::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    pub async fn query(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<StructuredAnswer, QueryError> {
        self.query_with_cancel(text, session_id, CancellationToken::new())
            .await
    }

    /// Like [`query`](Self::query), but gives up with [`QueryError::Timeout`]
    /// as soon as `cancel` fires. A cancelled query leaves history untouched.
    pub async fn query_with_cancel(
        &self,
        text: &str,
        session_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<StructuredAnswer, QueryError> {
        let question = self.validate_input(text)?;
        let session_id = normalize_session_id(session_id);
        info!(
            session_id = session_id.unwrap_or("-"),
            query = %preview(question),
            "processing query"
        );

        let _guard = self.lock_session(session_id, &cancel).await?;
        let mut lifecycle = QueryLifecycle::new(session_id);
        let history = self.load_history(session_id).await;

        lifecycle.advance(QueryState::Retrieving);
        let chunks = self.retrieve_context(question, &cancel).await?;
        let known_sources = known_sources(&chunks);
        let recent = history.recent(self.config.max_history_turns);

        let mut retry_reason: Option<String> = None;
        let answer = loop {
            let attempt = lifecycle.begin_attempt();
            let prompt = build_prompt(question, &chunks, recent, retry_reason.as_deref());

            let raw = match self.generate_once(&prompt, &cancel).await? {
                Ok(raw) => raw,
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    warn!(attempt, error = %err, "generation failed, retrying");
                    lifecycle.advance(QueryState::Retrying);
                    self.backoff(attempt, &cancel).await?;
                    continue;
                }
                Err(err) => {
                    return self.generation_exhausted(err, &mut lifecycle);
                }
            };

            lifecycle.advance(QueryState::Validating);
            match self.validator.validate(&raw, &known_sources) {
                Ok(answer) => {
                    lifecycle.advance(QueryState::Succeeded);
                    break answer;
                }
                Err(failure) if failure.recoverable && attempt < self.config.max_retries => {
                    warn!(attempt, reason = %failure.reason, "answer failed validation, retrying");
                    lifecycle.advance(QueryState::Retrying);
                    retry_reason = Some(failure.reason);
                    self.backoff(attempt, &cancel).await?;
                }
                Err(failure) => {
                    warn!(
                        attempt,
                        recoverable = failure.recoverable,
                        reason = %failure.reason,
                        "answer failed validation, using fallback answer"
                    );
                    lifecycle.advance(QueryState::Fallback);
                    break StructuredAnswer::fallback();
                }
            }
        };

        self.persist_exchange(session_id, question, &answer, &mut lifecycle)
            .await;
        lifecycle.advance(QueryState::Done);
        Ok(answer)
    }

    fn validate_input<'t>(&self, text: &'t str) -> Result<&'t str, QueryError> {
        let question = text.trim();
        if question.is_empty() {
            return Err(QueryError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        let length = question.chars().count();
        if length < self.config.min_query_length {
            return Err(QueryError::InvalidInput(format!(
                "query must be at least {} characters",
                self.config.min_query_length
            )));
        }
        if length > self.config.max_query_length {
            return Err(QueryError::InvalidInput(format!(
                "query must be at most {} characters",
                self.config.max_query_length
            )));
        }
        Ok(question)
    }

    async fn lock_session(
        &self,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<SessionGuard>, QueryError> {
        let Some(session_id) = session_id else {
            return Ok(None);
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Timeout),
            guard = self.locks.acquire(session_id) => Ok(Some(guard)),
        }
    }

    async fn load_history(&self, session_id: Option<&str>) -> SessionHistory {
        match session_id {
            Some(session_id) => self.sessions.get(session_id).await,
            None => SessionHistory::new(),
        }
    }

    async fn retrieve_context(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let retrieved = tokio::select! {
            _ = cancel.cancelled() => return Err(QueryError::Timeout),
            retrieved = timeout(
                self.config.retrieval_timeout,
                self.retriever.retrieve(question, self.config.top_k),
            ) => retrieved,
        };

        match retrieved {
            Ok(Ok(chunks)) => Ok(chunks),
            Ok(Err(err)) if self.config.retrieval_failure_is_fatal => {
                Err(QueryError::RetrievalUnavailable(err.to_string()))
            }
            Ok(Err(err)) => {
                warn!(error = %err, "retrieval failed, answering without context");
                Ok(Vec::new())
            }
            Err(_) if self.config.retrieval_failure_is_fatal => Err(QueryError::Timeout),
            Err(_) => {
                warn!("retrieval timed out, answering without context");
                Ok(Vec::new())
            }
        }
    }

    /// Outer error means the caller cancelled; inner error is the generator's.
    async fn generate_once(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<Result<String, GenerationError>, QueryError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Timeout),
            generated = timeout(self.config.generation_timeout, self.generator.generate(prompt)) => {
                Ok(generated.unwrap_or(Err(GenerationError::Timeout)))
            }
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), QueryError> {
        let delay = self.config.backoff_for(attempt);
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Timeout),
            _ = sleep(delay) => Ok(()),
        }
    }

    fn generation_exhausted(
        &self,
        err: GenerationError,
        lifecycle: &mut QueryLifecycle<'_>,
    ) -> Result<StructuredAnswer, QueryError> {
        if self.config.fallback_on_generation_failure {
            warn!(
                attempt = lifecycle.attempt(),
                error = %err,
                "generation failed, using fallback answer"
            );
            lifecycle.advance(QueryState::Fallback);
            lifecycle.advance(QueryState::Done);
            return Ok(StructuredAnswer::fallback());
        }

        warn!(attempt = lifecycle.attempt(), error = %err, "generation failed");
        lifecycle.advance(QueryState::Done);
        Err(match err {
            GenerationError::Timeout => QueryError::Timeout,
            other => QueryError::GenerationUnavailable(other.to_string()),
        })
    }

    /// Stores the question and answer together so a session never holds one
    /// without the other.
    async fn persist_exchange(
        &self,
        session_id: Option<&str>,
        question: &str,
        answer: &StructuredAnswer,
        lifecycle: &mut QueryLifecycle<'_>,
    ) {
        let Some(session_id) = session_id else {
            return;
        };

        lifecycle.advance(QueryState::Persisting);
        self.sessions
            .append(
                session_id,
                vec![
                    ConversationTurn::user(question),
                    ConversationTurn::assistant(answer.answer.clone()),
                ],
            )
            .await;
    }
}

fn normalize_session_id(session_id: Option<&str>) -> Option<&str> {
    session_id
        .map(str::trim)
        .filter(|session_id| !session_id.is_empty())
}

fn known_sources(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for chunk in chunks {
        if !sources.contains(&chunk.source_id) {
            sources.push(chunk.source_id.clone());
        }
    }
    sources
}

fn preview(question: &str) -> String {
    let mut preview = question.chars().take(QUERY_PREVIEW_CHARS).collect::<String>();
    if question.chars().count() > QUERY_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
