use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use super::state::QueryLifecycle;
use super::{
    QueryError, QueryOrchestrator, QueryState, known_sources, normalize_session_id, preview,
};
use crate::llm::{GenerationError, build_prompt};
use crate::models::StructuredAnswer;

const EVENT_BUFFER: usize = 64;
const FRAGMENT_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(String),
    /// Discard every fragment received so far; the final answer differs.
    Retract,
    Answer(StructuredAnswer),
    Error(String),
}

/// Events of one streaming query. Dropping the stream cancels the query.
pub struct QueryStream {
    events: mpsc::Receiver<StreamEvent>,
    cancel_on_drop: DropGuard,
}

impl QueryStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// The raw receiver plus the guard that cancels the query when dropped.
    /// Keep the guard alive for as long as events are consumed.
    pub fn into_parts(self) -> (mpsc::Receiver<StreamEvent>, DropGuard) {
        (self.events, self.cancel_on_drop)
    }
}

impl QueryOrchestrator {
    /// Validates the input up front, then runs the query in the background and
    /// streams fragments as the generator produces them. The stream ends with
    /// exactly one `Answer` or `Error` event.
    pub fn query_stream(
        &self,
        text: &str,
        session_id: Option<String>,
    ) -> Result<QueryStream, QueryError> {
        let question = self.validate_input(text)?.to_string();
        let session_id = normalize_session_id(session_id.as_deref()).map(str::to_string);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let orchestrator = self.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator
                .run_stream(&question, session_id.as_deref(), &events_tx, &task_cancel)
                .await
            {
                let _ = events_tx.send(StreamEvent::Error(err.to_string())).await;
            }
        });

        Ok(QueryStream {
            events: events_rx,
            cancel_on_drop: cancel.drop_guard(),
        })
    }

    async fn run_stream(
        &self,
        question: &str,
        session_id: Option<&str>,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), QueryError> {
        info!(
            session_id = session_id.unwrap_or("-"),
            query = %preview(question),
            "processing streaming query"
        );

        let _guard = self.lock_session(session_id, cancel).await?;
        let mut lifecycle = QueryLifecycle::new(session_id);
        let history = self.load_history(session_id).await;

        lifecycle.advance(QueryState::Retrieving);
        let chunks = self.retrieve_context(question, cancel).await?;
        let known_sources = known_sources(&chunks);
        let prompt = build_prompt(
            question,
            &chunks,
            history.recent(self.config.max_history_turns),
            None,
        );

        let text = loop {
            let attempt = lifecycle.begin_attempt();
            let mut emitted = false;
            let generated = self
                .stream_attempt(&prompt, events, cancel, &mut emitted)
                .await?;

            match generated {
                Ok(text) => break text,
                Err(err) if err.is_transient() && !emitted && attempt < self.config.max_retries => {
                    warn!(attempt, error = %err, "stream generation failed before output, retrying");
                    lifecycle.advance(QueryState::Retrying);
                    self.backoff(attempt, cancel).await?;
                }
                Err(err) => {
                    warn!(attempt, emitted, error = %err, "stream generation failed");
                    lifecycle.advance(QueryState::Done);
                    return Err(match err {
                        GenerationError::Timeout => QueryError::Timeout,
                        other => QueryError::GenerationUnavailable(other.to_string()),
                    });
                }
            }
        };

        // Streamed text cannot be replaced, so the answer is validated once.
        lifecycle.advance(QueryState::Validating);
        let answer = match self.validator.validate(&text, &known_sources) {
            Ok(answer) => {
                lifecycle.advance(QueryState::Succeeded);
                answer
            }
            Err(failure) => {
                warn!(reason = %failure.reason, "streamed answer failed validation, using fallback answer");
                lifecycle.advance(QueryState::Fallback);
                if self.config.stream_retract_on_fallback {
                    let _ = events.send(StreamEvent::Retract).await;
                }
                StructuredAnswer::fallback()
            }
        };

        if cancel.is_cancelled() {
            return Err(QueryError::Timeout);
        }
        self.persist_exchange(session_id, question, &answer, &mut lifecycle)
            .await;
        lifecycle.advance(QueryState::Done);
        let _ = events.send(StreamEvent::Answer(answer)).await;
        Ok(())
    }

    /// One generation attempt with fragments forwarded to `events`. Sets
    /// `emitted` once any fragment reached the client.
    async fn stream_attempt(
        &self,
        prompt: &crate::llm::Prompt,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        emitted: &mut bool,
    ) -> Result<Result<String, GenerationError>, QueryError> {
        let (fragment_tx, mut fragment_rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let generation = self.generator.generate_stream(prompt, fragment_tx);
        let forward = async {
            while let Some(fragment) = fragment_rx.recv().await {
                if events.send(StreamEvent::Fragment(fragment)).await.is_err() {
                    break;
                }
                *emitted = true;
            }
        };
        let attempt = async {
            let (generated, ()) = tokio::join!(generation, forward);
            generated
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Timeout),
            generated = timeout(self.config.generation_timeout, attempt) => {
                Ok(generated.unwrap_or(Err(GenerationError::Timeout)))
            }
        }
    }
}
