use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::llm::{GeneratorConfigError, OpenAiGenerator};
use crate::orchestrator::QueryOrchestrator;
use crate::retrieval::{EmbeddingError, KnowledgeBase, KnowledgeBaseError, OpenAiEmbedder};
use crate::session::{SessionStore, open_session_store};
use crate::validation::ResponseValidator;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Generator(#[from] GeneratorConfigError),
    #[error(transparent)]
    Embedder(#[from] EmbeddingError),
    #[error("failed to prepare knowledge base: {0}")]
    KnowledgeBase(#[from] KnowledgeBaseError),
}

/// The wired-up service: a knowledge base with a loaded index and an
/// orchestrator that retrieves from it.
#[derive(Clone)]
pub struct Runtime {
    pub knowledge_base: Arc<KnowledgeBase>,
    pub orchestrator: QueryOrchestrator,
}

/// Builds every collaborator from `config`, loads (or rebuilds) the vector
/// index and opens the session store. Must run inside a tokio runtime.
pub async fn start(config: &AppConfig, force_rebuild: bool) -> Result<Runtime, StartupError> {
    let embedder = OpenAiEmbedder::new(config.embedder_config())?;
    let knowledge_base = Arc::new(KnowledgeBase::new(
        config.knowledge_base_config(),
        Arc::new(embedder),
    ));
    let chunk_count = knowledge_base.load_or_build(force_rebuild).await?;
    info!(chunk_count, "knowledge base ready");

    let generator = OpenAiGenerator::new(config.generator_config())?;
    let session_limits = config.orchestrator.session_limits();
    let sessions = open_session_store(config.redis_url.as_deref(), session_limits).await;
    spawn_session_sweeper(sessions.clone());

    let orchestrator = QueryOrchestrator::new(
        knowledge_base.clone(),
        Arc::new(generator),
        ResponseValidator::with_limits(config.orchestrator.answer_limits),
        sessions,
        config.orchestrator.clone(),
    );

    Ok(Runtime {
        knowledge_base,
        orchestrator,
    })
}

fn spawn_session_sweeper(sessions: Arc<dyn SessionStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sessions.expire().await;
            if removed > 0 {
                info!(removed, "expired idle sessions");
            }
        }
    });
}

