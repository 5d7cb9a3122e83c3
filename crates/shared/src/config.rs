use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config_env::{EnvSource, process_env};
use crate::llm::{GeneratorConfig, ModelRoute};
use crate::orchestrator::OrchestratorConfig;
use crate::retrieval::{EmbedderConfig, KnowledgeBaseConfig};
use crate::validation::AnswerLimits;

const DEFAULT_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_MODEL_NAME: &str = "gpt-4o";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_TEMPERATURE: f32 = 0.0;
const DEFAULT_LLM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CHUNK_SIZE: usize = 1_000;
const DEFAULT_CHUNK_OVERLAP: usize = 200;
const DEFAULT_DOCS_PATH: &str = "./documents";
const DEFAULT_VECTOR_STORE_PATH: &str = "faiss_index";
const DEFAULT_API_BIND_ADDR: &str = "127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid number in env var {0}")]
    ParseFloat(String),
    #[error("invalid boolean in env var {0}")]
    ParseBool(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub chat_completions_url: String,
    pub embeddings_url: String,
    pub model_name: String,
    pub fallback_model_name: Option<String>,
    pub embedding_model: String,
    pub temperature: f32,
    pub llm_timeout_ms: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub docs_path: PathBuf,
    pub vector_store_path: PathBuf,
    pub redis_url: Option<String>,
    pub api_bind_addr: String,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source = EnvSource::new(lookup);
        let defaults = OrchestratorConfig::default();

        let orchestrator = OrchestratorConfig {
            top_k: source.parse_usize("K_RETRIEVAL", defaults.top_k)?,
            max_retries: source.parse_u32("MAX_RETRIES", defaults.max_retries)?,
            retry_base_backoff_ms: source
                .parse_u64("RETRY_BASE_BACKOFF_MS", defaults.retry_base_backoff_ms)?,
            session_ttl: Duration::from_secs(
                source.parse_u64("SESSION_TTL_SECONDS", defaults.session_ttl.as_secs())?,
            ),
            max_history_turns: source
                .parse_usize("MAX_HISTORY_TURNS", defaults.max_history_turns)?,
            min_query_length: source.parse_usize("MIN_QUERY_LENGTH", defaults.min_query_length)?,
            max_query_length: source.parse_usize("MAX_QUERY_LENGTH", defaults.max_query_length)?,
            generation_timeout: Duration::from_millis(source.parse_u64(
                "GENERATION_TIMEOUT_MS",
                duration_millis(defaults.generation_timeout),
            )?),
            retrieval_timeout: Duration::from_millis(source.parse_u64(
                "RETRIEVAL_TIMEOUT_MS",
                duration_millis(defaults.retrieval_timeout),
            )?),
            fallback_on_generation_failure: source.parse_bool(
                "FALLBACK_ON_GENERATION_FAILURE",
                defaults.fallback_on_generation_failure,
            )?,
            retrieval_failure_is_fatal: source.parse_bool(
                "RETRIEVAL_FAILURE_IS_FATAL",
                defaults.retrieval_failure_is_fatal,
            )?,
            stream_retract_on_fallback: source.parse_bool(
                "STREAM_RETRACT_ON_FALLBACK",
                defaults.stream_retract_on_fallback,
            )?,
            answer_limits: AnswerLimits {
                min_chars: source.parse_usize("ANSWER_MIN_CHARS", defaults.answer_limits.min_chars)?,
                max_chars: source.parse_usize("ANSWER_MAX_CHARS", defaults.answer_limits.max_chars)?,
            },
        };
        orchestrator.validate()?;

        let config = Self {
            openai_api_key: source.require("OPENAI_API_KEY")?,
            chat_completions_url: source
                .http_url_or("CHAT_COMPLETIONS_URL", DEFAULT_CHAT_COMPLETIONS_URL)?,
            embeddings_url: source.http_url_or("EMBEDDINGS_URL", DEFAULT_EMBEDDINGS_URL)?,
            model_name: source.string_or("MODEL_NAME", DEFAULT_MODEL_NAME),
            fallback_model_name: source.optional_trimmed("FALLBACK_MODEL_NAME"),
            embedding_model: source.string_or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            temperature: source.parse_f32("TEMPERATURE", DEFAULT_TEMPERATURE)?,
            llm_timeout_ms: source.parse_u64("LLM_TIMEOUT_MS", DEFAULT_LLM_TIMEOUT_MS)?,
            chunk_size: source.parse_usize("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            chunk_overlap: source.parse_usize("CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
            docs_path: PathBuf::from(source.string_or("DOCS_PATH", DEFAULT_DOCS_PATH)),
            vector_store_path: PathBuf::from(
                source.string_or("VECTOR_STORE_PATH", DEFAULT_VECTOR_STORE_PATH),
            ),
            redis_url: source.optional_trimmed("REDIS_URL"),
            api_bind_addr: source.string_or("API_BIND_ADDR", DEFAULT_API_BIND_ADDR),
            orchestrator,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "CHUNK_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::InvalidConfiguration(
                "CHUNK_OVERLAP must be smaller than CHUNK_SIZE".to_string(),
            ));
        }
        if self.llm_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidConfiguration(
                "TEMPERATURE must be between 0.0 and 2.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            chat_completions_url: self.chat_completions_url.clone(),
            api_key: self.openai_api_key.clone(),
            timeout_ms: self.llm_timeout_ms,
            temperature: self.temperature,
            model_route: ModelRoute {
                primary_model: self.model_name.clone(),
                fallback_model: self.fallback_model_name.clone(),
            },
        }
    }

    pub fn embedder_config(&self) -> EmbedderConfig {
        EmbedderConfig {
            embeddings_url: self.embeddings_url.clone(),
            api_key: self.openai_api_key.clone(),
            model: self.embedding_model.clone(),
            timeout_ms: self.llm_timeout_ms,
        }
    }

    pub fn knowledge_base_config(&self) -> KnowledgeBaseConfig {
        KnowledgeBaseConfig {
            docs_path: self.docs_path.clone(),
            vector_store_path: self.vector_store_path.clone(),
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            embedding_model: self.embedding_model.clone(),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
