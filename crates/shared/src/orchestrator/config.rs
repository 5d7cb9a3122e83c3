use std::time::Duration;

use crate::config::ConfigError;
use crate::session::SessionLimits;
use crate::validation::AnswerLimits;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub top_k: usize,
    /// Total generation attempts per query, the first one included.
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub session_ttl: Duration,
    pub max_history_turns: usize,
    pub min_query_length: usize,
    pub max_query_length: usize,
    pub generation_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub fallback_on_generation_failure: bool,
    pub retrieval_failure_is_fatal: bool,
    pub stream_retract_on_fallback: bool,
    pub answer_limits: AnswerLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_retries: 3,
            retry_base_backoff_ms: 250,
            session_ttl: Duration::from_secs(3600),
            max_history_turns: 10,
            min_query_length: 3,
            max_query_length: 500,
            generation_timeout: Duration::from_secs(30),
            retrieval_timeout: Duration::from_secs(10),
            fallback_on_generation_failure: true,
            retrieval_failure_is_fatal: false,
            stream_retract_on_fallback: false,
            answer_limits: AnswerLimits::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("K_RETRIEVAL", self.top_k as u128),
            ("MAX_RETRIES", u128::from(self.max_retries)),
            ("SESSION_TTL_SECONDS", u128::from(self.session_ttl.as_secs())),
            ("MAX_HISTORY_TURNS", self.max_history_turns as u128),
            ("MAX_QUERY_LENGTH", self.max_query_length as u128),
            ("GENERATION_TIMEOUT_MS", self.generation_timeout.as_millis()),
            ("RETRIEVAL_TIMEOUT_MS", self.retrieval_timeout.as_millis()),
            ("ANSWER_MAX_CHARS", self.answer_limits.max_chars as u128),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{key} must be greater than 0"
                )));
            }
        }

        if self.min_query_length > self.max_query_length {
            return Err(ConfigError::InvalidConfiguration(
                "MIN_QUERY_LENGTH must not exceed MAX_QUERY_LENGTH".to_string(),
            ));
        }
        if self.answer_limits.min_chars > self.answer_limits.max_chars {
            return Err(ConfigError::InvalidConfiguration(
                "ANSWER_MIN_CHARS must not exceed ANSWER_MAX_CHARS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            ttl: self.session_ttl,
            max_turns: self.max_history_turns,
        }
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_backoff_ms.saturating_mul(multiplier))
    }
}
