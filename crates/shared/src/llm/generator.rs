use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;

pub type GenerationFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, GenerationError>> + Send + 'a>>;

/// Chat prompt split into the instruction block and the user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("llm provider request timed out")]
    Timeout,
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),
    #[error("llm provider rejected the request: {0}")]
    Rejected(String),
    #[error("llm provider returned an invalid payload: {0}")]
    InvalidPayload(String),
}

impl GenerationError {
    /// Whether another attempt could succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

pub trait Generator: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a Prompt) -> GenerationFuture<'a>;

    /// Sends text fragments to `sink` as they arrive and resolves to the
    /// full text. Providers without streaming emit the whole text at once.
    fn generate_stream<'a>(
        &'a self,
        prompt: &'a Prompt,
        sink: mpsc::Sender<String>,
    ) -> GenerationFuture<'a> {
        Box::pin(async move {
            let text = self.generate(prompt).await?;
            if sink.send(text.clone()).await.is_err() {
                return Err(GenerationError::Unavailable(
                    "stream consumer disconnected".to_string(),
                ));
            }
            Ok(text)
        })
    }

    fn model_name(&self) -> &str;
}
