pub mod generator;
pub mod openai;
pub mod prompts;

pub use generator::{GenerationError, GenerationFuture, Generator, Prompt};
pub use openai::{GeneratorConfig, GeneratorConfigError, ModelRoute, OpenAiGenerator};
pub use prompts::build_prompt;
