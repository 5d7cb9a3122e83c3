pub mod config;
mod config_env;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod runtime;
pub mod session;
pub mod validation;

pub use config::{AppConfig, ConfigError};
