//! Classifier backend.
//!
//! The extractor needs chat completions (with optional images) and speech
//! to text for voice notes, so the provider trait is small and any
//! OpenAI-compatible endpoint can back it.

pub mod openai;
pub mod provider;

pub use openai::{DEFAULT_TRANSCRIPTION_MODEL, OpenAiCompatProvider};
pub use provider::*;

use std::sync::Arc;

use secrecy::SecretString;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    /// Speech-to-text model for voice notes.
    pub transcription_model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible classifier");
    Arc::new(
        OpenAiCompatProvider::new(&config.base_url, config.api_key.clone(), config.model.clone())
            .with_transcription_model(config.transcription_model.clone()),
    )
}
