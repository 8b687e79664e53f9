//! LLM provider implementations.
//!
//! One implementation covers both configured backends: OpenAI-compatible
//! endpoints and Ollama both expose `/v1/chat/completions`.

pub mod openai_compat;

use std::sync::Arc;

use opspilot_config::{Config, ModelType};
use opspilot_core::{Error, Provider};

pub use openai_compat::OpenAiCompatProvider;

/// Default model when `OPENAI_MODEL` is unset.
const DEFAULT_OPENAI_MODEL: &str = "gpt-4";

/// Build the provider and model name selected by the configuration.
pub fn build_from_config(config: &Config) -> Result<(Arc<dyn Provider>, String), Error> {
    match config.model_type {
        ModelType::Ollama => {
            let model = config.ollama_model.clone().ok_or_else(|| Error::Config {
                message: "OLLAMA_MODEL is required when MODEL_TYPE=ollama".into(),
            })?;
            let provider =
                OpenAiCompatProvider::ollama(config.ollama_base_url.as_deref());
            Ok((Arc::new(provider), model))
        }
        ModelType::OpenAi => {
            let api_key = config.openai_api_key.clone().unwrap_or_default();
            let base_url = config
                .openai_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into());
            let model = config
                .openai_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.into());
            let provider = OpenAiCompatProvider::new("openai", base_url, api_key);
            Ok((Arc::new(provider), model))
        }
    }
}
