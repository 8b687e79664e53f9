//! Configuration loading and validation for Opspilot.
//!
//! All settings come from the environment (after an optional `.env` file is
//! merged via `dotenvy`) and are read **once** at startup into a `Config`
//! value owned by the application. Nothing re-reads the environment later.

use std::time::Duration;

use opspilot_core::Error;
use serde::{Deserialize, Serialize};

/// Which LLM backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    OpenAi,
    Ollama,
}

/// The application configuration snapshot.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tool-server URL (`MCP_SERVER_URL`). Required.
    pub server_url: String,

    /// Tool-server API token (`MCP_API_TOKEN`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Which model backend to use (`MODEL_TYPE`, default "openai").
    pub model_type: ModelType,

    /// OpenAI-compatible settings (`OPENAI_API_KEY` / `OPENAI_BASE_URL` /
    /// `OPENAI_MODEL`).
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_model: Option<String>,

    /// Ollama settings (`OLLAMA_BASE_URL` / `OLLAMA_MODEL`).
    pub ollama_base_url: Option<String>,
    pub ollama_model: Option<String>,

    /// Debug mode (`DEBUG` ∈ {1, true, yes}).
    pub debug: bool,

    /// Webhook listener address (`WEBHOOK_ADDR`, default ":9094").
    pub webhook_addr: String,

    /// Web UI / WebSocket listener address (`WEB_ADDR`, default ":8080").
    pub web_addr: String,

    /// Settle time after opening the event stream, before initialize
    /// (`STABILIZE_SECS`, default 2).
    pub stabilization_delay: Duration,

    /// Notification webhook consumed by the notification tool
    /// (`WECHAT_WEBHOOK_URL`); forwarded for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_webhook_url: Option<String>,
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Loads `.env` first if present; a missing file is not an error.
    /// A missing `MCP_SERVER_URL` is fatal.
    pub fn from_env() -> Result<Self, Error> {
        let _ = dotenvy::dotenv();

        let server_url = std::env::var("MCP_SERVER_URL").map_err(|_| Error::Config {
            message: "MCP_SERVER_URL environment variable is not set".into(),
        })?;

        let model_type = match std::env::var("MODEL_TYPE").as_deref() {
            Ok("ollama") => ModelType::Ollama,
            _ => ModelType::OpenAi,
        };

        let debug = matches!(
            std::env::var("DEBUG").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );

        let stabilize_secs = std::env::var("STABILIZE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(2);

        Ok(Self {
            server_url,
            api_token: env_opt("MCP_API_TOKEN"),
            model_type,
            openai_api_key: env_opt("OPENAI_API_KEY"),
            openai_base_url: env_opt("OPENAI_BASE_URL"),
            openai_model: env_opt("OPENAI_MODEL"),
            ollama_base_url: env_opt("OLLAMA_BASE_URL"),
            ollama_model: env_opt("OLLAMA_MODEL"),
            debug,
            webhook_addr: env_opt("WEBHOOK_ADDR").unwrap_or_else(|| ":9094".into()),
            web_addr: env_opt("WEB_ADDR").unwrap_or_else(|| ":8080".into()),
            stabilization_delay: Duration::from_secs(stabilize_secs),
            notify_webhook_url: env_opt("WECHAT_WEBHOOK_URL"),
        })
    }

    /// Normalize a ":9094"-style address into a bindable "0.0.0.0:9094".
    pub fn bind_addr(addr: &str) -> String {
        if let Some(port) = addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            addr.to_string()
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("api_token", &redact(&self.api_token))
            .field("model_type", &self.model_type)
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_model", &self.openai_model)
            .field("ollama_base_url", &self.ollama_base_url)
            .field("ollama_model", &self.ollama_model)
            .field("debug", &self.debug)
            .field("webhook_addr", &self.webhook_addr)
            .field("web_addr", &self.web_addr)
            .field("stabilization_delay", &self.stabilization_delay)
            .field("notify_webhook_url", &redact(&self.notify_webhook_url))
            .finish()
    }
}
