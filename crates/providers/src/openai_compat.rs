//! OpenAI-compatible chat-completions provider.
//!
//! Covers both configured backends — OpenAI itself and Ollama's
//! OpenAI-compatible endpoint. The remote tool catalogue is presented to the
//! model as function definitions built directly from the catalogue
//! descriptors; their schemas pass through untouched, since the tool server
//! owns their shape.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use opspilot_core::error::ProviderError;
use opspilot_core::message::{Message, MessageToolCall, Role};
use opspilot_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use opspilot_core::tool::ToolDescriptor;

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider for any `/chat/completions` endpoint.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// One dialog message in chat-completions wire form.
    fn wire_message(message: &Message) -> Value {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let mut wire = Map::new();
        wire.insert("role".into(), json!(role));
        wire.insert("content".into(), json!(message.content));

        if !message.tool_calls.is_empty() {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments,
                        },
                    })
                })
                .collect();
            wire.insert("tool_calls".into(), Value::Array(calls));
        }

        if let Some(id) = &message.tool_call_id {
            wire.insert("tool_call_id".into(), json!(id));
        }

        Value::Object(wire)
    }

    /// A catalogue descriptor as a function definition. A descriptor without
    /// a schema gets the minimal empty-object schema some endpoints insist
    /// on.
    fn wire_function(descriptor: &ToolDescriptor) -> Value {
        let parameters = if descriptor.input_schema.is_null() {
            json!({ "type": "object", "properties": {} })
        } else {
            descriptor.input_schema.clone()
        };

        json!({
            "type": "function",
            "function": {
                "name": descriptor.name,
                "description": descriptor.description,
                "parameters": parameters,
            },
        })
    }

    /// Pull the assistant message, tool calls, and usage out of a completion
    /// body.
    fn parse_completion(completion: &Value) -> Result<ProviderResponse, ProviderError> {
        let reply = completion["choices"]
            .get(0)
            .map(|choice| &choice["message"])
            .ok_or_else(|| ProviderError::Api {
                status_code: 200,
                message: "completion has no choices".into(),
            })?;

        let mut message = Message::assistant(reply["content"].as_str().unwrap_or_default());
        if let Some(calls) = reply["tool_calls"].as_array() {
            for call in calls {
                let function = &call["function"];
                message.tool_calls.push(MessageToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: function["name"].as_str().unwrap_or_default().to_string(),
                    arguments: function["arguments"].as_str().unwrap_or("{}").to_string(),
                });
            }
        }

        let usage = completion.get("usage").and_then(|u| {
            Some(Usage {
                prompt_tokens: u["prompt_tokens"].as_u64()? as u32,
                completion_tokens: u["completion_tokens"].as_u64()? as u32,
                total_tokens: u["total_tokens"].as_u64()? as u32,
            })
        });

        Ok(ProviderResponse {
            message,
            usage,
            model: completion["model"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages.iter().map(Self::wire_message).collect::<Vec<_>>(),
            "temperature": request.temperature,
            "stream": false,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(Self::wire_function).collect());
        }

        debug!(
            provider = %self.name,
            model = %request.model,
            tools = request.tools.len(),
            "Requesting chat completion"
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed(
                "the endpoint rejected the API key".into(),
            ));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %detail, "Chat completion rejected");
            return Err(ProviderError::Api {
                status_code: status.as_u16(),
                message: detail,
            });
        }

        let completion: Value = response.json().await.map_err(|e| {
            ProviderError::Network(format!("unreadable completion body: {e}"))
        })?;
        Self::parse_completion(&completion)
    }
}
