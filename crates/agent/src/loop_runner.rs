//! The agent reasoning loop implementation.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use opspilot_core::message::Message;
use opspilot_core::provider::{Provider, ProviderRequest};

use crate::toolset::ToolSet;

/// Maximum LLM/tool iterations per turn.
const MAX_ITERATIONS: u32 = 40;

/// The core agent loop that orchestrates LLM calls and tool execution.
///
/// Runs on a snapshot of the dialog: intermediate tool-call and tool-result
/// messages live only inside one turn; the dispatcher appends the final
/// assistant text to the durable history.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    tools: ToolSet,
    max_iterations: u32,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, tools: ToolSet) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            tools,
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Run one agent turn to completion and return the assistant's reply.
    pub async fn run(&self, mut messages: Vec<Message>) -> Result<String, opspilot_core::Error> {
        let tool_definitions = self.tools.descriptors();
        let mut iteration = 0;

        loop {
            iteration += 1;
            if iteration > self.max_iterations {
                warn!(iterations = iteration, "Max tool iterations reached");
                break;
            }

            debug!(iteration, messages = messages.len(), "Agent loop iteration");

            let request = ProviderRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                temperature: self.temperature,
                tools: tool_definitions.clone(),
            };

            let response = self.provider.complete(request).await?;

            if response.message.tool_calls.is_empty() {
                // No tool calls — this is the final text response.
                return Ok(response.message.content);
            }

            let tool_calls = response.message.tool_calls.clone();
            messages.push(response.message);

            for tc in &tool_calls {
                let arguments: Value =
                    serde_json::from_str(&tc.arguments).unwrap_or_default();

                match self.tools.execute(&tc.name, arguments).await {
                    Ok(result) => {
                        messages.push(Message::tool_result(&tc.id, &result.output));
                    }
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "Tool execution failed");
                        // Report the error to the LLM so it can adapt.
                        messages.push(Message::tool_result(&tc.id, format!("Error: {e}")));
                    }
                }
            }
            // Loop back — the LLM sees the tool results and decides what
            // to do next.
        }

        Ok("I've reached the maximum number of tool call iterations. Please provide further guidance.".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opspilot_core::error::{ProviderError, ToolError};
    use opspilot_core::message::MessageToolCall;
    use opspilot_core::provider::ProviderResponse;
    use opspilot_core::tool::{ToolDescriptor, ToolInvoker};
    use serde_json::json;
    use std::sync::Mutex;

    /// Provider that pops scripted responses.
    struct ScriptedProvider {
        responses: Mutex<Vec<Message>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Message>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            let message = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .expect("script exhausted");
            Ok(ProviderResponse {
                message,
                usage: None,
                model: "scripted".into(),
            })
        }
    }

    struct EchoInvoker {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        async fn invoke(&self, name: &str, _arguments: Value) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push(name.to_string());
            Ok(json!({"content": [{"type": "text", "text": "3 pods"}]}))
        }
    }

    fn toolset(invoker: Arc<EchoInvoker>) -> ToolSet {
        ToolSet::new(
            Arc::new(vec![ToolDescriptor {
                name: "kubernetes_list_pods".into(),
                description: String::new(),
                input_schema: Value::Null,
            }]),
            invoker,
        )
    }

    fn tool_call_message(tool: &str) -> Message {
        let mut msg = Message::assistant("");
        msg.tool_calls.push(MessageToolCall {
            id: "call_1".into(),
            name: tool.into(),
            arguments: r#"{"namespace":"default"}"#.into(),
        });
        msg
    }

    #[tokio::test]
    async fn plain_text_response_ends_the_turn() {
        let provider = ScriptedProvider::new(vec![Message::assistant("All quiet.")]);
        let invoker = Arc::new(EchoInvoker {
            calls: Mutex::new(vec![]),
        });
        let agent = AgentLoop::new(provider, "m", toolset(invoker.clone()));

        let reply = agent.run(vec![Message::user("status?")]).await.unwrap();
        assert_eq!(reply, "All quiet.");
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_calls_execute_then_final_reply() {
        let provider = ScriptedProvider::new(vec![
            tool_call_message("kubernetes_list_pods"),
            Message::assistant("There are 3 pods."),
        ]);
        let invoker = Arc::new(EchoInvoker {
            calls: Mutex::new(vec![]),
        });
        let agent = AgentLoop::new(provider, "m", toolset(invoker.clone()));

        let reply = agent
            .run(vec![Message::user("list pods in default")])
            .await
            .unwrap();

        assert_eq!(reply, "There are 3 pods.");
        assert_eq!(
            invoker.calls.lock().unwrap().as_slice(),
            ["kubernetes_list_pods"]
        );
    }

    #[tokio::test]
    async fn unknown_tool_error_is_reported_to_the_llm() {
        let provider = ScriptedProvider::new(vec![
            tool_call_message("no_such_tool"),
            Message::assistant("That tool is unavailable."),
        ]);
        let invoker = Arc::new(EchoInvoker {
            calls: Mutex::new(vec![]),
        });
        let agent = AgentLoop::new(provider, "m", toolset(invoker));

        let reply = agent.run(vec![Message::user("go")]).await.unwrap();
        assert_eq!(reply, "That tool is unavailable.");
    }

    #[tokio::test]
    async fn iteration_cap_forces_a_reply() {
        // Always asks for another tool call; the cap has to break the loop.
        let responses: Vec<Message> = (0..3)
            .map(|_| tool_call_message("kubernetes_list_pods"))
            .collect();
        let provider = ScriptedProvider::new(responses);
        let invoker = Arc::new(EchoInvoker {
            calls: Mutex::new(vec![]),
        });
        let agent =
            AgentLoop::new(provider, "m", toolset(invoker)).with_max_iterations(3);

        let reply = agent.run(vec![Message::user("loop")]).await.unwrap();
        assert!(reply.contains("maximum number of tool call iterations"));
    }
}
