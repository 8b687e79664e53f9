//! The tool set offered to the LLM for one turn.
//!
//! Remote catalogue descriptors and local composite tools are merged into a
//! single namespace. Execution routes remote calls through the session's
//! [`ToolInvoker`]; local tools run in-process.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use opspilot_core::error::ToolError;
use opspilot_core::tool::{Tool, ToolDescriptor, ToolInvoker, ToolResult};

/// Tools available to one agent turn. Cheap to build per turn: descriptors
/// are shared snapshots and tools are Arcs.
pub struct ToolSet {
    remote: Arc<Vec<ToolDescriptor>>,
    local: Vec<Arc<dyn Tool>>,
    invoker: Arc<dyn ToolInvoker>,
}

impl ToolSet {
    pub fn new(remote: Arc<Vec<ToolDescriptor>>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            remote,
            local: Vec::new(),
            invoker,
        }
    }

    /// Add a local tool. A local tool shadows a remote tool of the same name.
    pub fn with_local(mut self, tool: Arc<dyn Tool>) -> Self {
        self.local.push(tool);
        self
    }

    /// All descriptors sent to the LLM, local tools last.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self
            .remote
            .iter()
            .filter(|d| !self.local.iter().any(|t| t.name() == d.name))
            .cloned()
            .collect();
        all.extend(self.local.iter().map(|t| t.to_descriptor()));
        all
    }

    /// Execute a named tool with JSON arguments.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        if let Some(tool) = self.local.iter().find(|t| t.name() == name) {
            return tool.execute(arguments).await;
        }

        if !self.remote.iter().any(|d| d.name == name) {
            return Err(ToolError::NotFound(name.to_string()));
        }

        let value = self.invoker.invoke(name, arguments).await?;
        debug!(tool = %name, "Remote tool returned");

        let output = render_tool_output(&value);
        if value.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: output,
            });
        }
        Ok(ToolResult::ok(output))
    }
}

/// Render a tool-call result for the LLM. The server wraps output in a
/// content array of text blocks; anything else is pretty-printed JSON.
pub fn render_tool_output(value: &Value) -> String {
    if let Some(content) = value.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Value)>>,
        response: Value,
    }

    #[async_trait]
    impl ToolInvoker for RecordingInvoker {
        async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(self.response.clone())
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
        }
    }

    #[tokio::test]
    async fn remote_execution_routes_through_invoker() {
        let invoker = Arc::new(RecordingInvoker {
            calls: Mutex::new(vec![]),
            response: json!({"content": [{"type": "text", "text": "pod-a\npod-b"}]}),
        });
        let set = ToolSet::new(
            Arc::new(vec![descriptor("kubernetes_list_pods")]),
            invoker.clone(),
        );

        let result = set
            .execute("kubernetes_list_pods", json!({"namespace": "default"}))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, "pod-a\npod-b");
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let invoker = Arc::new(RecordingInvoker {
            calls: Mutex::new(vec![]),
            response: Value::Null,
        });
        let set = ToolSet::new(Arc::new(vec![]), invoker);

        let err = set.execute("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_error_flag_becomes_tool_error() {
        let invoker = Arc::new(RecordingInvoker {
            calls: Mutex::new(vec![]),
            response: json!({
                "isError": true,
                "content": [{"type": "text", "text": "namespace not found"}]
            }),
        });
        let set = ToolSet::new(Arc::new(vec![descriptor("t")]), invoker);

        let err = set.execute("t", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("namespace not found"));
    }

    #[test]
    fn render_falls_back_to_json() {
        let rendered = render_tool_output(&json!({"pods": 3}));
        assert!(rendered.contains("\"pods\": 3"));
    }

    #[test]
    fn local_tool_shadows_remote_descriptor() {
        struct Shadow;
        #[async_trait]
        impl Tool for Shadow {
            fn name(&self) -> &str {
                "dup"
            }
            fn description(&self) -> &str {
                "local"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::ok("local"))
            }
        }

        let invoker = Arc::new(RecordingInvoker {
            calls: Mutex::new(vec![]),
            response: Value::Null,
        });
        let set =
            ToolSet::new(Arc::new(vec![descriptor("dup")]), invoker).with_local(Arc::new(Shadow));

        let descriptors = set.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].description, "local");
    }
}
