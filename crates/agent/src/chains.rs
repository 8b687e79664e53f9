//! Declarative tool chains — composites of remote tool calls.
//!
//! A chain is an ordered sequence of `{tool, args builder}` steps sharing one
//! failure policy: a failed step contributes an error section and the chain
//! continues, so partial diagnostics still reach the user. Each step gets its
//! own call deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use opspilot_core::error::ToolError;
use opspilot_core::tool::{Tool, ToolInvoker, ToolResult};

use crate::toolset::render_tool_output;

/// Per-step call deadline.
const STEP_TIMEOUT: Duration = Duration::from_secs(45);

/// One step of a chain.
pub struct ChainStep {
    /// Section title in the concatenated output.
    pub title: &'static str,

    /// Remote tool to invoke.
    pub tool: &'static str,

    /// Builds the tool arguments from the chain input.
    pub build_args: fn(&Value) -> Value,
}

/// A chain of remote tool calls exposed to the LLM as a single local tool.
pub struct ToolChain {
    name: &'static str,
    description: &'static str,
    schema: Value,
    /// Input fields that must be non-empty strings.
    required: &'static [&'static str],
    steps: Vec<ChainStep>,
    invoker: Arc<dyn ToolInvoker>,
    step_timeout: Duration,
}

impl ToolChain {
    pub fn new(
        name: &'static str,
        description: &'static str,
        schema: Value,
        required: &'static [&'static str],
        steps: Vec<ChainStep>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            name,
            description,
            schema,
            required,
            steps,
            invoker,
            step_timeout: STEP_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for ToolChain {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        for field in self.required {
            let present = arguments
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !present {
                return Err(ToolError::InvalidArguments(format!(
                    "'{field}' is required and must be a non-empty string"
                )));
            }
        }

        let mut sections = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let args = (step.build_args)(&arguments);
            let outcome =
                tokio::time::timeout(self.step_timeout, self.invoker.invoke(step.tool, args)).await;

            let section = match outcome {
                Ok(Ok(value)) => {
                    format!("--- {} ---\n{}", step.title, render_tool_output(&value))
                }
                Ok(Err(e)) => {
                    warn!(chain = %self.name, tool = %step.tool, error = %e, "Chain step failed");
                    format!("--- Error in {} ---\n{e}", step.title)
                }
                Err(_) => {
                    warn!(chain = %self.name, tool = %step.tool, "Chain step timed out");
                    format!(
                        "--- Error in {} ---\ninvoke tool {}: context deadline exceeded after {}s",
                        step.title,
                        step.tool,
                        self.step_timeout.as_secs()
                    )
                }
            };
            sections.push(section);
        }

        Ok(ToolResult::ok(sections.join("\n\n")))
    }
}

/// The shipped composite: describe a pod, then pull its recent logs.
pub fn diagnose_pod_chain(invoker: Arc<dyn ToolInvoker>) -> ToolChain {
    ToolChain::new(
        "diagnose_kubernetes_pod",
        "Runs a diagnostic sequence for a specific Kubernetes pod: fetches the pod \
         description and its recent logs. Requires 'namespace' and 'pod_name'.",
        json!({
            "type": "object",
            "properties": {
                "namespace": {
                    "type": "string",
                    "description": "The Kubernetes namespace where the pod resides."
                },
                "pod_name": {
                    "type": "string",
                    "description": "The name of the Kubernetes pod to diagnose."
                }
            },
            "required": ["namespace", "pod_name"]
        }),
        &["namespace", "pod_name"],
        vec![
            ChainStep {
                title: "Pod Description",
                tool: "kubernetes_describe_pod",
                build_args: |input| {
                    json!({
                        "namespace": input["namespace"],
                        "name": input["pod_name"],
                    })
                },
            },
            ChainStep {
                title: "Pod Logs (last 50 lines)",
                tool: "kubernetes_get_pod_logs",
                build_args: |input| {
                    json!({
                        "namespace": input["namespace"],
                        "name": input["pod_name"],
                        "tail_lines": 50,
                    })
                },
            },
        ],
        invoker,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedInvoker {
        calls: Mutex<Vec<(String, Value)>>,
        fail_tool: Option<&'static str>,
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            if self.fail_tool == Some(name) {
                return Err(ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason: "connection reset".into(),
                });
            }
            Ok(json!({
                "content": [{"type": "text", "text": format!("output of {name}")}]
            }))
        }
    }

    #[tokio::test]
    async fn diagnose_pod_runs_steps_in_order() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: Mutex::new(vec![]),
            fail_tool: None,
        });
        let chain = diagnose_pod_chain(invoker.clone());

        let result = chain
            .execute(json!({"namespace": "default", "pod_name": "web-0"}))
            .await
            .unwrap();

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls[0].0, "kubernetes_describe_pod");
        assert_eq!(calls[1].0, "kubernetes_get_pod_logs");
        assert_eq!(calls[1].1["tail_lines"], 50);
        assert_eq!(calls[1].1["name"], "web-0");

        assert!(result.output.contains("--- Pod Description ---"));
        assert!(result.output.contains("--- Pod Logs (last 50 lines) ---"));
        assert!(result.output.contains("output of kubernetes_get_pod_logs"));
    }

    #[tokio::test]
    async fn failed_step_does_not_abort_the_chain() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: Mutex::new(vec![]),
            fail_tool: Some("kubernetes_describe_pod"),
        });
        let chain = diagnose_pod_chain(invoker.clone());

        let result = chain
            .execute(json!({"namespace": "default", "pod_name": "web-0"}))
            .await
            .unwrap();

        assert!(result.output.contains("--- Error in Pod Description ---"));
        // The logs step still ran.
        assert_eq!(invoker.calls.lock().unwrap().len(), 2);
        assert!(result.output.contains("output of kubernetes_get_pod_logs"));
    }

    #[tokio::test]
    async fn missing_input_is_rejected() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: Mutex::new(vec![]),
            fail_tool: None,
        });
        let chain = diagnose_pod_chain(invoker.clone());

        let err = chain
            .execute(json!({"namespace": "default"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_hits_its_deadline() {
        struct StuckInvoker;
        #[async_trait]
        impl ToolInvoker for StuckInvoker {
            async fn invoke(&self, _name: &str, _arguments: Value) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("sleep outlives the step deadline")
            }
        }

        let chain =
            diagnose_pod_chain(Arc::new(StuckInvoker)).with_step_timeout(Duration::from_secs(1));
        let result = chain
            .execute(json!({"namespace": "default", "pod_name": "web-0"}))
            .await
            .unwrap();

        assert!(result.output.contains("context deadline exceeded"));
    }
}
