//! Tool types — the abstraction over tool-server operations.
//!
//! The orchestrator never implements Kubernetes/Linux/Redis/Loki operations
//! itself: it stores the server's catalogue as opaque descriptors and invokes
//! them by name. Local composite tools (chains of remote calls) implement the
//! [`Tool`] trait and are merged into the set offered to the LLM.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// One entry of the remote tool catalogue.
///
/// Descriptors are immutable between cache refreshes; the body is opaque to
/// the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The tool name (e.g. "kubernetes_describe_pod")
    pub name: String,

    /// Human description, sent to the LLM
    #[serde(default)]
    pub description: String,

    /// JSON Schema of accepted arguments
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }
}

/// Seam for invoking a remote tool by name.
///
/// Implemented over the tool-server session; mocked in tests so the agent
/// loop and chains can run without a live server.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a named remote tool with JSON arguments.
    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;
}

/// A locally implemented tool (composite chains, notification helpers).
///
/// Remote catalogue entries do NOT implement this trait; they are invoked
/// through [`ToolInvoker`] directly.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a descriptor for sending to the LLM.
    fn to_descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}
