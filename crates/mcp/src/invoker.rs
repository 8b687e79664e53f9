//! Session-backed implementation of the remote tool invocation seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use opspilot_core::error::ToolError;
use opspilot_core::tool::ToolInvoker;

use crate::session::SessionManager;
use crate::tools::is_connection_class;

/// Default deadline for a single remote tool call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Invokes remote tools through the managed session. Connection-class
/// failures mark the session so the reconnect machinery kicks in.
pub struct SessionToolInvoker {
    session: Arc<SessionManager>,
    call_timeout: Duration,
}

impl SessionToolInvoker {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolInvoker for SessionToolInvoker {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let transport =
            self.session
                .get()
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason: e.to_string(),
                })?;

        debug!(tool = %name, "Invoking remote tool");
        match transport.call_tool(name, arguments, self.call_timeout).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let reason = e.to_string();
                if is_connection_class(&reason) {
                    self.session.mark_failed(&reason);
                }
                Err(ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason,
                })
            }
        }
    }
}
