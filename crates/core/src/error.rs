//! Error types for the Opspilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Opspilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Tool-server transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures on the streamed RPC connection to the tool server.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("request timed out: deadline exceeded after {0}s")]
    DeadlineExceeded(u64),

    #[error("Invalid session ID: {0}")]
    InvalidSession(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session initialization failed: {0}")]
    InitFailed(String),

    #[error("session expired")]
    Expired,

    #[error("session manager closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("tool call failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("invoke tool {tool_name}: context deadline exceeded after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("tool catalogue fetch failed: {0}")]
    FetchFailed(String),

    #[error("tool catalogue is empty")]
    EmptyCatalogue,

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("input queue full")]
    QueueFull,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_displays_reconnect_substrings() {
        // The fetch pipeline and the dispatcher classify errors by substring,
        // so these renderings are load-bearing.
        let err = Error::Transport(TransportError::StreamClosed("EOF".into()));
        assert!(err.to_string().contains("stream closed"));

        let err = Error::Transport(TransportError::InvalidSession("sess-1".into()));
        assert!(err.to_string().contains("Invalid session ID"));

        let err = Error::Transport(TransportError::DeadlineExceeded(120));
        assert!(err.to_string().contains("deadline exceeded"));

        let err = Error::Transport(TransportError::ConnectFailed("refused".into()));
        assert!(err.to_string().contains("connection"));
    }

    #[test]
    fn tool_timeout_carries_invoke_fingerprint() {
        let err = Error::Tool(ToolError::Timeout {
            tool_name: "kubernetes_get_pod_logs".into(),
            timeout_secs: 45,
        });
        let msg = err.to_string();
        assert!(msg.contains("invoke tool"));
        assert!(msg.contains("deadline exceeded"));
    }
}
