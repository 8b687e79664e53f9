//! Streamed JSON-RPC transport to the tool server.
//!
//! The server speaks a session-oriented SSE protocol: the client opens a
//! long-lived `text/event-stream` GET, receives an `endpoint` event naming
//! the URL to POST requests to, and then receives JSON-RPC responses as
//! `message` events on the stream. Requests and responses are correlated by
//! id through a pending-request map.
//!
//! Four verbs are needed by the orchestrator: initialize, list-tools,
//! invoke-tool, close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use opspilot_core::error::TransportError;
use opspilot_core::tool::ToolDescriptor;

/// Protocol version sent in the initialize handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity sent in the initialize handshake.
const CLIENT_NAME: &str = "opspilot";

/// Result of the initialize handshake.
#[derive(Debug, Clone)]
pub struct InitializeResult {
    /// Session identifier from response metadata, if the server assigned one.
    pub session_id: Option<String>,

    /// Raw server info for diagnostics.
    pub server_info: Value,
}

/// The transport seam the session manager is written against.
///
/// `SseTransport` is the production implementation; tests substitute mocks.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send the initialize request; must complete within `timeout`.
    async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, TransportError>;

    /// Fetch the tool catalogue.
    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Invoke a named tool with JSON arguments.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// Tear down the stream and fail all pending requests.
    async fn close(&self);
}

/// Opens transports. The session manager calls this on every (re)connect so
/// each session gets a fresh stream.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn RpcTransport>, TransportError>;
}

// ── SSE framing ───────────────────────────────────────────────────────────

/// One parsed SSE frame: an event name plus a data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental line-oriented SSE parser.
///
/// Feed raw bytes; complete frames pop out. Comment lines and unknown fields
/// are skipped. A `data:` line completes the frame immediately — the server
/// sends single-line payloads.
#[derive(Default)]
pub(crate) struct SseFrameReader {
    buffer: String,
    event: String,
}

impl SseFrameReader {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(event) = line.strip_prefix("event:") {
                self.event = event.trim().to_string();
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    // Per the SSE default, a frame without an event name is
                    // a plain "message".
                    event: if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    },
                    data: data.trim().to_string(),
                });
            }
        }

        frames
    }
}

// ── SSE transport ─────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

/// Production transport: one SSE stream down, JSON-RPC POSTs up.
pub struct SseTransport {
    http: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its POST
    /// endpoint. Fails if the announcement does not arrive within
    /// `open_timeout`.
    pub async fn open(
        server_url: &str,
        api_token: Option<String>,
        open_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let mut request = http
            .get(server_url)
            .header("Accept", "text/event-stream");
        if let Some(token) = &api_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::ConnectFailed(format!(
                "server returned status {}",
                response.status()
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let mut frames = SseFrameReader::default();

        // The first frame must be the endpoint announcement.
        let endpoint = tokio::time::timeout(open_timeout, async {
            while let Some(chunk) = byte_stream.next().await {
                let bytes = chunk.map_err(|e| TransportError::StreamClosed(e.to_string()))?;
                for frame in frames.push(&bytes) {
                    if frame.event == "endpoint" {
                        return Ok(frame.data);
                    }
                    trace!(event = %frame.event, "Ignoring pre-endpoint frame");
                }
            }
            Err(TransportError::StreamClosed(
                "stream ended before endpoint announcement".into(),
            ))
        })
        .await
        .map_err(|_| TransportError::DeadlineExceeded(open_timeout.as_secs()))??;

        let endpoint = resolve_endpoint(server_url, &endpoint)?;
        debug!(endpoint = %endpoint, "Event stream established");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = Arc::new(Self {
            http,
            endpoint,
            api_token,
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            reader: Mutex::new(None),
        });

        // Reader task owns the byte stream for the life of the session.
        let handle = tokio::spawn(async move {
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "Event stream read error");
                        break;
                    }
                };
                for frame in frames.push(&bytes) {
                    if frame.event != "message" {
                        trace!(event = %frame.event, "Ignoring non-message frame");
                        continue;
                    }
                    dispatch_response(&pending, &frame.data);
                }
            }
            fail_all_pending(&pending, "stream closed: EOF");
        });
        *transport.reader.lock().expect("reader lock poisoned") = Some(handle);

        Ok(transport)
    }

    /// Send one JSON-RPC request and await its response from the stream.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let result = self.post(&body).await;
        if let Err(e) = result {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(TransportError::StreamClosed(
                "response channel dropped".into(),
            )),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&id);
                Err(TransportError::DeadlineExceeded(timeout.as_secs()))
            }
        }
    }

    /// Fire a JSON-RPC notification (no id, no response).
    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(&body).await.map(|_| ())
    }

    async fn post(&self, body: &Value) -> Result<(), TransportError> {
        let mut request = self.http.post(&self.endpoint).json(body);
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if text.contains("Invalid session ID") || status.as_u16() == 404 {
                return Err(TransportError::InvalidSession(text));
            }
            return Err(TransportError::ConnectFailed(format!(
                "request rejected with status {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for SseTransport {
    async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, TransportError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                timeout,
            )
            .await?;

        // The handshake is only complete after the initialized notification.
        self.notify("notifications/initialized", json!({})).await?;

        let session_id = result
            .get("_meta")
            .or_else(|| result.get("meta"))
            .and_then(|meta| meta.get("session_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(InitializeResult {
            session_id,
            server_info: result,
        })
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", json!({}), timeout).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Rpc {
                code: -32603,
                message: "tools/list response has no tools array".into(),
            })?;

        tools
            .iter()
            .map(|t| {
                serde_json::from_value(t.clone()).map_err(|e| TransportError::Rpc {
                    code: -32603,
                    message: format!("malformed tool descriptor: {e}"),
                })
            })
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            timeout,
        )
        .await
    }

    async fn close(&self) {
        if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
            handle.abort();
        }
        fail_all_pending(&self.pending, "stream closed: transport shut down");
    }
}

/// Complete the pending request matching a `message` frame, if any.
fn dispatch_response(pending: &PendingMap, data: &str) {
    let message: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "Ignoring unparseable message frame");
            return;
        }
    };

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        trace!("Ignoring message frame without id");
        return;
    };

    let Some(tx) = pending.lock().expect("pending lock poisoned").remove(&id) else {
        trace!(id, "No pending request for response id");
        return;
    };

    let outcome = if let Some(error) = message.get("error") {
        Err(TransportError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error")
                .to_string(),
        })
    } else {
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    };

    let _ = tx.send(outcome);
}

fn fail_all_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = pending
        .lock()
        .expect("pending lock poisoned")
        .drain()
        .collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::StreamClosed(reason.into())));
    }
}

/// Resolve the endpoint announcement against the stream URL. The server may
/// announce an absolute URL or a path relative to its origin.
fn resolve_endpoint(server_url: &str, endpoint: &str) -> Result<String, TransportError> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = reqwest::Url::parse(server_url)
        .map_err(|e| TransportError::ConnectFailed(format!("bad server URL: {e}")))?;
    let joined = base
        .join(endpoint)
        .map_err(|e| TransportError::ConnectFailed(format!("bad endpoint announcement: {e}")))?;
    Ok(joined.to_string())
}

/// Factory wiring the configured server URL and token into fresh transports.
pub struct SseTransportFactory {
    server_url: String,
    api_token: Option<String>,
    open_timeout: Duration,
}

impl SseTransportFactory {
    pub fn new(server_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_token,
            open_timeout: Duration::from_secs(8),
        }
    }
}

#[async_trait]
impl TransportFactory for SseTransportFactory {
    async fn open(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        let transport = SseTransport::open(
            &self.server_url,
            self.api_token.clone(),
            self.open_timeout,
        )
        .await?;
        Ok(transport as Arc<dyn RpcTransport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reader_parses_endpoint_then_messages() {
        let mut reader = SseFrameReader::default();
        let frames = reader.push(
            b"event: endpoint\ndata: /message?sessionId=abc\n\nevent: message\ndata: {\"id\":1}\n\n",
        );
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "endpoint".into(),
                    data: "/message?sessionId=abc".into()
                },
                SseFrame {
                    event: "message".into(),
                    data: "{\"id\":1}".into()
                },
            ]
        );
    }

    #[test]
    fn frame_reader_handles_split_chunks() {
        let mut reader = SseFrameReader::default();
        assert!(reader.push(b"event: mess").is_empty());
        assert!(reader.push(b"age\ndata: {\"id\"").is_empty());
        let frames = reader.push(b":2}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"id\":2}");
    }

    #[test]
    fn frame_reader_defaults_event_to_message() {
        let mut reader = SseFrameReader::default();
        let frames = reader.push(b"data: hello\n");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn frame_reader_skips_comments_and_crlf() {
        let mut reader = SseFrameReader::default();
        let frames = reader.push(b": keepalive\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            resolve_endpoint("http://localhost:8811/sse", "/message?sessionId=1").unwrap(),
            "http://localhost:8811/message?sessionId=1"
        );
        assert_eq!(
            resolve_endpoint("http://localhost:8811/sse", "http://other/msg").unwrap(),
            "http://other/msg"
        );
    }

    #[test]
    fn dispatch_completes_pending_result() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        dispatch_response(&pending, r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#);

        let value = rx.try_recv().unwrap().unwrap();
        assert_eq!(value["ok"], true);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn dispatch_completes_pending_error() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        dispatch_response(
            &pending,
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"Invalid session ID"}}"#,
        );

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.to_string().contains("Invalid session ID"));
    }

    #[test]
    fn fail_all_pending_uses_stream_closed() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx);

        fail_all_pending(&pending, "stream closed: EOF");

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.to_string().contains("stream closed"));
    }
}
