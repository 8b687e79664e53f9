//! Tool-server connectivity for Opspilot.
//!
//! Three layers, inside-out:
//! - [`rpc`] — the streamed JSON-RPC transport (SSE downstream, HTTP POST
//!   upstream) and the `RpcTransport`/`TransportFactory` seams.
//! - [`session`] — the session state machine: handshake, expiry timer,
//!   failure marking, cooperative reconnect.
//! - [`tools`] — the TTL-bounded tool catalogue cache with serialized
//!   fetches and bounded retry.

pub mod invoker;
pub mod rpc;
pub mod session;
pub mod tools;

pub use invoker::SessionToolInvoker;
pub use rpc::{InitializeResult, RpcTransport, SseTransport, SseTransportFactory, TransportFactory};
pub use session::{SessionConfig, SessionManager, SessionState};
pub use tools::{ToolCache, ToolCacheConfig};
