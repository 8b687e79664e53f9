//! # Opspilot Core
//!
//! Domain types, traits, and error definitions for the Opspilot Kubernetes
//! operations assistant. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod input;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use input::{is_exit_command, is_refresh_command, InputEvent, InputOrigin, RetryState};
pub use message::{Dialog, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, Usage};
pub use tool::{Tool, ToolDescriptor, ToolInvoker, ToolResult};
