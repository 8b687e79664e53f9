//! Agent orchestration for Opspilot.
//!
//! - [`loop_runner`] — the ReAct cycle: LLM call → tool calls → loop.
//! - [`toolset`] — merges the remote catalogue with local composite tools.
//! - [`chains`] — declarative multi-step composites (`diagnose_pod`).
//! - [`dispatcher`] — the single goroutine-equivalent that serializes agent
//!   turns over the multiplexed input channel.
//! - [`monitor`] — reconnect signal handling and the periodic health ticker.

pub mod chains;
pub mod dispatcher;
pub mod loop_runner;
pub mod monitor;
pub mod toolset;

pub use chains::{diagnose_pod_chain, ChainStep, ToolChain};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use loop_runner::AgentLoop;
pub use monitor::Monitor;
pub use toolset::ToolSet;
