//! Input channels for Opspilot.
//!
//! Three ingresses feed the shared input channel: the interactive console,
//! browser WebSockets (via the [`hub`]), and the Alertmanager [`webhook`].
//! All of them offer prompts non-blockingly; the dispatch loop is the single
//! consumer.

pub mod console;
pub mod hub;
pub mod webhook;

pub use console::ConsoleChannel;
pub use hub::{Hub, HubHandle};
pub use webhook::{build_alert_prompt, Alert, AlertmanagerMessage};
