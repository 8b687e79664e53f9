//! Input events — the unit of work flowing into the dispatch loop.
//!
//! Every ingress (console, browser WebSocket, Alertmanager webhook) produces
//! `InputEvent`s onto one bounded channel; the dispatch loop consumes each
//! exactly once.

use serde::{Deserialize, Serialize};

/// Where a prompt came from.
///
/// The origin drives two asymmetries: only console input participates in
/// auto-retry after a reconnect, and only the webhook ingress reports
/// queue-full back to its caller (HTTP 503).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputOrigin {
    Console,
    Web,
    Webhook,
}

/// A prompt plus its origin tag.
#[derive(Debug, Clone)]
pub struct InputEvent {
    pub prompt: String,
    pub origin: InputOrigin,
}

impl InputEvent {
    pub fn console(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            origin: InputOrigin::Console,
        }
    }

    pub fn web(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            origin: InputOrigin::Web,
        }
    }

    pub fn webhook(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            origin: InputOrigin::Webhook,
        }
    }
}

/// Console lines that trigger clean shutdown.
pub const EXIT_COMMANDS: [&str; 3] = ["exit", "quit", "退出"];

/// Prompts that force a tool-cache refresh instead of an agent turn.
pub const REFRESH_COMMANDS: [&str; 3] = ["更新工具", "刷新工具", "重新连接"];

pub fn is_exit_command(line: &str) -> bool {
    EXIT_COMMANDS.contains(&line)
}

pub fn is_refresh_command(prompt: &str) -> bool {
    REFRESH_COMMANDS.contains(&prompt)
}

/// Console-only auto-retry state.
///
/// The dispatcher records the last console command; the reconnect monitor
/// schedules a retry after a successful reconnect; the console ingress
/// consumes it and re-submits the command. Web and webhook inputs never
/// touch this state — re-running a webhook prompt would re-notify on a
/// possibly resolved alert.
#[derive(Default)]
pub struct RetryState {
    inner: std::sync::Mutex<RetryInner>,
    notify: tokio::sync::Notify,
}

#[derive(Default)]
struct RetryInner {
    last_console_command: String,
    pending_retry: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the most recent console command.
    pub fn record_command(&self, command: &str) {
        if !command.is_empty() {
            self.inner.lock().expect("retry lock poisoned").last_console_command =
                command.to_string();
        }
    }

    /// Flag a retry if a console command exists. Returns whether one was
    /// scheduled; wakes the console ingress when it was.
    pub fn schedule_retry(&self) -> bool {
        let scheduled = {
            let mut inner = self.inner.lock().expect("retry lock poisoned");
            if inner.last_console_command.is_empty() {
                false
            } else {
                inner.pending_retry = true;
                true
            }
        };
        if scheduled {
            self.notify.notify_one();
        }
        scheduled
    }

    /// Consume a pending retry, clearing the flag.
    pub fn take_pending(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("retry lock poisoned");
        if inner.pending_retry {
            inner.pending_retry = false;
            Some(inner.last_console_command.clone())
        } else {
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().expect("retry lock poisoned").pending_retry
    }

    /// Await the next scheduled retry notification.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
