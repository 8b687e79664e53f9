//! The dispatch loop — fan-in of all ingresses onto serialized agent turns.
//!
//! One task consumes the input channel, so agent turns are strictly ordered
//! no matter how many ingresses are producing. Each turn runs detached with
//! its own 90-s deadline plus a 100-s wall-clock guard, and errors are
//! classified by message fingerprint into reconnect / simplify / generic
//! replies.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opspilot_channels::hub::HubHandle;
use opspilot_core::input::{is_refresh_command, InputEvent, RetryState};
use opspilot_core::message::{Dialog, Message};
use opspilot_core::provider::Provider;
use opspilot_core::tool::{Tool, ToolInvoker};
use opspilot_core::Error;
use opspilot_mcp::invoker::SessionToolInvoker;
use opspilot_mcp::session::SessionManager;
use opspilot_mcp::tools::ToolCache;

use crate::chains::diagnose_pod_chain;
use crate::loop_runner::AgentLoop;
use crate::toolset::ToolSet;

/// Capacity of the shared input channel.
pub const INPUT_CHANNEL_CAPACITY: usize = 20;

const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// The initial system message.
const SYSTEM_PROMPT: &str = "\
You are a cloud-native operations assistant managing Kubernetes clusters and \
the Linux hosts underneath them.

Capabilities:
- Kubernetes resources: pods, deployments, services, stateful sets, ingresses, config maps, secrets
- Fault diagnosis: cluster health checks, pod/node/deployment diagnostics, alert analysis
- Linux hosts: system information, processes, resource usage, network checks, log analysis
- Log queries and cache inspection through the connected tools

Rules:
1. Execute one command at a time and wait for its result before issuing the \
next; never start commands that stream output forever.
2. Use the provided tools instead of hand-built kubectl invocations; check \
that a resource exists before operating on it.
3. Destructive operations (delete, cleanup, restart) must be confirmed with \
the user before execution.
4. When a command fails, explain the error in plain language and suggest a \
fix; never retry privileged operations on your own.
5. Users often give partial pod names; match them against the pods that \
actually exist and ask when the match is ambiguous.
6. For alert notifications: assess severity, inspect the affected resources \
and their logs and events, determine the root cause, then send the analysis \
out through the notification tool.";

const REPLY_UNREACHABLE: &str = "Sorry, I cannot reach the tool server right now. \
Please check that it is running.";

const REPLY_CONNECTION: &str = "Sorry, there was a connection problem reaching the \
tool server. Reconnecting now — please try again shortly.";

const REPLY_TOOL_TIMEOUT: &str = "Sorry, a tool call timed out. This usually happens \
with large result sets or under heavy load. Please simplify the command or try again later.";

const REPLY_TURN_TIMEOUT: &str = "Processing your request took too long. The server \
may be slow or the command too complex. Please try a simpler command or try again later.";

const REPLY_GENERIC: &str = "I ran into a problem handling your request. Please try \
again later or rephrase the command.";

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deadline for one agent turn.
    pub turn_timeout: Duration,

    /// Hard wall-clock guard in case the turn task itself wedges.
    pub wall_clock_guard: Duration,

    /// Cache age beyond which a turn triggers a refresh first.
    pub tool_update_interval: Duration,

    /// Retained non-system history entries.
    pub max_history: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(90),
            wall_clock_guard: Duration::from_secs(100),
            tool_update_interval: Duration::from_secs(30 * 60),
            max_history: 10,
        }
    }
}

/// Serializes agent turns over the multiplexed input channel.
pub struct Dispatcher {
    session: Arc<SessionManager>,
    cache: Arc<ToolCache>,
    provider: Arc<dyn Provider>,
    model: String,
    invoker: Arc<dyn ToolInvoker>,
    local_tools: Vec<Arc<dyn Tool>>,
    hub: HubHandle,
    retry: Arc<RetryState>,
    dialog: Dialog,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        session: Arc<SessionManager>,
        cache: Arc<ToolCache>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        hub: HubHandle,
        retry: Arc<RetryState>,
        config: DispatcherConfig,
    ) -> Self {
        let invoker: Arc<dyn ToolInvoker> =
            Arc::new(SessionToolInvoker::new(session.clone()));
        let local_tools: Vec<Arc<dyn Tool>> =
            vec![Arc::new(diagnose_pod_chain(invoker.clone()))];
        let dialog = Dialog::new(SYSTEM_PROMPT, config.max_history);

        Self {
            session,
            cache,
            provider,
            model: model.into(),
            invoker,
            local_tools,
            hub,
            retry,
            dialog,
            config,
        }
    }

    /// Add a local composite tool to every turn's tool set.
    pub fn with_local_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.local_tools.push(tool);
        self
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    /// Consume input events until shutdown. This is the only task that
    /// touches the dialog history.
    pub async fn run(mut self, mut input_rx: mpsc::Receiver<InputEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dispatch loop exiting on shutdown");
                    return;
                }

                event = input_rx.recv() => {
                    let Some(event) = event else {
                        warn!("Input channel closed unexpectedly");
                        return;
                    };
                    self.handle_input(event).await;
                }
            }
        }
    }

    pub(crate) async fn handle_input(&mut self, event: InputEvent) {
        println!("\n[system] Input received ({:?})", event.origin);
        let prompt = event.prompt;

        // Special commands bypass the agent entirely.
        if is_refresh_command(&prompt) {
            println!("[system] Refreshing the tool catalogue...");
            match self.cache.get_tools(true, true).await {
                Ok(tools) => {
                    println!("[system] {} tools available after refresh", tools.len());
                }
                Err(e) => {
                    println!("[system] Tool refresh failed: {e}");
                    self.deliver(REPLY_UNREACHABLE.into(), false).await;
                }
            }
            return;
        }

        // Staleness check before the turn.
        let stale = self
            .cache
            .age()
            .map_or(true, |age| age > self.config.tool_update_interval);
        if stale || self.session.needs_reconnect() {
            println!("[system] Refreshing the tool catalogue...");
            if let Err(e) = self.cache.get_tools(false, true).await {
                println!("[system] Tool refresh failed: {e}");
                self.deliver(REPLY_UNREACHABLE.into(), false).await;
                return;
            }
        }

        self.dialog.push(Message::user(&prompt));
        self.execute_turn().await;
        self.dialog.trim();
    }

    async fn execute_turn(&mut self) {
        // Keep the expiry timer away from a long turn.
        self.session.refresh().await;

        let tools = match self.cache.get_tools(false, false).await {
            Ok(tools) => tools,
            Err(e) => {
                println!("[system] Tool catalogue unavailable: {e}");
                self.deliver(REPLY_UNREACHABLE.into(), false).await;
                return;
            }
        };

        let mut toolset = ToolSet::new(tools, self.invoker.clone());
        for tool in &self.local_tools {
            toolset = toolset.with_local(tool.clone());
        }

        let agent = AgentLoop::new(self.provider.clone(), &self.model, toolset);
        let messages = self.dialog.messages().to_vec();
        let turn_timeout = self.config.turn_timeout;

        // Detached turn: the spawned task owns its own deadline, so dropping
        // this future cannot cancel the turn mid-flight.
        let handle = tokio::spawn(async move {
            tokio::time::timeout(turn_timeout, agent.run(messages)).await
        });

        print!("AI: processing your request");
        let _ = std::io::stdout().flush();

        let outcome = await_turn(handle, self.config.wall_clock_guard, || {
            print!(".");
            let _ = std::io::stdout().flush();
        })
        .await;
        println!();

        self.session.refresh().await;

        match outcome {
            TurnOutcome::Reply(text) => {
                self.deliver(text, true).await;
            }
            TurnOutcome::Failed(e) => {
                let message = e.to_string();
                if is_connection_error(&message) {
                    println!("[system] Connection problem detected: {message}");
                    self.session.mark_failed(&message);
                    self.deliver(REPLY_CONNECTION.into(), false).await;
                } else if is_tool_timeout_error(&message) {
                    println!("[system] Tool execution timed out: {message}");
                    self.deliver(REPLY_TOOL_TIMEOUT.into(), false).await;
                } else {
                    println!("[system] Agent run failed: {message}");
                    self.deliver(REPLY_GENERIC.into(), false).await;
                }
            }
            TurnOutcome::TurnTimeout | TurnOutcome::WallTimeout => {
                println!("[system] Command execution timed out");
                self.session.mark_failed("command execution timeout");
                self.deliver(REPLY_TURN_TIMEOUT.into(), false).await;
            }
        }
    }

    /// Print a reply, broadcast it to web subscribers, and optionally record
    /// it in the history (only successful turns are recorded).
    async fn deliver(&mut self, text: String, record: bool) {
        if record {
            self.dialog.push(Message::assistant(&text));
        }
        println!("AI: {text}");
        self.hub.broadcast(text).await;
    }
}

pub(crate) enum TurnOutcome {
    Reply(String),
    Failed(Error),
    TurnTimeout,
    WallTimeout,
}

type TurnHandle = JoinHandle<Result<Result<String, Error>, tokio::time::error::Elapsed>>;

/// Wait for a turn with a progress tick and a wall-clock guard. The guard
/// fires even when the turn task has wedged past its own deadline.
pub(crate) async fn await_turn(
    mut handle: TurnHandle,
    wall_clock: Duration,
    mut on_tick: impl FnMut(),
) -> TurnOutcome {
    let wall = tokio::time::sleep(wall_clock);
    tokio::pin!(wall);

    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    ticker.tick().await; // swallow the immediate first tick

    loop {
        tokio::select! {
            result = &mut handle => {
                return match result {
                    Ok(Ok(Ok(text))) => TurnOutcome::Reply(text),
                    Ok(Ok(Err(e))) => TurnOutcome::Failed(e),
                    Ok(Err(_elapsed)) => TurnOutcome::TurnTimeout,
                    Err(e) => TurnOutcome::Failed(Error::Internal(format!(
                        "agent task failed: {e}"
                    ))),
                };
            }

            _ = &mut wall => {
                handle.abort();
                return TurnOutcome::WallTimeout;
            }

            _ = ticker.tick() => on_tick(),
        }
    }
}

/// Connection-class fingerprint for agent-turn errors.
fn is_connection_error(message: &str) -> bool {
    ["connection", "timeout", "EOF", "Invalid session ID"]
        .iter()
        .any(|f| message.contains(f))
}

/// Tool-execution timeout fingerprint: a deadline hit inside a tool call.
fn is_tool_timeout_error(message: &str) -> bool {
    let deadline = message.contains("deadline exceeded")
        || message.contains("context deadline exceeded");
    let in_tool = message.contains("execute node[tools]")
        || message.contains("tool call")
        || message.contains("invoke tool");
    deadline && in_tool
}
