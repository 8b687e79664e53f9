//! Reconnect monitor and periodic health ticker.
//!
//! The monitor subscribes to the session manager's reconnect signal: on each
//! signal it waits a beat, force-refreshes the tool cache (which reconnects
//! through the session), and schedules a console auto-retry when a previous
//! console command exists. The health ticker probes the session every five
//! minutes and refreshes either the session (healthy) or the cache (not).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opspilot_core::input::RetryState;
use opspilot_mcp::session::SessionManager;
use opspilot_mcp::tools::ToolCache;

/// Wait after a reconnect signal before rebuilding the tool set.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Period of the session health probe.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Background recovery tasks.
pub struct Monitor {
    session: Arc<SessionManager>,
    cache: Arc<ToolCache>,
    retry: Arc<RetryState>,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new(
        session: Arc<SessionManager>,
        cache: Arc<ToolCache>,
        retry: Arc<RetryState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session,
            cache,
            retry,
            shutdown,
        }
    }

    /// Spawn the reconnect monitor over the session's signal channel.
    pub fn spawn_reconnect(&self, mut reconnect_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let session = self.session.clone();
        let cache = self.cache.clone();
        let retry = self.retry.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,

                    signal = reconnect_rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        println!("\n[system] Reconnect signal received, rebuilding the tool set...");
                        tokio::time::sleep(RETRY_INTERVAL).await;

                        match cache.get_tools(false, true).await {
                            Err(e) => {
                                println!("[system] Reconnect to the tool server failed: {e}");
                                warn!(error = %e, "Reconnect refresh failed");
                            }
                            Ok(tools) => {
                                println!("[system] Reconnected, {} tools available", tools.len());
                                info!(session_id = %session.session_id(), "Reconnect complete");
                                if retry.schedule_retry() {
                                    println!("[system] Connection restored, re-running the last command...");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Spawn the 5-minute session health ticker.
    pub fn spawn_health_ticker(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let cache = self.cache.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.tick().await; // swallow the immediate first tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,

                    _ = ticker.tick() => {
                        if session.health_check().await {
                            debug!("Session health check passed");
                            session.refresh().await;
                        } else {
                            debug!("Session health check failed, refreshing tools silently");
                            let _ = cache.get_tools(false, true).await;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opspilot_core::error::TransportError;
    use opspilot_core::tool::ToolDescriptor;
    use opspilot_mcp::rpc::{InitializeResult, RpcTransport, TransportFactory};
    use opspilot_mcp::session::SessionConfig;
    use opspilot_mcp::tools::ToolCacheConfig;
    use serde_json::Value;

    struct StubTransport;

    #[async_trait]
    impl RpcTransport for StubTransport {
        async fn initialize(
            &self,
            _timeout: Duration,
        ) -> Result<InitializeResult, TransportError> {
            Ok(InitializeResult {
                session_id: Some("stub".into()),
                server_info: Value::Null,
            })
        }

        async fn list_tools(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<ToolDescriptor>, TransportError> {
            Ok(vec![ToolDescriptor {
                name: "t".into(),
                description: String::new(),
                input_schema: Value::Null,
            }])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Value,
            _timeout: Duration,
        ) -> Result<Value, TransportError> {
            Ok(Value::Null)
        }

        async fn close(&self) {}
    }

    struct StubFactory;

    #[async_trait]
    impl TransportFactory for StubFactory {
        async fn open(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
            Ok(Arc::new(StubTransport))
        }
    }

    async fn session_and_cache() -> (Arc<SessionManager>, Arc<ToolCache>) {
        let session = Arc::new(SessionManager::new(
            Arc::new(StubFactory),
            SessionConfig {
                stabilization_delay: Duration::from_millis(1),
                ..SessionConfig::default()
            },
        ));
        session.start().await.unwrap();
        let cache = Arc::new(ToolCache::new(session.clone(), ToolCacheConfig::default()));
        (session, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_signal_refreshes_and_schedules_retry() {
        let (session, cache) = session_and_cache().await;
        let reconnect_rx = session.reconnect_receiver().unwrap();
        let retry = Arc::new(RetryState::new());
        retry.record_command("list pods");

        let shutdown = CancellationToken::new();
        let monitor = Monitor::new(session.clone(), cache.clone(), retry.clone(), shutdown.clone());
        let handle = monitor.spawn_reconnect(reconnect_rx);

        session.mark_failed("stream closed: EOF");

        // Let the monitor sleep its retry interval and refresh.
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(cache.rpc_count(), 1);
        assert!(retry.is_pending());

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_scheduled_without_console_command() {
        let (session, cache) = session_and_cache().await;
        let reconnect_rx = session.reconnect_receiver().unwrap();
        let retry = Arc::new(RetryState::new());

        let shutdown = CancellationToken::new();
        let monitor = Monitor::new(session.clone(), cache.clone(), retry.clone(), shutdown.clone());
        let handle = monitor.spawn_reconnect(reconnect_rx);

        // Session expiry during idle: the timer fires, the monitor rebuilds
        // the tool set, but with no console command there is no retry.
        tokio::time::sleep(Duration::from_secs(30 * 60 + 10)).await;

        assert_eq!(cache.rpc_count(), 1);
        assert!(!retry.is_pending());
        assert!(!session.needs_reconnect());

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_ticker_refreshes_session_when_healthy() {
        let (session, cache) = session_and_cache().await;
        let retry = Arc::new(RetryState::new());

        let shutdown = CancellationToken::new();
        let monitor = Monitor::new(session.clone(), cache.clone(), retry, shutdown.clone());
        let handle = monitor.spawn_health_ticker();

        tokio::time::sleep(Duration::from_secs(5 * 60 + 5)).await;

        // Healthy probe refreshes the session, not the cache.
        assert_eq!(cache.rpc_count(), 0);
        assert!(!session.needs_reconnect());

        shutdown.cancel();
        let _ = handle.await;
    }
}
