//! TTL-bounded cache of the remote tool catalogue.
//!
//! A non-empty snapshot younger than the TTL is served without I/O. Fetches
//! are serialized, run on a detached task with their own long deadline (a
//! caller dropping its future must not kill a fetch other waiters share),
//! and retry on connection-class errors while keeping the session alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use opspilot_core::error::{Error, ToolError};
use opspilot_core::tool::ToolDescriptor;

use crate::session::SessionManager;

/// Timing and retry knobs for the fetch pipeline.
#[derive(Debug, Clone)]
pub struct ToolCacheConfig {
    /// Snapshot age beyond which a fetch is required.
    pub cache_ttl: Duration,

    /// Deadline for one catalogue fetch, independent of the caller.
    pub fetch_timeout: Duration,

    /// Sleep between retry attempts.
    pub retry_wait: Duration,

    /// Total attempts for connection-class failures.
    pub max_attempts: u32,
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(120),
            retry_wait: Duration::from_secs(5),
            max_attempts: 4,
        }
    }
}

/// An immutable capture of the catalogue taken at a known instant.
#[derive(Clone)]
struct Snapshot {
    tools: Arc<Vec<ToolDescriptor>>,
    fetched_at: Instant,
}

/// The tool catalogue cache. Shared-read, single-writer; the snapshot is
/// replaced atomically and never mutated in place.
pub struct ToolCache {
    session: Arc<SessionManager>,
    config: ToolCacheConfig,
    snapshot: RwLock<Option<Snapshot>>,
    /// Serializes fetches so concurrent misses do not stampede the server.
    fetch_lock: tokio::sync::Mutex<()>,
    rpc_count: AtomicU64,
}

impl ToolCache {
    pub fn new(session: Arc<SessionManager>, config: ToolCacheConfig) -> Self {
        Self {
            session,
            config,
            snapshot: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
            rpc_count: AtomicU64::new(0),
        }
    }

    /// Return the tool catalogue, fetching from the server when the snapshot
    /// is missing, stale, or a refresh is forced.
    pub async fn get_tools(
        &self,
        verbose: bool,
        force_refresh: bool,
    ) -> Result<Arc<Vec<ToolDescriptor>>, Error> {
        if !force_refresh {
            if let Some(tools) = self.fresh_snapshot() {
                if verbose {
                    println!("Using {} cached tools", tools.len());
                }
                return Ok(tools);
            }
        }

        let _guard = self.fetch_lock.lock().await;

        // A fetch that completed while we waited for the lock satisfies a
        // non-forced caller; forced refreshes always perform their own RPC.
        if !force_refresh {
            if let Some(tools) = self.fresh_snapshot() {
                return Ok(tools);
            }
        }

        let tools = Arc::new(self.fetch_with_retry().await?);
        *self.snapshot.write().expect("snapshot lock poisoned") = Some(Snapshot {
            tools: tools.clone(),
            fetched_at: Instant::now(),
        });

        if verbose {
            println!("Fetched {} tools from the tool server:", tools.len());
            for (i, tool) in tools.iter().enumerate() {
                println!("  {}. {}", i + 1, tool.name);
            }
        }

        Ok(tools)
    }

    /// Age of the current snapshot, if any.
    pub fn age(&self) -> Option<Duration> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .as_ref()
            .map(|s| s.fetched_at.elapsed())
    }

    /// Drop the snapshot so the next call must fetch.
    pub fn reset(&self) {
        *self.snapshot.write().expect("snapshot lock poisoned") = None;
    }

    /// Number of list-tools RPCs issued since construction.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::SeqCst)
    }

    fn fresh_snapshot(&self) -> Option<Arc<Vec<ToolDescriptor>>> {
        let guard = self.snapshot.read().expect("snapshot lock poisoned");
        guard
            .as_ref()
            .filter(|s| !s.tools.is_empty() && s.fetched_at.elapsed() < self.config.cache_ttl)
            .map(|s| s.tools.clone())
    }

    async fn fetch_with_retry(&self) -> Result<Vec<ToolDescriptor>, Error> {
        let mut attempt = 1u32;
        loop {
            let transport = self.session.get().await?;

            self.rpc_count.fetch_add(1, Ordering::SeqCst);
            let fetch_timeout = self.config.fetch_timeout;

            // Detach the fetch: if the caller's future is dropped, the
            // spawned task keeps running and the session stays consistent.
            let handle =
                tokio::spawn(async move { transport.list_tools(fetch_timeout).await });
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(opspilot_core::error::TransportError::StreamClosed(format!(
                    "fetch task aborted: {e}"
                ))),
            };

            // Keep the session alive during long fetches, win or lose.
            self.session.refresh().await;

            match result {
                Ok(tools) if tools.is_empty() => {
                    return Err(Error::Tool(ToolError::EmptyCatalogue));
                }
                Ok(tools) => {
                    debug!(count = tools.len(), attempt, "Tool catalogue fetched");
                    return Ok(tools);
                }
                Err(e) => {
                    let message = e.to_string();
                    if !is_connection_class(&message) {
                        return Err(Error::Tool(ToolError::FetchFailed(message)));
                    }

                    warn!(
                        attempt,
                        max = self.config.max_attempts,
                        error = %message,
                        "Tool fetch failed with connection-class error"
                    );
                    self.session.mark_failed(&message);

                    if attempt >= self.config.max_attempts {
                        return Err(Error::Tool(ToolError::FetchFailed(message)));
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_wait).await;
                    // The next loop iteration obtains a fresh session
                    // reference via `session.get()`, reconnecting if needed.
                }
            }
        }
    }
}

/// Connection-class errors are retried with a reconnect; anything else fails
/// fast.
pub(crate) fn is_connection_class(message: &str) -> bool {
    const FINGERPRINTS: [&str; 4] = [
        "Invalid session ID",
        "connection",
        "stream closed",
        "deadline exceeded",
    ];
    FINGERPRINTS.iter().any(|f| message.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{InitializeResult, RpcTransport, TransportFactory};
    use crate::session::SessionConfig;
    use async_trait::async_trait;
    use opspilot_core::error::TransportError;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Tools(Vec<ToolDescriptor>),
        Fail(TransportError),
    }

    /// Transport whose list_tools responses follow a script shared across
    /// reconnects. An exhausted script keeps returning the last catalogue.
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<Step>>>,
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn initialize(
            &self,
            _timeout: Duration,
        ) -> Result<InitializeResult, TransportError> {
            Ok(InitializeResult {
                session_id: Some("scripted".into()),
                server_info: Value::Null,
            })
        }

        async fn list_tools(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<ToolDescriptor>, TransportError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Step::Tools(tools)) => Ok(tools),
                Some(Step::Fail(e)) => Err(e),
                None => Ok(vec![descriptor("fallback")]),
            }
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

    struct ScriptedFactory {
        script: Arc<Mutex<VecDeque<Step>>>,
        opens: AtomicU64,
    }

    impl ScriptedFactory {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Arc::new(Mutex::new(steps.into())),
                opens: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn open(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedTransport {
                script: self.script.clone(),
            }))
        }
    }

    async fn cache_with(steps: Vec<Step>) -> (ToolCache, Arc<ScriptedFactory>) {
        let factory = ScriptedFactory::new(steps);
        let session = Arc::new(SessionManager::new(
            factory.clone(),
            SessionConfig {
                stabilization_delay: Duration::from_millis(1),
                ..SessionConfig::default()
            },
        ));
        session.start().await.unwrap();
        (
            ToolCache::new(session, ToolCacheConfig::default()),
            factory,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_snapshot_served_without_rpc() {
        let (cache, _) = cache_with(vec![Step::Tools(vec![descriptor("a")])]).await;

        let first = cache.get_tools(false, false).await.unwrap();
        assert_eq!(cache.rpc_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let second = cache.get_tools(false, false).await.unwrap();
        assert_eq!(cache.rpc_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_refetched() {
        let (cache, _) = cache_with(vec![
            Step::Tools(vec![descriptor("a")]),
            Step::Tools(vec![descriptor("b")]),
        ])
        .await;

        cache.get_tools(false, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;

        let tools = cache.get_tools(false, false).await.unwrap();
        assert_eq!(cache.rpc_count(), 2);
        assert_eq!(tools[0].name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_is_idempotent() {
        let (cache, _) = cache_with(vec![
            Step::Tools(vec![descriptor("a")]),
            Step::Tools(vec![descriptor("b")]),
        ])
        .await;

        cache.get_tools(false, true).await.unwrap();
        let second = cache.get_tools(false, true).await.unwrap();

        assert_eq!(cache.rpc_count(), 2);
        assert_eq!(second[0].name, "b");
        // A follow-up read observes the second snapshot too.
        let read = cache.get_tools(false, false).await.unwrap();
        assert!(Arc::ptr_eq(&second, &read));
    }

    #[tokio::test(start_paused = true)]
    async fn four_connection_failures_exhaust_retries() {
        let (cache, _) = cache_with(vec![
            Step::Fail(TransportError::StreamClosed("EOF".into())),
            Step::Fail(TransportError::ConnectFailed("refused".into())),
            Step::Fail(TransportError::InvalidSession("gone".into())),
            Step::Fail(TransportError::DeadlineExceeded(120)),
            // A 5th attempt would succeed; it must never happen.
            Step::Tools(vec![descriptor("never")]),
        ])
        .await;

        let err = cache.get_tools(false, true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Tool(ToolError::FetchFailed(_))
        ));
        assert_eq!(cache.rpc_count(), 4);
        assert!(cache.age().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_recovers() {
        let (cache, factory) = cache_with(vec![
            Step::Fail(TransportError::StreamClosed("EOF".into())),
            Step::Fail(TransportError::ConnectFailed("refused".into())),
            Step::Tools(vec![descriptor("recovered")]),
        ])
        .await;

        let tools = cache.get_tools(false, true).await.unwrap();
        assert_eq!(tools[0].name, "recovered");
        assert_eq!(cache.rpc_count(), 3);
        // Each failure marked the session failed; each retry reconnected.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
        // The post-fetch refresh cleared the failure flag.
        assert!(!cache.session.needs_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn non_connection_error_fails_fast() {
        let (cache, _) = cache_with(vec![
            Step::Fail(TransportError::Rpc {
                code: -32602,
                message: "invalid params".into(),
            }),
            Step::Tools(vec![descriptor("never")]),
        ])
        .await;

        let err = cache.get_tools(false, true).await.unwrap_err();
        assert!(err.to_string().contains("invalid params"));
        assert_eq!(cache.rpc_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalogue_is_an_error() {
        let (cache, _) = cache_with(vec![Step::Tools(vec![])]).await;

        let err = cache.get_tools(false, true).await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::EmptyCatalogue)));
    }

    #[test]
    fn connection_class_fingerprints() {
        assert!(is_connection_class("Invalid session ID: abc"));
        assert!(is_connection_class("connection refused"));
        assert!(is_connection_class("stream closed: EOF"));
        assert!(is_connection_class("deadline exceeded after 120s"));
        assert!(!is_connection_class("invalid params"));
    }
}
