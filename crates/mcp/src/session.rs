//! Session lifecycle management for the tool-server connection.
//!
//! One logical session exists at a time. All transitions run through this
//! manager: Disconnected → Connecting → Connected → Failed → Disconnected.
//! Failures are marked cooperatively (`mark_failed`) and surface as a signal
//! on the reconnect channel; the actual reconnect happens lazily on the next
//! `get` call, serialized by the connect mutex.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use opspilot_core::error::{Error, SessionError};

use crate::rpc::{RpcTransport, TransportFactory};

/// Timing knobs for the session lifecycle.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the initialize handshake.
    pub connect_timeout: Duration,

    /// Settle time between opening the stream and sending initialize; the
    /// server buffers early messages and benefits from it.
    pub stabilization_delay: Duration,

    /// The expiry timer marks the session failed after this long without a
    /// refresh.
    pub session_ttl: Duration,

    /// `needs_reconnect` starts reporting true past this age.
    pub soft_refresh_age: Duration,

    /// `health_check` refreshes in place past this age.
    pub hard_refresh_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            stabilization_delay: Duration::from_secs(2),
            session_ttl: Duration::from_secs(30 * 60),
            soft_refresh_age: Duration::from_secs(25 * 60),
            hard_refresh_age: Duration::from_secs(20 * 60),
        }
    }
}

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

struct Inner {
    state: SessionState,
    transport: Option<Arc<dyn RpcTransport>>,
    session_id: String,
    last_connect: Option<Instant>,
    last_error: Option<String>,
    failed: bool,
    closed: bool,
}

/// State shared with the expiry timer task.
struct Shared {
    inner: RwLock<Inner>,
    reconnect_tx: mpsc::Sender<()>,
}

impl Shared {
    fn mark_failed(&self, reason: &str) {
        {
            let mut inner = self.inner.write().expect("session lock poisoned");
            inner.failed = true;
            inner.last_error = Some(reason.to_string());
            inner.state = SessionState::Failed;
        }
        // Non-blocking: a signal already in flight is enough.
        let _ = self.reconnect_tx.try_send(());
    }
}

/// Manages the streamed RPC session to the tool server.
pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    shared: Arc<Shared>,
    /// Serializes get / connect / close / refresh.
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Self {
            factory,
            config,
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    state: SessionState::Disconnected,
                    transport: None,
                    session_id: String::new(),
                    last_connect: None,
                    last_error: None,
                    failed: false,
                    closed: false,
                }),
                reconnect_tx,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            expiry_timer: Mutex::new(None),
        }
    }

    /// Establish the initial session.
    pub async fn start(&self) -> Result<(), Error> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked()
            .await
            .map_err(|e| Error::Session(SessionError::InitFailed(e.to_string())))
    }

    /// Return a transport reference usable for RPC, reconnecting first if the
    /// session is failed, missing, or past the soft refresh age.
    ///
    /// Ordering guarantee: a caller that gets a transport back observes the
    /// session identifier assigned by the most recent successful initialize,
    /// because both run under the connect mutex.
    pub async fn get(&self) -> Result<Arc<dyn RpcTransport>, Error> {
        let _guard = self.connect_lock.lock().await;

        if self.shared.inner.read().expect("session lock poisoned").closed {
            return Err(Error::Session(SessionError::Closed));
        }

        if self.needs_reconnect() {
            self.connect_locked()
                .await
                .map_err(|e| Error::Session(SessionError::InitFailed(e.to_string())))?;
        }

        let inner = self.shared.inner.read().expect("session lock poisoned");
        inner
            .transport
            .clone()
            .ok_or_else(|| Error::Session(SessionError::InitFailed("no live session".into())))
    }

    /// Flag the session as failed and signal the reconnect channel
    /// (non-blocking; the signal is dropped if one is already pending).
    pub fn mark_failed(&self, reason: &str) {
        warn!(reason = %reason, "Session marked failed");
        self.shared.mark_failed(reason);
    }

    /// Reset the expiry timer, clear failure flags, and update the
    /// last-connect instant. No-op without a live session.
    pub async fn refresh(&self) {
        let _guard = self.connect_lock.lock().await;
        {
            let inner = self.shared.inner.read().expect("session lock poisoned");
            if inner.transport.is_none() {
                return;
            }
        }
        self.arm_expiry_timer();
        let mut inner = self.shared.inner.write().expect("session lock poisoned");
        inner.last_connect = Some(Instant::now());
        inner.failed = false;
        inner.last_error = None;
    }

    /// True when the session is healthy enough to use. A session older than
    /// the hard refresh age is refreshed in place and still reported healthy.
    pub async fn health_check(&self) -> bool {
        let age = {
            let inner = self.shared.inner.read().expect("session lock poisoned");
            if inner.failed || inner.closed {
                return false;
            }
            if inner.transport.is_none() || inner.session_id.is_empty() {
                return false;
            }
            inner.last_connect.map(|t| t.elapsed())
        };

        match age {
            Some(age) if age > self.config.hard_refresh_age => {
                debug!(age_secs = age.as_secs(), "Session aged past hard refresh threshold");
                self.refresh().await;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// True when the failure flag is set, no session is live, or the session
    /// is past the soft refresh age.
    pub fn needs_reconnect(&self) -> bool {
        let inner = self.shared.inner.read().expect("session lock poisoned");
        if inner.failed {
            return true;
        }
        if inner.transport.is_none() {
            return true;
        }
        match inner.last_connect {
            Some(t) => t.elapsed() > self.config.soft_refresh_age,
            None => true,
        }
    }

    /// Release the session and stop the expiry timer.
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;

        if let Some(handle) = self.expiry_timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }

        let transport = {
            let mut inner = self.shared.inner.write().expect("session lock poisoned");
            inner.closed = true;
            inner.state = SessionState::Disconnected;
            inner.session_id.clear();
            inner.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!("Session manager closed");
    }

    /// Take the reconnect-signal receiver. Single consumer; returns `None`
    /// after the first call.
    pub fn reconnect_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.reconnect_rx.lock().expect("rx lock poisoned").take()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.read().expect("session lock poisoned").state
    }

    pub fn session_id(&self) -> String {
        self.shared
            .inner
            .read()
            .expect("session lock poisoned")
            .session_id
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .inner
            .read()
            .expect("session lock poisoned")
            .last_error
            .clone()
    }

    /// Full connection procedure. Caller must hold the connect mutex.
    async fn connect_locked(&self) -> Result<(), Error> {
        // Tear down any existing session first; a Failed session passes
        // through Disconnected before Connecting again.
        let old = {
            let mut inner = self.shared.inner.write().expect("session lock poisoned");
            inner.state = SessionState::Disconnected;
            inner.session_id.clear();
            inner.transport.take()
        };
        if let Some(old) = old {
            old.close().await;
        }

        self.set_state(SessionState::Connecting);
        info!("Connecting to tool server");

        let transport = match self.factory.open().await {
            Ok(t) => t,
            Err(e) => {
                self.fail_connect(&e.to_string());
                return Err(Error::Transport(e));
            }
        };

        // The server buffers early messages; give the stream a moment.
        tokio::time::sleep(self.config.stabilization_delay).await;

        let init = match transport.initialize(self.config.connect_timeout).await {
            Ok(init) => init,
            Err(e) => {
                transport.close().await;
                self.fail_connect(&e.to_string());
                return Err(Error::Transport(e));
            }
        };

        let session_id = init.session_id.unwrap_or_else(|| {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            format!("session-{nanos}")
        });

        {
            let mut inner = self.shared.inner.write().expect("session lock poisoned");
            inner.transport = Some(transport);
            inner.session_id = session_id.clone();
            inner.last_connect = Some(Instant::now());
            inner.failed = false;
            inner.last_error = None;
            inner.state = SessionState::Connected;
        }
        self.arm_expiry_timer();

        info!(session_id = %session_id, "Session established");
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.shared.inner.write().expect("session lock poisoned").state = state;
    }

    fn fail_connect(&self, reason: &str) {
        let mut inner = self.shared.inner.write().expect("session lock poisoned");
        inner.state = SessionState::Failed;
        inner.failed = true;
        inner.last_error = Some(reason.to_string());
    }

    /// (Re)arm the session-expiry timer for a full TTL.
    fn arm_expiry_timer(&self) {
        let shared = self.shared.clone();
        let ttl = self.config.session_ttl;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            debug!("Session expiry timer fired");
            shared.mark_failed("session expired");
        });

        let mut timer = self.expiry_timer.lock().expect("timer lock poisoned");
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }
}
