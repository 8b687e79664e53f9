//! WebSocket hub — register/unregister/broadcast fan-out.
//!
//! All mutations of the client set happen on the hub task; everyone else
//! talks to it through channels. Broadcast offers each client its message
//! non-blockingly: a client whose outbound queue is full is evicted on the
//! spot so the broadcaster never blocks on a slow consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opspilot_core::input::InputEvent;

/// Outbound queue capacity per client.
pub const OUTBOUND_QUEUE: usize = 256;

/// Maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(50);

enum HubCommand {
    Register {
        id: u64,
        tx: mpsc::Sender<String>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        message: String,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle for talking to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Register a new client; returns its id and outbound queue.
    pub async fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let _ = self.tx.send(HubCommand::Register { id, tx }).await;
        (id, rx)
    }

    /// Remove a client; its outbound queue is closed by the hub.
    pub async fn unregister(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { id }).await;
    }

    /// Broadcast a message to every connected client.
    pub async fn broadcast(&self, message: impl Into<String>) {
        let _ = self
            .tx
            .send(HubCommand::Broadcast {
                message: message.into(),
            })
            .await;
    }

    /// Number of currently registered clients.
    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The broadcast coordinator.
pub struct Hub;

impl Hub {
    /// Spawn the hub task; it runs until the shutdown token is cancelled.
    pub fn spawn(shutdown: CancellationToken) -> HubHandle {
        let (tx, mut rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,

                    command = rx.recv() => {
                        let Some(command) = command else { break };
                        match command {
                            HubCommand::Register { id, tx } => {
                                clients.insert(id, tx);
                                info!(id, clients = clients.len(), "Web client connected");
                            }
                            HubCommand::Unregister { id } => {
                                // Dropping the sender closes the outbound
                                // queue; the write pump sends Close and exits.
                                if clients.remove(&id).is_some() {
                                    info!(id, clients = clients.len(), "Web client disconnected");
                                }
                            }
                            HubCommand::Broadcast { message } => {
                                let mut evicted = Vec::new();
                                for (id, tx) in &clients {
                                    if tx.try_send(message.clone()).is_err() {
                                        evicted.push(*id);
                                    }
                                }
                                for id in evicted {
                                    clients.remove(&id);
                                    warn!(id, "Evicting slow web client (outbound queue full)");
                                }
                            }
                            HubCommand::Count { reply } => {
                                let _ = reply.send(clients.len());
                            }
                        }
                    }
                }
            }
            debug!("Hub loop exited");
        });

        HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Serve one upgraded WebSocket connection: register with the hub, run the
/// read and write pumps, unregister when either ends.
pub async fn serve_socket(
    socket: WebSocket,
    hub: HubHandle,
    input_tx: mpsc::Sender<InputEvent>,
) {
    let (id, outbound_rx) = hub.register().await;
    let (sink, stream) = socket.split();

    let mut write_task = tokio::spawn(write_pump(sink, outbound_rx));
    let mut read_task = tokio::spawn(read_pump(stream, input_tx));

    // Whichever pump stops first ends the connection.
    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => {}
    }

    hub.unregister(id).await;
    // Give the write pump its chance to deliver the Close frame.
    let _ = timeout(WRITE_DEADLINE, write_task).await;
}

/// Read pump: every inbound text frame is offered to the input channel as a
/// user prompt. Exits on read error, close frame, or 60 s of silence (pongs
/// count as traffic and extend the deadline).
async fn read_pump(
    mut stream: futures::stream::SplitStream<WebSocket>,
    input_tx: mpsc::Sender<InputEvent>,
) {
    loop {
        let frame = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!("Web client read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Web client read error");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                // Never block the read pump on a full input queue.
                if input_tx.try_send(InputEvent::web(text)).is_err() {
                    warn!("Input queue full, web prompt dropped");
                }
            }
            Message::Close(_) => return,
            // Pings are answered by the framework; pongs just renewed the
            // deadline above.
            _ => {}
        }
    }
}

/// Write pump: forwards the outbound queue to the socket, batching queued
/// messages into one newline-separated frame, and pings every 50 s. A closed
/// queue produces a Close frame; any write failure or missed deadline ends
/// the pump.
async fn write_pump(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // swallow the immediate first tick

    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => match maybe {
                None => {
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                    return;
                }
                Some(text) => {
                    let mut payload = text;
                    while let Ok(next) = outbound_rx.try_recv() {
                        payload.push('\n');
                        payload.push_str(&next);
                    }
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(payload))).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
            },

            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let hub = Hub::spawn(CancellationToken::new());
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;

        hub.broadcast("hello").await;

        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted() {
        let hub = Hub::spawn(CancellationToken::new());
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;

        // Fill both outbound queues to capacity, draining only A.
        for i in 0..OUTBOUND_QUEUE {
            hub.broadcast(format!("msg-{i}")).await;
            assert!(rx_a.recv().await.is_some());
        }
        assert_eq!(hub.client_count().await, 2);

        // B's queue is full now; this broadcast evicts it.
        hub.broadcast("hi").await;
        assert_eq!(rx_a.recv().await.as_deref(), Some("hi"));
        assert_eq!(hub.client_count().await, 1);

        // B drains its backlog and then observes the closed queue — "hi"
        // never arrives.
        let mut last = None;
        while let Some(msg) = rx_b.recv().await {
            last = Some(msg);
        }
        assert_eq!(last.as_deref(), Some(&*format!("msg-{}", OUTBOUND_QUEUE - 1)));
    }

    #[tokio::test]
    async fn subsequent_broadcasts_skip_evicted_client() {
        let hub = Hub::spawn(CancellationToken::new());
        let (_a, mut rx_a) = hub.register().await;
        let (_b, _rx_b_kept_undrained) = hub.register().await;

        for i in 0..=OUTBOUND_QUEUE {
            hub.broadcast(format!("m{i}")).await;
            assert!(rx_a.recv().await.is_some());
        }
        assert_eq!(hub.client_count().await, 1);

        hub.broadcast("after").await;
        assert_eq!(rx_a.recv().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn unregister_closes_outbound_queue() {
        let hub = Hub::spawn(CancellationToken::new());
        let (id, mut rx) = hub.register().await;

        hub.unregister(id).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let token = CancellationToken::new();
        let hub = Hub::spawn(token.clone());
        let (_id, _rx) = hub.register().await;

        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The loop is gone; commands are accepted but unanswered.
        assert_eq!(hub.client_count().await, 0);
    }
}
