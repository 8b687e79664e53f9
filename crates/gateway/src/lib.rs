//! HTTP ingress for Opspilot.
//!
//! Two listeners, built on Axum:
//! - the webhook listener (default `:9094`) accepting Alertmanager POSTs,
//! - the web listener (default `:8080`) serving the WebSocket endpoint.
//!
//! Both offer prompts to the shared input channel non-blockingly; a full
//! queue is reported to the webhook caller as 503 and logged for WebSocket
//! clients.

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use opspilot_channels::hub::{serve_socket, HubHandle, MAX_MESSAGE_SIZE};
use opspilot_channels::webhook::{build_alert_prompt, AlertmanagerMessage};
use opspilot_config::Config;
use opspilot_core::input::InputEvent;
use opspilot_core::Error;

/// Shared state for both routers.
pub struct GatewayState {
    pub hub: HubHandle,
    pub input_tx: tokio::sync::mpsc::Sender<InputEvent>,
}

type SharedState = Arc<GatewayState>;

/// Router for the Alertmanager webhook listener.
pub fn webhook_router(state: SharedState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the web/WebSocket listener.
pub fn web_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve both listeners until the shutdown token fires.
pub async fn start(
    config: &Config,
    hub: HubHandle,
    input_tx: tokio::sync::mpsc::Sender<InputEvent>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let state = Arc::new(GatewayState { hub, input_tx });

    let webhook_addr = Config::bind_addr(&config.webhook_addr);
    let web_addr = Config::bind_addr(&config.web_addr);

    let webhook_listener = tokio::net::TcpListener::bind(&webhook_addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {webhook_addr}: {e}")))?;
    let web_listener = tokio::net::TcpListener::bind(&web_addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {web_addr}: {e}")))?;

    info!(addr = %webhook_addr, "Webhook listener started");
    info!(addr = %web_addr, "Web listener started");

    let webhook_app = webhook_router(state.clone());
    let web_app = web_router(state);

    let webhook_shutdown = shutdown.clone();
    let webhook_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(webhook_listener, webhook_app)
            .with_graceful_shutdown(webhook_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Webhook listener failed");
        }
    });

    let web_shutdown = shutdown.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(web_listener, web_app)
            .with_graceful_shutdown(web_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Web listener failed");
        }
    });

    let _ = tokio::join!(webhook_task, web_task);
    Ok(())
}

// --- Handlers ---

async fn index_handler() -> &'static str {
    "Opspilot web server is running. Connect via WebSocket at /ws"
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            serve_socket(socket, state.hub.clone(), state.input_tx.clone())
        })
}

async fn webhook_handler(
    State(state): State<SharedState>,
    payload: Result<Json<AlertmanagerMessage>, JsonRejection>,
) -> (StatusCode, String) {
    let Json(message) = match payload {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to decode webhook body: {e}"),
            );
        }
    };

    info!(
        receiver = %message.receiver,
        status = %message.status,
        alerts = message.alerts.len(),
        "Alertmanager webhook received"
    );

    let prompt = build_alert_prompt(&message);

    match state.input_tx.try_send(InputEvent::webhook(prompt)) {
        Ok(()) => (
            StatusCode::OK,
            "Webhook received and queued for processing".into(),
        ),
        Err(_) => {
            error!("Input queue full, rejecting webhook");
            (StatusCode::SERVICE_UNAVAILABLE, "queue busy".into())
        }
    }
}
