//! Opspilot — the main entry point.
//!
//! Boots the tool-server session (three attempts with backoff), wires the
//! console, web, and webhook ingresses onto the shared input channel, and
//! runs the dispatch loop until an exit command or termination signal.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use opspilot_agent::dispatcher::{Dispatcher, DispatcherConfig, INPUT_CHANNEL_CAPACITY};
use opspilot_agent::monitor::Monitor;
use opspilot_channels::console::ConsoleChannel;
use opspilot_channels::hub::Hub;
use opspilot_config::Config;
use opspilot_core::input::RetryState;
use opspilot_mcp::rpc::SseTransportFactory;
use opspilot_mcp::session::{SessionConfig, SessionManager};
use opspilot_mcp::tools::{ToolCache, ToolCacheConfig};

/// Bootstrap attempts before giving up.
const INIT_ATTEMPTS: u32 = 3;

/// Backoff between bootstrap attempts.
const INIT_BACKOFF: Duration = Duration::from_secs(10);

/// Tool-fetch attempts within one bootstrap attempt.
const INIT_FETCH_ATTEMPTS: u32 = 3;

/// Wait between bootstrap tool-fetch attempts.
const INIT_FETCH_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "opspilot",
    about = "Opspilot — LLM-driven Kubernetes operations assistant",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let filter = if cli.verbose || config.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    println!("==== Opspilot cloud-native operations client ====");
    println!("Inputs: console, web UI, Alertmanager webhook");
    println!("Tool server: {}", config.server_url);

    // ── Bootstrap: session + initial tool fetch, with backoff ──
    let mut bootstrapped = None;
    for attempt in 1..=INIT_ATTEMPTS {
        println!("=== Initialization attempt {attempt}/{INIT_ATTEMPTS} ===");
        match bootstrap(&config).await {
            Ok(parts) => {
                bootstrapped = Some(parts);
                break;
            }
            Err(e) => {
                error!(attempt, error = %e, "Initialization failed");
                if attempt < INIT_ATTEMPTS {
                    println!("Retrying in {} seconds...", INIT_BACKOFF.as_secs());
                    tokio::time::sleep(INIT_BACKOFF).await;
                }
            }
        }
    }
    let Some((session, cache)) = bootstrapped else {
        eprintln!("Failed to initialize after {INIT_ATTEMPTS} attempts, exiting.");
        std::process::exit(1);
    };

    let (provider, model) = opspilot_providers::build_from_config(&config)?;
    info!(provider = %provider.name(), model = %model, "Model backend ready");

    // ── Shared plumbing ──
    let shutdown = CancellationToken::new();
    let (input_tx, input_rx) = tokio::sync::mpsc::channel(INPUT_CHANNEL_CAPACITY);
    let retry = Arc::new(RetryState::new());
    let hub = Hub::spawn(shutdown.clone());

    // ── HTTP ingress (webhook + WebSocket) ──
    {
        let config = config.clone();
        let hub = hub.clone();
        let input_tx = input_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = opspilot_gateway::start(&config, hub, input_tx, shutdown).await {
                error!(error = %e, "HTTP ingress failed");
            }
        });
    }

    // ── Reconnect monitor + health ticker ──
    let monitor = Monitor::new(
        session.clone(),
        cache.clone(),
        retry.clone(),
        shutdown.clone(),
    );
    let reconnect_rx = session
        .reconnect_receiver()
        .expect("reconnect receiver already taken");
    monitor.spawn_reconnect(reconnect_rx);
    monitor.spawn_health_ticker();

    // ── Dispatch loop ──
    let dispatcher = Dispatcher::new(
        session.clone(),
        cache,
        provider,
        model,
        hub,
        retry.clone(),
        DispatcherConfig::default(),
    );
    {
        let shutdown = shutdown.clone();
        tokio::spawn(dispatcher.run(input_rx, shutdown));
    }

    // ── Console ingress ──
    let console = ConsoleChannel::new(input_tx, retry, shutdown.clone());
    tokio::spawn(console.run());

    println!("Client ready; waiting for input (console, web UI, webhook)...");

    // ── Shutdown on signal or console exit command ──
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nTermination signal received, shutting down...");
            shutdown.cancel();
        }
    }

    session.close().await;
    println!("Goodbye.");
    Ok(())
}

/// One bootstrap attempt: connect the session, then fetch the initial tool
/// catalogue with inner retries.
async fn bootstrap(
    config: &Config,
) -> Result<(Arc<SessionManager>, Arc<ToolCache>), opspilot_core::Error> {
    let factory = Arc::new(SseTransportFactory::new(
        config.server_url.clone(),
        config.api_token.clone(),
    ));
    let session = Arc::new(SessionManager::new(
        factory,
        SessionConfig {
            stabilization_delay: config.stabilization_delay,
            ..SessionConfig::default()
        },
    ));

    println!("Connecting to the tool server...");
    session.start().await?;
    println!(
        "Connected, session {} established",
        session.session_id()
    );

    let cache = Arc::new(ToolCache::new(session.clone(), ToolCacheConfig::default()));

    let mut last_error = None;
    for attempt in 1..=INIT_FETCH_ATTEMPTS {
        println!("[system] Fetching tools (attempt {attempt}/{INIT_FETCH_ATTEMPTS})...");
        match cache.get_tools(attempt == 1, true).await {
            Ok(tools) => {
                println!("[system] {} tools ready, initialization complete", tools.len());
                return Ok((session, cache));
            }
            Err(e) => {
                println!("[system] Tool fetch failed: {e}");
                last_error = Some(e);
                if attempt < INIT_FETCH_ATTEMPTS {
                    session.mark_failed("initial tool fetch failed");
                    tokio::time::sleep(INIT_FETCH_WAIT).await;
                }
            }
        }
    }

    session.close().await;
    Err(last_error.expect("fetch loop ran at least once"))
}
