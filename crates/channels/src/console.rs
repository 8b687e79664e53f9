//! Console channel — interactive terminal input.
//!
//! Reads lines from stdin and offers them to the input channel. The exit
//! literals trigger clean shutdown. After a reconnect, a scheduled auto-retry
//! re-submits the last console command with a visible annotation.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opspilot_core::input::{is_exit_command, InputEvent, RetryState};

/// Interactive console ingress.
pub struct ConsoleChannel {
    input_tx: mpsc::Sender<InputEvent>,
    retry: Arc<RetryState>,
    shutdown: CancellationToken,
}

impl ConsoleChannel {
    pub fn new(
        input_tx: mpsc::Sender<InputEvent>,
        retry: Arc<RetryState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            input_tx,
            retry,
            shutdown,
        }
    }

    /// Run the console read loop until shutdown or EOF.
    pub async fn run(self) {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        println!("\nEnter a command ('exit' or 'quit' to leave):");

        loop {
            if !self.retry.is_pending() {
                print!("You: ");
                let _ = std::io::stdout().flush();
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Console reader exiting on shutdown");
                    return;
                }

                _ = self.retry.notified() => {
                    if let Some(command) = self.retry.take_pending() {
                        println!("{command} (自动重试)");
                        self.offer(InputEvent::console(command));
                    }
                }

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }

                        if is_exit_command(&line) {
                            self.shutdown.cancel();
                            return;
                        }

                        // Remembered for auto-retry after a reconnect.
                        self.retry.record_command(&line);
                        self.offer(InputEvent::console(line));
                    }
                    Ok(None) => {
                        info!("Console input reached EOF");
                        return;
                    }
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            return;
                        }
                        warn!(error = %e, "Failed to read console input");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    fn offer(&self, event: InputEvent) {
        if self.input_tx.try_send(event).is_err() {
            warn!("Input queue full, console input dropped");
        }
    }
}
