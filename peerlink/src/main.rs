//! `peerlink`: line-oriented relay chat with direct peer channels.
//!
//! Reads commands from stdin and prints the message log to stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/peerlink/config.toml`).
//!
//! ```bash
//! # Connect to a local relay
//! cargo run --bin peerlink -- --relay-url ws://127.0.0.1:8080/ws
//!
//! # Negotiate direct channels with every peer seen on the relay
//! cargo run --bin peerlink -- --p2p --stun stun:stun.l.google.com:19302
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use peerlink::client::{Client, ClientCommand, ClientHandle};
use peerlink::config::{CliArgs, ClientConfig};
use peerlink::input::{self, HELP, Input};
use peerlink::log::LogEvent;
use peerlink::rtc::native::WebRtcApi;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file so they don't interleave with the chat output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(relay = %config.relay_url, p2p = config.p2p, "peerlink starting");

    let rtc = match WebRtcApi::new(config.stun_servers.clone()) {
        Ok(rtc) => rtc,
        Err(e) => {
            eprintln!("Error initializing WebRTC: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (client, handle) = Client::new(config.client_options(), rtc);
    let printer = tokio::spawn(print_log(handle.subscribe()));
    let client_task = tokio::spawn(client.run());

    read_input(&handle).await;

    if let Err(e) = client_task.await {
        tracing::error!(error = %e, "client task failed");
    }
    // The log channel closes once the client and the handle are gone.
    drop(handle);
    let _ = printer.await;
    tracing::info!("peerlink exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("peerlink.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Feeds stdin lines to the client until EOF, `/quit`, or the client stops.
async fn read_input(handle: &ClientHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read error");
                break;
            }
        };
        match input::parse(&line) {
            Ok(Input::Command(command)) => {
                if handle.send(command).is_err() {
                    break;
                }
            }
            Ok(Input::Peers) => match handle.snapshot().await {
                Ok(snapshot) => {
                    let me = snapshot.self_id.as_deref().unwrap_or("(unassigned)");
                    println!("you: {me}  relay: {}  p2p: {}", snapshot.relay_connected, snapshot.p2p);
                    for peer in &snapshot.peers {
                        let link = snapshot
                            .links
                            .iter()
                            .find(|(linked, _)| linked == peer)
                            .map_or_else(|| "-".to_string(), |(_, status)| format!("{status:?}"));
                        println!("  {peer}  {link}");
                    }
                }
                Err(_) => break,
            },
            Ok(Input::Help) => println!("{HELP}"),
            Ok(Input::Quit) => break,
            Ok(Input::Empty) => {}
            Err(e) => println!("{e}\n{HELP}"),
        }
    }
    let _ = handle.send(ClientCommand::Shutdown);
}

/// Prints log entries as they are appended or resolved.
async fn print_log(mut events: broadcast::Receiver<LogEvent>) {
    loop {
        match events.recv().await {
            Ok(LogEvent::Appended(entry) | LogEvent::Updated(entry)) => println!("{entry}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "log printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
