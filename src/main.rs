//! livevoice - talk to a Gemini Live model from the terminal
//!
//! Reads commands from stdin (`start`, `stop`, `status`, `quit`) and prints the
//! conversation transcript as turns complete. Ctrl+C stops a running session;
//! a second Ctrl+C while idle exits.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use livevoice::media_in::{list_devices, DeviceKind, PulseMicrophone};
use livevoice::media_out::PulseSpeaker;
use livevoice::{GeminiConnector, LiveConfig, LiveSession, Notice, SessionHandle, SessionState};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_devices() -> Result<()> {
    for (title, kind) in [("Input", DeviceKind::Input), ("Output", DeviceKind::Output)] {
        println!("{} devices:", title);
        let devices = list_devices(kind).context("Failed to list audio devices")?;
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            let tag = if device.is_monitor { " [monitor]" } else { "" };
            println!("  {}{}", device.name, tag);
            println!(
                "    {} - {} Hz, {} ch",
                device.description, device.sample_rate, device.channels
            );
        }
        println!();
    }
    Ok(())
}

fn print_notice(notice: Notice) {
    match notice {
        Notice::State(SessionState::Connecting) => println!("* connecting..."),
        Notice::State(SessionState::Active) => println!("* live - start talking"),
        Notice::State(SessionState::Idle) => println!("* session ended"),
        Notice::Error(e) => println!("! {}", e),
        Notice::Transcript(entry) => println!("{}: {}", entry.speaker, entry.text.trim()),
        Notice::Partial { .. } => {}
    }
}

async fn print_status(handle: &SessionHandle) {
    let Some(snapshot) = handle.snapshot().await else {
        return;
    };
    println!("status: {}", snapshot.status);
    println!(
        "playback: {} segments pending, cursor {:.2}s",
        snapshot.pending_segments, snapshot.cursor
    );
    if !snapshot.partial_user.is_empty() {
        println!("user (so far): {}", snapshot.partial_user.trim());
    }
    if !snapshot.partial_model.is_empty() {
        println!("model (so far): {}", snapshot.partial_model.trim());
    }
    println!("{} transcript entries", snapshot.transcript.len());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if std::env::args().any(|arg| arg == "--list-devices") {
        return print_devices();
    }

    let config = Arc::new(LiveConfig::from_env().context("Invalid configuration")?);
    info!("Using model {}", config.model);

    let (handle, mut notices, task) = LiveSession::spawn(
        config.clone(),
        Arc::new(GeminiConnector::new(config.clone())),
        Arc::new(PulseMicrophone::new(&config)),
        Arc::new(PulseSpeaker::new(&config)),
    );

    println!("Commands: start, stop, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "start" | "s" => { handle.start(); }
                    "stop" | "x" => { handle.stop(); }
                    "status" => print_status(&handle).await,
                    "quit" | "q" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                }
            }
            notice = notices.recv() => {
                match notice {
                    Some(notice) => print_notice(notice),
                    None => {
                        error!("Session manager exited");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let idle = handle
                    .snapshot()
                    .await
                    .map_or(true, |s| s.state == SessionState::Idle);
                if idle {
                    break;
                }
                info!("Interrupted, stopping session");
                handle.stop();
            }
        }
    }

    handle.shutdown();
    task.await.context("Session manager panicked")?;
    info!("livevoice stopped");
    Ok(())
}
