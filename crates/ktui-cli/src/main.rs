//! ktui - Main entry point
//!
//! Discovers Kasa-style smart plugs on the local network and drives them
//! from a line-based command prompt. The prompt is a minimal stand-in for
//! a richer terminal UI: it consumes the same snapshot and outcome feeds
//! such a UI would subscribe to.

mod config;
mod session;

use anyhow::Result;
use clap::Parser;
use ktui_core::{DeviceId, DeviceRegistry, DeviceStatus, RegistrySnapshot, Sequencer};
use ktui_discovery::{Poller, PollerState};
use ktui_proto::{CommandOp, DeviceClient};
use session::Session;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ktui")]
#[command(about = "Discover and control Kasa-style smart plugs on the local network")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ktui.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Run a single discovery scan, print the results, and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("ktui v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    let registry = Arc::new(DeviceRegistry::new());
    let sequencer = Arc::new(Sequencer::new());
    let client = DeviceClient::new(&config.protocol, config.command_timeout());
    let poller = Arc::new(Poller::new(
        Arc::clone(&registry),
        Arc::clone(&sequencer),
        config.to_poller_config(),
    ));
    let (session, mut outcomes) = Session::new(
        registry,
        sequencer,
        client,
        config.to_probe_config(),
        Arc::clone(&poller),
    );

    if args.scan_once {
        let found = session.discover().await?;
        println!("Discovery complete. Found {found} devices.");
        print_device_list(&session.snapshot());
        return Ok(());
    }

    let mut poller_state = poller.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    println!("Welcome to ktui");
    println!("Scanning for devices... please wait.");
    // Let the first poll cycle finish before prompting.
    while poller_state.changed().await.is_ok() {
        let state = *poller_state.borrow();
        if state == PollerState::Idle || state == PollerState::Cancelled {
            break;
        }
    }
    print_device_list(&session.snapshot());
    println!("Type help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                match line? {
                    None => break,
                    Some(line) => {
                        if !handle_command(&session, line.trim()).await {
                            break;
                        }
                    }
                }
            }
            Some(outcome) = outcomes.recv() => {
                match outcome.result {
                    Ok(()) => println!("{}: ok", outcome.device),
                    Err(e) => println!("{}: {e}", outcome.device),
                }
            }
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    poll_task.await??;
    Ok(())
}

/// Handle one prompt line; returns false when the session should end
async fn handle_command(session: &Session, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };
    let cmd = cmd.trim_start_matches('/').to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    match cmd.as_str() {
        "quit" | "exit" => {
            println!("Goodbye!");
            return false;
        }
        "scan" => {
            println!("Scanning for devices... please wait.");
            match session.discover().await {
                Ok(found) => {
                    println!("Discovery complete. Found {found} devices.");
                    print_device_list(&session.snapshot());
                }
                Err(e) => println!("Error during discovery: {e}"),
            }
        }
        "refresh" => match session.refresh().await {
            Ok(()) => print_device_list(&session.snapshot()),
            Err(e) => println!("Refresh failed: {e}"),
        },
        "list" => print_device_list(&session.snapshot()),
        "on" | "off" => {
            if args.is_empty() {
                println!("Usage: {cmd} <id|name|ip>");
                return true;
            }
            let target = args.join(" ");
            dispatch(session, &target, CommandOp::SetPower(cmd == "on")).await;
        }
        "dim" => {
            if args.len() < 2 {
                println!("Usage: dim <id|name|ip> <level 0-100>");
                return true;
            }
            let Some(level) = args
                .last()
                .and_then(|s| s.parse::<u8>().ok())
                .filter(|l| *l <= 100)
            else {
                println!("Level must be a number between 0 and 100.");
                return true;
            };
            let target = args[..args.len() - 1].join(" ");
            dispatch(session, &target, CommandOp::SetBrightness(level)).await;
        }
        "help" => print_help(),
        _ => println!("Unknown command. Type help for options."),
    }
    true
}

async fn dispatch(session: &Session, target: &str, op: CommandOp) {
    let snapshot = session.snapshot();
    let Some(id) = resolve_target(&snapshot, target) else {
        println!("Device '{target}' not found.");
        return;
    };
    match session.send_command(&id, op).await {
        Ok(ticket) => println!("{}: command accepted", ticket.device),
        Err(e) => println!("{e}"),
    }
}

/// Resolve a list index, IP address, device ID, or alias fragment
fn resolve_target(snapshot: &RegistrySnapshot, target: &str) -> Option<DeviceId> {
    if let Ok(index) = target.parse::<usize>() {
        if index >= 1 {
            if let Some(device) = snapshot.devices.get(index - 1) {
                return Some(device.identity.id.clone());
            }
        }
    }

    for device in snapshot.devices.iter() {
        if device.identity.addr.to_string() == target || device.identity.id.as_str() == target {
            return Some(device.identity.id.clone());
        }
    }

    let needle = target.to_ascii_lowercase();
    snapshot
        .devices
        .iter()
        .find(|d| {
            d.alias
                .as_deref()
                .is_some_and(|a| a.to_ascii_lowercase().contains(&needle))
        })
        .map(|d| d.identity.id.clone())
}

fn print_device_list(snapshot: &RegistrySnapshot) {
    if snapshot.is_empty() {
        println!("No devices found. Try scan");
        return;
    }
    println!("\n--- Device List ---");
    for (index, device) in snapshot.devices.iter().enumerate() {
        let power = device
            .power
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        let mut line = format!(
            "[{}] {:<20} ({}) - {}",
            index + 1,
            device.display_name(),
            device.identity.addr,
            power
        );
        if let Some(level) = device.brightness {
            line.push_str(&format!(" [Bright: {level}%]"));
        }
        if device.status == DeviceStatus::Offline {
            line.push_str(" (offline)");
        }
        if let Some(err) = &device.last_error {
            line.push_str(&format!(" - Error: {err}"));
        }
        println!("{line}");
    }
    println!("-------------------");
}

fn print_help() {
    println!("\nAvailable commands:");
    println!("  scan             - Discover devices");
    println!("  list             - List known devices");
    println!("  refresh          - Re-query every known device now");
    println!("  on <target>      - Turn device ON");
    println!("  off <target>     - Turn device OFF");
    println!("  dim <target> <%> - Set brightness (e.g. dim 1 50)");
    println!("  exit             - Exit");
    println!("  <target> can be the list index, IP address, or name.");
}
