use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use bandstand::agents::ConfiguredBackendFactory;
use bandstand::sessions::{JamRegistry, RoutingScope};
use bandstand::telemetry;

/// Bandstand - turn scheduler for an AI jam band.
///
/// Starts one jam session and drives it from stdin. Session snapshots are
/// written to stdout as JSON lines; logs go to stderr.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file path (overrides the discovery chain)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated band member roles
    #[arg(short, long, default_value = "drums,bass,keys")]
    agents: String,

    /// Genre preset to seed the session with
    #[arg(short, long)]
    preset: Option<String>,

    /// Client id this session belongs to
    #[arg(long, default_value = "console")]
    client: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = bandconf::BandConfig::load_with_override(cli.config.as_deref())
        .context("failed to load configuration")?;
    telemetry::init(&config.telemetry);

    let backends = Arc::new(ConfiguredBackendFactory {
        agent: config.agent.clone(),
        timing: config.timing,
        tuning: config.tuning,
    });
    let registry = Arc::new(JamRegistry::new(&config, backends));

    let roles: Vec<String> = cli
        .agents
        .split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();

    let jam = registry
        .start_jam(&cli.client, roles, cli.preset.as_deref())
        .await
        .context("failed to start the jam")?;
    info!(session.id = %jam.session_id(), "jam running, directives on stdin");

    // snapshot stream -> stdout, one JSON object per line
    let mut snapshots = jam.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(snapshot) = snapshots.recv().await {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "snapshot failed to serialize"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                match line.context("stdin read failed")? {
                    Some(line) => {
                        if !handle_line(&jam, line.trim()).await {
                            break;
                        }
                    }
                    None => break, // EOF
                }
            }
        }
    }

    info!("shutting down");
    registry.stop_all().await;
    printer.abort();
    Ok(())
}

/// One console line. Returns false when the operator asked to quit.
async fn handle_line(jam: &bandstand::scheduler::JamScheduler, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if let Some(rest) = line.strip_prefix('/') {
        let (command, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        match command {
            "quit" | "stop" => return false,
            "preset" => {
                if let Err(e) = jam.set_preset(arg.trim()).await {
                    eprintln!("preset: {e}");
                }
            }
            "mute" | "unmute" => {
                if let Err(e) = jam.set_muted(arg.trim(), command == "mute").await {
                    eprintln!("{command}: {e}");
                }
            }
            "status" => match jam.snapshot().await {
                Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("status: {e}"),
                },
                Err(e) => eprintln!("status: {e}"),
            },
            _ => eprintln!("unknown command: /{command}"),
        }
        return true;
    }

    // "@drums half time" addresses one agent; bare text goes to every agent
    // already brought in by a targeted directive
    let (target, text) = match line.strip_prefix('@') {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((role, text)) => (Some(role), text.trim()),
            None => (Some(rest), ""),
        },
        None => (None, line),
    };

    if let Err(e) = jam.directive(text, target, RoutingScope::Broadcast).await {
        eprintln!("directive: {e}");
    }
    true
}
