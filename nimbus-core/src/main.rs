mod setup;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nimbus_core::config;
use nimbus_core::{Nimbus, NimbusConfig};
use tracing::{error, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "nimbusd", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check host prerequisites (architecture, networking tools, /dev/kvm)
    Setup,
    /// Write a populated nimbus.yaml template
    GenerateConfig {
        #[arg(long, default_value = "nimbus.yaml")]
        output: PathBuf,
    },
    /// Run the long-lived scheduler daemon
    Serve {
        #[arg(long, default_value = "nimbus.yaml")]
        config: PathBuf,
    },
    /// Build a snapshot for a function spec read from a JSON file
    BuildSnapshot {
        #[arg(long, default_value = "nimbus.yaml")]
        config: PathBuf,
        /// Path to a JSON-encoded `Function` spec
        #[arg(long)]
        function: PathBuf,
    },
    /// Print aggregate per-runtime and snapshot statistics
    Stats {
        #[arg(long, default_value = "nimbus.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::GenerateConfig { output } => run_generate_config(&output).await,
        Command::Setup => setup::run().map_err(|e| e.to_string()),
        Command::Serve { config } => run_serve(&config).await,
        Command::BuildSnapshot { config, function } => run_build_snapshot(&config, &function).await,
        Command::Stats { config } => run_stats(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_generate_config(output: &Path) -> Result<(), String> {
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let template = config::default_template(dir);
    config::generate(output, &template)
        .await
        .map_err(|e| e.to_string())?;
    info!(path = %output.display(), "wrote config template");
    Ok(())
}

async fn run_serve(config_path: &Path) -> Result<(), String> {
    let cfg = load_config(config_path).await?;
    let nimbus = Nimbus::new(&cfg).map_err(|e| e.to_string())?;

    info!("nimbusd started, running background sweepers");

    let (mode_tx, mut mode_rx) = tokio::sync::watch::channel(RunnerMode::Running);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, shutting down");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, shutting down");
            }
        }
        let _ = mode_tx.send(RunnerMode::Stopping);
    });

    loop {
        if *mode_rx.borrow() == RunnerMode::Stopping {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                nimbus.sweep().await;
            }
            _ = mode_rx.changed() => {}
        }
    }

    info!("draining and shutting down");
    nimbus.shutdown().await;
    info!("nimbusd stopped");
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunnerMode {
    Running,
    Stopping,
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_build_snapshot(config_path: &Path, function_path: &Path) -> Result<(), String> {
    let cfg = load_config(config_path).await?;
    let nimbus = Nimbus::new(&cfg).map_err(|e| e.to_string())?;

    let raw = tokio::fs::read_to_string(function_path)
        .await
        .map_err(|e| format!("read {}: {e}", function_path.display()))?;
    let function: nimbus_snapshot::Function =
        serde_json::from_str(&raw).map_err(|e| format!("parse function spec: {e}"))?;

    let (mem_bytes, state_bytes) = nimbus
        .build_snapshot(&function)
        .await
        .map_err(|e| e.to_string())?;
    info!(mem_bytes, state_bytes, "snapshot built");
    Ok(())
}

async fn run_stats(config_path: &Path) -> Result<(), String> {
    let cfg = load_config(config_path).await?;
    let nimbus = Nimbus::new(&cfg).map_err(|e| e.to_string())?;
    let stats = nimbus.stats().await;
    println!("{:#?}", stats);
    Ok(())
}

async fn load_config(path: &Path) -> Result<NimbusConfig, String> {
    config::load(path).await.map_err(|e| e.to_string())
}
