//! gateway-monitor entrypoint: one command per invocation, results as JSON on
//! stdout, diagnostics on stderr. `watch` polls until Ctrl+C.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use gateway_monitor::collectors::{NetworkConnection, NetworkUsageSample, ProcessRecord};
use gateway_monitor::logging::emit_json;
use gateway_monitor::{Monitor, MonitorConfig, StructuredLogger};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Privilege-aware host telemetry and security posture collector
#[derive(Parser)]
#[command(name = "gateway-monitor", version)]
struct Cli {
    /// JSON configuration file; defaults apply when missing
    #[arg(long, env = "GATEWAY_MONITOR_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process snapshot
    Processes,
    /// Socket table, process-attributed when elevated
    Connections,
    /// Per-process bandwidth (requires elevation)
    Usage,
    /// Sockets held by one process
    ConnectionsFor { pid: u32 },
    /// Open files of one process
    FilesFor { pid: u32 },
    /// Request admin privileges (prompts at most once)
    Elevate,
    /// Extend the sudo credential cache lifetime
    ExtendWindow,
    /// Security posture scan
    Scan {
        #[arg(long)]
        detailed: bool,
    },
    /// Host summary
    Host,
    Interfaces,
    Routes,
    Arp,
    Dns,
    /// Poll processes, connections and usage until Ctrl+C
    Watch,
}

#[derive(Serialize)]
struct StateReport {
    privilege: gateway_monitor::PrivilegeState,
}

#[derive(Serialize)]
struct WatchSample {
    timestamp: DateTime<Utc>,
    cycle: u64,
    processes: Vec<ProcessRecord>,
    connections: Vec<NetworkConnection>,
    usage: Vec<NetworkUsageSample>,
}

static STOP: AtomicBool = AtomicBool::new(false);

fn print_json(value: &impl Serialize) -> Result<(), BoxError> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn watch(monitor: &Monitor, interval: Duration) -> Result<(), BoxError> {
    if let Err(e) = ctrlc::set_handler(|| STOP.store(true, Ordering::Relaxed)) {
        warn!(error = %e, "could not install Ctrl+C handler");
    }
    info!(interval_secs = interval.as_secs(), "watch mode (Ctrl+C to stop)");
    let mut cycle: u64 = 0;
    while !STOP.load(Ordering::Relaxed) {
        cycle += 1;
        let (processes, connections, usage) = tokio::join!(
            monitor.list_processes(),
            monitor.list_network_connections(),
            monitor.get_process_network_usage(),
        );
        let processes = processes.unwrap_or_else(|e| {
            warn!(cycle, error = %e, "process snapshot failed");
            Vec::new()
        });
        let connections = connections.unwrap_or_else(|e| {
            warn!(cycle, error = %e, "connection snapshot failed");
            Vec::new()
        });
        let sample = WatchSample {
            timestamp: Utc::now(),
            cycle,
            processes,
            connections,
            usage,
        };
        emit_json(&sample, &mut std::io::stdout().lock())?;

        for _ in 0..interval.as_secs().max(1) {
            if STOP.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    info!(cycles = cycle, "watch stopped");
    Ok(())
}

async fn run(monitor: &Monitor, command: Command, config: &MonitorConfig) -> Result<(), BoxError> {
    match command {
        Command::Processes => print_json(&monitor.list_processes().await?),
        Command::Connections => print_json(&monitor.list_network_connections().await?),
        Command::Usage => {
            monitor.request_elevation().await;
            print_json(&monitor.get_process_network_usage().await)
        }
        Command::ConnectionsFor { pid } => print_json(&monitor.get_connections_for_pid(pid).await),
        Command::FilesFor { pid } => print_json(&monitor.get_file_descriptors_for_pid(pid).await),
        Command::Elevate => print_json(&StateReport {
            privilege: monitor.request_elevation().await,
        }),
        Command::ExtendWindow => {
            monitor.request_elevation().await;
            monitor.extend_elevation_window().await?;
            print_json(&StateReport {
                privilege: monitor.privilege_state(),
            })
        }
        Command::Scan { detailed: false } => print_json(&monitor.run_basic_scan().await),
        Command::Scan { detailed: true } => print_json(&monitor.run_detailed_scan().await),
        Command::Host => print_json(&monitor.host_info()),
        Command::Interfaces => print_json(&monitor.interfaces().await?),
        Command::Routes => print_json(&monitor.routing_table().await?),
        Command::Arp => print_json(&monitor.arp_table().await?),
        Command::Dns => print_json(&monitor.dns_configuration().await?),
        Command::Watch => watch(monitor, config.collection.poll_interval()).await,
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = MonitorConfig::load(&cli.config);

    StructuredLogger::init(config.log.json, &config.log.level);
    info!(config = %cli.config.display(), "gateway monitor starting");

    let monitor = Monitor::start(&config).await;
    let result = run(&monitor, cli.command, &config).await;
    monitor.shutdown().await;
    result
}
