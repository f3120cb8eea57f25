//! df-local-controller entry point.
//!
//! Runs the controller against an in-memory switch; the OpenFlow codec is
//! provided by the deployment and plugs in through `SwitchChannel`.

use clap::Parser;
use dflow_controller::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use dflow_controller::secgroup::{ConntrackHelper, NullConntrack, ShellConntrack};
use dflow_controller::{Controller, ControllerDaemon, DaemonHandle, IntentEvent};
use dflow_ofproto::MemorySwitch;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// dflow per-host local controller
#[derive(Parser, Debug)]
#[command(name = "df-local-controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Chassis name of this host (overrides the file)
    #[arg(long)]
    chassis: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Grace period before stale flows are swept (overrides the file)
    #[arg(long)]
    settle_delay_ms: Option<u64>,

    /// JSON array of intents to load at start-up
    #[arg(long)]
    intents: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<ControllerConfig, String> {
    let mut config = ControllerConfig::load_or_default(&args.config).map_err(|e| e.to_string())?;
    if let Some(chassis) = &args.chassis {
        config.chassis = chassis.clone();
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(delay) = args.settle_delay_ms {
        config.aging.settle_delay_ms = delay;
    }
    Ok(config)
}

fn load_intents(path: &Path) -> Result<Vec<IntentEvent>, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

async fn feed_intents(handle: &DaemonHandle, intents: Vec<IntentEvent>) {
    let count = intents.len();
    for intent in intents {
        if let Err(e) = handle.submit(intent).await {
            error!("Failed to submit intent: {}", e);
            return;
        }
    }
    info!("Loaded {} intents", count);
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("df-local-controller: {}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log.level.as_str()),
    )
    .init();

    info!("====================================================================");
    info!("Starting dflow local controller");
    info!("====================================================================");
    info!("Chassis: {}", config.chassis);
    info!("Batch size: {}", config.daemon.batch_size);
    info!("Queue depth: {}", config.daemon.queue_depth);
    if config.aging.enabled {
        info!("Flow aging: ENABLED (settle delay {}ms)", config.aging.settle_delay_ms);
    } else {
        info!("Flow aging: DISABLED");
    }

    let conntrack: Box<dyn ConntrackHelper> = if config.conntrack.enabled {
        info!("Conntrack flush: {}", config.conntrack.command);
        Box::new(ShellConntrack::new(config.conntrack.command.clone()))
    } else {
        info!("Conntrack flush: DISABLED");
        Box::new(NullConntrack)
    };

    let intents = match args.intents.as_deref().map(load_intents).transpose() {
        Ok(intents) => intents.unwrap_or_default(),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let switch = MemorySwitch::new();
    let controller = match Controller::new(config, Box::new(switch.clone()), conntrack) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to start controller: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (daemon, handle) = ControllerDaemon::new(controller);
    let worker = tokio::spawn(daemon.run());

    // Simulation mode: the in-memory switch is connected from the start.
    if let Err(e) = handle.session_established().await {
        error!("Failed to establish session: {}", e);
        return ExitCode::FAILURE;
    }
    feed_intents(&handle, intents).await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Received SIGINT, shutting down gracefully..."),
        Err(err) => error!("Failed to listen for ctrl-c: {}", err),
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Worker already stopped: {}", e);
    }
    let controller = match worker.await {
        Ok(controller) => controller,
        Err(e) => {
            error!("Worker task failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let status = controller.status();
    info!(
        "Final state: {} ports, {} flows on switch, {} dispatch events",
        status.ports,
        switch.flow_count(),
        status.dispatch.events
    );
    info!("====================================================================");
    info!("dflow local controller shutdown complete");
    info!("====================================================================");

    ExitCode::SUCCESS
}
