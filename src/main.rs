use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use gantry_zenoh_runtime::config::GantryConfig;
use gantry_zenoh_runtime::drive::sim::{DEFAULT_TRAVEL_POLLS, simulated_rig};
use gantry_zenoh_runtime::drive::{
    Axis, DriveTiming, ModbusTcpClient, MotionCoordinator, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "gantry-runtime")]
#[command(version)]
#[command(about = "Three-axis gantry runtime for CMMO-ST drives over Modbus/TCP")]
struct Args {
    /// Path to configuration file (gantry.toml); built-in defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run against simulated drive controllers
    #[arg(short = 's', long)]
    simulate: bool,

    /// Initialize and home all drives before accepting commands
    #[arg(long)]
    auto_home: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    if let Err(e) = run(args).await {
        error!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            GantryConfig::load(path)?
        }
        None => GantryConfig::default(),
    };
    let timing = DriveTiming::from(config.timing);

    let transports: [Box<dyn Transport>; 3] = if args.simulate {
        info!("Simulation mode: using simulated drive controllers");
        let (transports, _, _) = simulated_rig(DEFAULT_TRAVEL_POLLS);
        transports
    } else {
        let io_timeout = config.drives.io_timeout();
        Axis::ALL.map(|axis| {
            Box::new(ModbusTcpClient::with_timeout(
                config.drives.address(axis),
                config.drives.unit_id,
                io_timeout,
            )) as Box<dyn Transport>
        })
    };

    let coordinator =
        Arc::new(MotionCoordinator::connect(transports, timing, config.motion).await?);

    if args.auto_home {
        info!("Auto-home: initializing and homing all drives");
        coordinator.init_drives().await?;
        coordinator.home_all().await?;
    }

    gantry_zenoh_runtime::runtime::run(coordinator).await
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // RUST_LOG wins when set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
