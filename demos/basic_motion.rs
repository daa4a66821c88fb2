// Basic motion: init, home and a short coordinated move
//
// Runs against simulated controllers unless --hardware is passed.
//
// Usage: cargo run --example basic_motion -- [--hardware]
//
// Safety features:
// - Explicit confirmation before touching real drives
// - Targets are checked against the configured bounds
// - Ctrl+C terminates all drives (halt + brake)

use gantry_zenoh_runtime::config::GantryConfig;
use gantry_zenoh_runtime::drive::sim::simulated_rig;
use gantry_zenoh_runtime::drive::{
    Axis, DriveTiming, ModbusTcpClient, MotionCoordinator, Transport,
};
use std::io::{self, Write};
use tracing::info;

const TARGETS: [(i32, i32, i32); 3] = [(50_000, 0, 0), (50_000, 50_000, 10_000), (0, 0, 0)];

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let hardware = std::env::args().any(|arg| arg == "--hardware");
    let config = GantryConfig::default();

    let transports: [Box<dyn Transport>; 3] = if hardware {
        println!("⚠  This WILL move the gantry. Clear the work area first.");
        if !confirm("Continue with real drives?")? {
            println!("Aborted.");
            return Ok(());
        }
        Axis::ALL.map(|axis| {
            Box::new(ModbusTcpClient::with_timeout(
                config.drives.address(axis),
                config.drives.unit_id,
                config.drives.io_timeout(),
            )) as Box<dyn Transport>
        })
    } else {
        info!("Using simulated drives (pass --hardware for real ones)");
        let (transports, _, _) = simulated_rig(10);
        transports
    };

    let coordinator = MotionCoordinator::connect(
        transports,
        DriveTiming::from(config.timing),
        config.motion,
    )
    .await?;

    let result = tokio::select! {
        result = sequence(&coordinator) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    coordinator.terminate().await;
    result
}

async fn sequence(
    coordinator: &MotionCoordinator,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Step 1: Initializing drives...");
    coordinator.init_drives().await?;

    info!("Step 2: Homing (Z first)...");
    coordinator.home_all().await?;

    for (i, &(x, y, z)) in TARGETS.iter().enumerate() {
        info!("Step {}: Moving to ({}, {}, {}) um", i + 3, x, y, z);
        coordinator.move_to(x, y, z).await?;
        let pos = coordinator.position();
        info!("  Position: x={:.3} y={:.3} z={:.3} mm", pos.x, pos.y, pos.z);
    }

    info!("Motion test complete");
    Ok(())
}
