// Drive diagnostic: READ-ONLY check of the three drive controllers
//
// This tool does NOT write any control registers - it's completely safe.
// Use this first before running basic_motion.
//
// Usage: cargo run --example drive_diagnostic -- [config.toml]

use gantry_zenoh_runtime::config::GantryConfig;
use gantry_zenoh_runtime::drive::registers::{FRAME_ADDRESS, FRAME_WORDS};
use gantry_zenoh_runtime::drive::{
    Axis, DriveException, DriveState, ModbusTcpClient, StatusRegisters, Transport,
};
use std::path::Path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let config = match std::env::args().nth(1) {
        Some(path) => GantryConfig::load(Path::new(&path))?,
        None => GantryConfig::default(),
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Gantry Drive Diagnostic (READ-ONLY)               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only READS from drives - no writes, no movement   ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut reachable = 0;
    for axis in Axis::ALL {
        let address = config.drives.address(axis);
        println!("  === Drive {} ({}) ===", axis, address);

        let mut client =
            ModbusTcpClient::with_timeout(address, config.drives.unit_id, config.drives.io_timeout());
        if let Err(e) = client.connect().await {
            println!("    ✗ Connect failed: {}", e);
            println!();
            continue;
        }
        reachable += 1;

        match client.read_registers(FRAME_ADDRESS, FRAME_WORDS as u16).await {
            Ok(words) if words.len() == FRAME_WORDS => {
                let status = StatusRegisters::decode(&[words[0], words[1], words[2], words[3]]);
                println!("    Raw status:     {:04X?}", words);
                println!("    State:          {:?}", DriveState::from_status(&status));
                println!(
                    "    Enabled:        drive={} operation={}",
                    status.drive_enabled, status.operation_enabled
                );
                println!("    Mode:           {:?}", status.operation_mode);
                println!("    Reference set:  {}", status.reference_set);
                println!("    Halted:         {}", status.halt_active);
                println!("    Position:       {}", status.position);
            }
            Ok(words) => println!("    ✗ Short status frame: {:04X?}", words),
            Err(e) => println!("    ✗ Status read failed: {}", e),
        }

        match client.read_exception_status().await {
            Ok(code) => {
                let exception = DriveException::from_code(code);
                println!("    Exception:      0x{:02X} ({})", code, exception.description);
            }
            Err(e) => println!("    Exception:      ERROR - {}", e),
        }

        client.close().await;
        println!();
    }

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!("  {}/3 drives reachable", reachable);
    if reachable == Axis::ALL.len() {
        println!("Next step: Run 'cargo run --example basic_motion -- --hardware'");
    }

    Ok(())
}
