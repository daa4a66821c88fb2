// Drive control for the three-axis gantry
//
// Provides:
// - FHPP register frame encoding/decoding for the CMMO-ST controllers
// - Modbus/TCP transport (and an in-process simulated controller)
// - Per-axis driver with a background register poll loop
// - Multi-axis coordinator with bounds checking and fail-safe shutdown

pub mod axis;
pub mod coordinator;
mod error;
pub mod modbus;
pub mod registers;
pub mod sim;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use axis::{AxisDriver, AxisPhase, DriveException, DriveState, DriveTiming, Telemetry};
pub use coordinator::{CalibrationOffset, MotionBounds, MotionConfig, MotionCoordinator, Position};
pub use error::{AxisError, MotionError};
pub use modbus::{ModbusTcpClient, Transport, TransportError};
pub use registers::{ControlRegisters, StatusRegisters};

/// One linear axis of the gantry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}
