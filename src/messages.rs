// Message types carried on the command/telemetry bus

use serde::{Deserialize, Serialize};

use crate::drive::{Axis, AxisPhase, DriveState, MotionCoordinator, Position};

/// Command from operator tools/scripts -> runtime
///
/// Coordinates are micrometer offsets from the calibration point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GantryCommand {
    InitDrives,
    Home {
        axis: Axis,
    },
    HomeAll,
    Move {
        x: i32,
        y: i32,
        z: i32,
    },
    MoveDirect {
        x: i32,
        y: i32,
        z: i32,
    },
    /// Halt one axis, or all when `axis` is omitted
    Stop {
        #[serde(default)]
        axis: Option<Axis>,
    },
    Resume {
        #[serde(default)]
        axis: Option<Axis>,
    },
    ResetDrive {
        axis: Axis,
    },
    SetCalibrationOffset {
        x: i32,
        y: i32,
    },
    Terminate,
}

impl GantryCommand {
    /// Commands that run on the motion executor, one at a time
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            GantryCommand::InitDrives
                | GantryCommand::Home { .. }
                | GantryCommand::HomeAll
                | GantryCommand::Move { .. }
                | GantryCommand::MoveDirect { .. }
                | GantryCommand::ResetDrive { .. }
        )
    }
}

/// Per-axis telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisReport {
    pub axis: Axis,
    pub state: DriveState,
    pub phase: AxisPhase,
    pub exception_code: u8,
    pub exception: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_error: Option<String>,
}

/// Telemetry published by runtime every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GantryState {
    pub axes: Vec<AxisReport>,
    /// Calibrated position in micrometers
    pub position_um: Position<i32>,
}

impl From<&MotionCoordinator> for GantryState {
    fn from(coordinator: &MotionCoordinator) -> Self {
        let axes = Axis::ALL
            .iter()
            .map(|&axis| {
                let drive = coordinator.drive(axis);
                let exception = drive.exception();
                AxisReport {
                    axis,
                    state: drive.drive_state(),
                    phase: drive.phase(),
                    exception_code: exception.code,
                    exception: exception.description.to_string(),
                    link_error: drive.link_error(),
                }
            })
            .collect();

        Self {
            axes,
            position_um: coordinator.position_raw(),
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    Busy,
    Faulted,
    Terminated,
}
