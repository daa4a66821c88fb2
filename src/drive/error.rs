// Error taxonomy for the drive layer

use std::time::Duration;

use super::Axis;
use super::axis::DriveState;
use super::modbus::TransportError;

/// Errors raised by a single axis driver
#[derive(Debug, thiserror::Error)]
pub enum AxisError {
    #[error("Drive {axis}: transport failure: {source}")]
    Transport {
        axis: Axis,
        #[source]
        source: TransportError,
    },

    #[error("Drive {axis}: link lost: {reason}")]
    LinkLost { axis: Axis, reason: String },

    #[error("Drive {axis}: {action} aborted, drive reports a fault")]
    ActionFault { axis: Axis, action: &'static str },

    #[error("Drive {axis}: {action} did not complete within {after:?}")]
    Timeout {
        axis: Axis,
        action: &'static str,
        after: Duration,
    },

    #[error("Drive {axis}: {action} was not acknowledged by the controller")]
    NotStarted { axis: Axis, action: &'static str },

    #[error("Drive {axis}: not ready for motion ({state:?})")]
    NotReady { axis: Axis, state: DriveState },

    #[error("Drive {axis}: another motion is already in progress")]
    Busy { axis: Axis },

    #[error("Drive {axis}: fault latched, reset the drive first")]
    FaultLatched { axis: Axis },

    #[error("Drive {axis}: terminated")]
    Terminated { axis: Axis },
}

impl AxisError {
    pub fn axis(&self) -> Axis {
        match self {
            AxisError::Transport { axis, .. }
            | AxisError::LinkLost { axis, .. }
            | AxisError::ActionFault { axis, .. }
            | AxisError::Timeout { axis, .. }
            | AxisError::NotStarted { axis, .. }
            | AxisError::NotReady { axis, .. }
            | AxisError::Busy { axis }
            | AxisError::FaultLatched { axis }
            | AxisError::Terminated { axis } => *axis,
        }
    }

    /// Hardware or link fault, as opposed to a rejected request
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            AxisError::Transport { .. }
                | AxisError::LinkLost { .. }
                | AxisError::ActionFault { .. }
                | AxisError::Timeout { .. }
                | AxisError::NotStarted { .. }
        )
    }
}

/// Errors raised by the multi-axis coordinator
#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error(transparent)]
    Axis(#[from] AxisError),

    #[error("Target {axis}={target}um outside bounds [{min}, {max}]")]
    OutOfBounds {
        axis: Axis,
        target: i32,
        min: i32,
        max: i32,
    },
}
