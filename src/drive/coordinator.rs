// Three-axis motion coordinator
//
// Applies the calibration offset and bounds to horizontal targets and
// sequences moves so the end-effector never travels horizontally below the
// cruise height. Any fault during a coordinated action shuts every axis down.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

use super::Axis;
use super::axis::{AxisDriver, AxisPhase, DriveException, DriveState, DriveTiming};
use super::error::{AxisError, MotionError};
use super::modbus::Transport;

/// Offset of the calibration point from the drive origin (micrometers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationOffset {
    pub x: i32,
    pub y: i32,
}

/// Allowed X/Y targets, relative to the calibration point (inclusive, micrometers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionBounds {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

impl Default for MotionBounds {
    fn default() -> Self {
        Self {
            x_min: 0,
            x_max: 470_000,
            y_min: -90_000,
            y_max: 200_000,
        }
    }
}

impl MotionBounds {
    pub fn check(&self, x: i32, y: i32) -> Result<(), MotionError> {
        if x < self.x_min || x > self.x_max {
            return Err(MotionError::OutOfBounds {
                axis: Axis::X,
                target: x,
                min: self.x_min,
                max: self.x_max,
            });
        }
        if y < self.y_min || y > self.y_max {
            return Err(MotionError::OutOfBounds {
                axis: Axis::Y,
                target: y,
                min: self.y_min,
                max: self.y_max,
            });
        }
        Ok(())
    }
}

/// Motion parameters for the rig
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Z height used for horizontal transit (micrometers)
    pub cruise_height_um: i32,
    pub calibration_offset: CalibrationOffset,
    pub bounds: MotionBounds,
    /// Encoder scale
    pub um_per_tick: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            cruise_height_um: 20_000,
            calibration_offset: CalibrationOffset { x: 0, y: 90_000 },
            bounds: MotionBounds::default(),
            um_per_tick: 1.0,
        }
    }
}

/// Position of the three axes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

/// Owns the X, Y and Z drives
pub struct MotionCoordinator {
    x: AxisDriver,
    y: AxisDriver,
    z: AxisDriver,
    cruise_height: i32,
    bounds: MotionBounds,
    um_per_tick: f64,
    offset: Mutex<CalibrationOffset>,
}

impl MotionCoordinator {
    pub fn new(x: AxisDriver, y: AxisDriver, z: AxisDriver, config: MotionConfig) -> Self {
        Self {
            x,
            y,
            z,
            cruise_height: config.cruise_height_um,
            bounds: config.bounds,
            um_per_tick: config.um_per_tick,
            offset: Mutex::new(config.calibration_offset),
        }
    }

    /// Connect all three drives concurrently; `transports` is ordered X, Y, Z
    pub async fn connect(
        transports: [Box<dyn Transport>; 3],
        timing: DriveTiming,
        config: MotionConfig,
    ) -> Result<Self, AxisError> {
        info!("Spawning drive controllers...");
        let [tx, ty, tz] = transports;
        let (x, y, z) = tokio::try_join!(
            AxisDriver::connect(Axis::X, tx, timing),
            AxisDriver::connect(Axis::Y, ty, timing),
            AxisDriver::connect(Axis::Z, tz, timing),
        )?;
        Ok(Self::new(x, y, z, config))
    }

    pub fn drive(&self, axis: Axis) -> &AxisDriver {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    fn drives(&self) -> [&AxisDriver; 3] {
        [&self.x, &self.y, &self.z]
    }

    /// Initialize all drives for direct positioning
    pub async fn init_drives(&self) -> Result<(), MotionError> {
        let result = tokio::try_join!(
            self.x.initialize(),
            self.y.initialize(),
            self.z.initialize(),
        );
        if let Err(e) = result {
            return Err(self.shut_down_after(e).await);
        }
        info!("All drives initialized");
        Ok(())
    }

    /// Home a single drive
    ///
    /// Homing Z first keeps the head clear of obstacles while X and Y home.
    pub async fn home(&self, axis: Axis) -> Result<(), MotionError> {
        match self.drive(axis).home().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fault() => Err(self.shut_down_after(e).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Home Z, then X, then Y
    pub async fn home_all(&self) -> Result<(), MotionError> {
        for axis in [Axis::Z, Axis::X, Axis::Y] {
            self.home(axis).await?;
        }
        info!("Homing complete");
        Ok(())
    }

    /// Move to (x, y, z) via the cruise height
    ///
    /// Coordinates are micrometer offsets from the calibration point.
    pub async fn move_to(&self, x: i32, y: i32, z: i32) -> Result<(), MotionError> {
        self.coordinated_move(x, y, z, true).await
    }

    /// Move to (x, y, z) without raising Z first
    pub async fn move_direct(&self, x: i32, y: i32, z: i32) -> Result<(), MotionError> {
        self.coordinated_move(x, y, z, false).await
    }

    async fn coordinated_move(
        &self,
        x: i32,
        y: i32,
        z: i32,
        via_cruise: bool,
    ) -> Result<(), MotionError> {
        if let Err(e) = self.bounds.check(x, y) {
            error!("{}, shutting down", e);
            self.terminate().await;
            return Err(e);
        }

        let offset = self.calibration_offset();
        let (target_x, target_y) = (x.saturating_add(offset.x), y.saturating_add(offset.y));
        info!("Setting target position to ({}, {}, {}) um", x, y, z);

        let sequence = async {
            if via_cruise {
                self.z.move_to(self.cruise_height).await?;
                info!("Drive Z raised to cruise height");
            }

            tokio::try_join!(self.x.move_to(target_x), self.y.move_to(target_y))?;
            info!("XY motion complete");

            self.z.move_to(z).await?;
            info!("Z motion complete");
            Ok::<_, AxisError>(())
        };

        match sequence.await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.shut_down_after(e).await),
        }
    }

    /// Halt every drive
    pub async fn stop(&self) {
        tokio::join!(self.x.stop(), self.y.stop(), self.z.stop());
    }

    /// Release halt on every drive
    pub async fn resume(&self) -> Result<(), MotionError> {
        tokio::try_join!(self.x.resume(), self.y.resume(), self.z.resume())?;
        Ok(())
    }

    pub async fn stop_axis(&self, axis: Axis) {
        self.drive(axis).stop().await;
    }

    pub async fn resume_axis(&self, axis: Axis) -> Result<(), MotionError> {
        Ok(self.drive(axis).resume().await?)
    }

    /// Clear a latched fault on one drive
    pub async fn reset_drive(&self, axis: Axis) -> Result<(), MotionError> {
        Ok(self.drive(axis).reset().await?)
    }

    pub fn set_calibration_offset(&self, x: i32, y: i32) {
        info!("Calibration offset set to ({}, {}) um", x, y);
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset = CalibrationOffset { x, y };
    }

    pub fn calibration_offset(&self) -> CalibrationOffset {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticks_to_um(&self, ticks: i32) -> i32 {
        (ticks as f64 * self.um_per_tick).round() as i32
    }

    /// Position relative to the calibration point in micrometers
    pub fn position_raw(&self) -> Position<i32> {
        let offset = self.calibration_offset();
        Position {
            x: self.ticks_to_um(self.x.position_ticks()).saturating_sub(offset.x),
            y: self.ticks_to_um(self.y.position_ticks()).saturating_sub(offset.y),
            z: self.ticks_to_um(self.z.position_ticks()),
        }
    }

    /// Position relative to the calibration point in millimeters
    pub fn position(&self) -> Position<f64> {
        let raw = self.position_raw();
        Position {
            x: raw.x as f64 / 1000.0,
            y: raw.y as f64 / 1000.0,
            z: raw.z as f64 / 1000.0,
        }
    }

    pub fn drive_state(&self, axis: Axis) -> DriveState {
        self.drive(axis).drive_state()
    }

    pub fn drive_exception(&self, axis: Axis) -> DriveException {
        self.drive(axis).exception()
    }

    pub fn axis_phase(&self, axis: Axis) -> AxisPhase {
        self.drive(axis).phase()
    }

    /// First drive whose poll worker died on a transport failure
    pub fn check_links(&self) -> Result<(), AxisError> {
        for drive in self.drives() {
            if let Some(reason) = drive.link_error() {
                return Err(AxisError::LinkLost {
                    axis: drive.axis(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// True once every drive has terminated
    pub fn is_terminated(&self) -> bool {
        self.drives()
            .iter()
            .all(|drive| drive.phase() == AxisPhase::Terminated)
    }

    /// Terminate all drives and wait for every one to finish
    pub async fn terminate(&self) {
        tokio::join!(self.x.terminate(), self.y.terminate(), self.z.terminate());
        info!("All drives terminated");
    }

    async fn shut_down_after(&self, e: AxisError) -> MotionError {
        warn!("{}; terminating all drives", e);
        self.terminate().await;
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::sim::{MotionLog, SimHandle, simulated_rig};
    use crate::messages::GantryState;
    use std::time::Duration;

    fn timing() -> DriveTiming {
        DriveTiming {
            motion_timeout: Duration::from_secs(30),
            ..DriveTiming::default()
        }
    }

    async fn rig(config: MotionConfig) -> (MotionCoordinator, [SimHandle; 3], MotionLog) {
        let (transports, handles, log) = simulated_rig(3);
        let coordinator = MotionCoordinator::connect(transports, timing(), config)
            .await
            .unwrap();
        (coordinator, handles, log)
    }

    async fn homed_rig(config: MotionConfig) -> (MotionCoordinator, [SimHandle; 3], MotionLog) {
        let (coordinator, handles, log) = rig(config).await;
        coordinator.init_drives().await.unwrap();
        coordinator.home_all().await.unwrap();
        (coordinator, handles, log)
    }

    fn entries(log: &MotionLog) -> Vec<(Axis, i32)> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_bounds_check() {
        let bounds = MotionBounds::default();
        assert!(bounds.check(0, 0).is_ok());
        assert!(bounds.check(470_000, 200_000).is_ok());
        assert!(bounds.check(450_000, -90_000).is_ok());
        assert!(matches!(
            bounds.check(-1, 0),
            Err(MotionError::OutOfBounds { axis: Axis::X, .. })
        ));
        assert!(matches!(
            bounds.check(0, 200_001),
            Err(MotionError::OutOfBounds { axis: Axis::Y, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_drives_joins_all_axes() {
        let (coordinator, handles, _) = rig(MotionConfig::default()).await;
        coordinator.init_drives().await.unwrap();

        for axis in Axis::ALL {
            assert_eq!(coordinator.axis_phase(axis), AxisPhase::ReadyIdle);
            assert_eq!(coordinator.drive_state(axis), DriveState::NoHome);
        }
        for handle in &handles {
            assert!(handle.control().drive_enabled);
            assert!(!handle.control().halt_active);
        }
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_sequence_via_cruise_height() {
        let (coordinator, _, log) = homed_rig(MotionConfig::default()).await;

        coordinator.move_to(150_000, 0, 0).await.unwrap();

        let log = entries(&log);
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], (Axis::Z, 20_000));
        let mut xy = vec![log[1], log[2]];
        xy.sort_by_key(|(axis, _)| *axis as u8);
        assert_eq!(xy, vec![(Axis::X, 150_000), (Axis::Y, 90_000)]);
        assert_eq!(log[3], (Axis::Z, 0));

        assert_eq!(coordinator.position_raw(), Position { x: 150_000, y: 0, z: 0 });
        assert_eq!(coordinator.position(), Position { x: 150.0, y: 0.0, z: 0.0 });
        for axis in Axis::ALL {
            assert_eq!(coordinator.drive_state(axis), DriveState::Ready);
        }
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_direct_skips_cruise() {
        let (coordinator, _, log) = homed_rig(MotionConfig::default()).await;

        coordinator.move_direct(10_000, 20_000, 5_000).await.unwrap();

        let log = entries(&log);
        assert_eq!(log.len(), 3);
        assert!(log[..2].contains(&(Axis::X, 10_000)));
        assert!(log[..2].contains(&(Axis::Y, 110_000)));
        assert_eq!(log[2], (Axis::Z, 5_000));
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_bounds_terminates_without_motion() {
        let (coordinator, handles, log) = homed_rig(MotionConfig::default()).await;

        let err = coordinator.move_to(600_000, 0, 0).await.unwrap_err();
        assert!(matches!(err, MotionError::OutOfBounds { axis: Axis::X, .. }));

        assert!(entries(&log).is_empty());
        assert!(coordinator.is_terminated());
        for handle in &handles {
            let control = handle.control();
            assert!(!control.drive_enabled && control.halt_active && control.brake_active);
            assert!(!handle.is_connected());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_axis_fault_shuts_everything_down() {
        let (coordinator, handles, log) = homed_rig(MotionConfig::default()).await;
        handles[1].fault_on_setpoint(90_000);

        let err = coordinator.move_to(150_000, 0, 0).await.unwrap_err();
        assert!(matches!(
            err,
            MotionError::Axis(AxisError::ActionFault { axis: Axis::Y, .. })
        ));

        assert!(coordinator.is_terminated());
        // Z never went to its final target
        assert!(!entries(&log).contains(&(Axis::Z, 0)));

        let err = coordinator.move_to(0, 0, 0).await.unwrap_err();
        assert!(matches!(err, MotionError::Axis(AxisError::Terminated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_offset_update() {
        let (coordinator, _, log) = homed_rig(MotionConfig::default()).await;

        coordinator.set_calibration_offset(1_000, 2_000);
        assert_eq!(coordinator.calibration_offset(), CalibrationOffset { x: 1_000, y: 2_000 });
        coordinator.move_direct(0, 0, 0).await.unwrap();

        let log = entries(&log);
        assert!(log.contains(&(Axis::X, 1_000)));
        assert!(log.contains(&(Axis::Y, 2_000)));
        assert_eq!(coordinator.position_raw(), Position { x: 0, y: 0, z: 0 });
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_scaling() {
        let config = MotionConfig {
            calibration_offset: CalibrationOffset { x: 100, y: 200 },
            um_per_tick: 2.0,
            ..MotionConfig::default()
        };
        let (coordinator, handles, _) = rig(config).await;
        handles[0].set_position(1_000);
        handles[1].set_position(-50);
        handles[2].set_position(7);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(coordinator.position_raw(), Position { x: 1_900, y: -300, z: 14 });
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_saturates_at_encoder_extremes() {
        let (coordinator, handles, _) = rig(MotionConfig::default()).await;
        handles[0].set_position(i32::MAX);
        handles[1].set_position(i32::MIN);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let raw = coordinator.position_raw();
        assert_eq!(raw.y, i32::MIN);
        assert_eq!(raw.x, i32::MAX);
        assert!(coordinator.position().y < -2_000_000.0);
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_and_fault_reported() {
        let (coordinator, handles, _) = homed_rig(MotionConfig::default()).await;
        handles[1].set_warning(true);
        handles[2].inject_fault();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(coordinator.drive_state(Axis::X), DriveState::Ready);
        assert_eq!(coordinator.drive_state(Axis::Y), DriveState::Warn);
        assert_eq!(coordinator.drive_state(Axis::Z), DriveState::Error);
        assert_eq!(coordinator.drive_exception(Axis::Z).description, "Software error");
        assert_eq!(coordinator.drive_exception(Axis::Y).code, 0);

        let state = GantryState::from(&coordinator);
        assert_eq!(state.axes[1].state, DriveState::Warn);
        assert_eq!(state.axes[2].state, DriveState::Error);
        assert_eq!(state.axes[2].exception, "Software error");

        let telemetry = coordinator.drive(Axis::Y).telemetry();
        assert!(telemetry.status.warning_present);
        assert!(telemetry.polls > 0);
        assert!(telemetry.link_error.is_none());
        coordinator.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_while_stopped_is_refused() {
        let (coordinator, handles, log) = homed_rig(MotionConfig::default()).await;
        coordinator.stop().await;

        let err = coordinator.move_to(10_000, 0, 0).await.unwrap_err();
        assert!(matches!(
            err,
            MotionError::Axis(AxisError::NotReady {
                axis: Axis::Z,
                state: DriveState::Halt
            })
        ));
        assert!(entries(&log).is_empty());
        assert!(coordinator.is_terminated());
        assert_eq!(handles[0].status().position, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_aborts_siblings() {
        let (coordinator, handles, _) = rig(MotionConfig::default()).await;
        handles[2].fail_link();

        let err = coordinator.init_drives().await.unwrap_err();
        assert!(matches!(err, MotionError::Axis(AxisError::LinkLost { axis: Axis::Z, .. })));
        assert!(coordinator.check_links().is_err());
        assert!(coordinator.is_terminated());
        assert!(!handles[0].control().drive_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_resume() {
        let (coordinator, handles, _) = homed_rig(MotionConfig::default()).await;

        coordinator.stop().await;
        for axis in Axis::ALL {
            assert_eq!(coordinator.drive_state(axis), DriveState::Halt);
        }

        coordinator.resume_axis(Axis::Y).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.drive_state(Axis::Y), DriveState::Ready);
        assert!(handles[0].control().halt_active);

        coordinator.resume().await.unwrap();
        coordinator.stop_axis(Axis::Z).await;
        assert!(handles[2].control().halt_active);
        assert!(!handles[0].control().halt_active);
        coordinator.terminate().await;
    }
}
