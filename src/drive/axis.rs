// Single-axis driver for a CMMO-ST controller
//
// A poll worker task owns the transport and exchanges the register frame
// with the controller at a fixed period. The foreground API never touches
// the transport: it mutates ControlRegisters through a watch channel and
// waits on telemetry published by the worker after every successful poll.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use super::Axis;
use super::error::AxisError;
use super::modbus::{Transport, TransportError};
use super::registers::{
    ControlRegisters, FRAME_ADDRESS, FRAME_WORDS, Frame, OpMode, StatusRegisters,
};

/// Velocity preselection applied on initialization (percent)
pub const DEFAULT_PRESELECTION: u8 = 100;

/// Timing of the register sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveTiming {
    /// Period of the register exchange with the controller
    pub poll_interval: Duration,
    /// Wait between consecutive register transitions
    pub settle: Duration,
    /// How long start bits are held asserted
    pub pulse_hold: Duration,
    /// Upper bound for a homing or positioning run
    pub motion_timeout: Duration,
}

impl Default for DriveTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            settle: Duration::from_millis(200),
            pulse_hold: Duration::from_millis(400),
            motion_timeout: Duration::from_secs(120),
        }
    }
}

/// Drive state derived from the status registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    /// No faults or warnings, ready for movement
    Ready,
    /// Warning present, the drive may or may not still move
    Warn,
    /// Fault present, the drive will not move
    Error,
    /// No homing reference set
    NoHome,
    /// Operation enabled but halt asserted
    Halt,
    /// Operation not enabled
    Disabled,
}

impl DriveState {
    pub fn from_status(status: &StatusRegisters) -> Self {
        if status.fault_present {
            DriveState::Error
        } else if status.warning_present {
            DriveState::Warn
        } else if !status.reference_set {
            DriveState::NoHome
        } else if status.drive_enabled && status.operation_enabled {
            if status.halt_active {
                DriveState::Halt
            } else {
                DriveState::Ready
            }
        } else {
            DriveState::Disabled
        }
    }
}

/// Latched controller exception, mapped to its datasheet description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriveException {
    pub code: u8,
    pub description: &'static str,
}

impl DriveException {
    pub fn from_code(code: u8) -> Self {
        let description = match code {
            0x00 => "N/A",
            0x01 => "Software error",
            0x02 => "Default parameter file invalid",
            0x47 => "Modbus connection with master control",
            _ => "Unknown error",
        };
        Self { code, description }
    }
}

/// Lifecycle of an axis driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisPhase {
    Uninitialized,
    Initializing,
    ReadyIdle,
    Homing,
    HomedIdle,
    Moving,
    Faulted,
    Terminating,
    Terminated,
}

impl AxisPhase {
    fn is_terminal(self) -> bool {
        matches!(self, AxisPhase::Terminating | AxisPhase::Terminated)
    }
}

/// Snapshot published by the poll worker
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub status: StatusRegisters,
    pub exception_code: u8,
    /// Number of successful register exchanges
    pub polls: u64,
    /// Set once the worker has died on a transport failure
    pub link_error: Option<String>,
}

/// Driver for one axis
pub struct AxisDriver {
    axis: Axis,
    timing: DriveTiming,
    control: watch::Sender<ControlRegisters>,
    telemetry: watch::Receiver<Telemetry>,
    phase: watch::Sender<AxisPhase>,
    motion: Mutex<()>,
    shutdown: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl AxisDriver {
    /// Connect the transport and start the poll worker
    pub async fn connect(
        axis: Axis,
        mut transport: Box<dyn Transport>,
        timing: DriveTiming,
    ) -> Result<Self, AxisError> {
        info!("Connecting drive {}", axis);
        transport
            .connect()
            .await
            .map_err(|source| AxisError::Transport { axis, source })?;
        debug!("Drive {} connected", axis);
        Ok(Self::spawn(axis, transport, timing))
    }

    /// Start the poll worker on an already connected transport
    pub fn spawn(axis: Axis, transport: Box<dyn Transport>, timing: DriveTiming) -> Self {
        let (control, control_rx) = watch::channel(ControlRegisters::default());
        let (telemetry_tx, telemetry) = watch::channel(Telemetry::default());
        let (phase, _) = watch::channel(AxisPhase::Uninitialized);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(poll_worker(
            axis,
            transport,
            control_rx,
            telemetry_tx,
            shutdown_rx,
            timing.poll_interval,
        ));

        Self {
            axis,
            timing,
            control,
            telemetry,
            phase,
            motion: Mutex::new(()),
            shutdown,
            worker: StdMutex::new(Some(worker)),
        }
    }

    /// Bring the controller from power-on into direct positioning mode
    pub async fn initialize(&self) -> Result<(), AxisError> {
        self.check_alive()?;
        let _motion = self.claim()?;
        self.set_phase(AxisPhase::Initializing)?;

        let steps: [(&str, fn(&mut ControlRegisters)); 7] = [
            ("enabling drive", |c| c.drive_enabled = true),
            ("enabling operation", |c| c.operation_enabled = true),
            ("releasing halt", |c| c.halt_active = false),
            ("releasing brake", |c| c.brake_active = false),
            ("clearing faults", |c| c.reset = true),
            ("de-asserting reset", |c| c.reset = false),
            ("selecting direct application mode", |c| {
                c.operation_mode = OpMode::DirectApp;
                c.preselection = DEFAULT_PRESELECTION;
            }),
        ];

        self.settle().await.map_err(|e| self.fail(e))?;
        for (what, apply) in steps {
            debug!("Drive {}: {}", self.axis, what);
            self.modify(apply)?;
            self.settle().await.map_err(|e| self.fail(e))?;
        }

        self.set_phase(self.idle_phase())?;
        info!("Drive {} initialized", self.axis);
        Ok(())
    }

    /// Run the homing procedure and wait for it to complete
    pub async fn home(&self) -> Result<(), AxisError> {
        self.check_ready()?;
        let _motion = self.claim()?;
        self.check_enabled()?;
        self.set_phase(AxisPhase::Homing)?;

        debug!("Drive {}: starting homing", self.axis);
        self.start_motion(|c, on| c.homing_start = on, self.timing.settle, "homing")
            .await
            .map_err(|e| self.fail(e))?;
        self.pause(self.timing.pulse_hold).await?;

        self.wait_motion_complete("homing")
            .await
            .map_err(|e| self.fail(e))?;
        if !self.status().reference_set {
            return Err(self.fail(AxisError::ActionFault {
                axis: self.axis,
                action: "homing",
            }));
        }

        self.set_phase(AxisPhase::HomedIdle)?;
        info!("Drive {} homing complete", self.axis);
        Ok(())
    }

    /// Position to `target` (micrometers) and wait for completion
    pub async fn move_to(&self, target: i32) -> Result<(), AxisError> {
        self.check_ready()?;
        let _motion = self.claim()?;
        self.check_enabled()?;
        self.set_phase(AxisPhase::Moving)?;

        self.modify(|c| c.setpoint = target)?;
        self.settle().await.map_err(|e| self.fail(e))?;

        debug!("Drive {}: setpoint is {}", self.axis, target);
        self.start_motion(
            |c, on| c.positioning_start = on,
            self.timing.pulse_hold,
            "positioning",
        )
        .await
        .map_err(|e| self.fail(e))?;
        self.pause(self.timing.settle).await?;

        self.wait_motion_complete("positioning")
            .await
            .map_err(|e| self.fail(e))?;

        self.set_phase(self.idle_phase())?;
        debug!("Drive {}: positioning complete", self.axis);
        Ok(())
    }

    /// Assert halt
    pub async fn stop(&self) {
        if self.modify(|c| c.halt_active = true).is_err() {
            return;
        }
        info!("Drive {}: halt", self.axis);
        sleep(self.timing.settle).await;
    }

    /// Release halt
    pub async fn resume(&self) -> Result<(), AxisError> {
        self.check_alive()?;
        info!("Drive {}: resume", self.axis);
        self.modify(|c| c.halt_active = false)?;
        self.pause(self.timing.settle).await
    }

    /// Pulse the reset bit to clear a latched fault
    pub async fn reset(&self) -> Result<(), AxisError> {
        self.check_alive()?;
        let _motion = self.claim()?;

        info!("Drive {}: resetting", self.axis);
        self.pulse(|c, on| c.reset = on, self.timing.settle).await?;
        self.settle().await.map_err(|e| self.fail(e))?;

        self.set_phase(self.idle_phase())?;
        Ok(())
    }

    /// Safe the controller, stop the poll worker and release the transport
    ///
    /// Concurrent and repeated calls return once the axis is terminated.
    pub async fn terminate(&self) {
        let started = self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = AxisPhase::Terminating;
                true
            }
        });
        if !started {
            let mut phase = self.phase.subscribe();
            let _ = phase.wait_for(|p| *p == AxisPhase::Terminated).await;
            return;
        }

        // Phase is terminal from here on, so no foreground write can undo this
        info!("Drive {}: terminating", self.axis);
        self.control.send_modify(|c| *c = c.safed());
        sleep(self.timing.pulse_hold).await;

        self.shutdown.send_replace(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Drive {}: poll worker ended abnormally: {}", self.axis, e);
            }
        }

        self.phase.send_replace(AxisPhase::Terminated);
        info!("Drive {} terminated", self.axis);
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn phase(&self) -> AxisPhase {
        *self.phase.borrow()
    }

    /// Latest status registers read from the controller
    pub fn status(&self) -> StatusRegisters {
        self.telemetry.borrow().status
    }

    /// Control registers as currently commanded
    pub fn control(&self) -> ControlRegisters {
        *self.control.borrow()
    }

    pub fn drive_state(&self) -> DriveState {
        DriveState::from_status(&self.telemetry.borrow().status)
    }

    pub fn exception(&self) -> DriveException {
        DriveException::from_code(self.telemetry.borrow().exception_code)
    }

    /// Actual position in encoder ticks
    pub fn position_ticks(&self) -> i32 {
        self.telemetry.borrow().status.position
    }

    pub fn link_error(&self) -> Option<String> {
        self.telemetry.borrow().link_error.clone()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.borrow().clone()
    }

    fn claim(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, AxisError> {
        self.motion
            .try_lock()
            .map_err(|_| AxisError::Busy { axis: self.axis })
    }

    fn check_alive(&self) -> Result<(), AxisError> {
        if self.phase().is_terminal() {
            return Err(AxisError::Terminated { axis: self.axis });
        }
        self.check_link()
    }

    fn check_ready(&self) -> Result<(), AxisError> {
        self.check_alive()?;
        if self.phase() == AxisPhase::Faulted {
            return Err(AxisError::FaultLatched { axis: self.axis });
        }
        Ok(())
    }

    /// The controller ignores start bits unless enabled and not halted
    fn check_enabled(&self) -> Result<(), AxisError> {
        let status = self.status();
        let state = if !(status.drive_enabled && status.operation_enabled) {
            DriveState::Disabled
        } else if status.halt_active {
            DriveState::Halt
        } else {
            return Ok(());
        };
        Err(AxisError::NotReady {
            axis: self.axis,
            state,
        })
    }

    fn check_link(&self) -> Result<(), AxisError> {
        match self.link_error() {
            Some(reason) => Err(AxisError::LinkLost {
                axis: self.axis,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Apply a control change unless the axis is terminating
    fn modify(&self, apply: impl FnOnce(&mut ControlRegisters)) -> Result<(), AxisError> {
        let applied = self.control.send_if_modified(|control| {
            if self.phase().is_terminal() {
                false
            } else {
                apply(control);
                true
            }
        });
        if applied {
            Ok(())
        } else {
            Err(AxisError::Terminated { axis: self.axis })
        }
    }

    /// Move to `next` unless the axis is terminating
    fn set_phase(&self, next: AxisPhase) -> Result<(), AxisError> {
        let applied = self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = next;
                true
            }
        });
        if applied {
            Ok(())
        } else {
            Err(AxisError::Terminated { axis: self.axis })
        }
    }

    /// Sleep, then bail out if terminate() ran in the meantime
    async fn pause(&self, duration: Duration) -> Result<(), AxisError> {
        sleep(duration).await;
        if self.phase().is_terminal() {
            return Err(AxisError::Terminated { axis: self.axis });
        }
        Ok(())
    }

    async fn settle(&self) -> Result<(), AxisError> {
        self.pause(self.timing.settle).await?;
        self.check_link()
    }

    /// Assert a bit, hold it, then clear it
    async fn pulse(
        &self,
        set: fn(&mut ControlRegisters, bool),
        hold: Duration,
    ) -> Result<(), AxisError> {
        self.modify(|c| set(c, true))?;
        self.pause(hold).await?;
        self.modify(|c| set(c, false))
    }

    /// Pulse a start bit and require the controller to take it up
    ///
    /// Until the start is acknowledged (or motion or a fault shows up) the
    /// motion-complete bit still describes the previous run.
    async fn start_motion(
        &self,
        set: fn(&mut ControlRegisters, bool),
        hold: Duration,
        action: &'static str,
    ) -> Result<(), AxisError> {
        let mut telemetry = self.telemetry.clone();
        telemetry.mark_unchanged();
        let deadline = Instant::now() + hold;

        self.modify(|c| set(c, true))?;
        let acknowledge = async {
            while telemetry.changed().await.is_ok() {
                let status = telemetry.borrow_and_update().status;
                if status.ack_start || status.is_moving || status.fault_present {
                    return true;
                }
            }
            false
        };
        let acknowledged = timeout_at(deadline, acknowledge).await.unwrap_or(false);
        sleep_until(deadline).await;

        self.check_alive()?;
        self.modify(|c| set(c, false))?;
        if acknowledged {
            Ok(())
        } else {
            warn!("Drive {}: {} start not acknowledged", self.axis, action);
            Err(AxisError::NotStarted {
                axis: self.axis,
                action,
            })
        }
    }

    fn idle_phase(&self) -> AxisPhase {
        if self.status().reference_set {
            AxisPhase::HomedIdle
        } else {
            AxisPhase::ReadyIdle
        }
    }

    /// Record a fault-class error in the phase and hand it back
    fn fail(&self, err: AxisError) -> AxisError {
        if err.is_fault() {
            let _ = self.set_phase(AxisPhase::Faulted);
        }
        err
    }

    /// The worker is gone: either we terminated it or it died
    fn worker_gone(&self) -> AxisError {
        if self.phase().is_terminal() {
            AxisError::Terminated { axis: self.axis }
        } else {
            AxisError::LinkLost {
                axis: self.axis,
                reason: self
                    .link_error()
                    .unwrap_or_else(|| "poll worker stopped".to_string()),
            }
        }
    }

    async fn wait_motion_complete(&self, action: &'static str) -> Result<(), AxisError> {
        let axis = self.axis;
        let mut telemetry = self.telemetry.clone();

        let wait = async {
            loop {
                if self.phase().is_terminal() {
                    return Err(AxisError::Terminated { axis });
                }
                {
                    let snapshot = telemetry.borrow_and_update();
                    if let Some(reason) = &snapshot.link_error {
                        return Err(AxisError::LinkLost {
                            axis,
                            reason: reason.clone(),
                        });
                    }
                    if DriveState::from_status(&snapshot.status) == DriveState::Error {
                        return Err(AxisError::ActionFault { axis, action });
                    }
                    if snapshot.status.motion_complete {
                        return Ok(());
                    }
                }
                if telemetry.changed().await.is_err() {
                    return Err(self.worker_gone());
                }
            }
        };

        match timeout(self.timing.motion_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Drive {}: {} timed out after {:?}, halting",
                    axis, action, self.timing.motion_timeout
                );
                self.modify(|c| c.halt_active = true)?;
                Err(AxisError::Timeout {
                    axis,
                    action,
                    after: self.timing.motion_timeout,
                })
            }
        }
    }
}

impl Drop for AxisDriver {
    fn drop(&mut self) {
        // Leave the controller locked if terminate() was never awaited
        if !self.phase().is_terminal() {
            warn!("Drive {} dropped without terminate, safing", self.axis);
            self.control.send_modify(|c| *c = c.safed());
            self.shutdown.send_replace(true);
        }
    }
}

/// One register exchange: write control, read status, read exception byte
async fn exchange(
    transport: &mut dyn Transport,
    control: &ControlRegisters,
) -> Result<(StatusRegisters, u8), TransportError> {
    transport.write_registers(FRAME_ADDRESS, &control.encode()).await?;

    let words = transport
        .read_registers(FRAME_ADDRESS, FRAME_WORDS as u16)
        .await?;
    let frame: Frame = words
        .as_slice()
        .try_into()
        .map_err(|_| TransportError::InvalidResponse {
            reason: format!("Expected {} status words, got {}", FRAME_WORDS, words.len()),
        })?;

    let exception_code = transport.read_exception_status().await?;
    Ok((StatusRegisters::decode(&frame), exception_code))
}

async fn poll_worker(
    axis: Axis,
    mut transport: Box<dyn Transport>,
    control: watch::Receiver<ControlRegisters>,
    telemetry: watch::Sender<Telemetry>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    debug!("Drive {} poll worker started", axis);
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        let frame = *control.borrow();
        match exchange(transport.as_mut(), &frame).await {
            Ok((status, exception_code)) => {
                telemetry.send_modify(|t| {
                    t.status = status;
                    t.exception_code = exception_code;
                    t.polls += 1;
                });
            }
            Err(e) => {
                error!("Drive {}: register exchange failed: {}", axis, e);
                telemetry.send_modify(|t| t.link_error = Some(e.to_string()));
                transport.close().await;
                return;
            }
        }
    }

    // Flush a safed frame before letting go of the connection
    let frame = control.borrow().safed();
    if let Err(e) = transport.write_registers(FRAME_ADDRESS, &frame.encode()).await {
        warn!("Drive {}: final register write failed: {}", axis, e);
    }
    transport.close().await;
    debug!("Drive {} poll worker exiting", axis);
}
