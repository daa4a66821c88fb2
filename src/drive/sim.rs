// Simulated CMMO-ST controller
//
// Speaks the same register frame as the real controller through the
// Transport trait, so the full driver stack can run without hardware.
// Motion takes a fixed number of status reads to complete.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_modbus::ExceptionCode;
use tracing::debug;

use super::Axis;
use super::modbus::{FunctionCode, Result, Transport, TransportError};
use super::registers::{ControlRegisters, FRAME_ADDRESS, FRAME_WORDS, Frame, StatusRegisters};

/// Status reads needed to complete a homing or positioning run
pub const DEFAULT_TRAVEL_POLLS: u32 = 5;

/// Exception code latched when a fault is injected
pub const INJECTED_FAULT_CODE: u8 = 0x01;

/// Positioning starts accepted by the simulated controllers, in order
pub type MotionLog = Arc<Mutex<Vec<(Axis, i32)>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Travel {
    Homing,
    Positioning,
}

#[derive(Debug)]
struct SimState {
    control: ControlRegisters,
    status: StatusRegisters,
    exception_code: u8,
    travel: Option<(Travel, u32)>,
    start: i32,
    target: i32,
    fault_on_setpoint: Option<i32>,
    link_down: bool,
    connected: bool,
    writes: u64,
}

impl SimState {
    fn new() -> Self {
        Self {
            control: ControlRegisters::default(),
            status: StatusRegisters {
                motion_complete: true,
                ..StatusRegisters::default()
            },
            exception_code: 0,
            travel: None,
            start: 0,
            target: 0,
            fault_on_setpoint: None,
            link_down: false,
            connected: false,
            writes: 0,
        }
    }

    fn can_move(&self) -> bool {
        let c = &self.control;
        c.drive_enabled
            && c.operation_enabled
            && !c.halt_active
            && !c.brake_active
            && !self.status.fault_present
    }

    fn latch_fault(&mut self) {
        self.status.fault_present = true;
        self.status.motion_complete = false;
        self.status.is_moving = false;
        self.exception_code = INJECTED_FAULT_CODE;
        self.travel = None;
    }

    fn begin(&mut self, travel: Travel, target: i32, polls: u32) {
        self.travel = Some((travel, polls.max(1)));
        self.start = self.status.position;
        self.target = target;
        self.status.motion_complete = false;
        self.status.is_moving = true;
    }

    /// Apply a freshly written control frame
    fn write(
        &mut self,
        next: ControlRegisters,
        axis: Axis,
        travel_polls: u32,
        log: Option<&MotionLog>,
    ) {
        let prev = self.control;
        self.control = next;
        self.writes += 1;

        if next.reset && !prev.reset {
            debug!("Sim {}: reset edge, clearing faults", axis);
            self.status.fault_present = false;
            self.status.warning_present = false;
            self.exception_code = 0;
        }

        // A locked drive does not acknowledge start requests
        let accepted = self.can_move();
        let s = &mut self.status;
        s.drive_enabled = next.drive_enabled;
        s.operation_enabled = next.operation_enabled;
        s.fct_blocked = next.fct_blocked;
        s.operation_mode = next.operation_mode;
        s.halt_active = next.halt_active;
        s.setpoint_mode = next.setpoint_mode;
        s.control_mode = next.control_mode;
        s.ack_start = (next.positioning_start || next.homing_start) && accepted;

        if next.homing_start && !prev.homing_start && self.can_move() {
            debug!("Sim {}: homing", axis);
            self.status.reference_set = false;
            self.begin(Travel::Homing, 0, travel_polls);
        }

        if next.positioning_start && !prev.positioning_start && self.can_move() {
            debug!("Sim {}: positioning to {}", axis, next.setpoint);
            if let Some(log) = log {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((axis, next.setpoint));
            }
            if self.fault_on_setpoint == Some(next.setpoint) {
                self.latch_fault();
            } else {
                self.begin(Travel::Positioning, next.setpoint, travel_polls);
            }
        }
    }

    /// Advance motion by one status read
    fn advance(&mut self, travel_polls: u32) {
        if self.control.halt_active {
            return;
        }
        let Some((travel, remaining)) = self.travel else {
            return;
        };

        if remaining <= 1 {
            self.status.position = self.target;
            self.status.motion_complete = true;
            self.status.is_moving = false;
            if travel == Travel::Homing {
                self.status.reference_set = true;
            }
            self.travel = None;
        } else {
            let done = (travel_polls.max(1) - remaining + 1) as i64;
            let total = travel_polls.max(1) as i64;
            let span = self.target as i64 - self.start as i64;
            self.status.position = (self.start as i64 + span * done / total) as i32;
            self.travel = Some((travel, remaining - 1));
        }
    }
}

/// Test and diagnostics handle onto a simulated controller
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latch a controller fault immediately
    pub fn inject_fault(&self) {
        self.lock().latch_fault();
    }

    /// Latch a fault instead of moving when positioning to `setpoint`
    pub fn fault_on_setpoint(&self, setpoint: i32) {
        self.lock().fault_on_setpoint = Some(setpoint);
    }

    /// Make every further transport call fail
    pub fn fail_link(&self) {
        self.lock().link_down = true;
    }

    /// Set a warning flag in the status frame
    pub fn set_warning(&self, warning: bool) {
        self.lock().status.warning_present = warning;
    }

    /// Overwrite the reported position (encoder ticks)
    pub fn set_position(&self, ticks: i32) {
        self.lock().status.position = ticks;
    }

    /// Last control frame written by the driver
    pub fn control(&self) -> ControlRegisters {
        self.lock().control
    }

    pub fn status(&self) -> StatusRegisters {
        self.lock().status
    }

    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// In-process stand-in for one drive controller
pub struct SimulatedDrive {
    axis: Axis,
    travel_polls: u32,
    log: Option<MotionLog>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDrive {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            travel_polls: DEFAULT_TRAVEL_POLLS,
            log: None,
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Record accepted positioning starts into a shared log
    pub fn with_log(mut self, log: MotionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_travel_polls(mut self, polls: u32) -> Self {
        self.travel_polls = polls;
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.link_down {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("simulated link to drive {} is down", self.axis),
            )));
        }
        Ok(state)
    }

    fn check_frame(function: FunctionCode, address: u16, count: usize) -> Result<()> {
        if address != FRAME_ADDRESS || count != FRAME_WORDS {
            return Err(TransportError::Exception {
                function: function as u8,
                code: ExceptionCode::IllegalDataAddress,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedDrive {
    async fn connect(&mut self) -> Result<()> {
        self.lock()?.connected = true;
        Ok(())
    }

    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        Self::check_frame(FunctionCode::ReadHoldingRegisters, address, count as usize)?;
        let travel_polls = self.travel_polls;
        let mut state = self.lock()?;
        state.advance(travel_polls);
        Ok(state.status.encode().to_vec())
    }

    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        Self::check_frame(FunctionCode::WriteMultipleRegisters, address, words.len())?;
        let frame: Frame = [words[0], words[1], words[2], words[3]];
        let (axis, travel_polls) = (self.axis, self.travel_polls);
        let log = self.log.clone();
        let mut state = self.lock()?;
        state.write(ControlRegisters::decode(&frame), axis, travel_polls, log.as_ref());
        Ok(())
    }

    async fn read_exception_status(&mut self) -> Result<u8> {
        Ok(self.lock()?.exception_code)
    }

    async fn close(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connected = false;
    }
}

/// Three simulated controllers sharing one motion log
pub fn simulated_rig(
    travel_polls: u32,
) -> ([Box<dyn Transport>; 3], [SimHandle; 3], MotionLog) {
    let log: MotionLog = Arc::new(Mutex::new(Vec::new()));
    let drives = Axis::ALL.map(|axis| {
        SimulatedDrive::new(axis)
            .with_travel_polls(travel_polls)
            .with_log(Arc::clone(&log))
    });
    let handles = [drives[0].handle(), drives[1].handle(), drives[2].handle()];
    let transports = drives.map(|drive| Box::new(drive) as Box<dyn Transport>);
    (transports, handles, log)
}
