// 10 Hz bus loop around the motion coordinator
//
// Motion commands run one at a time on an executor task so the loop keeps
// publishing telemetry while the gantry moves. Stop/resume bypass the queue
// so they can interrupt a running move.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{LOOP_HZ, TOPIC_CMD, TOPIC_HEALTH, TOPIC_STATE};
use crate::drive::{MotionCoordinator, MotionError};
use crate::messages::{GantryCommand, GantryState, RuntimeHealth};

/// Queued motion commands waiting for the executor
const QUEUE_DEPTH: usize = 16;

/// Apply one command to the coordinator
pub async fn dispatch(
    coordinator: &MotionCoordinator,
    cmd: GantryCommand,
) -> Result<(), MotionError> {
    match cmd {
        GantryCommand::InitDrives => coordinator.init_drives().await,
        GantryCommand::Home { axis } => coordinator.home(axis).await,
        GantryCommand::HomeAll => coordinator.home_all().await,
        GantryCommand::Move { x, y, z } => coordinator.move_to(x, y, z).await,
        GantryCommand::MoveDirect { x, y, z } => coordinator.move_direct(x, y, z).await,
        GantryCommand::Stop { axis: None } => {
            coordinator.stop().await;
            Ok(())
        }
        GantryCommand::Stop { axis: Some(axis) } => {
            coordinator.stop_axis(axis).await;
            Ok(())
        }
        GantryCommand::Resume { axis: None } => coordinator.resume().await,
        GantryCommand::Resume { axis: Some(axis) } => coordinator.resume_axis(axis).await,
        GantryCommand::ResetDrive { axis } => coordinator.reset_drive(axis).await,
        GantryCommand::SetCalibrationOffset { x, y } => {
            coordinator.set_calibration_offset(x, y);
            Ok(())
        }
        GantryCommand::Terminate => {
            coordinator.terminate().await;
            Ok(())
        }
    }
}

/// Runs queued commands sequentially and reports the outcome as health
async fn execute(
    coordinator: Arc<MotionCoordinator>,
    mut queue: mpsc::Receiver<GantryCommand>,
    health: Arc<watch::Sender<RuntimeHealth>>,
) {
    while let Some(cmd) = queue.recv().await {
        info!("Executing {:?}", cmd);
        health.send_replace(RuntimeHealth::Busy);

        match dispatch(&coordinator, cmd).await {
            Ok(()) => {
                health.send_if_modified(|h| {
                    if *h == RuntimeHealth::Busy {
                        *h = RuntimeHealth::Ok;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                error!("Command failed: {}", e);
                health.send_if_modified(|h| {
                    if *h == RuntimeHealth::Terminated {
                        false
                    } else {
                        *h = RuntimeHealth::Faulted;
                        true
                    }
                });
            }
        }
    }
}

pub struct Runtime {
    coordinator: Arc<MotionCoordinator>,
    queue: mpsc::Sender<GantryCommand>,
    health: Arc<watch::Sender<RuntimeHealth>>,
    link_fault_handled: bool,
}

impl Runtime {
    /// Create the runtime and start its motion executor
    pub fn new(coordinator: Arc<MotionCoordinator>) -> Self {
        let (queue, rx) = mpsc::channel(QUEUE_DEPTH);
        let (health, _) = watch::channel(RuntimeHealth::Ok);
        let health = Arc::new(health);

        tokio::spawn(execute(Arc::clone(&coordinator), rx, Arc::clone(&health)));

        Self {
            coordinator,
            queue,
            health,
            link_fault_handled: false,
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        *self.health.borrow()
    }

    /// Process incoming command
    ///
    /// Returns false once the runtime should exit.
    pub async fn on_command(&mut self, cmd: GantryCommand) -> bool {
        info!("Received command: {:?}", &cmd);

        if cmd == GantryCommand::Terminate {
            self.coordinator.terminate().await;
            self.health.send_replace(RuntimeHealth::Terminated);
            return false;
        }

        if cmd.is_queued() {
            if let Err(e) = self.queue.try_send(cmd) {
                warn!("Motion queue rejected command: {}", e);
            }
        } else {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(e) = dispatch(&coordinator, cmd).await {
                    warn!("Command failed: {}", e);
                }
            });
        }
        true
    }

    /// Shut everything down once a poll worker has died
    pub async fn check_links(&mut self) {
        if self.link_fault_handled {
            return;
        }
        if let Err(e) = self.coordinator.check_links() {
            error!("{}; terminating all drives", e);
            self.link_fault_handled = true;
            self.health.send_replace(RuntimeHealth::Faulted);
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move { coordinator.terminate().await });
        }
    }

    /// Compute telemetry snapshot
    pub fn state(&self) -> GantryState {
        GantryState::from(self.coordinator.as_ref())
    }
}

pub async fn run(
    coordinator: Arc<MotionCoordinator>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new(coordinator);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!("Runtime started: {}Hz loop", LOOP_HZ);
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {}", TOPIC_STATE, TOPIC_HEALTH);

    let mut running = true;
    while running {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<GantryCommand>(&payload) {
                Ok(cmd) => {
                    if !runtime.on_command(cmd).await {
                        running = false;
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Link watchdog
        runtime.check_links().await;

        // 3. Publish telemetry
        let state_json = serde_json::to_string(&runtime.state())?;
        pub_state.put(state_json).await?;

        // 4. Publish health
        let health_json = serde_json::to_string(&runtime.health())?;
        pub_health.put(health_json).await?;
    }

    info!("Runtime stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::sim::simulated_rig;
    use crate::drive::{Axis, AxisPhase, DriveTiming, MotionConfig};
    use tokio::time::sleep;

    async fn runtime() -> (Runtime, [crate::drive::sim::SimHandle; 3]) {
        let (transports, handles, _) = simulated_rig(3);
        let coordinator =
            MotionCoordinator::connect(transports, DriveTiming::default(), MotionConfig::default())
                .await
                .unwrap();
        (Runtime::new(Arc::new(coordinator)), handles)
    }

    async fn wait_idle(runtime: &Runtime) {
        sleep(Duration::from_millis(50)).await;
        while runtime.health() == RuntimeHealth::Busy {
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_motion() {
        let (mut runtime, _) = runtime().await;

        assert!(runtime.on_command(GantryCommand::InitDrives).await);
        assert!(runtime.on_command(GantryCommand::HomeAll).await);
        assert!(
            runtime
                .on_command(GantryCommand::Move { x: 1_000, y: 2_000, z: 3_000 })
                .await
        );
        wait_idle(&runtime).await;

        assert_eq!(runtime.health(), RuntimeHealth::Ok);
        let state = runtime.state();
        assert_eq!(state.position_um.x, 1_000);
        assert_eq!(state.position_um.y, 2_000);
        assert_eq!(state.position_um.z, 3_000);
        assert!(state.axes.iter().all(|a| a.phase == AxisPhase::HomedIdle));

        assert!(!runtime.on_command(GantryCommand::Terminate).await);
        assert_eq!(runtime.health(), RuntimeHealth::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_move_reports_fault() {
        let (mut runtime, _) = runtime().await;

        runtime.on_command(GantryCommand::InitDrives).await;
        runtime
            .on_command(GantryCommand::Move { x: -5, y: 0, z: 0 })
            .await;
        wait_idle(&runtime).await;

        assert_eq!(runtime.health(), RuntimeHealth::Faulted);
        assert!(runtime.state().axes.iter().all(|a| a.phase == AxisPhase::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_watchdog() {
        let (mut runtime, handles) = runtime().await;
        handles[1].fail_link();
        sleep(Duration::from_millis(300)).await;

        runtime.check_links().await;
        assert_eq!(runtime.health(), RuntimeHealth::Faulted);
        sleep(Duration::from_secs(1)).await;

        let state = runtime.state();
        let y = state.axes.iter().find(|a| a.axis == Axis::Y).unwrap();
        assert!(y.link_error.is_some());
        assert!(state.axes.iter().all(|a| a.phase == AxisPhase::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_bypasses_queue() {
        let (mut runtime, handles) = runtime().await;
        runtime.on_command(GantryCommand::InitDrives).await;
        wait_idle(&runtime).await;

        runtime
            .on_command(GantryCommand::Stop { axis: Some(Axis::X) })
            .await;
        sleep(Duration::from_millis(300)).await;
        assert!(handles[0].control().halt_active);
        assert!(!handles[1].control().halt_active);

        runtime
            .on_command(GantryCommand::SetCalibrationOffset { x: 5, y: 6 })
            .await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(runtime.coordinator.calibration_offset().y, 6);
        runtime.on_command(GantryCommand::Terminate).await;
    }
}
