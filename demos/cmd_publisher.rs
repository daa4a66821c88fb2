// Keyboard jog: WASD move target in XY, R/F raise/lower Z, 1-3 step size,
// G go, I init, H home, Space stop, C resume, T terminate, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use gantry_zenoh_runtime::config::TOPIC_CMD;
use gantry_zenoh_runtime::messages::GantryCommand;
use std::time::Duration;
use tracing::info;

const STEPS_UM: [i32; 3] = [1_000, 10_000, 50_000];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Controls: WASD=XY, R/F=Z, 1-3=step, G=go, I=init, H=home, Space=stop, C=resume, T=terminate, Q=quit");

    enable_raw_mode()?;
    let result = run_jog(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &GantryCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Sending {:?}", cmd);
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}

async fn run_jog(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 1;
    let (mut x, mut y, mut z) = (0i32, 0i32, 0i32);

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }

        let step = STEPS_UM[step_idx];
        let cmd = match code {
            // Target adjustment, sent with G
            KeyCode::Char('w') => {
                x += step;
                None
            }
            KeyCode::Char('s') => {
                x -= step;
                None
            }
            KeyCode::Char('a') => {
                y += step;
                None
            }
            KeyCode::Char('d') => {
                y -= step;
                None
            }
            KeyCode::Char('r') => {
                z += step;
                None
            }
            KeyCode::Char('f') => {
                z -= step;
                None
            }
            KeyCode::Char(c @ '1'..='3') => {
                step_idx = (c as usize) - ('1' as usize);
                info!("Step: {} um", STEPS_UM[step_idx]);
                continue;
            }

            KeyCode::Char('g') => Some(GantryCommand::Move { x, y, z }),
            KeyCode::Char('i') => Some(GantryCommand::InitDrives),
            KeyCode::Char('h') => Some(GantryCommand::HomeAll),
            KeyCode::Char(' ') => Some(GantryCommand::Stop { axis: None }),
            KeyCode::Char('c') => Some(GantryCommand::Resume { axis: None }),
            KeyCode::Char('t') => {
                send(publisher, &GantryCommand::Terminate).await?;
                break;
            }

            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        match cmd {
            Some(cmd) => send(publisher, &cmd).await?,
            None => info!("Target: ({}, {}, {}) um", x, y, z),
        }
    }

    Ok(())
}
