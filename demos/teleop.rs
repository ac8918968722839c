// Keyboard teleop for the mecanum chassis
// W/S forward/back, A/D strafe, Q/E rotate, +/- speed level, Space stop, Esc quit
//
// Usage: cargo run --example teleop
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use mecanum_zenoh_runtime::config::TOPIC_CMD_BASE;
use mecanum_zenoh_runtime::messages::ChassisCommand;

const LINEAR_SPEEDS: [f32; 3] = [500.0, 1500.0, 3000.0]; // mm/s
const YAW_SPEEDS: [f32; 3] = [30.0, 90.0, 180.0]; // deg/s
const LEVEL_NAMES: [&str; 3] = ["LOW", "MED", "HIGH"];
const HOLD_TIMEOUT: Duration = Duration::from_millis(150); // key repeat gap before axes reset
const PUBLISH_PERIOD: Duration = Duration::from_millis(20);

/// What a key press does to the teleop state
enum Action {
    Drive { vx: f32, vy: f32, vw: f32 },
    Level(i8),
    Stop,
    Quit,
}

fn action_for(code: KeyCode) -> Option<Action> {
    let action = match code {
        KeyCode::Char('w') => Action::Drive { vx: 1.0, vy: 0.0, vw: 0.0 },
        KeyCode::Char('s') => Action::Drive { vx: -1.0, vy: 0.0, vw: 0.0 },
        KeyCode::Char('a') => Action::Drive { vx: 0.0, vy: 1.0, vw: 0.0 },
        KeyCode::Char('d') => Action::Drive { vx: 0.0, vy: -1.0, vw: 0.0 },
        KeyCode::Char('q') => Action::Drive { vx: 0.0, vy: 0.0, vw: 1.0 },
        KeyCode::Char('e') => Action::Drive { vx: 0.0, vy: 0.0, vw: -1.0 },
        KeyCode::Char('+') | KeyCode::Char('=') => Action::Level(1),
        KeyCode::Char('-') => Action::Level(-1),
        KeyCode::Char(' ') => Action::Stop,
        KeyCode::Esc => Action::Quit,
        _ => return None,
    };
    Some(action)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_BASE).await?;

    info!("Controls: W/S/A/D=move, Q/E=rotate, +/-=speed, Space=stop, Esc=quit");
    info!("Speed: {}", LEVEL_NAMES[0]);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut level: usize = 0;
    let mut cmd = ChassisCommand {
        vx: 0.0,
        vy: 0.0,
        vw: 0.0,
    };
    let mut last_drive = Instant::now();

    loop {
        if event::poll(PUBLISH_PERIOD)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind == KeyEventKind::Release {
                    continue;
                }
                match action_for(code) {
                    Some(Action::Drive { vx, vy, vw }) => {
                        // Each key sets its own axis and keeps the others
                        if vx != 0.0 {
                            cmd.vx = vx * LINEAR_SPEEDS[level];
                        }
                        if vy != 0.0 {
                            cmd.vy = vy * LINEAR_SPEEDS[level];
                        }
                        if vw != 0.0 {
                            cmd.vw = vw * YAW_SPEEDS[level];
                        }
                        last_drive = Instant::now();
                    }
                    Some(Action::Level(step)) => {
                        level = (level as i8 + step).clamp(0, 2) as usize;
                        info!("Speed: {}", LEVEL_NAMES[level]);
                    }
                    Some(Action::Stop) => {
                        cmd = ChassisCommand {
                            vx: 0.0,
                            vy: 0.0,
                            vw: 0.0,
                        };
                    }
                    Some(Action::Quit) => break,
                    None => {}
                }
            }
        }

        if last_drive.elapsed() > HOLD_TIMEOUT {
            cmd = ChassisCommand {
                vx: 0.0,
                vy: 0.0,
                vw: 0.0,
            };
        }

        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    // Leave the chassis stopped
    let stop = ChassisCommand {
        vx: 0.0,
        vy: 0.0,
        vw: 0.0,
    };
    publisher.put(serde_json::to_string(&stop)?).await?;
    Ok(())
}
