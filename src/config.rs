// Timeouts, topics, chassis configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::kinematics::{MecanumLimits, MecanumParams};
use crate::motor::{CanBus, TxPolicy};

// Runtime loop frequency (CAN command period 2 ms)
pub const LOOP_HZ: u64 = 500;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// A motor with no feedback for this long is reported stale
pub const MOTOR_TIMEOUT: Duration = Duration::from_millis(100);

// Zenoh topics
pub const TOPIC_CMD_BASE: &str = "chassis/cmd/base"; // chassis velocity commands
pub const TOPIC_CMD_CURRENT: &str = "chassis/cmd/current"; // speed loop output
pub const TOPIC_RT_WHEELS: &str = "chassis/rt/wheel_targets"; // speed loop input
pub const TOPIC_CAN_RX: &str = "chassis/can/rx"; // ESC feedback frames
pub const TOPIC_CAN_TX: &str = "chassis/can/tx"; // ESC command frames
pub const TOPIC_GYRO: &str = "chassis/state/gyro";
pub const TOPIC_ODOMETRY: &str = "chassis/state/odometry";
pub const TOPIC_HEALTH: &str = "chassis/state/health";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Wheel motor {0} is not in the motor list")]
    UnknownWheel(String),

    #[error("Invalid chassis geometry: {0}")]
    InvalidGeometry(String),
}

/// One ESC node to register at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorSpec {
    pub name: String,
    pub bus: CanBus,
    pub address: u16,
    #[serde(default = "default_calibrate")]
    pub calibrate_offset: bool,
}

fn default_calibrate() -> bool {
    true
}

/// Chassis configuration, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChassisConfig {
    pub mecanum: MecanumParams,
    pub limits: MecanumLimits,
    pub motors: Vec<MotorSpec>,
    /// Motor names in wheel order: front-right, front-left, back-left, back-right
    pub wheels: [String; 4],
    pub tx_policy: TxPolicy,
}

impl Default for ChassisConfig {
    fn default() -> Self {
        let names = ["fr", "fl", "bl", "br"];
        let motors = names
            .iter()
            .zip(0x201u16..)
            .map(|(name, address)| MotorSpec {
                name: name.to_string(),
                bus: CanBus::Can1,
                address,
                calibrate_offset: true,
            })
            .collect();

        Self {
            mecanum: MecanumParams::default(),
            limits: MecanumLimits::default(),
            motors,
            wheels: names.map(str::to_string),
            tx_policy: TxPolicy::default(),
        }
    }
}

impl ChassisConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for wheel in &self.wheels {
            if !self.motors.iter().any(|m| &m.name == wheel) {
                return Err(ConfigError::UnknownWheel(wheel.clone()));
            }
        }

        let p = &self.mecanum;
        let l = &self.limits;
        require_positive("mecanum.wheel_perimeter", p.wheel_perimeter)?;
        require_positive("mecanum.wheel_track", p.wheel_track)?;
        require_positive("mecanum.wheelbase", p.wheelbase)?;
        require_finite("mecanum.rotate_x_offset", p.rotate_x_offset)?;
        require_finite("mecanum.rotate_y_offset", p.rotate_y_offset)?;
        require_positive("limits.max_vx", l.max_vx)?;
        require_positive("limits.max_vy", l.max_vy)?;
        require_positive("limits.max_vw", l.max_vw)?;
        require_positive("limits.max_wheel_rpm", l.max_wheel_rpm)?;
        require_positive("limits.decel_ratio", l.decel_ratio)?;

        // Every wheel needs a lever arm on the far side of the rotation center
        for (wheel, ratio) in self.wheels.iter().zip(p.rotate_ratios()) {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(ConfigError::InvalidGeometry(format!(
                    "rotation center offset leaves wheel {} with lever arm {} mm",
                    wheel, ratio
                )));
            }
        }
        Ok(())
    }
}

fn require_positive(field: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidGeometry(format!(
            "{} must be positive, got {}",
            field, value
        )))
    }
}

fn require_finite(field: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidGeometry(format!(
            "{} must be finite, got {}",
            field, value
        )))
    }
}
