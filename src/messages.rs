// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::motor::kinematics::{ChassisPosition, ChassisSpeed, GyroReading};

// Command from teleop/scripts -> runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChassisCommand {
    /// Forward (mm/s)
    pub vx: f32,
    /// Left (mm/s)
    pub vy: f32,
    /// Counter-clockwise (deg/s)
    pub vw: f32,
}

impl From<&ChassisCommand> for ChassisSpeed {
    fn from(cmd: &ChassisCommand) -> Self {
        ChassisSpeed::new(cmd.vx, cmd.vy, cmd.vw)
    }
}

// Wheel targets runtime -> speed loop, motor rpm in [fr, fl, bl, br] order
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WheelTargets {
    pub wheel_rpm: [f32; 4],
}

// Current command speed loop -> runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentCommand {
    pub name: String,
    pub current: i16,
}

// Gyro sample from the IMU feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GyroSample {
    /// Absolute yaw (deg)
    pub yaw: f32,
    #[serde(default)]
    pub yaw_rate: f32,
}

impl From<&GyroSample> for GyroReading {
    fn from(sample: &GyroSample) -> Self {
        GyroReading {
            yaw_gyro_angle: sample.yaw,
            yaw_gyro_rate: sample.yaw_rate,
        }
    }
}

// Odometry runtime -> consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChassisOdometry {
    pub x_mm: f32,
    pub y_mm: f32,
    pub angle_deg: f32,
    pub vx_mm: f32,
    pub vy_mm: f32,
    pub rate_deg: f32,
}

impl From<&ChassisPosition> for ChassisOdometry {
    fn from(pos: &ChassisPosition) -> Self {
        Self {
            x_mm: pos.position_x_mm,
            y_mm: pos.position_y_mm,
            angle_deg: pos.angle_deg,
            vx_mm: pos.v_x_mm,
            vy_mm: pos.v_y_mm,
            rate_deg: pos.rate_deg,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    MotorStale,
}
