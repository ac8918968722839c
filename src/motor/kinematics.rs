// Mecanum kinematics for the 4-wheel chassis
// Inverse: chassis velocity (vx, vy, vw) -> motor rpm of each wheel.
// Forward: wheel encoders + gyro yaw -> chassis position and velocity.
//
// Wheel order everywhere is [front-right, front-left, back-left, back-right].

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::device::{MotorData, ENCODER_RESOLUTION};

/// Degrees per radian
pub const RADIAN_COEF: f32 = 180.0 / PI;

/// Chassis geometry (mm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MecanumParams {
    pub wheel_perimeter: f32,
    pub wheel_track: f32,
    pub wheelbase: f32,
    /// Rotation center offset from the geometric center
    pub rotate_x_offset: f32,
    pub rotate_y_offset: f32,
}

impl Default for MecanumParams {
    fn default() -> Self {
        Self {
            wheel_perimeter: 478.0,
            wheel_track: 394.0,
            wheelbase: 415.0,
            rotate_x_offset: 7.0,
            rotate_y_offset: 0.0,
        }
    }
}

impl MecanumParams {
    /// Lever arm of each wheel about the rotation center (mm)
    pub fn rotate_ratios(&self) -> [f32; 4] {
        let half = (self.wheelbase + self.wheel_track) / 2.0;
        let x = self.rotate_x_offset;
        let y = self.rotate_y_offset;
        [half - x + y, half - x - y, half + x - y, half + x + y]
    }
}

/// Platform limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MecanumLimits {
    /// mm/s
    pub max_vx: f32,
    /// mm/s
    pub max_vy: f32,
    /// deg/s
    pub max_vw: f32,
    /// Motor shaft rpm
    pub max_wheel_rpm: f32,
    /// Wheel turns per motor turn
    pub decel_ratio: f32,
}

impl Default for MecanumLimits {
    fn default() -> Self {
        Self {
            max_vx: 3300.0,
            max_vy: 3300.0,
            max_vw: 300.0,
            max_wheel_rpm: 8500.0,
            decel_ratio: 1.0 / 19.0,
        }
    }
}

/// Commanded chassis velocity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChassisSpeed {
    /// Forward (mm/s)
    pub vx: f32,
    /// Left (mm/s)
    pub vy: f32,
    /// Counter-clockwise (deg/s)
    pub vw: f32,
}

impl ChassisSpeed {
    pub fn new(vx: f32, vy: f32, vw: f32) -> Self {
        Self { vx, vy, vw }
    }
}

/// Odometry estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChassisPosition {
    pub v_x_mm: f32,
    pub v_y_mm: f32,
    pub rate_deg: f32,
    pub position_x_mm: f32,
    pub position_y_mm: f32,
    pub angle_deg: f32,
}

/// Yaw from the external gyro
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GyroReading {
    /// Absolute yaw (deg)
    pub yaw_gyro_angle: f32,
    /// deg/s
    pub yaw_gyro_rate: f32,
}

/// Per-wheel input of the odometry update
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelFeedback {
    /// Cumulative encoder counts
    pub total_ecd: f64,
    /// Motor shaft rpm
    pub speed_rpm: f32,
}

impl From<&MotorData> for WheelFeedback {
    fn from(data: &MotorData) -> Self {
        Self {
            total_ecd: data.total_ecd as f64,
            speed_rpm: data.speed_rpm as f32,
        }
    }
}

// f32::clamp panics on an inverted range; a bad limit must not take the loop down
fn saturate(value: f32, limit: f32) -> f32 {
    value.min(limit).max(-limit)
}

#[derive(Debug, Clone, Copy, Default)]
struct OdometryAccumulator {
    last_d_x: f64,
    last_d_y: f64,
    last_d_w: f64,
    position_x: f64,
    position_y: f64,
    angle_w: f64,
}

/// Kinematics state of one chassis
#[derive(Debug, Clone)]
pub struct Mecanum {
    param: MecanumParams,
    limits: MecanumLimits,
    speed: ChassisSpeed,
    position: ChassisPosition,
    gyro: GyroReading,
    wheel_rpm: [f32; 4],
    odom: OdometryAccumulator,
}

impl Default for Mecanum {
    fn default() -> Self {
        Self::new(MecanumParams::default(), MecanumLimits::default())
    }
}

impl Mecanum {
    pub fn new(param: MecanumParams, limits: MecanumLimits) -> Self {
        Self {
            param,
            limits,
            speed: ChassisSpeed::default(),
            position: ChassisPosition::default(),
            gyro: GyroReading::default(),
            wheel_rpm: [0.0; 4],
            odom: OdometryAccumulator::default(),
        }
    }

    pub fn param(&self) -> &MecanumParams {
        &self.param
    }

    pub fn limits(&self) -> &MecanumLimits {
        &self.limits
    }

    pub fn set_speed(&mut self, speed: ChassisSpeed) {
        self.speed = speed;
    }

    /// Command after the last `calculate` (saturated)
    pub fn speed(&self) -> ChassisSpeed {
        self.speed
    }

    pub fn set_gyro(&mut self, gyro: GyroReading) {
        self.gyro = gyro;
    }

    pub fn gyro(&self) -> GyroReading {
        self.gyro
    }

    pub fn wheel_rpm(&self) -> [f32; 4] {
        self.wheel_rpm
    }

    pub fn position(&self) -> ChassisPosition {
        self.position
    }

    /// Zero the integrated pose and the encoder reference
    pub fn reset_odometry(&mut self) {
        self.odom = OdometryAccumulator::default();
        self.position = ChassisPosition::default();
    }

    /// Decompose the commanded chassis velocity into motor rpm.
    ///
    /// The command is clamped per axis first. If any wheel then exceeds
    /// `max_wheel_rpm` all four are scaled by the same factor.
    pub fn calculate(&mut self) -> [f32; 4] {
        let l = self.limits;
        self.speed.vx = saturate(self.speed.vx, l.max_vx);
        self.speed.vy = saturate(self.speed.vy, l.max_vy);
        self.speed.vw = saturate(self.speed.vw, l.max_vw);

        let [fr, fl, bl, br] = self.param.rotate_ratios().map(|r| r / RADIAN_COEF);
        let wheel_rpm_ratio = 60.0 / (self.param.wheel_perimeter * l.decel_ratio);

        let ChassisSpeed { vx, vy, vw } = self.speed;
        let mut wheel_rpm = [
            (-vx - vy - vw * fr) * wheel_rpm_ratio,
            (vx - vy - vw * fl) * wheel_rpm_ratio,
            (vx + vy - vw * bl) * wheel_rpm_ratio,
            (-vx + vy - vw * br) * wheel_rpm_ratio,
        ];

        let max = wheel_rpm.iter().fold(0.0f32, |m, w| m.max(w.abs()));
        if max > l.max_wheel_rpm {
            let rate = l.max_wheel_rpm / max;
            for w in &mut wheel_rpm {
                *w *= rate;
            }
        }

        self.wheel_rpm = wheel_rpm;
        wheel_rpm
    }

    /// Integrate wheel feedback into the odometry estimate.
    ///
    /// Displacement since the previous call is rotated by the gyro yaw into
    /// the world frame before accumulation. Velocity stays in chassis frame.
    pub fn position_measure(&mut self, wheels: &[WheelFeedback; 4]) -> ChassisPosition {
        let [r_fr, r_fl, r_bl, r_br] = self.param.rotate_ratios().map(f64::from);
        let travel = (self.param.wheel_perimeter * self.limits.decel_ratio) as f64;
        let ecd_ratio = travel / (4.0 * ENCODER_RESOLUTION as f64);
        let rpm_ratio = travel / (4.0 * 60.0);

        let e = (*wheels).map(|w| w.total_ecd);
        let d_x = ecd_ratio * (-e[0] + e[1] + e[2] - e[3]);
        let d_y = ecd_ratio * (-e[0] - e[1] + e[2] + e[3]);
        let d_w = ecd_ratio * (-e[0] / r_fr - e[1] / r_fl - e[2] / r_bl - e[3] / r_br);

        let diff_x = d_x - self.odom.last_d_x;
        let diff_y = d_y - self.odom.last_d_y;
        let diff_w = d_w - self.odom.last_d_w;
        self.odom.last_d_x = d_x;
        self.odom.last_d_y = d_y;
        self.odom.last_d_w = d_w;

        let yaw = (self.gyro.yaw_gyro_angle as f64).to_radians();
        let (sin, cos) = yaw.sin_cos();
        self.odom.position_x += diff_x * cos - diff_y * sin;
        self.odom.position_y += diff_x * sin + diff_y * cos;
        self.odom.angle_w += diff_w;

        let s = (*wheels).map(|w| w.speed_rpm as f64);
        let v_x = rpm_ratio * (-s[0] + s[1] + s[2] - s[3]);
        let v_y = rpm_ratio * (-s[0] - s[1] + s[2] + s[3]);
        let v_w = rpm_ratio * (-s[0] / r_fr - s[1] / r_fl - s[2] / r_bl - s[3] / r_br);

        self.position = ChassisPosition {
            v_x_mm: v_x as f32,
            v_y_mm: v_y as f32,
            rate_deg: v_w.to_degrees() as f32,
            position_x_mm: self.odom.position_x as f32,
            position_y_mm: self.odom.position_y as f32,
            angle_deg: self.odom.angle_w.to_degrees() as f32,
        };
        self.position
    }
}
