// Per-node record and feedback decoding
//
// Each ESC reports its rotor encoder (0..8191 per turn), speed and current.
// The first frames after power-up are taken as the encoder zero reference.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::can::{be_i16, be_u16, CanBus};

/// Encoder counts per mechanical turn
pub const ENCODER_RESOLUTION: i32 = 8192;
const HALF_TURN: i32 = ENCODER_RESOLUTION / 2;

/// Encoder counts per degree
pub const ENCODER_ANGLE_RATIO: f32 = 8192.0 / 360.0;

/// Frames spent collecting the zero reference
pub const OFFSET_WARMUP_FRAMES: u32 = 50;

/// Decoded feedback of one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorData {
    pub ecd: u16,
    pub last_ecd: u16,
    pub round_cnt: i64,
    pub total_ecd: i64,
    /// Cumulative angle in degrees
    pub total_angle: f32,
    /// Short-way encoder delta of the last frame
    pub ecd_delta: i32,
    pub speed_rpm: i16,
    pub given_current: i16,
    pub offset_ecd: u16,
    pub msg_cnt: u32,
    pub calibrating: bool,
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl MotorData {
    fn new(calibrate_offset: bool) -> Self {
        Self {
            ecd: 0,
            last_ecd: 0,
            round_cnt: 0,
            total_ecd: 0,
            total_angle: 0.0,
            ecd_delta: 0,
            speed_rpm: 0,
            given_current: 0,
            offset_ecd: 0,
            msg_cnt: 0,
            calibrating: calibrate_offset,
            last_update: None,
        }
    }

    /// Current state of the decode state machine
    pub fn state(&self) -> DecodeState {
        if self.calibrating {
            DecodeState::Calibrating
        } else {
            DecodeState::Tracking
        }
    }

    /// True if no frame arrived within `timeout` of `now`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_update {
            Some(at) => now.saturating_duration_since(at) > timeout,
            None => true,
        }
    }

    /// Feed one feedback payload (at least 6 bytes) through the state machine
    pub fn decode(&mut self, payload: &[u8], now: Instant) {
        self.msg_cnt = self.msg_cnt.saturating_add(1);
        self.last_update = Some(now);

        // Leaves calibration after the warm-up even if nobody asked for it
        if self.msg_cnt > OFFSET_WARMUP_FRAMES {
            self.calibrating = false;
        }

        if self.calibrating {
            self.ecd = be_u16(payload, 0);
            self.offset_ecd = self.ecd;
            return;
        }

        self.last_ecd = self.ecd;
        self.ecd = be_u16(payload, 0);

        let raw = self.ecd as i32 - self.last_ecd as i32;
        self.ecd_delta = if raw > HALF_TURN {
            self.round_cnt -= 1;
            raw - ENCODER_RESOLUTION
        } else if raw < -HALF_TURN {
            self.round_cnt += 1;
            raw + ENCODER_RESOLUTION
        } else {
            raw
        };

        self.total_ecd = self.round_cnt * ENCODER_RESOLUTION as i64 + self.ecd as i64
            - self.offset_ecd as i64;
        self.total_angle = self.total_ecd as f32 / ENCODER_ANGLE_RATIO;
        self.speed_rpm = be_i16(payload, 2);
        self.given_current = be_i16(payload, 4);
    }
}

/// Decode state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Calibrating,
    Tracking,
}

/// Registration options
#[derive(Debug, Clone, Copy)]
pub struct MotorOptions {
    /// Capture the encoder zero reference during warm-up
    pub calibrate_offset: bool,
}

impl Default for MotorOptions {
    fn default() -> Self {
        Self {
            calibrate_offset: true,
        }
    }
}

/// One registered ESC node
#[derive(Debug, Clone)]
pub struct MotorDevice {
    name: String,
    bus: CanBus,
    address: u16,
    /// Registration sequence number; a re-registered address gets a new one
    pub(crate) generation: u64,
    pub(crate) current: i16,
    pub(crate) last_sent: Option<i16>,
    pub(crate) data: MotorData,
}

impl MotorDevice {
    pub(crate) fn new(name: &str, bus: CanBus, address: u16, options: MotorOptions) -> Self {
        Self {
            name: name.to_string(),
            bus,
            address,
            generation: 0,
            current: 0,
            last_sent: None,
            data: MotorData::new(options.calibrate_offset),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> CanBus {
        self.bus
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Current command waiting to be transmitted
    pub fn current(&self) -> i16 {
        self.current
    }

    pub fn data(&self) -> &MotorData {
        &self.data
    }

    /// Command changed since the last successful send
    pub fn is_dirty(&self) -> bool {
        self.last_sent != Some(self.current)
    }
}
