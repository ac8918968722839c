// Motor control module for the mecanum chassis
//
// Provides:
// - CAN wire format of the chassis ESCs
// - Per-node feedback decoding (encoder unwrapping, zero offset)
// - Motor device layer: registry, command packing, transmit
// - Mecanum inverse kinematics and wheel odometry

pub mod can;
pub mod device;
mod driver;
pub mod kinematics;

pub use can::{CanBus, CanFrame, CanTransport, MotorError};
pub use device::{DecodeState, MotorData, MotorDevice, MotorOptions};
pub use driver::{MotorDriver, MotorHandle, TxPolicy, MAX_MOTOR_NUM};
pub use kinematics::{ChassisPosition, ChassisSpeed, GyroReading, Mecanum, WheelFeedback};
