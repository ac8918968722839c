// CAN wire format for the chassis ESC nodes (C620-style current control)
//
// Command frames carry four big-endian i16 currents:
// [0x200] -> nodes 0x201..=0x204, [0x1FF] -> nodes 0x205..=0x208
// Feedback frames (ID = node address) carry:
// [ecd_hi, ecd_lo, rpm_hi, rpm_lo, current_hi, current_lo, ...]

use serde::{Deserialize, Serialize};

/// Number of physical CAN peripherals on the board
pub const CAN_BUS_COUNT: usize = 2;

/// Command frame IDs
pub const CMD_ID_LOW: u16 = 0x200;
pub const CMD_ID_HIGH: u16 = 0x1FF;

/// Reserved node address window
pub const NODE_ADDR_MIN: u16 = 0x201;
pub const NODE_ADDR_MAX: u16 = 0x208;

/// First address carried by the 0x1FF frame
const NODE_ADDR_HIGH_BASE: u16 = 0x205;

/// Minimum payload of a feedback frame
pub const FEEDBACK_LEN: usize = 6;

/// Physical CAN peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanBus {
    Can1,
    Can2,
}

impl CanBus {
    pub const ALL: [CanBus; CAN_BUS_COUNT] = [CanBus::Can1, CanBus::Can2];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which of the two command frames a node is packed into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlot {
    Low,
    High,
}

impl FrameSlot {
    pub fn frame_id(self) -> u16 {
        match self {
            FrameSlot::Low => CMD_ID_LOW,
            FrameSlot::High => CMD_ID_HIGH,
        }
    }

    fn index(self) -> usize {
        match self {
            FrameSlot::Low => 0,
            FrameSlot::High => 1,
        }
    }
}

/// Standard 8-byte CAN frame as handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub bus: CanBus,
    pub id: u16,
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(bus: CanBus, id: u16, data: [u8; 8]) -> Self {
        Self { bus, id, data }
    }
}

/// Error types for the motor device layer
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MotorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Motor already registered: {name} ({bus:?}, 0x{address:03X})")]
    AlreadyExists {
        name: String,
        bus: CanBus,
        address: u16,
    },

    #[error("Node address 0x{address:03X} outside 0x201..=0x208")]
    OutOfRange { address: u16 },

    #[error("No motor registered at {bus:?} 0x{address:03X}")]
    Unregistered { bus: CanBus, address: u16 },

    #[error("Motor handle does not refer to a registered device")]
    NullDevice,

    #[error("No CAN transport installed")]
    TransportUnavailable,

    #[error("Motor registry full ({max} devices)")]
    CapacityExceeded { max: usize },
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// Send function for outbound frames.
///
/// Called synchronously from `MotorDriver::transmit`, outside the registry
/// lock. Delivery is fire-and-forget from the driver's point of view.
pub trait CanTransport: Send + Sync {
    fn send(&self, frame: &CanFrame);
}

impl<F> CanTransport for F
where
    F: Fn(&CanFrame) + Send + Sync,
{
    fn send(&self, frame: &CanFrame) {
        self(frame)
    }
}

/// Check an address against the reserved window and return its frame slot
pub fn slot_for(address: u16) -> Result<FrameSlot> {
    if !(NODE_ADDR_MIN..=NODE_ADDR_MAX).contains(&address) {
        return Err(MotorError::OutOfRange { address });
    }
    if address < NODE_ADDR_HIGH_BASE {
        Ok(FrameSlot::Low)
    } else {
        Ok(FrameSlot::High)
    }
}

/// Byte offset of a node's current inside its command frame
fn slot_offset(address: u16) -> usize {
    let base = if address < NODE_ADDR_HIGH_BASE {
        NODE_ADDR_MIN
    } else {
        NODE_ADDR_HIGH_BASE
    };
    2 * (address - base) as usize
}

/// Staging buffers for one bus: [0x200 frame, 0x1FF frame]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameGroup {
    data: [[u8; 8]; 2],
    used: [bool; 2],
    dirty: [bool; 2],
}

impl FrameGroup {
    /// Pack a node's current into its slot. `dirty` marks the whole frame.
    pub fn pack(&mut self, address: u16, current: i16, dirty: bool) -> Result<()> {
        let slot = slot_for(address)?.index();
        let offset = slot_offset(address);
        self.data[slot][offset..offset + 2].copy_from_slice(&current.to_be_bytes());
        self.used[slot] = true;
        self.dirty[slot] |= dirty;
        Ok(())
    }

    pub fn is_dirty(&self, slot: FrameSlot) -> bool {
        self.dirty[slot.index()]
    }

    pub fn is_used(&self, slot: FrameSlot) -> bool {
        self.used[slot.index()]
    }

    pub fn frame(&self, bus: CanBus, slot: FrameSlot) -> CanFrame {
        CanFrame::new(bus, slot.frame_id(), self.data[slot.index()])
    }
}

/// Read a big-endian u16 at `offset`
pub fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Read a big-endian i16 at `offset`
pub fn be_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_for_window() {
        assert_eq!(slot_for(0x201), Ok(FrameSlot::Low));
        assert_eq!(slot_for(0x204), Ok(FrameSlot::Low));
        assert_eq!(slot_for(0x205), Ok(FrameSlot::High));
        assert_eq!(slot_for(0x208), Ok(FrameSlot::High));
        assert_eq!(
            slot_for(0x200),
            Err(MotorError::OutOfRange { address: 0x200 })
        );
        assert_eq!(
            slot_for(0x209),
            Err(MotorError::OutOfRange { address: 0x209 })
        );
    }

    #[test]
    fn test_pack_offsets_big_endian() {
        let mut group = FrameGroup::default();
        group.pack(0x201, 0x1234, true).unwrap();
        group.pack(0x204, -2, false).unwrap();
        group.pack(0x206, 1000, false).unwrap();

        let low = group.frame(CanBus::Can1, FrameSlot::Low);
        assert_eq!(low.id, 0x200);
        assert_eq!(low.data, [0x12, 0x34, 0, 0, 0, 0, 0xFF, 0xFE]);
        assert!(group.is_dirty(FrameSlot::Low));

        let high = group.frame(CanBus::Can1, FrameSlot::High);
        assert_eq!(high.id, 0x1FF);
        assert_eq!(high.data, [0, 0, 0x03, 0xE8, 0, 0, 0, 0]);
        assert!(group.is_used(FrameSlot::High));
        assert!(!group.is_dirty(FrameSlot::High));
    }

    #[test]
    fn test_be_helpers() {
        let data = [0x1F, 0xFF, 0xFC, 0x18, 0x00, 0x64];
        assert_eq!(be_u16(&data, 0), 8191);
        assert_eq!(be_i16(&data, 2), -1000);
        assert_eq!(be_i16(&data, 4), 100);
    }

    #[test]
    fn test_closure_transport() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = AtomicUsize::new(0);
        let transport = |_: &CanFrame| {
            count.fetch_add(1, Ordering::Relaxed);
        };
        transport.send(&CanFrame::new(CanBus::Can2, CMD_ID_LOW, [0; 8]));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
