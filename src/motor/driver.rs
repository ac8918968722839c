// Motor device layer for the chassis ESCs
//
// Owns the registry of nodes, decodes their feedback and packs the pending
// current commands into the shared command frames of each bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::can::{
    slot_for, CanBus, CanFrame, CanTransport, FrameGroup, FrameSlot, MotorError, Result,
    FEEDBACK_LEN,
};
use super::device::{MotorData, MotorDevice, MotorOptions};

/// Maximum number of nodes the layer will hold
pub const MAX_MOTOR_NUM: usize = 6;

/// Identifies a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MotorHandle {
    pub bus: CanBus,
    pub address: u16,
}

/// When a command frame is put on the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPolicy {
    /// Only frames holding a changed command
    #[default]
    OnChange,
    /// Every frame with at least one node, on every call
    Periodic,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<MotorHandle, MotorDevice>,
    policy: TxPolicy,
    next_generation: u64,
}

impl Registry {
    fn contains_name(&self, name: &str) -> bool {
        self.devices.values().any(|m| m.name() == name)
    }
}

/// Motor device layer
///
/// Shared between the periodic transmit path and the feedback receive path
/// (`Arc<MotorDriver>`). Every registry access goes through one lock; the
/// transport is only called after the lock is released.
#[derive(Default)]
pub struct MotorDriver {
    registry: Mutex<Registry>,
    transport: RwLock<Option<Arc<dyn CanTransport>>>,
}

impl MotorDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the send function used by `transmit`
    pub fn set_transport<T: CanTransport + 'static>(&self, transport: T) {
        *self.transport.write() = Some(Arc::new(transport));
    }

    pub fn clear_transport(&self) {
        *self.transport.write() = None;
    }

    pub fn set_tx_policy(&self, policy: TxPolicy) {
        self.registry.lock().policy = policy;
    }

    /// Register a node with offset calibration enabled
    pub fn register(&self, name: &str, bus: CanBus, address: u16) -> Result<MotorHandle> {
        self.register_with(name, bus, address, MotorOptions::default())
    }

    /// Register a node
    pub fn register_with(
        &self,
        name: &str,
        bus: CanBus,
        address: u16,
        options: MotorOptions,
    ) -> Result<MotorHandle> {
        if name.is_empty() {
            return Err(MotorError::InvalidArgument(
                "motor name must not be empty".to_string(),
            ));
        }
        slot_for(address)?;

        let handle = MotorHandle { bus, address };
        let mut registry = self.registry.lock();

        if registry.contains_name(name) || registry.devices.contains_key(&handle) {
            return Err(MotorError::AlreadyExists {
                name: name.to_string(),
                bus,
                address,
            });
        }
        if registry.devices.len() >= MAX_MOTOR_NUM {
            return Err(MotorError::CapacityExceeded { max: MAX_MOTOR_NUM });
        }

        let mut device = MotorDevice::new(name, bus, address, options);
        registry.next_generation += 1;
        device.generation = registry.next_generation;
        registry.devices.insert(handle, device);
        drop(registry);

        info!("Registered motor {} on {:?} at 0x{:03X}", name, bus, address);
        Ok(handle)
    }

    /// Remove a node; returns its last state
    pub fn unregister(&self, handle: MotorHandle) -> Result<MotorDevice> {
        let removed = self.registry.lock().devices.remove(&handle);
        match removed {
            Some(device) => {
                info!(
                    "Unregistered motor {} on {:?} at 0x{:03X}",
                    device.name(),
                    handle.bus,
                    handle.address
                );
                Ok(device)
            }
            None => Err(MotorError::Unregistered {
                bus: handle.bus,
                address: handle.address,
            }),
        }
    }

    pub fn find_by_address(&self, bus: CanBus, address: u16) -> Option<MotorHandle> {
        let handle = MotorHandle { bus, address };
        let registry = self.registry.lock();
        registry.devices.contains_key(&handle).then_some(handle)
    }

    pub fn find(&self, name: &str) -> Option<MotorHandle> {
        let registry = self.registry.lock();
        registry
            .devices
            .iter()
            .find(|(_, m)| m.name() == name)
            .map(|(handle, _)| *handle)
    }

    /// Registered nodes on one bus, ordered by address
    pub fn handles(&self, bus: CanBus) -> Vec<MotorHandle> {
        let registry = self.registry.lock();
        registry
            .devices
            .keys()
            .filter(|h| h.bus == bus)
            .copied()
            .collect()
    }

    /// Store a current command; sent on the next `transmit`
    pub fn set_current(&self, handle: MotorHandle, current: i16) -> Result<()> {
        let mut registry = self.registry.lock();
        let device = registry
            .devices
            .get_mut(&handle)
            .ok_or(MotorError::NullDevice)?;
        device.current = current;
        Ok(())
    }

    /// Snapshot of a node's decoded feedback
    pub fn telemetry(&self, handle: MotorHandle) -> Option<MotorData> {
        let registry = self.registry.lock();
        registry.devices.get(&handle).map(|m| *m.data())
    }

    /// Snapshot of a whole node record
    pub fn device(&self, handle: MotorHandle) -> Option<MotorDevice> {
        self.registry.lock().devices.get(&handle).cloned()
    }

    /// Decode one feedback frame into the owning node
    pub fn decode_frame(&self, bus: CanBus, address: u16, payload: &[u8]) -> Result<()> {
        self.decode_frame_at(bus, address, payload, Instant::now())
    }

    pub fn decode_frame_at(
        &self,
        bus: CanBus,
        address: u16,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        if payload.len() < FEEDBACK_LEN {
            return Err(MotorError::InvalidArgument(format!(
                "feedback frame from 0x{:03X} has {} bytes, expected {}",
                address,
                payload.len(),
                FEEDBACK_LEN
            )));
        }

        let mut registry = self.registry.lock();
        match registry.devices.get_mut(&MotorHandle { bus, address }) {
            Some(device) => {
                device.data.decode(payload, now);
                Ok(())
            }
            None => Err(MotorError::Unregistered { bus, address }),
        }
    }

    /// Nodes with no feedback within `timeout`
    pub fn stale_motors(&self, now: Instant, timeout: Duration) -> Vec<MotorHandle> {
        let registry = self.registry.lock();
        registry
            .devices
            .iter()
            .filter(|(_, m)| m.data().is_stale(now, timeout))
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Pack every node of `bus` and hand the pending frames to the transport.
    ///
    /// Returns the number of frames sent. With no transport installed the
    /// staged frames are discarded and the commands stay pending.
    pub fn transmit(&self, bus: CanBus) -> Result<usize> {
        let mut group = FrameGroup::default();
        let mut staged: Vec<(MotorHandle, u64, i16)> = Vec::new();

        {
            let registry = self.registry.lock();
            let periodic = registry.policy == TxPolicy::Periodic;
            for (handle, device) in registry.devices.iter().filter(|(h, _)| h.bus == bus) {
                group.pack(handle.address, device.current, periodic || device.is_dirty())?;
                staged.push((*handle, device.generation, device.current));
            }
        }

        let pending: Vec<CanFrame> = [FrameSlot::Low, FrameSlot::High]
            .into_iter()
            .filter(|&slot| group.is_used(slot) && group.is_dirty(slot))
            .map(|slot| group.frame(bus, slot))
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            debug!(
                "No transport installed, dropping {} frame(s) for {:?}",
                pending.len(),
                bus
            );
            return Err(MotorError::TransportUnavailable);
        };

        for frame in &pending {
            debug!("TX {:?} 0x{:03X} {:02X?}", bus, frame.id, frame.data);
            transport.send(frame);
        }

        let sent_ids: Vec<u16> = pending.iter().map(|f| f.id).collect();
        let mut registry = self.registry.lock();
        for (handle, generation, current) in staged {
            let in_sent_frame = slot_for(handle.address)
                .map(|slot| sent_ids.contains(&slot.frame_id()))
                .unwrap_or(false);
            if !in_sent_frame {
                continue;
            }
            // Device may have been removed or replaced while the lock was released
            match registry.devices.get_mut(&handle) {
                Some(device) if device.generation == generation => {
                    device.last_sent = Some(current)
                }
                Some(device) => debug!(
                    "Motor at {:?} 0x{:03X} re-registered as {} during transmit",
                    handle.bus,
                    handle.address,
                    device.name()
                ),
                None => warn!(
                    "Motor at {:?} 0x{:03X} vanished during transmit",
                    handle.bus, handle.address
                ),
            }
        }

        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::can::{CMD_ID_HIGH, CMD_ID_LOW};
    use crate::motor::device::DecodeState;

    fn recording_driver() -> (MotorDriver, Arc<Mutex<Vec<CanFrame>>>) {
        let driver = MotorDriver::new();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        driver.set_transport(move |frame: &CanFrame| sink.lock().push(*frame));
        (driver, sent)
    }

    fn feedback(ecd: u16, rpm: i16) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&ecd.to_be_bytes());
        data[2..4].copy_from_slice(&rpm.to_be_bytes());
        data
    }

    #[test]
    fn test_register_duplicate_address() {
        let driver = MotorDriver::new();
        driver.register("fr", CanBus::Can1, 0x201).unwrap();

        assert!(matches!(
            driver.register("fr", CanBus::Can1, 0x201),
            Err(MotorError::AlreadyExists { .. })
        ));
        assert!(matches!(
            driver.register("other", CanBus::Can1, 0x201),
            Err(MotorError::AlreadyExists { .. })
        ));
        // Same name on a free address is also a duplicate
        assert!(matches!(
            driver.register("fr", CanBus::Can2, 0x202),
            Err(MotorError::AlreadyExists { .. })
        ));
        // Same address on the other bus is fine
        assert!(driver.register("fr2", CanBus::Can2, 0x201).is_ok());
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let driver = MotorDriver::new();
        assert!(matches!(
            driver.register("", CanBus::Can1, 0x201),
            Err(MotorError::InvalidArgument(_))
        ));
        assert_eq!(
            driver.register("low", CanBus::Can1, 0x200),
            Err(MotorError::OutOfRange { address: 0x200 })
        );
        assert_eq!(
            driver.register("high", CanBus::Can1, 0x209),
            Err(MotorError::OutOfRange { address: 0x209 })
        );
        assert!(driver.handles(CanBus::Can1).is_empty());
    }

    #[test]
    fn test_register_capacity() {
        let driver = MotorDriver::new();
        for (i, address) in (0x201..=0x206).enumerate() {
            driver
                .register(&format!("m{}", i), CanBus::Can1, address)
                .unwrap();
        }
        assert_eq!(
            driver.register("m6", CanBus::Can1, 0x207),
            Err(MotorError::CapacityExceeded { max: MAX_MOTOR_NUM })
        );
    }

    #[test]
    fn test_find_and_unregister() {
        let driver = MotorDriver::new();
        let handle = driver.register("bl", CanBus::Can2, 0x203).unwrap();

        assert_eq!(driver.find_by_address(CanBus::Can2, 0x203), Some(handle));
        assert_eq!(driver.find_by_address(CanBus::Can1, 0x203), None);
        assert_eq!(driver.find("bl"), Some(handle));
        assert_eq!(driver.find("nope"), None);

        let removed = driver.unregister(handle).unwrap();
        assert_eq!(removed.name(), "bl");
        assert_eq!(driver.find("bl"), None);
        assert!(matches!(
            driver.unregister(handle),
            Err(MotorError::Unregistered { .. })
        ));
        assert_eq!(driver.set_current(handle, 1), Err(MotorError::NullDevice));
        assert_eq!(driver.telemetry(handle), None);
    }

    #[test]
    fn test_decode_unregistered_does_not_mutate() {
        let driver = MotorDriver::new();
        let handle = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        let before = driver.telemetry(handle).unwrap();

        assert_eq!(
            driver.decode_frame(CanBus::Can1, 0x202, &feedback(100, 5)),
            Err(MotorError::Unregistered {
                bus: CanBus::Can1,
                address: 0x202
            })
        );
        assert_eq!(
            driver.decode_frame(CanBus::Can2, 0x201, &feedback(100, 5)),
            Err(MotorError::Unregistered {
                bus: CanBus::Can2,
                address: 0x201
            })
        );
        assert_eq!(driver.telemetry(handle).unwrap(), before);
    }

    #[test]
    fn test_decode_short_frame() {
        let driver = MotorDriver::new();
        let handle = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        assert!(matches!(
            driver.decode_frame(CanBus::Can1, 0x201, &[0, 1, 2]),
            Err(MotorError::InvalidArgument(_))
        ));
        assert_eq!(driver.telemetry(handle).unwrap().msg_cnt, 0);
    }

    #[test]
    fn test_decode_leaves_calibration() {
        let driver = MotorDriver::new();
        let handle = driver.register("fr", CanBus::Can1, 0x201).unwrap();

        for _ in 0..51 {
            driver
                .decode_frame(CanBus::Can1, 0x201, &feedback(4000, 0))
                .unwrap();
        }
        driver
            .decode_frame(CanBus::Can1, 0x201, &feedback(4100, 120))
            .unwrap();

        let data = driver.telemetry(handle).unwrap();
        assert_eq!(data.offset_ecd, 4000);
        assert_eq!(data.state(), DecodeState::Tracking);
        assert_eq!(data.total_ecd, 100);
        assert_eq!(data.speed_rpm, 120);
    }

    #[test]
    fn test_transmit_empty_bus_sends_nothing() {
        let (driver, sent) = recording_driver();
        driver.register("fr", CanBus::Can1, 0x201).unwrap();

        assert_eq!(driver.transmit(CanBus::Can2), Ok(0));
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_transmit_packs_both_frames() {
        let (driver, sent) = recording_driver();
        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        let br = driver.register("br", CanBus::Can1, 0x204).unwrap();
        let yaw = driver.register("yaw", CanBus::Can1, 0x206).unwrap();
        driver.set_current(fr, 1000).unwrap();
        driver.set_current(br, -1000).unwrap();
        driver.set_current(yaw, 0x0102).unwrap();

        assert_eq!(driver.transmit(CanBus::Can1), Ok(2));

        let frames = sent.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, CMD_ID_LOW);
        assert_eq!(frames[0].bus, CanBus::Can1);
        assert_eq!(frames[0].data, [0x03, 0xE8, 0, 0, 0, 0, 0xFC, 0x18]);
        assert_eq!(frames[1].id, CMD_ID_HIGH);
        assert_eq!(frames[1].data, [0, 0, 0x01, 0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn test_transmit_only_on_change() {
        let (driver, sent) = recording_driver();
        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        let yaw = driver.register("yaw", CanBus::Can1, 0x205).unwrap();

        assert_eq!(driver.transmit(CanBus::Can1), Ok(2));
        assert_eq!(driver.transmit(CanBus::Can1), Ok(0));

        driver.set_current(fr, 10).unwrap();
        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert_eq!(sent.lock().last().unwrap().id, CMD_ID_LOW);

        // Writing the same value again is not a change
        driver.set_current(fr, 10).unwrap();
        driver.set_current(yaw, 0).unwrap();
        assert_eq!(driver.transmit(CanBus::Can1), Ok(0));
        assert_eq!(sent.lock().len(), 3);
    }

    #[test]
    fn test_transmit_periodic_policy() {
        let (driver, sent) = recording_driver();
        driver.set_tx_policy(TxPolicy::Periodic);
        driver.register("fr", CanBus::Can1, 0x201).unwrap();

        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert_eq!(sent.lock().len(), 2);
    }

    #[test]
    fn test_transmit_without_transport() {
        let driver = MotorDriver::new();
        assert_eq!(driver.transmit(CanBus::Can1), Ok(0));

        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        driver.set_current(fr, 500).unwrap();
        assert_eq!(
            driver.transmit(CanBus::Can1),
            Err(MotorError::TransportUnavailable)
        );
        assert!(driver.device(fr).unwrap().is_dirty());

        // Command goes out once a transport shows up
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        driver.set_transport(move |frame: &CanFrame| sink.lock().push(*frame));
        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert_eq!(sent.lock()[0].data[0..2], 500i16.to_be_bytes());
        assert!(!driver.device(fr).unwrap().is_dirty());

        driver.clear_transport();
        driver.set_current(fr, 0).unwrap();
        assert_eq!(
            driver.transmit(CanBus::Can1),
            Err(MotorError::TransportUnavailable)
        );
    }

    #[test]
    fn test_reregistered_during_send_stays_dirty() {
        use std::sync::Weak;
        use std::sync::atomic::{AtomicBool, Ordering};

        let driver = Arc::new(MotorDriver::new());
        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        driver.set_current(fr, 500).unwrap();

        // Swap the node for a new one with the same command while the frame is on the wire
        let weak: Weak<MotorDriver> = Arc::downgrade(&driver);
        let swapped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&swapped);
        driver.set_transport(move |_: &CanFrame| {
            let Some(driver) = weak.upgrade() else { return };
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            driver.unregister(fr).unwrap();
            let new = driver.register("fr_new", CanBus::Can1, 0x201).unwrap();
            driver.set_current(new, 500).unwrap();
        });

        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert!(swapped.load(Ordering::SeqCst));

        // The frame carried the old node's command, not the new node's
        let device = driver.device(fr).unwrap();
        assert_eq!(device.name(), "fr_new");
        assert!(device.is_dirty());

        // Next cycle sends it and settles
        assert_eq!(driver.transmit(CanBus::Can1), Ok(1));
        assert!(!driver.device(fr).unwrap().is_dirty());
    }

    #[test]
    fn test_stale_motors() {
        let driver = MotorDriver::new();
        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();
        let fl = driver.register("fl", CanBus::Can1, 0x202).unwrap();
        let start = Instant::now();

        driver
            .decode_frame_at(CanBus::Can1, 0x201, &feedback(0, 0), start)
            .unwrap();

        let timeout = Duration::from_millis(100);
        assert_eq!(driver.stale_motors(start, timeout), vec![fl]);
        assert_eq!(
            driver.stale_motors(start + Duration::from_millis(200), timeout),
            vec![fr, fl]
        );
    }

    #[test]
    fn test_concurrent_decode_and_transmit() {
        let (driver, sent) = recording_driver();
        let driver = Arc::new(driver);
        driver.set_tx_policy(TxPolicy::Periodic);
        let fr = driver.register("fr", CanBus::Can1, 0x201).unwrap();

        let rx = {
            let driver = Arc::clone(&driver);
            std::thread::spawn(move || {
                for i in 0..1000u16 {
                    driver
                        .decode_frame(CanBus::Can1, 0x201, &feedback(i % 8192, 0))
                        .unwrap();
                }
            })
        };
        for i in 0..1000i16 {
            driver.set_current(fr, i).unwrap();
            driver.transmit(CanBus::Can1).unwrap();
        }
        rx.join().unwrap();

        assert_eq!(driver.telemetry(fr).unwrap().msg_cnt, 1000);
        assert_eq!(sent.lock().len(), 1000);
    }
}
