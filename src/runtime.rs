// Periodic chassis loop with watchdog
// Note: the ESC speed loop runs elsewhere; it reads the wheel targets published
// here and sends back the current commands that this loop puts on the CAN bus.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::interval;
use tracing::{debug, info, warn};

// local imports
use crate::config::{
    ChassisConfig, CMD_TIMEOUT, MOTOR_TIMEOUT, TOPIC_CAN_RX, TOPIC_CAN_TX, TOPIC_CMD_BASE,
    TOPIC_CMD_CURRENT, TOPIC_GYRO, TOPIC_HEALTH, TOPIC_ODOMETRY, TOPIC_RT_WHEELS,
};
use crate::messages::{
    ChassisCommand, ChassisOdometry, CurrentCommand, GyroSample, RuntimeHealth, WheelTargets,
};
use crate::motor::{
    CanBus, CanFrame, ChassisSpeed, DecodeState, Mecanum, MotorDriver, MotorError, MotorHandle,
    MotorOptions, WheelFeedback,
};

pub struct Runtime {
    driver: Arc<MotorDriver>,
    mecanum: Mecanum,
    wheels: [MotorHandle; 4],
    tx_frames: UnboundedReceiver<CanFrame>,
    latest_cmd: Option<ChassisCommand>,
    cmd_received_at: Instant,
    health: RuntimeHealth,
    stale_reported: bool,
    unregistered_frames: u64,
}

impl Runtime {
    /// Register the configured motors and route their command frames into a queue
    pub fn new(config: &ChassisConfig) -> Result<Self, MotorError> {
        let driver = Arc::new(MotorDriver::new());
        driver.set_tx_policy(config.tx_policy);

        for motor in &config.motors {
            let options = MotorOptions {
                calibrate_offset: motor.calibrate_offset,
            };
            driver.register_with(&motor.name, motor.bus, motor.address, options)?;
        }

        let mut found = Vec::with_capacity(4);
        for name in &config.wheels {
            found.push(driver.find(name).ok_or_else(|| {
                MotorError::InvalidArgument(format!("wheel motor {} not registered", name))
            })?);
        }
        let wheels = [found[0], found[1], found[2], found[3]];

        let (tx, tx_frames) = unbounded_channel();
        driver.set_transport(move |frame: &CanFrame| {
            // Receiver lives as long as the runtime
            let _ = tx.send(*frame);
        });

        Ok(Self {
            driver,
            mecanum: Mecanum::new(config.mecanum, config.limits),
            wheels,
            tx_frames,
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
            stale_reported: false,
            unregistered_frames: 0,
        })
    }

    pub fn driver(&self) -> &Arc<MotorDriver> {
        &self.driver
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn unregistered_frames(&self) -> u64 {
        self.unregistered_frames
    }

    /// Process incoming command
    fn on_command(&mut self, cmd: ChassisCommand, now: Instant) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = now;
    }

    fn on_gyro(&mut self, sample: &GyroSample) {
        self.mecanum.set_gyro(sample.into());
    }

    /// Store a current command from the speed loop
    fn on_current(&mut self, cmd: &CurrentCommand) {
        match self.driver.find(&cmd.name) {
            Some(handle) => {
                if let Err(e) = self.driver.set_current(handle, cmd.current) {
                    warn!("Failed to set current for {}: {}", cmd.name, e);
                }
            }
            None => warn!("Current command for unknown motor {}", cmd.name),
        }
    }

    /// Decode one feedback frame; unknown nodes are counted and skipped
    fn on_can_frame(&mut self, frame: &CanFrame) {
        match self.driver.decode_frame(frame.bus, frame.id, &frame.data) {
            Ok(()) => {}
            Err(MotorError::Unregistered { bus, address }) => {
                self.unregistered_frames += 1;
                debug!("Dropped frame from unregistered node {:?} 0x{:03X}", bus, address);
            }
            Err(e) => warn!("Failed to decode frame 0x{:03X}: {}", frame.id, e),
        }
    }

    /// Compute wheel targets based on watchdog state
    fn compute_targets(&mut self, now: Instant) -> WheelTargets {
        let cmd_age = now.saturating_duration_since(self.cmd_received_at);

        let speed = match self.latest_cmd {
            Some(ref cmd) if cmd_age <= CMD_TIMEOUT => {
                self.health = RuntimeHealth::Ok;
                ChassisSpeed::from(cmd)
            }
            Some(_) => {
                // Watchdog triggered - stop the robot
                if self.health != RuntimeHealth::CmdStale {
                    warn!("Command stale ({:?} old), stopping chassis", cmd_age);
                }
                self.health = RuntimeHealth::CmdStale;
                ChassisSpeed::default()
            }
            None => {
                self.health = RuntimeHealth::CmdStale;
                ChassisSpeed::default()
            }
        };

        self.mecanum.set_speed(speed);
        WheelTargets {
            wheel_rpm: self.mecanum.calculate(),
        }
    }

    /// Flag motors that stopped reporting
    fn check_motors(&mut self, now: Instant) {
        let stale = self.driver.stale_motors(now, MOTOR_TIMEOUT);
        if stale.is_empty() {
            if self.stale_reported {
                info!("All motors reporting again");
            }
            self.stale_reported = false;
            return;
        }
        if !self.stale_reported {
            warn!("No feedback from {} motor(s): {:?}", stale.len(), stale);
            self.stale_reported = true;
        }
        if self.health == RuntimeHealth::Ok {
            self.health = RuntimeHealth::MotorStale;
        }
    }

    /// Put pending current commands on every bus and collect the frames sent
    fn transmit(&mut self) -> Vec<CanFrame> {
        for bus in CanBus::ALL {
            match self.driver.transmit(bus) {
                Ok(_) => {}
                Err(MotorError::TransportUnavailable) => {
                    debug!("No transport for {:?}", bus)
                }
                Err(e) => warn!("Transmit on {:?} failed: {}", bus, e),
            }
        }

        let mut frames = Vec::new();
        while let Ok(frame) = self.tx_frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Integrate wheel feedback once every wheel is past calibration
    fn update_odometry(&mut self) -> Option<ChassisOdometry> {
        let mut feedback = [WheelFeedback::default(); 4];
        for (slot, handle) in feedback.iter_mut().zip(self.wheels.iter()) {
            let data = self.driver.telemetry(*handle)?;
            if data.state() != DecodeState::Tracking {
                return None;
            }
            *slot = WheelFeedback::from(&data);
        }
        let position = self.mecanum.position_measure(&feedback);
        Some(ChassisOdometry::from(&position))
    }
}

pub async fn run(
    config: ChassisConfig,
    loop_hz: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut runtime = Runtime::new(&config)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD_BASE).await?;
    let sub_current = session.declare_subscriber(TOPIC_CMD_CURRENT).await?;
    let sub_can_rx = session.declare_subscriber(TOPIC_CAN_RX).await?;
    let sub_gyro = session.declare_subscriber(TOPIC_GYRO).await?;
    let pub_wheels = session.declare_publisher(TOPIC_RT_WHEELS).await?;
    let pub_can_tx = session.declare_publisher(TOPIC_CAN_TX).await?;
    let pub_odometry = session.declare_publisher(TOPIC_ODOMETRY).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut tick = interval(Duration::from_micros(1_000_000 / loop_hz));

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout, {} motor(s)",
        loop_hz,
        CMD_TIMEOUT.as_millis(),
        config.motors.len()
    );
    info!(
        "Subscribed to: {}, {}, {}, {}",
        TOPIC_CMD_BASE, TOPIC_CMD_CURRENT, TOPIC_CAN_RX, TOPIC_GYRO
    );
    info!(
        "Publishing to: {}, {}, {}, {}",
        TOPIC_RT_WHEELS, TOPIC_CAN_TX, TOPIC_ODOMETRY, TOPIC_HEALTH
    );

    loop {
        tick.tick().await;
        let now = Instant::now();

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ChassisCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, now),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        while let Ok(Some(sample)) = sub_gyro.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<GyroSample>(&payload) {
                Ok(gyro) => runtime.on_gyro(&gyro),
                Err(e) => warn!("Failed to parse gyro sample: {}", e),
            }
        }

        // 2. Wheel targets (includes watchdog logic)
        let targets = runtime.compute_targets(now);
        pub_wheels.put(serde_json::to_string(&targets)?).await?;

        // 3. Current commands from the speed loop
        while let Ok(Some(sample)) = sub_current.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<CurrentCommand>(&payload) {
                Ok(cmd) => runtime.on_current(&cmd),
                Err(e) => warn!("Failed to parse current command: {}", e),
            }
        }

        // 4. ESC feedback
        while let Ok(Some(sample)) = sub_can_rx.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<CanFrame>(&payload) {
                Ok(frame) => runtime.on_can_frame(&frame),
                Err(e) => warn!("Failed to parse CAN frame: {}", e),
            }
        }

        // 5. Command frames
        for frame in runtime.transmit() {
            pub_can_tx.put(serde_json::to_string(&frame)?).await?;
        }

        // 6. Odometry
        if let Some(odometry) = runtime.update_odometry() {
            pub_odometry.put(serde_json::to_string(&odometry)?).await?;
        }

        // 7. Health
        runtime.check_motors(now);
        let health_json = serde_json::to_string(&runtime.health)?;
        pub_health.put(health_json).await?;
    }
}
