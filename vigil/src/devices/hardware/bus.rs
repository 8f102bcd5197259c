use crate::{
    error::{ConnectionError, DeviceError},
    utils::config::from_yaml_file,
};
use config::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, ffi::OsStr, sync::Arc, thread, time::Duration};
use tracing::{debug, info};

/// Register level contract of a master/responder serial bus (8 data bits,
/// no parity, 1 stop bit). Every call is one blocking transaction bounded
/// by the bus timeout.
pub trait RegisterBus: Send {
    /// Open the port. Must succeed before any transaction.
    fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Whether [`RegisterBus::connect`] has succeeded.
    fn is_connected(&self) -> bool;

    /// Read `count` consecutive holding registers starting at `register`.
    fn read_holding_registers(
        &mut self,
        unit: u8,
        register: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError>;

    /// Write a single holding register.
    fn write_register(&mut self, unit: u8, register: u16, value: u16) -> Result<(), DeviceError>;

    /// Close the port.
    fn disconnect(&mut self);
}

/// Bus shared by every device on the same port. The lock is held for one
/// transaction at a time, so devices never overlap on the wire.
pub type SharedBus = Arc<Mutex<dyn RegisterBus>>;

/// Bus implementations that can be selected from config.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusDevice {
    /// In-memory register file, see [`SimulatedBus`].
    #[default]
    Simulated,
}

/// Serial link and responder addresses for the light tower and the lux
/// sensor.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Rs485Config {
    /// Port the bus is attached to.
    pub serial_port: String,
    /// Line speed.
    pub baud: u32,
    /// Responder address of the light tower.
    pub light_control_addr: u8,
    /// Responder address of the lux sensor.
    pub light_sensor_addr: u8,
    /// Time between sensor polls.
    pub poll_period_ms: u64,
    /// Readings below this request the red light.
    pub dark_threshold_lux: u32,
    /// Per transaction timeout.
    pub timeout_ms: u64,
    /// Implementation behind the bus.
    pub device: BusDevice,
    /// Lux the simulated sensor reports until something changes it.
    pub simulated_lux: u32,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyTHS1".to_string(),
            baud: 9600,
            light_control_addr: 0x01,
            light_sensor_addr: 0x0B,
            poll_period_ms: 1000,
            dark_threshold_lux: 50,
            timeout_ms: 500,
            device: BusDevice::Simulated,
            simulated_lux: 300,
        }
    }
}

impl Rs485Config {
    /// Create an `Rs485Config` by reading data from a file.
    ///
    /// * `filepath`: Path to file with configuration parameters.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        from_yaml_file(filepath)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Build the bus named by `device`. The bus is returned unconnected.
    pub fn open_bus(&self) -> SharedBus {
        match self.device {
            BusDevice::Simulated => {
                let bus: SharedBus = Arc::new(Mutex::new(self.simulated_bus()));
                bus
            }
        }
    }

    /// Simulated bus on this port with the configured line settings, the
    /// lux sensor seeded with `simulated_lux`.
    pub fn simulated_bus(&self) -> SimulatedBus {
        let mut bus = SimulatedBus::new(&self.serial_port)
            .with_baud(self.baud)
            .with_timeout(self.timeout());
        bus.load_u32(
            self.light_sensor_addr,
            crate::devices::hardware::lux_sensor::LUX_HIGH_REGISTER,
            self.simulated_lux,
        );
        bus
    }
}

/// One write seen by the simulated bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub unit: u8,
    pub register: u16,
    pub value: u16,
}

/// In-memory register file standing in for the devices on the serial bus.
/// Registers that were never written read as zero.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    /// Port name, only used for logs and connection errors.
    port: String,
    /// Line speed, only used for logs.
    baud: u32,
    /// Transactions slower than this fail with [`DeviceError::Timeout`].
    timeout: Option<Duration>,
    connected: bool,
    registers: HashMap<(u8, u16), u16>,
    /// Time each read takes to be answered.
    read_delay: Duration,
    /// Time each write takes to be acknowledged.
    write_delay: Duration,
    /// When set, `connect` fails with this reason.
    connect_failure: Option<String>,
    /// Transactions touching these registers fail with the stored error.
    faults: HashMap<(u8, u16), DeviceError>,
    writes: Vec<RegisterWrite>,
}

impl SimulatedBus {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud: 9600,
            ..Default::default()
        }
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Fail any transaction whose response takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Make every read block for `delay` while holding the bus.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Make every write block for `delay` while holding the bus.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Make `connect` fail, as if the port did not exist.
    pub fn with_connect_failure(mut self, reason: &str) -> Self {
        self.connect_failure = Some(reason.to_string());
        self
    }

    /// Set a register directly, without logging it as a write.
    pub fn set_register(&mut self, unit: u8, register: u16, value: u16) {
        self.registers.insert((unit, register), value);
    }

    /// Store a 32 bit value as a high word at `register` and a low word
    /// right after it.
    pub fn load_u32(&mut self, unit: u8, register: u16, value: u32) {
        self.set_register(unit, register, (value >> 16) as u16);
        self.set_register(unit, register.wrapping_add(1), (value & 0xFFFF) as u16);
    }

    /// Fail transactions on a register until [`SimulatedBus::clear_faults`].
    pub fn inject_fault(&mut self, unit: u8, register: u16, error: DeviceError) {
        self.faults.insert((unit, register), error);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    pub fn register(&self, unit: u8, register: u16) -> u16 {
        self.registers.get(&(unit, register)).copied().unwrap_or(0)
    }

    /// Every successful write, oldest first.
    pub fn writes(&self) -> &[RegisterWrite] {
        &self.writes
    }

    fn check(&self, unit: u8, register: u16) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        match self.faults.get(&(unit, register)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Wait for the responder, giving up once the timeout has passed.
    fn respond(&self, unit: u8, register: u16, delay: Duration) -> Result<(), DeviceError> {
        match self.timeout {
            Some(timeout) if delay > timeout => {
                thread::sleep(timeout);
                Err(DeviceError::Timeout { unit, register })
            }
            _ => {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                Ok(())
            }
        }
    }
}

impl RegisterBus for SimulatedBus {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        if let Some(reason) = &self.connect_failure {
            return Err(ConnectionError {
                port: self.port.clone(),
                reason: reason.clone(),
            });
        }
        self.connected = true;
        info!(port = %self.port, baud = self.baud, timeout = ?self.timeout, "simulated bus connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_holding_registers(
        &mut self,
        unit: u8,
        register: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        for offset in 0..count {
            self.check(unit, register.wrapping_add(offset))?;
        }
        self.respond(unit, register, self.read_delay)?;
        Ok((0..count)
            .map(|offset| self.register(unit, register.wrapping_add(offset)))
            .collect())
    }

    fn write_register(&mut self, unit: u8, register: u16, value: u16) -> Result<(), DeviceError> {
        self.check(unit, register)?;
        self.respond(unit, register, self.write_delay)?;
        self.registers.insert((unit, register), value);
        self.writes.push(RegisterWrite {
            unit,
            register,
            value,
        });
        debug!(unit, register, value, "simulated register write");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
