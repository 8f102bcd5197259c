use crate::{
    devices::hardware::bus::SharedBus,
    error::DeviceError,
    messages::control::light::{LightCommand, LIGHT_REGISTERS},
};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Three colour tower light on the serial bus.
///
/// A transition is several register writes: clear all three colours, then
/// set one. The actuator lock spans the whole transition, so two callers
/// never see each other's half finished update. The bus lock is only taken
/// per write, which leaves the bus free for other devices in between.
pub struct LightActuator {
    /// Unique identifier for the light in the system.
    uuid: Uuid,
    /// Responder address.
    unit: u8,
    bus: SharedBus,
    transition: Mutex<()>,
}

impl LightActuator {
    /// * `unit`: responder address of the light tower.
    /// * `bus`: bus the light is wired to.
    pub fn new(unit: u8, bus: SharedBus) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            unit,
            bus,
            transition: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Apply `command` as one indivisible transition. Every write is
    /// attempted even when an earlier one fails; the first failure is
    /// returned.
    pub fn set_light(&self, command: LightCommand) -> Result<(), DeviceError> {
        let _transition = self.transition.lock();

        let mut first_error = None;
        for register in LIGHT_REGISTERS {
            if let Err(error) = self.write(register, 0) {
                first_error.get_or_insert(error);
            }
        }
        if let Some(register) = command.register() {
            if let Err(error) = self.write(register, 1) {
                first_error.get_or_insert(error);
            }
        }
        debug!(light = %self.uuid, %command, ok = first_error.is_none(), "light transition");

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write(&self, register: u16, value: u16) -> Result<(), DeviceError> {
        self.bus.lock().write_register(self.unit, register, value)
    }
}
