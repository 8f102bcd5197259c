use crate::{
    devices::hardware::bus::SharedBus,
    error::{DeviceError, SensorError},
    messages::packet::Lux,
};
use std::{thread, time::Duration};
use uuid::Uuid;

/// High word of the 32 bit lux value.
pub const LUX_HIGH_REGISTER: u16 = 0x0007;
/// Low word of the 32 bit lux value.
pub const LUX_LOW_REGISTER: u16 = 0x0008;

/// Settling time before and after each read. The sensor returns stale or
/// garbled words if polled back to back.
pub const SETTLE_DELAY: Duration = Duration::from_millis(20);

/// Ambient light sensor on the serial bus.
pub struct LuxSensor {
    /// Unique identifier for the sensor in the system.
    uuid: Uuid,
    /// Responder address.
    unit: u8,
    bus: SharedBus,
    settle: Duration,
}

impl LuxSensor {
    /// * `unit`: responder address of the sensor.
    /// * `bus`: bus the sensor is wired to.
    pub fn new(unit: u8, bus: SharedBus) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            unit,
            bus,
            settle: SETTLE_DELAY,
        }
    }

    /// Override the settling delay.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Read both lux words in one transaction and validate the result.
    /// The bus is only held for the transaction, not the settling delays.
    pub fn read_lux(&self) -> Result<Lux, SensorError> {
        thread::sleep(self.settle);
        let words = self
            .bus
            .lock()
            .read_holding_registers(self.unit, LUX_HIGH_REGISTER, 2);
        thread::sleep(self.settle);

        match words?.as_slice() {
            &[high, low] => Ok(Lux::try_from(combine_words(high, low))?),
            other => Err(DeviceError::ShortResponse {
                expected: 2,
                got: other.len(),
            }
            .into()),
        }
    }
}

/// `(high << 16) | low`, widened so that nothing is lost before the range
/// check.
pub fn combine_words(high: u16, low: u16) -> i64 {
    (i64::from(high) << 16) | i64::from(low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::hardware::bus::{RegisterBus, SimulatedBus};
    use crate::error::RangeError;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::Arc;

    fn sensor_reading(value: u32) -> (Arc<Mutex<SimulatedBus>>, LuxSensor) {
        let mut bus = SimulatedBus::new("/dev/null");
        bus.connect().unwrap();
        bus.load_u32(0x0B, LUX_HIGH_REGISTER, value);
        let bus = Arc::new(Mutex::new(bus));
        let sensor = LuxSensor::new(0x0B, bus.clone()).with_settle_delay(Duration::ZERO);
        (bus, sensor)
    }

    #[rstest]
    #[case(0x0000, 0x0000, 0)]
    #[case(0x0000, 0x0032, 50)]
    #[case(0x0001, 0x86A0, 100_000)]
    #[case(0xFFFF, 0xFFFF, 0xFFFF_FFFF)]
    fn test_combine_words(#[case] high: u16, #[case] low: u16, #[case] expected: i64) {
        assert_eq!(combine_words(high, low), expected);
    }

    #[rstest]
    #[case(0, true)]
    #[case(50, true)]
    #[case(100_000, true)]
    #[case(100_001, false)]
    fn test_read_lux_bounds(#[case] value: u32, #[case] accepted: bool) {
        let (_bus, sensor) = sensor_reading(value);
        match sensor.read_lux() {
            Ok(lux) => {
                assert!(accepted);
                assert_eq!(lux.get(), value);
            }
            Err(SensorError::Range(RangeError { value: raw, .. })) => {
                assert!(!accepted);
                assert_eq!(raw, i64::from(value));
            }
            Err(other) => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_device_error_is_no_reading() {
        let (bus, sensor) = sensor_reading(300);
        bus.lock().inject_fault(
            0x0B,
            LUX_LOW_REGISTER,
            DeviceError::Exception {
                unit: 0x0B,
                register: LUX_LOW_REGISTER,
                code: 0x02,
            },
        );
        assert!(matches!(sensor.read_lux(), Err(SensorError::Device(_))));

        bus.lock().clear_faults();
        assert_eq!(sensor.read_lux().unwrap().get(), 300);
    }

    #[test]
    fn test_unanswered_read_times_out() {
        let mut bus = SimulatedBus::new("/dev/null")
            .with_read_delay(Duration::from_millis(30))
            .with_timeout(Duration::from_millis(2));
        bus.connect().unwrap();
        let sensor = LuxSensor::new(0x0B, Arc::new(Mutex::new(bus)))
            .with_settle_delay(Duration::ZERO);
        assert_eq!(
            sensor.read_lux(),
            Err(SensorError::Device(DeviceError::Timeout {
                unit: 0x0B,
                register: LUX_HIGH_REGISTER
            }))
        );
    }
}
