use crate::{
    components::edge::{arbiter::LightArbiter, transport::UdpTransport},
    devices::hardware::{bus::SharedBus, lux_sensor::LuxSensor},
    messages::{
        control::light::LightRequest,
        packet::{Envelope, SensorReading},
    },
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reads the lux sensor, publishes each good reading and asks for the red
/// light whenever it is too dark.
pub struct SensorPoller {
    /// Unique identifier for the component.
    uuid: Uuid,
    sensor: LuxSensor,
    transport: Arc<UdpTransport>,
    arbiter: LightArbiter,
    /// Readings strictly below this are too dark.
    dark_threshold: u32,
    period: Duration,
}

impl SensorPoller {
    /// * `sensor`: the lux sensor.
    /// * `transport`: where readings are published.
    /// * `arbiter`: light the low light request goes to.
    /// * `dark_threshold`: lux below which red is requested.
    /// * `period`: time between polls.
    pub fn new(
        sensor: LuxSensor,
        transport: Arc<UdpTransport>,
        arbiter: LightArbiter,
        dark_threshold: u32,
        period: Duration,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            sensor,
            transport,
            arbiter,
            dark_threshold,
            period,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// One poll cycle. A failed or out of range read publishes nothing and
    /// leaves the light alone.
    pub fn poll_once(&self) -> Option<SensorReading> {
        let lux = match self.sensor.read_lux() {
            Ok(lux) => lux,
            Err(e) => {
                warn!(sensor = %self.sensor.uuid(), error = %e, "lux read failed");
                return None;
            }
        };
        let reading = SensorReading::now(Some(lux));
        self.transport.send(&Envelope::SensorData(reading.clone()));
        debug!(lux = lux.get(), "lux reading published");

        if lux.get() < self.dark_threshold {
            info!(lux = lux.get(), threshold = self.dark_threshold, "too dark, requesting red");
            self.arbiter.request(LightRequest::low_light());
        }
        Some(reading)
    }
}

/// Unit struct for running the sensor poller.
pub struct SensorPollerController;

impl SensorPollerController {
    /// Start the polling thread, connecting the bus if needed. If the bus
    /// cannot be connected the thread logs the failure and exits; nothing
    /// else is affected.
    ///
    /// * `poller`: what to poll.
    /// * `bus`: bus shared with the light, connected here if needed.
    /// * `stop`: shared stop signal.
    pub fn start(poller: SensorPoller, bus: SharedBus, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::spawn(move || {
            // A bus connected by someone else is left for them to close.
            let owns_connection = {
                let mut bus = bus.lock();
                if bus.is_connected() {
                    false
                } else if let Err(e) = bus.connect() {
                    error!(poller = %poller.uuid(), error = %e, "sensor polling disabled");
                    return;
                } else {
                    true
                }
            };
            info!(poller = %poller.uuid(), period = ?poller.period, "sensor polling started");

            while !stop.load(Ordering::Relaxed) {
                let started = Instant::now();
                poller.poll_once();
                Self::sleep_until(started + poller.period, &stop);
            }

            if owns_connection {
                bus.lock().disconnect();
            }
            info!(poller = %poller.uuid(), "sensor polling stopped");
        })
    }

    /// Sleep in short steps so that a stop request is seen promptly.
    fn sleep_until(deadline: Instant, stop: &AtomicBool) {
        const STEP: Duration = Duration::from_millis(50);
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep((deadline - now).min(STEP));
        }
    }
}
