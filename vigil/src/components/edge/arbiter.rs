use crate::{
    devices::hardware::light::LightActuator,
    messages::control::light::{LightCommand, LightRequest, LightSource},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{error, info, warn};

/// How long the worker waits for a request before checking its stop signal.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Handle for requesting light changes. Every producer holds a clone; a
/// single worker applies the requests one at a time in arrival order.
///
/// There is no precedence between sources: the last request applied
/// decides what the light shows. The source is only recorded in the log.
#[derive(Clone, Debug)]
pub struct LightArbiter {
    sender: Sender<LightRequest>,
}

impl LightArbiter {
    /// Handle and the receiving end it feeds. The worker started by
    /// [`LightArbiterController::start`] owns the receiver in production.
    pub fn channel() -> (Self, Receiver<LightRequest>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    /// Queue a request. Never blocks on the hardware.
    pub fn request(&self, request: LightRequest) {
        if self.sender.send(request).is_err() {
            warn!(command = %request.command, source = %request.source, "light arbiter has stopped, request dropped");
        }
    }

    pub fn set_light(&self, command: LightCommand, source: LightSource) {
        self.request(LightRequest::new(command, source));
    }
}

/// Unit struct for running the light arbitration worker.
pub struct LightArbiterController;

impl LightArbiterController {
    /// Start the worker thread that owns the actuator. It stops once `stop`
    /// is set or every handle is dropped, and turns the light off on the
    /// way out.
    ///
    /// * `actuator`: the light tower.
    /// * `stop`: shared stop signal.
    pub fn start(
        actuator: Arc<LightActuator>,
        stop: Arc<AtomicBool>,
    ) -> (LightArbiter, JoinHandle<()>) {
        let (arbiter, receiver) = LightArbiter::channel();
        let handle = thread::spawn(move || {
            info!(light = %actuator.uuid(), "light arbiter started");
            Self::drain(&receiver, &stop, |request| Self::apply(&actuator, request));
            Self::apply(&actuator, LightRequest::new(LightCommand::Off, LightSource::Manual));
            info!(light = %actuator.uuid(), "light arbiter stopped");
        });
        (arbiter, handle)
    }

    /// Start a worker with no light attached. Requests are accepted and
    /// logged so producers behave the same with or without the bus.
    ///
    /// * `stop`: shared stop signal.
    pub fn start_unattached(stop: Arc<AtomicBool>) -> (LightArbiter, JoinHandle<()>) {
        let (arbiter, receiver) = LightArbiter::channel();
        let handle = thread::spawn(move || {
            warn!("no light attached, light requests are only logged");
            Self::drain(&receiver, &stop, |request| {
                info!(command = %request.command, source = %request.source, "light request (no light attached)");
            });
        });
        (arbiter, handle)
    }

    /// Apply requests in arrival order until stopped or every handle is gone.
    /// Requests already queued when the stop is seen are still applied.
    fn drain(
        receiver: &Receiver<LightRequest>,
        stop: &AtomicBool,
        mut apply: impl FnMut(LightRequest),
    ) {
        while !stop.load(Ordering::Relaxed) {
            match receiver.recv_timeout(STOP_POLL) {
                Ok(request) => apply(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        receiver.try_iter().for_each(apply);
    }

    fn apply(actuator: &LightActuator, request: LightRequest) {
        match actuator.set_light(request.command) {
            Ok(()) => info!(command = %request.command, source = %request.source, "light set"),
            Err(e) => error!(command = %request.command, source = %request.source, error = %e, "failed to set light"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::hardware::bus::{RegisterBus, SimulatedBus};
    use crate::messages::control::light::{GREEN_REGISTER, RED_REGISTER, YELLOW_REGISTER};
    use parking_lot::Mutex;

    const UNIT: u8 = 0x01;

    fn lit(bus: &SimulatedBus) -> [u16; 3] {
        [
            bus.register(UNIT, GREEN_REGISTER),
            bus.register(UNIT, YELLOW_REGISTER),
            bus.register(UNIT, RED_REGISTER),
        ]
    }

    #[test]
    fn test_requests_applied_in_order_and_off_on_stop() {
        let mut bus = SimulatedBus::new("/dev/null");
        bus.connect().unwrap();
        let bus = Arc::new(Mutex::new(bus));
        let actuator = Arc::new(LightActuator::new(UNIT, bus.clone()));
        let stop = Arc::new(AtomicBool::new(false));

        let (arbiter, worker) = LightArbiterController::start(actuator, stop.clone());
        arbiter.request(LightRequest::from_verdict(true));
        arbiter.request(LightRequest::low_light());
        drop(arbiter);
        worker.join().unwrap();

        let bus = bus.lock();
        // Yellow, red, then off: three transitions of three clears, two sets.
        assert_eq!(bus.writes().len(), 11);
        assert_eq!(bus.writes()[7].register, RED_REGISTER);
        assert_eq!(bus.writes()[7].value, 1);
        assert_eq!(lit(&bus), [0, 0, 0]);
    }

    #[test]
    fn test_request_queued_before_stop_is_applied() {
        let mut bus = SimulatedBus::new("/dev/null");
        bus.connect().unwrap();
        let bus = Arc::new(Mutex::new(bus));
        let actuator = Arc::new(LightActuator::new(UNIT, bus.clone()));
        let (arbiter, receiver) = LightArbiter::channel();
        arbiter.request(LightRequest::from_verdict(true));
        let stop = AtomicBool::new(true);

        LightArbiterController::drain(&receiver, &stop, |request| {
            LightArbiterController::apply(&actuator, request)
        });
        assert_eq!(lit(&bus.lock()), [0, 1, 0]);
    }

    #[test]
    fn test_last_request_wins_across_producers() {
        let mut bus = SimulatedBus::new("/dev/null").with_write_delay(Duration::from_millis(1));
        bus.connect().unwrap();
        let bus = Arc::new(Mutex::new(bus));
        let actuator = Arc::new(LightActuator::new(UNIT, bus.clone()));
        let (arbiter, receiver) = LightArbiter::channel();

        let producers: Vec<_> = [LightRequest::from_verdict(true), LightRequest::low_light()]
            .into_iter()
            .map(|request| {
                let arbiter = arbiter.clone();
                thread::spawn(move || arbiter.request(request))
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        drop(arbiter);

        let mut last = None;
        for request in receiver {
            actuator.set_light(request.command).unwrap();
            last = Some(request.command);
        }
        let expected = match last.unwrap() {
            LightCommand::Yellow => [0, 1, 0],
            LightCommand::Red => [0, 0, 1],
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(lit(&bus.lock()), expected);
    }

    #[test]
    fn test_unattached_worker_stops_on_signal() {
        let stop = Arc::new(AtomicBool::new(false));
        let (arbiter, worker) = LightArbiterController::start_unattached(stop.clone());
        arbiter.set_light(LightCommand::Red, LightSource::Manual);
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        // The handle outlives the worker; further requests are dropped.
        arbiter.set_light(LightCommand::Green, LightSource::Manual);
    }

    #[test]
    fn test_request_after_stop_is_dropped() {
        let (arbiter, receiver) = LightArbiter::channel();
        drop(receiver);
        arbiter.set_light(LightCommand::Green, LightSource::Manual);
    }
}
