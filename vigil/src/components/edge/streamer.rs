use crate::{
    components::edge::{
        arbiter::{LightArbiter, LightArbiterController},
        cache::LatestValueCache,
        multiplexer::Multiplexer,
        scheduler::{AnalysisConfig, AnalysisScheduler},
        sensor_poller::{SensorPoller, SensorPollerController},
        transport::UdpTransport,
    },
    devices::{
        hardware::{
            bus::{Rs485Config, SharedBus},
            camera::{CameraConfig, FrameSource},
            light::LightActuator,
            lux_sensor::LuxSensor,
        },
        software::{
            store::{AnalysisStore, MemoryStore, DEFAULT_HISTORY_CAPACITY},
            vision::{ChatAssistant, OllamaVision, VisionModel},
        },
    },
    error::StreamerError,
    messages::packet::{Envelope, VideoFrame},
    utils::{
        config::from_yaml_file,
        image::{encode_jpeg, JpegQuality},
    },
};
use config::ConfigError;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::{
    ffi::OsStr,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

assert_impl_all!(Multiplexer: Send, Sync);
assert_impl_all!(LatestValueCache<VideoFrame>: Send, Sync);
assert_impl_all!(AnalysisScheduler: Send, Sync);
assert_impl_all!(LightArbiter: Send, Clone);
assert_impl_all!(UdpTransport: Send, Sync);
assert_impl_all!(MemoryStore: Send, Sync);

/// Configuration of the producer side.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StreamerConfig {
    /// Where envelopes are sent.
    pub target: SocketAddr,
    /// Frames captured and streamed per second.
    pub frame_rate: u32,
    /// Quality of streamed frames.
    pub stream_jpeg_quality: JpegQuality,
    /// Frame source.
    pub camera: CameraConfig,
    /// Vision-model settings.
    pub analysis: AnalysisConfig,
    /// Serial bus with the light tower and lux sensor. Without it the
    /// sensor is not polled and light requests are only logged.
    pub rs485: Option<Rs485Config>,
    /// Verdicts and chat exchanges kept for the chat assistant.
    pub history_capacity: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([127, 0, 0, 1], 5000)),
            frame_rate: 30,
            stream_jpeg_quality: JpegQuality::STREAM,
            camera: CameraConfig::default(),
            analysis: AnalysisConfig::default(),
            rs485: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl StreamerConfig {
    /// Build the config by reading a file.
    ///
    /// * `filepath`: path to config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        from_yaml_file(filepath)
    }

    /// Time between two captured frames.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

/// Producer side of the edge system: captures frames, streams them,
/// schedules analyses, polls the lux sensor and owns the light.
pub struct EdgeStreamer {
    /// Unique identifier for the component.
    uuid: Uuid,
    config: StreamerConfig,
    transport: Arc<UdpTransport>,
    store: Arc<MemoryStore>,
    vision: Arc<dyn VisionModel>,
    assistant: Arc<ChatAssistant>,
    frames: Box<dyn FrameSource>,
    /// Unconnected until the controller starts.
    bus: Option<SharedBus>,
}

impl EdgeStreamer {
    /// Open the frame source, the outbound socket and the model clients.
    /// Nothing runs until [`EdgeStreamerController::start`].
    pub fn new(config: StreamerConfig) -> Result<Self, StreamerError> {
        let transport = Arc::new(UdpTransport::to(config.target)?);
        let store = Arc::new(MemoryStore::new(config.history_capacity));
        let vision: Arc<dyn VisionModel> = Arc::new(OllamaVision::new(
            &config.analysis.endpoint,
            &config.analysis.model,
            config.analysis.timeout(),
        )?);
        let assistant = Arc::new(ChatAssistant::new(
            &config.analysis.completions_url,
            &config.analysis.model,
            config.analysis.timeout(),
            store.clone(),
        )?);
        let frames = config.camera.open()?;
        let bus = config.rs485.as_ref().map(Rs485Config::open_bus);

        Ok(Self {
            uuid: Uuid::new_v4(),
            config,
            transport,
            store,
            vision,
            assistant,
            frames,
            bus,
        })
    }

    /// Build the streamer from a config file.
    ///
    /// * `filepath`: path to config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, StreamerError> {
        Self::new(StreamerConfig::from_file(filepath)?)
    }

    /// Replace the vision-model client.
    pub fn with_vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = vision;
        self
    }

    /// Replace the bus opened from the `rs485` section. Ignored when that
    /// section is absent.
    pub fn with_bus(mut self, bus: SharedBus) -> Self {
        if self.config.rs485.is_some() {
            self.bus = Some(bus);
        }
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Chat assistant answering from this streamer's verdict history.
    pub fn assistant(&self) -> Arc<ChatAssistant> {
        self.assistant.clone()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Bus shared by the light and the sensor, if configured.
    pub fn bus(&self) -> Option<SharedBus> {
        self.bus.clone()
    }
}

/// Pulls frames, streams each one and offers it to the scheduler.
struct CaptureLoop {
    frames: Box<dyn FrameSource>,
    transport: Arc<UdpTransport>,
    scheduler: Arc<AnalysisScheduler>,
    quality: JpegQuality,
    period: Duration,
}

impl CaptureLoop {
    fn run(mut self, stop: &AtomicBool) {
        let mut captured: u64 = 0;
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            match self.frames.next_frame() {
                Ok(frame) => {
                    match encode_jpeg(&frame, self.quality) {
                        Ok(jpeg) => self.transport.send(&Envelope::Video(VideoFrame::new(jpeg))),
                        Err(e) => warn!(error = %e, "failed to encode frame"),
                    }
                    if self.scheduler.on_frame(&frame) {
                        debug!(frame = captured, "frame sent for analysis");
                    }
                    captured += 1;
                    if captured % 30 == 0 {
                        debug!(captured, "frames streamed");
                    }
                }
                Err(e) => error!(error = %e, "failed to capture frame"),
            }
            if let Some(rest) = self.period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

/// Extra time granted to an in-flight analysis at shutdown on top of the
/// model timeout, covering encoding and publishing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Running producer. Dropping it without [`StreamerHandle::stop`] leaves
/// the threads running.
pub struct StreamerHandle {
    uuid: Uuid,
    capture_stop: Arc<AtomicBool>,
    /// Stops the sensor poller and the light arbiter.
    stop: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
    arbiter: JoinHandle<()>,
    scheduler: Arc<AnalysisScheduler>,
    bus: Option<SharedBus>,
}

impl StreamerHandle {
    pub fn scheduler(&self) -> &AnalysisScheduler {
        &self.scheduler
    }

    /// Stop capture so no new analysis starts, wait for the analysis in
    /// flight (bounded by the model timeout), then stop the sensor and the
    /// light, which is turned off on the way out. Blocks until every thread
    /// has finished, so call it off the runtime's worker threads.
    pub fn stop(self) {
        self.capture_stop.store(true, Ordering::Relaxed);
        Self::join(self.uuid, "capture", Some(self.capture));

        let limit = self.scheduler.call_timeout() + SHUTDOWN_GRACE;
        if !self.scheduler.wait_idle(limit) {
            warn!(streamer = %self.uuid, ?limit, "analysis still running at shutdown");
        }

        self.stop.store(true, Ordering::Relaxed);
        Self::join(self.uuid, "sensor poller", self.poller);
        Self::join(self.uuid, "light arbiter", Some(self.arbiter));
        if let Some(bus) = self.bus {
            bus.lock().disconnect();
        }
        info!(streamer = %self.uuid, "streamer stopped");
    }

    fn join(streamer: Uuid, name: &str, worker: Option<JoinHandle<()>>) {
        if let Some(Err(_)) = worker.map(JoinHandle::join) {
            error!(%streamer, worker = name, "worker panicked");
        }
    }
}

/// Unit struct for running the edge streamer.
pub struct EdgeStreamerController;

impl EdgeStreamerController {
    /// Connect the bus and start every producer loop. The light and the
    /// sensor share the bus, so it is connected once here and a failure
    /// disables both; streaming and analysis still run. The poller then
    /// finds the bus connected and leaves closing it to the handle.
    ///
    /// * `streamer`: the assembled producer.
    /// * `runtime`: runtime the model calls are dispatched on.
    pub fn start(streamer: EdgeStreamer, runtime: Handle) -> StreamerHandle {
        let EdgeStreamer {
            uuid,
            config,
            transport,
            store,
            vision,
            frames,
            bus,
            ..
        } = streamer;
        let stop = Arc::new(AtomicBool::new(false));
        let target = transport.target();

        let attached = match (bus, config.rs485.as_ref()) {
            (Some(bus), Some(rs485)) => match bus.lock().connect() {
                Ok(()) => Some((bus.clone(), rs485)),
                Err(e) => {
                    error!(streamer = %uuid, error = %e, "light and sensor disabled");
                    None
                }
            },
            _ => None,
        };

        let (arbiter, arbiter_worker) = match &attached {
            Some((bus, rs485)) => {
                let actuator = Arc::new(LightActuator::new(rs485.light_control_addr, bus.clone()));
                LightArbiterController::start(actuator, stop.clone())
            }
            None => LightArbiterController::start_unattached(stop.clone()),
        };

        let poller = attached.as_ref().map(|(bus, rs485)| {
            let sensor = LuxSensor::new(rs485.light_sensor_addr, bus.clone());
            let poller = SensorPoller::new(
                sensor,
                transport.clone(),
                arbiter.clone(),
                rs485.dark_threshold_lux,
                rs485.poll_period(),
            );
            SensorPollerController::start(poller, bus.clone(), stop.clone())
        });

        let store: Arc<dyn AnalysisStore> = store;
        let scheduler = Arc::new(AnalysisScheduler::new(
            &config.analysis,
            vision,
            transport.clone(),
            store,
            arbiter,
            config.stream_jpeg_quality,
            runtime,
        ));

        let capture = CaptureLoop {
            frames,
            transport,
            scheduler: scheduler.clone(),
            quality: config.stream_jpeg_quality,
            period: config.frame_period(),
        };
        let capture_stop = Arc::new(AtomicBool::new(false));
        let capture = {
            let stop = capture_stop.clone();
            thread::spawn(move || capture.run(&stop))
        };

        info!(
            streamer = %uuid,
            target = %target,
            frame_rate = config.frame_rate,
            light_attached = attached.is_some(),
            "streamer started"
        );

        StreamerHandle {
            uuid,
            capture_stop,
            stop,
            capture,
            poller,
            arbiter: arbiter_worker,
            scheduler,
            bus: attached.map(|(bus, _)| bus),
        }
    }
}
