use crate::{
    components::edge::{arbiter::LightArbiter, transport::UdpTransport},
    devices::software::{
        store::AnalysisStore,
        vision::{VerdictKind, VerdictStrategy, VisionModel},
    },
    error::ModelError,
    messages::{
        control::light::LightRequest,
        packet::{AnalysisResult, Envelope, VideoFrame},
    },
    utils::{
        image::{encode_jpeg, JpegQuality},
        time::local_now_seconds,
    },
};
use image::DynamicImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How often [`AnalysisScheduler::wait_idle`] checks the phase.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Vision-model settings for the producer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum time between two dispatched analyses.
    pub interval_secs: u64,
    /// Model tag.
    pub model: String,
    /// Base URL of the vision endpoint.
    pub endpoint: String,
    /// Completions route used by the chat assistant.
    pub completions_url: String,
    /// Upper bound on one model call.
    pub timeout_secs: u64,
    /// How the verdict is derived from the reply.
    pub verdict: VerdictKind,
    /// Quality of the frame sent to the model.
    pub analysis_jpeg_quality: JpegQuality,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            model: "gemma3:4b".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            completions_url: "http://localhost:11434/v1/completions".to_string(),
            timeout_secs: 60,
            verdict: VerdictKind::Json,
            analysis_jpeg_quality: JpegQuality::ANALYSIS,
        }
    }
}

impl AnalysisConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Whether a model call is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalysisPhase {
    Idle,
    Analyzing,
}

#[derive(Debug)]
struct SchedulerState {
    phase: AnalysisPhase,
    /// When the last analysis was dispatched.
    last_run: Option<Instant>,
}

/// Returns the scheduler to idle when the dispatched work ends, however
/// it ends.
struct IdleOnDrop(Arc<Mutex<SchedulerState>>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        self.0.lock().phase = AnalysisPhase::Idle;
    }
}

/// Everything the dispatched work needs, shared with every dispatch.
struct AnalysisJob {
    vision: Arc<dyn VisionModel>,
    strategy: Arc<dyn VerdictStrategy>,
    transport: Arc<UdpTransport>,
    store: Arc<dyn AnalysisStore>,
    arbiter: LightArbiter,
    analysis_quality: JpegQuality,
    stream_quality: JpegQuality,
    timeout: Duration,
}

impl AnalysisJob {
    async fn analyse(&self, frame: &DynamicImage) -> Result<AnalysisResult, ModelError> {
        let requested_at = local_now_seconds();
        let jpeg = encode_jpeg(frame, self.analysis_quality)?;
        let reply = tokio::time::timeout(
            self.timeout,
            self.vision.describe(&jpeg, self.strategy.prompt()),
        )
        .await
        .map_err(|_| ModelError::Timeout(self.timeout))??;
        Ok(self.strategy.extract(&reply)?.into_result(requested_at))
    }

    /// Record and publish a verdict, then forward it to the light.
    fn publish(&self, result: AnalysisResult, frame: &DynamicImage) {
        let danger = result.danger;
        self.store.append_analysis(result.clone());
        self.transport.send(&Envelope::VllmResponse(result));
        match encode_jpeg(frame, self.stream_quality) {
            Ok(jpeg) => self.transport.send(&Envelope::Video(VideoFrame::new(jpeg))),
            Err(error) => warn!(%error, "could not re-send analysed frame"),
        }
        self.arbiter.request(LightRequest::from_verdict(danger));
    }
}

/// Dispatches vision-model calls from the capture loop at most once per
/// interval, never more than one at a time, without blocking the loop.
///
/// `last_run` is set when work is dispatched rather than when it completes,
/// so ticks arriving during a slow call cannot queue up more work. A failed
/// analysis is not retried; the next due tick is the retry.
pub struct AnalysisScheduler {
    /// Unique identifier for the component.
    uuid: Uuid,
    interval: Duration,
    state: Arc<Mutex<SchedulerState>>,
    job: Arc<AnalysisJob>,
    runtime: Handle,
    dispatched: AtomicU64,
}

impl AnalysisScheduler {
    /// * `config`: interval, timeout and frame quality.
    /// * `vision`: model endpoint.
    /// * `transport`: where verdicts are published.
    /// * `store`: history the verdicts are appended to.
    /// * `arbiter`: light the danger flag is forwarded to.
    /// * `stream_quality`: quality used when re-sending the analysed frame.
    /// * `runtime`: runtime the model calls run on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &AnalysisConfig,
        vision: Arc<dyn VisionModel>,
        transport: Arc<UdpTransport>,
        store: Arc<dyn AnalysisStore>,
        arbiter: LightArbiter,
        stream_quality: JpegQuality,
        runtime: Handle,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            interval: config.interval(),
            state: Arc::new(Mutex::new(SchedulerState {
                phase: AnalysisPhase::Idle,
                last_run: None,
            })),
            job: Arc::new(AnalysisJob {
                vision,
                strategy: config.verdict.strategy(),
                transport,
                store,
                arbiter,
                analysis_quality: config.analysis_jpeg_quality,
                stream_quality,
                timeout: config.timeout(),
            }),
            runtime,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> AnalysisPhase {
        self.state.lock().phase
    }

    /// Upper bound on a single model call.
    pub fn call_timeout(&self) -> Duration {
        self.job.timeout
    }

    /// Block until the analysis in flight, if any, has finished or `limit`
    /// has passed. Returns whether the scheduler is idle. Call from a plain
    /// thread, never from a runtime worker.
    pub fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.phase() == AnalysisPhase::Analyzing {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
        true
    }

    /// Number of analyses dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Called for every captured frame. Dispatches an analysis of `frame`
    /// if the interval has elapsed and nothing is in flight. Returns
    /// whether it did.
    pub fn on_frame(&self, frame: &DynamicImage) -> bool {
        if !self.try_begin(Instant::now()) {
            return false;
        }
        let run = self.dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        let idle = IdleOnDrop(self.state.clone());
        let job = self.job.clone();
        let frame = frame.clone();
        let scheduler = self.uuid;

        self.runtime.spawn(async move {
            let _idle = idle;
            match job.analyse(&frame).await {
                Ok(result) => {
                    info!(%scheduler, run, danger = result.danger, description = %result.description, "analysis complete");
                    job.publish(result, &frame);
                }
                Err(error) => error!(%scheduler, run, %error, "analysis failed"),
            }
        });
        true
    }

    /// Move to `Analyzing` if due and idle.
    fn try_begin(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let due = state
            .last_run
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if state.phase != AnalysisPhase::Idle || !due {
            return false;
        }
        state.phase = AnalysisPhase::Analyzing;
        state.last_run = Some(now);
        true
    }
}
