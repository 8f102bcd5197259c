use crate::{
    components::edge::{
        cache::{LatestValueCache, Stamped},
        chart::ChartReceiver,
        transport::bind_inbound,
    },
    error::{DecodeError, TransportError},
    messages::{
        codec::{Decoded, PacketCodec},
        packet::{AnalysisResult, Envelope, PacketKind, SensorReading, VideoFrame},
    },
    utils::config::from_yaml_file,
};
use config::ConfigError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::{sync::CancellationToken, udp::UdpFramed};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A progress line is logged every this many video frames.
pub const FRAME_LOG_INTERVAL: u64 = 30;

/// Where the viewer listens.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Address of the multiplexed channel.
    pub bind: SocketAddr,
    /// Address of the chart channel, `None` to disable it.
    pub chart_bind: Option<SocketAddr>,
    /// How often the viewer logs a snapshot of the caches.
    pub status_period_secs: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            chart_bind: Some(SocketAddr::from(([0, 0, 0, 0], 5002))),
            status_period_secs: 5,
        }
    }
}

impl MultiplexerConfig {
    /// Build the config by reading a file.
    ///
    /// * `filepath`: path to config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        from_yaml_file(filepath)
    }

    pub fn status_period(&self) -> Duration {
        Duration::from_secs(self.status_period_secs.max(1))
    }
}

/// Counters over every datagram the multiplexer has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    /// Datagrams decoded into a known kind.
    pub accepted: u64,
    /// Of which video frames.
    pub video_frames: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Well formed envelopes of an unknown kind.
    pub unknown: u64,
}

/// One cache per kind, each with its own lock, so a slow reader of one kind
/// never holds up ingestion of another.
#[derive(Default)]
struct Channels {
    video: LatestValueCache<VideoFrame>,
    description: LatestValueCache<AnalysisResult>,
    vllm_response: LatestValueCache<AnalysisResult>,
    sensor_data: LatestValueCache<SensorReading>,
    accepted: AtomicU64,
    video_frames: AtomicU64,
    malformed: AtomicU64,
    unknown: AtomicU64,
}

impl Channels {
    fn ingest(&self, decoded: Result<Decoded, DecodeError>, peer: Option<SocketAddr>) {
        match decoded {
            Ok(Decoded::Packet(envelope)) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.store(envelope);
            }
            Ok(Decoded::UnknownKind(kind)) => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, ?peer, "dropping envelope of unknown kind");
            }
            Err(error) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%error, ?peer, "dropping malformed datagram");
            }
        }
    }

    fn store(&self, envelope: Envelope) {
        debug!(kind = %envelope.kind(), "caching envelope");
        match envelope {
            Envelope::Video(frame) => {
                let frames = self.video_frames.fetch_add(1, Ordering::Relaxed) + 1;
                if frames % FRAME_LOG_INTERVAL == 0 {
                    info!(frames, size = frame.bytes.len(), "receiving video");
                }
                self.video.put(frame);
            }
            Envelope::Description(result) => self.description.put(result),
            Envelope::VllmResponse(result) => self.vllm_response.put(result),
            Envelope::SensorData(reading) => self.sensor_data.put(reading),
        }
    }

    fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

/// Owns the inbound socket and its receive loop, and routes each decoded
/// envelope into the cache for its kind. Constructed and owned by the
/// caller, with an explicit start and stop.
pub struct Multiplexer {
    /// Unique identifier for the component.
    uuid: Uuid,
    config: MultiplexerConfig,
    channels: Arc<Channels>,
    chart: Option<ChartReceiver>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Multiplexer {
    /// Generate a new component by consuming a config.
    ///
    /// * `config`: `MultiplexerConfig`
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            chart: config.chart_bind.map(ChartReceiver::new),
            config,
            channels: Arc::new(Channels::default()),
            cancel: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    /// Generate a new component from the config stored in a file.
    ///
    /// * `filepath`: filepath to a config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        Ok(Self::new(MultiplexerConfig::from_file(filepath)?))
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Bind the sockets and start the receive loops. Returns the bound
    /// address of the multiplexed channel. Starting twice is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        if let (Some(local), true) = (self.local_addr, self.is_running()) {
            warn!(component = %self.uuid, %local, "multiplexer already running");
            return Ok(local);
        }

        let socket = bind_inbound(self.config.bind).await?;
        let local = socket.local_addr().unwrap_or(self.config.bind);
        if let Some(chart) = self.chart.as_mut() {
            chart.start().await?;
        }

        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(receive_loop(
            socket,
            self.channels.clone(),
            self.cancel.clone(),
        )));
        self.local_addr = Some(local);
        info!(component = %self.uuid, %local, "multiplexer started");
        Ok(local)
    }

    /// Stop the receive loops and wait for them to end. Cached values stay
    /// readable.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(chart) = self.chart.as_mut() {
            chart.stop().await;
        }
        self.local_addr = None;
        info!(component = %self.uuid, stats = ?self.stats(), "multiplexer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Decode one datagram and route it, exactly as the receive loop does.
    pub fn handle_datagram(&self, datagram: &[u8]) {
        self.channels.ingest(PacketCodec.decode(datagram), None);
    }

    /// Copy of the latest value of `kind`, wrapped as an envelope.
    pub fn get(&self, kind: PacketKind) -> Option<Envelope> {
        match kind {
            PacketKind::Video => self.latest_frame().map(Envelope::Video),
            PacketKind::Description => self.latest_description().map(Envelope::Description),
            PacketKind::VllmResponse => self.latest_vllm_response().map(Envelope::VllmResponse),
            PacketKind::SensorData => self.latest_sensor_data().map(Envelope::SensorData),
        }
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.channels.video.get()
    }

    pub fn latest_description(&self) -> Option<AnalysisResult> {
        self.channels.description.get()
    }

    pub fn latest_vllm_response(&self) -> Option<AnalysisResult> {
        self.channels.vllm_response.get()
    }

    /// Whichever of `description` and `vllm_response` arrived last.
    pub fn latest_analysis(&self) -> Option<AnalysisResult> {
        let latest = match (
            self.channels.description.snapshot(),
            self.channels.vllm_response.snapshot(),
        ) {
            (Some(description), Some(response)) => {
                if response.arrival >= description.arrival {
                    response
                } else {
                    description
                }
            }
            (description, response) => response.or(description)?,
        };
        Some(latest.value)
    }

    pub fn latest_sensor_data(&self) -> Option<SensorReading> {
        self.channels.sensor_data.get()
    }

    /// Latest sensor reading with its arrival time.
    pub fn sensor_snapshot(&self) -> Option<Stamped<SensorReading>> {
        self.channels.sensor_data.snapshot()
    }

    /// Latest chart document, `None` when nothing arrived or the chart
    /// channel is disabled.
    pub fn latest_chart_data(&self) -> Option<serde_json::Value> {
        self.chart.as_ref().and_then(ChartReceiver::latest)
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.channels.stats()
    }
}

async fn receive_loop(socket: UdpSocket, channels: Arc<Channels>, cancel: CancellationToken) {
    let mut framed = UdpFramed::new(socket, PacketCodec);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok((decoded, peer))) => channels.ingest(decoded, Some(peer)),
                Some(Err(error)) => warn!(%error, "receive failed"),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::edge::transport::UdpTransport,
        messages::packet::Lux,
    };
    use rstest::rstest;
    use serial_test::serial;
    use std::fs::OpenOptions;

    fn multiplexer() -> Multiplexer {
        Multiplexer::new(MultiplexerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            chart_bind: None,
            status_period_secs: 1,
        })
    }

    fn is_untouched(multiplexer: &Multiplexer) -> bool {
        use strum::IntoEnumIterator;
        PacketKind::iter().all(|kind| multiplexer.get(kind).is_none())
    }

    #[rstest]
    #[case(br#"{"type": "telemetry", "data": {"lux": 10}}"#.to_vec())]
    #[case(br#"{"type": "Video", "data": "AQID"}"#.to_vec())]
    #[case(br#"{"type": "", "data": null}"#.to_vec())]
    fn test_unknown_kind_is_dropped(#[case] datagram: Vec<u8>) {
        let multiplexer = multiplexer();
        multiplexer.handle_datagram(&datagram);
        assert!(is_untouched(&multiplexer));
        assert_eq!(multiplexer.stats().unknown, 1);
    }

    #[rstest]
    #[case(b"garbage".to_vec())]
    #[case(br#"{"type": "sensor_data", "data": {"lux": 100001, "unit": "Lux", "timestamp": 1.0}}"#.to_vec())]
    #[case(vec![])]
    fn test_malformed_is_dropped(#[case] datagram: Vec<u8>) {
        let multiplexer = multiplexer();
        multiplexer.handle_datagram(&datagram);
        assert!(is_untouched(&multiplexer));
        assert_eq!(multiplexer.stats().malformed, 1);
    }

    #[test]
    fn test_routes_by_kind_last_write_wins() {
        let multiplexer = multiplexer();
        let codec = PacketCodec;
        for lux in [400, 30] {
            let reading = SensorReading::now(Lux::try_from(lux).ok());
            multiplexer.handle_datagram(&codec.encode(&Envelope::SensorData(reading)).unwrap());
        }
        multiplexer.handle_datagram(
            &codec
                .encode(&Envelope::Video(VideoFrame::new(vec![9, 9])))
                .unwrap(),
        );

        assert_eq!(
            multiplexer
                .latest_sensor_data()
                .and_then(|reading| reading.lux)
                .map(Lux::get),
            Some(30)
        );
        let stamped = multiplexer.sensor_snapshot().unwrap();
        assert_eq!(stamped.value.lux.map(Lux::get), Some(30));
        assert!(stamped.received_at <= chrono::Utc::now());
        assert_eq!(multiplexer.latest_frame().unwrap().bytes, vec![9, 9]);
        assert!(multiplexer.latest_vllm_response().is_none());
        assert_eq!(multiplexer.stats().accepted, 3);
    }

    #[test]
    fn test_latest_analysis_follows_arrival() {
        let multiplexer = multiplexer();
        let codec = PacketCodec;
        assert!(multiplexer.latest_analysis().is_none());

        let response = AnalysisResult::now("from the scheduler", true);
        multiplexer.handle_datagram(&codec.encode(&Envelope::VllmResponse(response)).unwrap());
        assert_eq!(
            multiplexer.latest_analysis().unwrap().description,
            "from the scheduler"
        );

        let description = AnalysisResult::now("legacy stream", false);
        multiplexer.handle_datagram(&codec.encode(&Envelope::Description(description)).unwrap());
        assert_eq!(
            multiplexer.latest_analysis().unwrap().description,
            "legacy stream"
        );
    }

    #[tokio::test]
    async fn test_receives_from_transport() {
        let mut multiplexer = multiplexer();
        let addr = multiplexer.start().await.unwrap();
        assert_eq!(multiplexer.start().await.unwrap(), addr);

        let transport = UdpTransport::to(addr).unwrap();
        transport.send(&Envelope::Video(VideoFrame::new(vec![1, 2, 3])));
        transport.send(&Envelope::VllmResponse(AnalysisResult::now("a knife", true)));

        let mut received = false;
        for _ in 0..100 {
            if multiplexer.latest_frame().is_some() && multiplexer.latest_vllm_response().is_some() {
                received = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(received, "stats: {:?}", multiplexer.stats());
        assert!(multiplexer.latest_vllm_response().unwrap().danger);

        multiplexer.stop().await;
        assert!(!multiplexer.is_running());
        assert!(multiplexer.latest_frame().is_some());
    }

    #[test]
    #[serial]
    fn test_read_write_multiplexer_config_file() {
        let write_config = MultiplexerConfig {
            bind: "127.0.0.1:6000".parse().unwrap(),
            chart_bind: None,
            status_period_secs: 2,
        };
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let write_file = OpenOptions::new().write(true).open(file.path()).unwrap();
        serde_yaml::to_writer(write_file, &write_config).unwrap();

        let read_config = MultiplexerConfig::from_file(file.path()).unwrap();
        assert_eq!(write_config, read_config, "Failed to read write config");
    }

    #[test]
    fn test_sample_viewer_config() {
        let config =
            MultiplexerConfig::from_file(crate::test_file_path!("/config/viewer.yaml")).unwrap();
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.chart_bind.map(|addr| addr.port()), Some(5002));
    }
}
