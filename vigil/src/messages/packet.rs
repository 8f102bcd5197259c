use crate::error::RangeError;
use crate::utils::time::local_now_seconds;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Practical payload ceiling of a single UDP datagram over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Encoded envelopes larger than this are logged as likely to be dropped.
pub const DATAGRAM_WARN_BYTES: usize = 65_000;

/// The logically distinct message streams sharing the UDP channel. The
/// snake case name is the `type` tag on the wire.
#[derive(
    EnumString, IntoStaticStr, Display, EnumIter, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
pub enum PacketKind {
    /// Camera frame.
    Video,
    /// Verdict in the legacy `description` stream.
    Description,
    /// Verdict produced by the analysis scheduler.
    VllmResponse,
    /// Ambient light reading.
    SensorData,
}

/// Opaque encoded image (JPEG from the producer, anything the image
/// codec recognises on the legacy path). Base64 text on the wire.
#[serde_as]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct VideoFrame {
    /// Encoded image bytes.
    #[serde_as(as = "Base64")]
    pub bytes: Vec<u8>,
}

impl VideoFrame {
    /// Wrap encoded image bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Outcome of one vision-model call. Immutable once created.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AnalysisResult {
    /// Local wall clock time the analysis was requested.
    #[serde(rename = "date", with = "crate::utils::time::verdict_date")]
    pub timestamp: NaiveDateTime,
    /// Scene description from the model.
    pub description: String,
    /// Danger verdict.
    pub danger: bool,
}

impl AnalysisResult {
    /// Stamp a verdict with the current local time.
    pub fn now(description: impl Into<String>, danger: bool) -> Self {
        Self::at(local_now_seconds(), description, danger)
    }

    /// Stamp a verdict with the time its analysis was requested.
    pub fn at(timestamp: NaiveDateTime, description: impl Into<String>, danger: bool) -> Self {
        Self {
            timestamp,
            description: description.into(),
            danger,
        }
    }
}

/// Illuminance in lux, validated to the sensor's physical range.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "i64", into = "u32")]
pub struct Lux(u32);

impl Lux {
    /// Smallest value the sensor can report.
    pub const MIN: i64 = 0;
    /// Largest value the sensor can report.
    pub const MAX: i64 = 100_000;

    /// Raw value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for Lux {
    type Error = RangeError;

    // Bounds are checked before the cast, so it always fits in u32.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value as u32))
        } else {
            Err(RangeError {
                value,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }
}

impl From<Lux> for u32 {
    fn from(value: Lux) -> Self {
        value.0
    }
}

/// Unit tag carried alongside a reading; only lux is ever produced.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LightUnit {
    #[default]
    Lux,
}

/// Ambient light reading. `lux` is absent when the read failed.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SensorReading {
    /// Reading, or `None` for a failed cycle.
    pub lux: Option<Lux>,
    /// Always lux.
    #[serde(default)]
    pub unit: LightUnit,
    /// When the registers were read.
    #[serde(with = "crate::utils::time::epoch_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// A reading taken now.
    pub fn now(lux: Option<Lux>) -> Self {
        Self {
            lux,
            unit: LightUnit::Lux,
            timestamp: Utc::now(),
        }
    }
}

/// The typed wrapper carried by each datagram: `{"type": kind, "data": payload}`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    Video(VideoFrame),
    Description(AnalysisResult),
    VllmResponse(AnalysisResult),
    SensorData(SensorReading),
}

impl Envelope {
    /// Which stream this envelope belongs to.
    pub fn kind(&self) -> PacketKind {
        match self {
            Envelope::Video(_) => PacketKind::Video,
            Envelope::Description(_) => PacketKind::Description,
            Envelope::VllmResponse(_) => PacketKind::VllmResponse,
            Envelope::SensorData(_) => PacketKind::SensorData,
        }
    }
}
