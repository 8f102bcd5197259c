//! Error types for the edge system.
//!
//! None of these are fatal to the process. Loops log them and carry on with
//! the next datagram, tick or poll; the visible effect of any failure is a
//! stale or absent cached value.

use crate::messages::packet::PacketKind;
use std::{io, net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

/// A datagram that could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Neither a structured envelope nor a raw encoded image.
    #[error("datagram of {len} bytes is neither an envelope ({structured}) nor a raw image")]
    Unrecognised {
        /// Datagram length.
        len: usize,
        /// Why the structured parse failed.
        structured: String,
    },
    /// The kind tag was known but its payload failed validation.
    #[error("malformed {kind} payload: {source}")]
    Payload {
        /// Kind announced by the envelope.
        kind: PacketKind,
        /// Validation failure.
        #[source]
        source: serde_json::Error,
    },
    /// Zero length datagram.
    #[error("empty datagram")]
    Empty,
}

/// Payload that the codec could not represent.
#[derive(Debug, Error)]
#[error("failed to encode {kind} envelope: {source}")]
pub struct EncodeError {
    /// Kind of the envelope being encoded.
    pub kind: PacketKind,
    /// Serialiser failure.
    #[source]
    pub source: serde_json::Error,
}

/// Register transaction failure on the serial bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The bus has not been connected.
    #[error("bus is not connected")]
    NotConnected,
    /// The device did not answer inside the bus timeout.
    #[error("unit {unit:#04x} timed out at register {register:#06x}")]
    Timeout {
        /// Responder address.
        unit: u8,
        /// Register offset.
        register: u16,
    },
    /// The device answered with an exception.
    #[error("unit {unit:#04x} raised exception {code:#04x} at register {register:#06x}")]
    Exception {
        /// Responder address.
        unit: u8,
        /// Register offset.
        register: u16,
        /// Exception code.
        code: u8,
    },
    /// Fewer registers came back than were asked for.
    #[error("expected {expected} registers, got {got}")]
    ShortResponse {
        /// Registers requested.
        expected: usize,
        /// Registers returned.
        got: usize,
    },
}

/// A sensor value outside its physical bounds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("value {value} is outside [{min}, {max}]")]
pub struct RangeError {
    /// Offending value.
    pub value: i64,
    /// Lower bound, inclusive.
    pub min: i64,
    /// Upper bound, inclusive.
    pub max: i64,
}

/// Reasons a sensor cycle produced no reading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Register I/O failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The reading was out of range.
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// The serial port could not be opened. Terminal for the owning loop only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not open serial port {port}: {reason}")]
pub struct ConnectionError {
    /// Port path.
    pub port: String,
    /// Reason reported by the bus.
    pub reason: String,
}

/// Vision-model call failures. Any of these yields no analysis result.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The HTTP request itself failed.
    #[error("request to the model endpoint failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non success status.
    #[error("model endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },
    /// The call did not complete inside the fixed upper bound.
    #[error("model call exceeded {0:?}")]
    Timeout(Duration),
    /// A verdict could not be extracted from the reply.
    #[error("unparsable model reply: {0}")]
    Unparsable(String),
    /// The frame could not be encoded for the request.
    #[error("failed to encode frame for analysis: {0}")]
    Frame(#[from] image::ImageError),
}

/// UDP socket failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the local socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested local address.
        addr: SocketAddr,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// A datagram could not be handed to the OS.
    #[error("failed to send datagram to {addr}: {source}")]
    Send {
        /// Destination.
        addr: SocketAddr,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// The envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Frame source failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Reading a frame source failed.
    #[error("failed to read frames from {path:?}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// A frame could not be decoded or encoded.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    /// The source has no frames to give.
    #[error("frame source {0:?} holds no images")]
    Empty(PathBuf),
}

/// The producer could not be assembled from its config.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// The config file could not be read.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// The outbound socket could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The frame source could not be opened.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The model clients could not be built.
    #[error(transparent)]
    Model(#[from] ModelError),
}
