use crate::{
    error::{DecodeError, EncodeError},
    messages::packet::{Envelope, PacketKind, VideoFrame, DATAGRAM_WARN_BYTES},
};
use bytes::BytesMut;
use serde::Deserialize;
use std::str::FromStr;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Outcome of decoding one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A known kind with a validated payload.
    Packet(Envelope),
    /// Well formed envelope whose `type` tag is not one of the known kinds.
    /// Not fatal, the caller drops it.
    UnknownKind(String),
}

/// Envelope shape before the kind tag has been looked at.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Encodes envelopes as JSON datagrams and decodes them in two stages:
/// a structured attempt, then the legacy raw image path, then a classified
/// failure. Stateless, so it is cheap to construct wherever it is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    /// Serialise an envelope for the wire.
    ///
    /// * `envelope`: kind and payload to send.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        let bytes = serde_json::to_vec(envelope).map_err(|source| EncodeError {
            kind: envelope.kind(),
            source,
        })?;
        if bytes.len() > DATAGRAM_WARN_BYTES {
            warn!(
                kind = %envelope.kind(),
                size = bytes.len(),
                "encoded envelope is close to the UDP datagram limit and may be dropped"
            );
        }
        Ok(bytes)
    }

    /// Parse one datagram.
    ///
    /// * `datagram`: bytes exactly as received.
    pub fn decode(&self, datagram: &[u8]) -> Result<Decoded, DecodeError> {
        if datagram.is_empty() {
            return Err(DecodeError::Empty);
        }
        match serde_json::from_slice::<RawEnvelope>(datagram) {
            Ok(raw) => Self::decode_structured(raw),
            Err(structured) => match Self::decode_legacy(datagram) {
                Some(frame) => {
                    debug!(size = datagram.len(), "decoded legacy raw frame");
                    Ok(Decoded::Packet(Envelope::Video(frame)))
                }
                None => Err(DecodeError::Unrecognised {
                    len: datagram.len(),
                    structured: structured.to_string(),
                }),
            },
        }
    }

    /// Validate the payload against the schema of its kind.
    fn decode_structured(raw: RawEnvelope) -> Result<Decoded, DecodeError> {
        let Ok(kind) = PacketKind::from_str(&raw.kind) else {
            return Ok(Decoded::UnknownKind(raw.kind));
        };
        let invalid = |source: serde_json::Error| DecodeError::Payload { kind, source };

        let envelope = match kind {
            PacketKind::Video => Envelope::Video(serde_json::from_value(raw.data).map_err(invalid)?),
            PacketKind::Description => {
                Envelope::Description(serde_json::from_value(raw.data).map_err(invalid)?)
            }
            PacketKind::VllmResponse => {
                Envelope::VllmResponse(serde_json::from_value(raw.data).map_err(invalid)?)
            }
            PacketKind::SensorData => {
                Envelope::SensorData(serde_json::from_value(raw.data).map_err(invalid)?)
            }
        };
        Ok(Decoded::Packet(envelope))
    }

    /// Older producers pushed the encoded image straight into the datagram.
    /// Only accept the bytes if the image codec can actually decode them.
    fn decode_legacy(datagram: &[u8]) -> Option<VideoFrame> {
        image::load_from_memory(datagram)
            .ok()
            .map(|_| VideoFrame::new(datagram.to_vec()))
    }
}

/// Each UDP read lands in the buffer as exactly one datagram, so the whole
/// buffer is consumed per call. Decode failures are part of the item so a
/// bad datagram never ends the stream.
impl Decoder for PacketCodec {
    type Item = Result<Decoded, DecodeError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        Ok(Some(PacketCodec::decode(self, &datagram)))
    }
}
