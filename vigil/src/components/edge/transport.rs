use crate::{
    error::TransportError,
    messages::{codec::PacketCodec, packet::Envelope},
};
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, error};

/// Sends envelopes to a single UDP destination. Sending is fire and forget:
/// no acknowledgement, no retry, and a failed send only shows up in the log.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
    codec: PacketCodec,
}

impl UdpTransport {
    /// Bind `local` and send everything to `target`.
    ///
    /// * `local`: local address, port 0 for an ephemeral port.
    /// * `target`: where datagrams go.
    pub fn bind(local: SocketAddr, target: SocketAddr) -> Result<Self, TransportError> {
        let socket =
            UdpSocket::bind(local).map_err(|source| TransportError::Bind { addr: local, source })?;
        Ok(Self {
            socket,
            target,
            codec: PacketCodec,
        })
    }

    /// Send from an ephemeral port on all interfaces.
    pub fn to(target: SocketAddr) -> Result<Self, TransportError> {
        let local = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Self::bind(local, target)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Encode and send one envelope, reporting what went wrong.
    pub fn try_send(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let bytes = self.codec.encode(envelope)?;
        self.socket
            .send_to(&bytes, self.target)
            .map_err(|source| TransportError::Send {
                addr: self.target,
                source,
            })
    }

    /// Best effort send. Failures are logged and otherwise ignored.
    pub fn send(&self, envelope: &Envelope) {
        match self.try_send(envelope) {
            Ok(size) => debug!(kind = %envelope.kind(), size, "sent envelope"),
            Err(error) => error!(kind = %envelope.kind(), %error, "dropped outgoing envelope"),
        }
    }
}

/// Bind the receiving end of the channel.
///
/// * `addr`: local address to listen on.
pub async fn bind_inbound(addr: SocketAddr) -> Result<tokio::net::UdpSocket, TransportError> {
    tokio::net::UdpSocket::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}
