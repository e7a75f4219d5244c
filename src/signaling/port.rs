use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::TransportError;
use crate::peer::types::PeerId;
use crate::signaling::protocol::{self, InboundSignal, OutboundSignal};
use crate::signaling::transport::{SignalingLink, SignalingTransport};

/// Cloneable outbound half, handed to every session
#[derive(Clone)]
pub struct SignalingSender {
    frames: mpsc::UnboundedSender<String>,
}

impl SignalingSender {
    pub fn new(frames: mpsc::UnboundedSender<String>) -> Self {
        Self { frames }
    }

    pub fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        let frame = protocol::encode(&signal)?;
        tracing::trace!(target: "signaling", "-> {}", signal.event_name());
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Room-scoped signaling channel.
///
/// Decodes inbound frames into `InboundSignal`s and drops malformed ones.
/// All room logic lives with the caller of `recv`.
pub struct SignalingPort {
    room_id: String,
    local_id: PeerId,
    sender: SignalingSender,
    inbound: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

impl SignalingPort {
    pub async fn connect(
        transport: &dyn SignalingTransport,
        room_id: &str,
        local_id: &PeerId,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let link = match timeout(connect_timeout, transport.connect(room_id, local_id.as_str())).await
        {
            Ok(link) => link?,
            Err(_) => return Err(TransportError::Timeout(connect_timeout)),
        };
        tracing::info!(target: "signaling", "connected to room {room_id} as {local_id}");
        Ok(Self::from_link(link, room_id, local_id.clone()))
    }

    pub fn from_link(link: SignalingLink, room_id: &str, local_id: PeerId) -> Self {
        Self {
            room_id: room_id.to_owned(),
            local_id,
            sender: SignalingSender::new(link.outbound),
            inbound: link.inbound,
            closed: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        self.sender.send(signal)
    }

    pub fn announce_presence(&self) -> Result<(), TransportError> {
        self.send(OutboundSignal::JoinRoom {
            room_id: self.room_id.clone(),
        })
    }

    /// Next valid inbound event. A dropped link yields one `TransportError`
    /// and then `None`.
    pub async fn recv(&mut self) -> Option<InboundSignal> {
        if self.closed {
            return None;
        }
        loop {
            let Some(frame) = self.inbound.recv().await else {
                self.closed = true;
                return Some(InboundSignal::TransportError(
                    "signaling channel closed".into(),
                ));
            };

            match protocol::decode(&frame) {
                Ok(signal) if signal.peer_id() == Some(&self.local_id) => {
                    tracing::debug!(target: "signaling", "ignoring event about ourselves: {signal:?}");
                }
                Ok(signal) => {
                    tracing::trace!(target: "signaling", "<- {signal:?}");
                    return Some(signal);
                }
                Err(e) => {
                    tracing::warn!(target: "signaling", "dropping malformed message: {e}");
                }
            }
        }
    }

    pub fn disconnect(mut self) {
        self.inbound.close();
        tracing::info!(target: "signaling", "left signaling for room {}", self.room_id);
    }
}
