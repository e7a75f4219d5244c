use tokio::sync::mpsc;

use crate::media::RemoteTrack;
use crate::peer::types::PeerId;

/// Per-peer state as the UI sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    /// Connectivity degraded, ICE restart or grace period in progress
    Recovering,
    Failed,
    Ended,
}

/// Notifications for the UI layer
#[derive(Debug, Clone)]
pub enum RoomEvent {
    LocalStreamReady { tracks: usize },
    PeerStateChanged { peer_id: PeerId, state: PeerState },
    RemoteStreamAvailable { peer_id: PeerId, track: RemoteTrack },
    RemoteStreamRemoved { peer_id: PeerId },
    /// Room-fatal error; every session has been torn down
    RoomFailed { reason: String },
    Left,
}

/// Fire-and-forget event emitter. A UI that stopped listening is not an error.
#[derive(Clone)]
pub struct RoomEvents {
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RoomEvent) {
        tracing::trace!("emit {event:?}");
        let _ = self.tx.send(event);
    }

    pub fn peer_state(&self, peer_id: &PeerId, state: PeerState) {
        tracing::debug!("peer {peer_id} -> {state:?}");
        self.emit(RoomEvent::PeerStateChanged {
            peer_id: peer_id.clone(),
            state,
        });
    }
}
