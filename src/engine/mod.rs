//! Seam to the real-time connection engine.
//!
//! Sessions only talk to `RtcConnection`; engine callbacks come back as
//! `ConnectionEvent`s on a channel owned by the session.

pub mod peer_connection;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::media::{LocalMediaHandle, RemoteTrack};
use crate::peer::types::{ConnectivityState, IceCandidate, PeerId, SessionDescription};

pub use self::peer_connection::WebRtcEngine;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Locally gathered candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    GatheringComplete,
    Connectivity(ConnectivityState),
    RemoteTrack(RemoteTrack),
}

pub type ConnectionEventSink = mpsc::UnboundedSender<ConnectionEvent>;

#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>, EngineError>;
}

/// One engine-level peer connection, exclusively owned by its session
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn add_local_tracks(&self, media: &LocalMediaHandle) -> Result<(), EngineError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Detaches local tracks and closes the connection
    async fn close(&self) -> Result<(), EngineError>;
}
