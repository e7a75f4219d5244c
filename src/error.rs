use std::time::Duration;

use thiserror::Error;

use crate::peer::types::NegotiationState;

/// Signaling channel unreachable or gone. Fatal to the room.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling connect failed: {0}")]
    Connect(String),

    #[error("signaling connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("signaling channel closed")]
    Closed,

    #[error("signaling channel lost: {0}")]
    Lost(String),

    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
}

/// Failure reported by the real-time connection engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is mid-negotiation; the call may succeed later.
    #[error("engine busy: {0}")]
    Busy(String),

    #[error("connection closed")]
    Closed,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

/// Offer/answer/description failures for one peer session.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot {op} while negotiation is {state:?}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },

    #[error("remote description rejected: {0}")]
    RemoteDescription(#[source] EngineError),

    #[error("remote answer rejected: {0}")]
    AnswerRejected(#[source] EngineError),

    #[error("local description failed: {0}")]
    LocalDescription(#[source] EngineError),

    #[error("connection setup failed: {0}")]
    Connection(#[source] EngineError),

    #[error("ICE restart budget exhausted after {0} attempt(s)")]
    RestartsExhausted(u32),

    #[error("connectivity not restored within {0:?} of ICE restart")]
    RestartTimedOut(std::time::Duration),

    #[error("session closed")]
    SessionClosed,
}

impl NegotiationError {
    /// Fatal errors end the session; the rest drop the offending message only.
    pub fn is_fatal(&self) -> bool {
        match self {
            NegotiationError::InvalidState { .. } | NegotiationError::RemoteDescription(_) => false,
            NegotiationError::SessionClosed => false,
            NegotiationError::LocalDescription(_)
            | NegotiationError::AnswerRejected(_)
            | NegotiationError::Connection(_)
            | NegotiationError::RestartsExhausted(_)
            | NegotiationError::RestartTimedOut(_) => true,
        }
    }
}

/// Inbound signaling payload that cannot be applied. Logged and dropped.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("undecodable signaling frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{event}` from {peer_id} carries no sdp")]
    MissingSdp { event: &'static str, peer_id: String },

    #[error("`{event}` from {peer_id} carries sdp of type {found}")]
    SdpTypeMismatch {
        event: &'static str,
        peer_id: String,
        found: String,
    },

    #[error("`candidate` from {0} carries no candidate")]
    MissingCandidate(String),

    #[error("`{0}` carries an empty peer id")]
    EmptyPeerId(&'static str),

    #[error("`{0}` is not an inbound event")]
    UnexpectedEvent(&'static str),
}

/// Local capture could not be started. Fatal to starting a call.
#[derive(Debug, Error)]
pub enum MediaAcquisitionError {
    #[error("no audio or video requested")]
    NoTracks,

    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ICE server `{0}` has an empty url")]
    EmptyServerUrl(String),

    #[error("TURN server `{0}` requires username and credential")]
    MissingTurnCredentials(String),
}

/// Room-level errors surfaced to the caller of `join`/`run`.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("already joined room {0}")]
    AlreadyJoined(String),

    #[error("not in a room")]
    NotJoined,

    #[error("room task ended abnormally: {0}")]
    Task(#[from] tokio::task::JoinError),
}
