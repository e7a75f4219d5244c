//! Mesh video-call client core: one negotiated peer connection per remote
//! room member, driven by room signaling.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;
mod utils;

pub use config::{RoomConfig, ServerConfig, ServerKind};
pub use error::{
    ConfigError, EngineError, MalformedMessage, MediaAcquisitionError, NegotiationError, RoomError,
    TransportError,
};
pub use events::{PeerState, RoomEvent};
pub use media::{LocalMediaHandle, MediaSource, SampleMediaSource};
pub use peer::PeerId;
pub use room::{RoomCommand, RoomHandle, RoomOrchestrator};
