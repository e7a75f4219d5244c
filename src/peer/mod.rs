pub mod actor;
pub mod candidates;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod types;

pub use actor::{SessionCommand, SessionEnded, SessionHandle};
pub use registry::{SessionFactory, SessionRegistry};
pub use session::{PeerSession, SessionStatus};
pub use types::{
    CandidateKind, ConnectivityState, IceCandidate, NegotiationState, PeerId, Role, SdpKind,
    SessionDescription,
};
