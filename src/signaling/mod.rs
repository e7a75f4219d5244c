pub mod port;
pub mod protocol;
pub mod transport;

pub use port::{SignalingPort, SignalingSender};
pub use protocol::{InboundSignal, OutboundSignal};
pub use transport::{MemoryServer, MemoryTransport, SignalingLink, SignalingTransport, WebSocketTransport};
