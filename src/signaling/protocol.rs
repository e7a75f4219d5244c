//! Signaling wire format.
//!
//! Every frame is a JSON envelope `{ "event": <name>, "data": <payload> }`.
//! Outbound `peerId` names the target, inbound `peerId` names the sender.

use serde::{Deserialize, Serialize};

use crate::error::MalformedMessage;
use crate::peer::types::{IceCandidate, PeerId, SdpKind, SessionDescription};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct WireSdp {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
enum WireMessage {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    ExistingPeers {
        #[serde(rename = "peerIds", default)]
        peer_ids: Vec<String>,
    },
    NewPeer {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        sdp: Option<WireSdp>,
    },
    Answer {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        sdp: Option<WireSdp>,
    },
    Candidate {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
    RemovePeer {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

/// Typed inbound event, routed through the room's single dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    ExistingPeers(Vec<PeerId>),
    NewPeer(PeerId),
    Offer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    Candidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    RemovePeer(PeerId),
    /// Synthesized locally when the channel drops
    TransportError(String),
}

impl InboundSignal {
    /// Remote peer the event concerns, if any
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            InboundSignal::NewPeer(peer_id) | InboundSignal::RemovePeer(peer_id) => Some(peer_id),
            InboundSignal::Offer { peer_id, .. }
            | InboundSignal::Answer { peer_id, .. }
            | InboundSignal::Candidate { peer_id, .. } => Some(peer_id),
            InboundSignal::ExistingPeers(_) | InboundSignal::TransportError(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    /// Presence announcement
    JoinRoom { room_id: String },
    Offer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    Candidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    RemovePeer(PeerId),
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::JoinRoom { .. } => "joinRoom",
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::Candidate { .. } => "candidate",
            OutboundSignal::RemovePeer(_) => "removePeer",
        }
    }
}

pub fn encode(signal: &OutboundSignal) -> Result<String, serde_json::Error> {
    let wire = match signal.clone() {
        OutboundSignal::JoinRoom { room_id } => WireMessage::JoinRoom { room_id },
        OutboundSignal::Offer { peer_id, sdp } => WireMessage::Offer {
            peer_id: peer_id.to_string(),
            sdp: Some(wire_sdp(sdp)),
        },
        OutboundSignal::Answer { peer_id, sdp } => WireMessage::Answer {
            peer_id: peer_id.to_string(),
            sdp: Some(wire_sdp(sdp)),
        },
        OutboundSignal::Candidate { peer_id, candidate } => WireMessage::Candidate {
            peer_id: peer_id.to_string(),
            candidate: Some(candidate),
        },
        OutboundSignal::RemovePeer(peer_id) => WireMessage::RemovePeer {
            peer_id: peer_id.to_string(),
        },
    };
    serde_json::to_string(&wire)
}

fn wire_sdp(desc: SessionDescription) -> WireSdp {
    WireSdp {
        kind: Some(desc.kind.to_string()),
        sdp: Some(desc.sdp),
    }
}

fn peer(event: &'static str, id: String) -> Result<PeerId, MalformedMessage> {
    if id.is_empty() {
        return Err(MalformedMessage::EmptyPeerId(event));
    }
    Ok(PeerId::new(id))
}

/// Validates the `{ type, sdp }` object of an offer or answer
fn session_description(
    event: &'static str,
    expected: SdpKind,
    peer_id: &PeerId,
    wire: Option<WireSdp>,
) -> Result<SessionDescription, MalformedMessage> {
    let wire = wire.unwrap_or_default();
    let sdp = match wire.sdp {
        Some(sdp) if !sdp.trim().is_empty() => sdp,
        _ => {
            return Err(MalformedMessage::MissingSdp {
                event,
                peer_id: peer_id.to_string(),
            })
        }
    };

    if let Some(kind) = wire.kind {
        if kind != expected.to_string() {
            return Err(MalformedMessage::SdpTypeMismatch {
                event,
                peer_id: peer_id.to_string(),
                found: kind,
            });
        }
    }

    Ok(SessionDescription {
        kind: expected,
        sdp,
    })
}

pub fn decode(frame: &str) -> Result<InboundSignal, MalformedMessage> {
    let wire: WireMessage = serde_json::from_str(frame)?;
    let signal = match wire {
        WireMessage::JoinRoom { .. } => return Err(MalformedMessage::UnexpectedEvent("joinRoom")),
        WireMessage::ExistingPeers { peer_ids } => InboundSignal::ExistingPeers(
            peer_ids
                .into_iter()
                .map(|id| peer("existingPeers", id))
                .collect::<Result<_, _>>()?,
        ),
        WireMessage::NewPeer { peer_id } => InboundSignal::NewPeer(peer("newPeer", peer_id)?),
        WireMessage::Offer { peer_id, sdp } => {
            let peer_id = peer("offer", peer_id)?;
            let sdp = session_description("offer", SdpKind::Offer, &peer_id, sdp)?;
            InboundSignal::Offer { peer_id, sdp }
        }
        WireMessage::Answer { peer_id, sdp } => {
            let peer_id = peer("answer", peer_id)?;
            let sdp = session_description("answer", SdpKind::Answer, &peer_id, sdp)?;
            InboundSignal::Answer { peer_id, sdp }
        }
        WireMessage::Candidate { peer_id, candidate } => {
            let peer_id = peer("candidate", peer_id)?;
            match candidate {
                Some(candidate) if !candidate.candidate.is_empty() => {
                    InboundSignal::Candidate { peer_id, candidate }
                }
                _ => return Err(MalformedMessage::MissingCandidate(peer_id.to_string())),
            }
        }
        WireMessage::RemovePeer { peer_id } => {
            InboundSignal::RemovePeer(peer("removePeer", peer_id)?)
        }
    };
    Ok(signal)
}
