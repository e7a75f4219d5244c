use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{RoomConfig, ServerConfig};
use crate::engine::{ConnectionEvent, ConnectionEventSink, RtcConnection, RtcEngine};
use crate::error::EngineError;
use crate::media::{LocalMediaHandle, MediaKind, RemoteTrack};
use crate::peer::types::{ConnectivityState, IceCandidate, PeerId, SdpKind, SessionDescription};

/// webrtc-rs backed engine. One `API` instance serves every connection of a room.
pub struct WebRtcEngine {
    api: API,
    config: RoomConfig,
}

impl WebRtcEngine {
    pub fn new(config: RoomConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.config.ice_servers),
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Converts configured servers into webrtc-rs ICE servers
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![config.url.clone()],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn connectivity_from(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(EngineError::Rejected(
                "rollback descriptions are not applied".into(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription, kind: SdpKind) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

/// Snapshot of getStats: the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                tracing::info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>, EngineError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);
        tracing::debug!("Created peer connection for {peer_id}");

        let sink = events.clone();
        let label = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let event = match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => Some(ConnectionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => {
                        tracing::warn!("Unserializable local candidate for {label}: {e}");
                        None
                    }
                },
                None => Some(ConnectionEvent::GatheringComplete),
            };
            if let Some(event) = event {
                let _ = sink.send(event);
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        let label = peer_id.to_string();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!("ICE connection state for {label}: {state:?}");
            if let Some(state) = connectivity_from(state) {
                let _ = sink.send(ConnectionEvent::Connectivity(state));
            }
            Box::pin(async {})
        }));

        let pc_stats: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        let label = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            tracing::debug!("Peer connection state for {label}: {st:?}");
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_stats.upgrade() {
                    let moment = format!("BEFORE-FAIL {label}");
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, &moment).await;
                    });
                }
            }
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: MediaKind::from_codec_type(track.kind()),
                    track: Some(track),
                };
                let _ = sink.send(ConnectionEvent::RemoteTrack(remote));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            peer_id: peer_id.clone(),
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebRtcConnection {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl WebRtcConnection {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_local_tracks(&self, media: &LocalMediaHandle) -> Result<(), EngineError> {
        let mut senders = self.senders.lock().await;
        for local in media.tracks() {
            let sender = self.pc.add_track(Arc::clone(&local.track)).await?;

            // RTCP has to be drained for the interceptors to work
            let rtcp = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp.read(&mut buf).await.is_ok() {}
            });

            senders.push(sender);
        }
        tracing::debug!("Attached {} local tracks for {}", senders.len(), self.peer_id);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let signaling = self.pc.signaling_state();
        if signaling != RTCSignalingState::Stable {
            return Err(EngineError::Busy(format!("signaling state is {signaling:?}")));
        }

        let options = RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart,
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(from_rtc(offer, SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(answer, SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let senders: Vec<_> = self.senders.lock().await.drain(..).collect();
        for sender in senders {
            if let Err(e) = self.pc.remove_track(&sender).await {
                tracing::debug!("Failed to detach local track for {}: {e}", self.peer_id);
            }
        }
        self.pc.close().await?;
        tracing::debug!("Closed peer connection for {}", self.peer_id);
        Ok(())
    }
}
