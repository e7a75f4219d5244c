//! Room orchestration: join, the single inbound-signal dispatcher, leave.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::engine::{RtcEngine, WebRtcEngine};
use crate::error::{RoomError, TransportError};
use crate::events::{PeerState, RoomEvent, RoomEvents};
use crate::media::{LocalMediaHandle, MediaSource, SampleMediaSource};
use crate::peer::{
    PeerId, Role, SessionCommand, SessionEnded, SessionFactory, SessionHandle, SessionRegistry,
};
use crate::signaling::{
    InboundSignal, OutboundSignal, SignalingPort, SignalingTransport, WebSocketTransport,
};

/// Requests from the UI to a spawned room
#[derive(Debug, Clone)]
pub enum RoomCommand {
    /// Hang up on one peer and tell the room about it
    EndSession(PeerId),
    Leave,
}

enum Input {
    Signal(Option<InboundSignal>),
    Ended(SessionEnded),
    Command(Option<RoomCommand>),
}

struct JoinedRoom {
    room_id: String,
    signaling: SignalingPort,
    registry: SessionRegistry,
    media: LocalMediaHandle,
}

impl JoinedRoom {
    async fn open_session(
        &mut self,
        peer_id: &PeerId,
        role: Role,
        events: &RoomEvents,
    ) -> Option<(SessionHandle, bool)> {
        match self.registry.get_or_create(peer_id, role).await {
            Ok(opened) => Some(opened),
            Err(e) => {
                tracing::warn!("Could not open session for {peer_id}: {e}");
                events.peer_state(peer_id, PeerState::Failed);
                None
            }
        }
    }

    fn route(&self, peer_id: &PeerId, command: SessionCommand) {
        match self.registry.get(peer_id) {
            Some(session) => {
                if !session.send(command) {
                    tracing::debug!("Session for {peer_id} already finished");
                }
            }
            None => tracing::warn!("No session for {peer_id}, dropping {command:?}"),
        }
    }

    async fn drop_peer(&mut self, peer_id: &PeerId, events: &RoomEvents) -> bool {
        if !self.registry.remove(peer_id).await {
            return false;
        }
        events.emit(RoomEvent::RemoteStreamRemoved {
            peer_id: peer_id.clone(),
        });
        events.peer_state(peer_id, PeerState::Ended);
        true
    }
}

/// One instance per room visit. Owns the signaling port, the session
/// registry and the orchestrator's reference to local media.
pub struct RoomOrchestrator {
    config: RoomConfig,
    local_id: PeerId,
    engine: Arc<dyn RtcEngine>,
    media_source: Arc<dyn MediaSource>,
    transport: Arc<dyn SignalingTransport>,
    events: RoomEvents,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    ended_rx: mpsc::UnboundedReceiver<SessionEnded>,
    room: Option<JoinedRoom>,
}

impl RoomOrchestrator {
    pub fn new(
        config: RoomConfig,
        local_id: PeerId,
        engine: Arc<dyn RtcEngine>,
        media_source: Arc<dyn MediaSource>,
        transport: Arc<dyn SignalingTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, events_rx) = RoomEvents::channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                local_id,
                engine,
                media_source,
                transport,
                events,
                ended_tx,
                ended_rx,
                room: None,
            },
            events_rx,
        )
    }

    /// webrtc engine, sample-fed local tracks and a WebSocket signaling link.
    /// The config is validated first.
    pub fn with_webrtc(
        mut config: RoomConfig,
        local_id: PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>), RoomError> {
        config.validate()?;
        let engine = Arc::new(WebRtcEngine::new(config.clone())?);
        let transport = Arc::new(WebSocketTransport::new(config.signaling_url.clone()));
        Ok(Self::new(
            config,
            local_id,
            engine,
            Arc::new(SampleMediaSource::default()),
            transport,
        ))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room.as_ref().map(|room| room.room_id.as_str())
    }

    pub fn is_joined(&self) -> bool {
        self.room.is_some()
    }

    /// Remote peers with a live or winding-down session
    pub fn peers(&self) -> Vec<PeerId> {
        self.room
            .as_ref()
            .map(|room| room.registry.peers())
            .unwrap_or_default()
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<SessionHandle> {
        self.room.as_ref().and_then(|room| room.registry.get(peer_id))
    }

    /// ========== JOIN ==========

    /// Acquires local media, connects signaling and announces presence.
    /// On failure nothing is left behind and the local media is released.
    pub async fn join(&mut self, room_id: &str) -> Result<(), RoomError> {
        if let Some(room) = &self.room {
            return Err(RoomError::AlreadyJoined(room.room_id.clone()));
        }

        let media = match self.media_source.acquire().await {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Local media unavailable: {e}");
                self.events.emit(RoomEvent::RoomFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        tracing::info!("Local stream ready with {} track(s)", media.tracks().len());
        self.events.emit(RoomEvent::LocalStreamReady {
            tracks: media.tracks().len(),
        });

        let signaling = match SignalingPort::connect(
            self.transport.as_ref(),
            room_id,
            &self.local_id,
            self.config.connect_timeout(),
        )
        .await
        .and_then(|port| port.announce_presence().map(|_| port))
        {
            Ok(port) => port,
            Err(e) => {
                tracing::error!("Joining room {room_id} failed: {e}");
                drop(media);
                self.events.emit(RoomEvent::RoomFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let factory = SessionFactory::new(
            &self.config,
            self.engine.clone(),
            media.clone(),
            signaling.sender(),
            self.events.clone(),
            self.ended_tx.clone(),
        );
        self.room = Some(JoinedRoom {
            room_id: room_id.to_owned(),
            signaling,
            registry: SessionRegistry::new(factory, self.config.teardown_timeout()),
            media,
        });
        tracing::info!("Joined room {room_id} as {}", self.local_id);
        Ok(())
    }

    /// ========== DISPATCH ==========

    /// Applies one inbound signaling event. Only a transport failure is
    /// returned as an error; it has already torn the room down.
    pub async fn handle_signal(&mut self, signal: InboundSignal) -> Result<(), RoomError> {
        let events = self.events.clone();
        let Some(room) = self.room.as_mut() else {
            return Err(RoomError::NotJoined);
        };

        match signal {
            InboundSignal::ExistingPeers(peer_ids) => {
                tracing::info!("Room has {} existing peer(s)", peer_ids.len());
                for peer_id in peer_ids {
                    if peer_id == self.local_id || room.registry.contains(&peer_id) {
                        continue;
                    }
                    room.open_session(&peer_id, Role::Responder, &events).await;
                }
            }
            InboundSignal::NewPeer(peer_id) => {
                tracing::info!("Peer {peer_id} joined");
                match room.open_session(&peer_id, Role::Initiator, &events).await {
                    Some((session, true)) => {
                        session.send(SessionCommand::StartAsInitiator);
                    }
                    Some((session, false)) => {
                        tracing::debug!("{peer_id} already has a {:?} session", session.role());
                    }
                    None => {}
                }
            }
            InboundSignal::Offer { peer_id, sdp } => {
                if let Some((session, _)) = room.open_session(&peer_id, Role::Responder, &events).await {
                    session.send(SessionCommand::RemoteOffer(sdp));
                }
            }
            InboundSignal::Answer { peer_id, sdp } => {
                room.route(&peer_id, SessionCommand::RemoteAnswer(sdp));
            }
            InboundSignal::Candidate { peer_id, candidate } => {
                room.route(&peer_id, SessionCommand::RemoteCandidate(candidate));
            }
            InboundSignal::RemovePeer(peer_id) => {
                tracing::info!("Peer {peer_id} left");
                room.drop_peer(&peer_id, &events).await;
            }
            InboundSignal::TransportError(reason) => {
                tracing::error!("Signaling lost: {reason}");
                self.teardown(RoomEvent::RoomFailed {
                    reason: reason.clone(),
                })
                .await;
                return Err(TransportError::Lost(reason).into());
            }
        }
        Ok(())
    }

    /// Forgets a session whose task ended on its own, unless the entry has
    /// since been replaced.
    pub async fn handle_session_ended(&mut self, ended: SessionEnded) {
        let events = self.events.clone();
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if !room
            .registry
            .remove_generation(&ended.peer_id, ended.generation)
            .await
        {
            tracing::debug!(
                "Ignoring end of stale session {} (generation {})",
                ended.peer_id,
                ended.generation
            );
            return;
        }

        events.emit(RoomEvent::RemoteStreamRemoved {
            peer_id: ended.peer_id.clone(),
        });
        if ended.error.is_none() {
            events.peer_state(&ended.peer_id, PeerState::Ended);
        }
    }

    /// Hangs up on one peer and sends `removePeer` for it
    pub async fn end_session(&mut self, peer_id: &PeerId) -> Result<(), RoomError> {
        let events = self.events.clone();
        let Some(room) = self.room.as_mut() else {
            return Err(RoomError::NotJoined);
        };
        room.drop_peer(peer_id, &events).await;
        room.signaling.send(OutboundSignal::RemovePeer(peer_id.clone()))?;
        Ok(())
    }

    /// ========== LEAVE ==========

    /// Idempotent.
    pub async fn leave(&mut self) {
        if self.teardown(RoomEvent::Left).await {
            tracing::info!("Left room");
        }
    }

    async fn teardown(&mut self, last: RoomEvent) -> bool {
        let Some(room) = self.room.take() else {
            return false;
        };
        let JoinedRoom {
            room_id,
            signaling,
            mut registry,
            media,
        } = room;

        registry.close_all().await;
        drop(registry);
        drop(media);
        signaling.disconnect();

        tracing::debug!("Room {room_id} torn down");
        self.events.emit(last);
        true
    }

    /// Serves the joined room until `Leave`, the command channel closing, or
    /// a transport failure.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<RoomCommand>) -> Result<(), RoomError> {
        loop {
            let input = {
                let Some(room) = self.room.as_mut() else {
                    return Ok(());
                };
                tokio::select! {
                    signal = room.signaling.recv() => Input::Signal(signal),
                    Some(ended) = self.ended_rx.recv() => Input::Ended(ended),
                    command = commands.recv() => Input::Command(command),
                }
            };

            match input {
                Input::Signal(Some(signal)) => self.handle_signal(signal).await?,
                Input::Signal(None) => {
                    self.teardown(RoomEvent::RoomFailed {
                        reason: "signaling closed".into(),
                    })
                    .await;
                    return Err(TransportError::Closed.into());
                }
                Input::Ended(ended) => self.handle_session_ended(ended).await,
                Input::Command(Some(RoomCommand::EndSession(peer_id))) => {
                    if let Err(e) = self.end_session(&peer_id).await {
                        tracing::warn!("Ending session with {peer_id} failed: {e}");
                    }
                }
                Input::Command(Some(RoomCommand::Leave)) | Input::Command(None) => {
                    self.leave().await;
                    return Ok(());
                }
            }
        }
    }

    /// Joins `room_id` and serves it on a background task
    pub fn spawn(mut self, room_id: impl Into<String>) -> RoomHandle {
        let room_id = room_id.into();
        let (commands, commands_rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            self.join(&room_id).await?;
            self.run(commands_rx).await
        });
        RoomHandle { commands, task }
    }
}

pub struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    task: JoinHandle<Result<(), RoomError>>,
}

impl RoomHandle {
    pub async fn end_session(&self, peer_id: PeerId) -> bool {
        self.commands
            .send(RoomCommand::EndSession(peer_id))
            .await
            .is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Leaves the room and returns how the room task ended
    pub async fn leave(self) -> Result<(), RoomError> {
        let _ = self.commands.send(RoomCommand::Leave).await;
        self.task.await?
    }
}
