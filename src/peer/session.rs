//! Per-peer negotiation state machine.
//!
//! A `PeerSession` is only ever driven by its own actor task, so every
//! method here runs to completion before the next input for the same peer
//! is looked at. The one thing shared with the outside is `SessionShared`,
//! which lets teardown close the engine connection while an engine call is
//! still pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::{ConnectionEvent, RtcConnection};
use crate::error::NegotiationError;
use crate::events::{PeerState, RoomEvent, RoomEvents};
use crate::logger::{dump_candidate, GatheringSummary};
use crate::media::LocalMediaHandle;
use crate::peer::candidates::CandidateBuffer;
use crate::peer::recovery::Recovery;
use crate::peer::types::{
    ConnectivityState, IceCandidate, NegotiationState, PeerId, Role, SessionDescription,
};
use crate::signaling::{OutboundSignal, SignalingSender};

/// Snapshot published after every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub negotiation: NegotiationState,
    pub connectivity: ConnectivityState,
    pub pending_candidates: usize,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            negotiation: NegotiationState::New,
            connectivity: ConnectivityState::New,
            pending_candidates: 0,
        }
    }
}

/// Session state visible outside the actor task
pub struct SessionShared {
    closed: AtomicBool,
    connection: Arc<dyn RtcConnection>,
    status: watch::Sender<SessionStatus>,
}

impl SessionShared {
    pub fn new(connection: Arc<dyn RtcConnection>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            closed: AtomicBool::new(false),
            connection,
            status,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Marks the session closed and closes the engine connection.
    /// Only the first caller does the closing; returns whether it was us.
    pub async fn close_connection(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Closing connection failed: {e}");
        }
        true
    }
}

pub struct PeerSession {
    peer_id: PeerId,
    role: Role,
    negotiation: NegotiationState,
    connectivity: ConnectivityState,
    pending: CandidateBuffer,
    recovery: Recovery,
    gathered: GatheringSummary,
    media: Option<LocalMediaHandle>,
    shared: Arc<SessionShared>,
    signaling: SignalingSender,
    events: RoomEvents,
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        role: Role,
        shared: Arc<SessionShared>,
        media: LocalMediaHandle,
        signaling: SignalingSender,
        events: RoomEvents,
        recovery: Recovery,
    ) -> Self {
        Self {
            peer_id,
            role,
            negotiation: NegotiationState::New,
            connectivity: ConnectivityState::New,
            pending: CandidateBuffer::new(),
            recovery,
            gathered: GatheringSummary::default(),
            media: Some(media),
            shared,
            signaling,
            events,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.negotiation == NegotiationState::Closed || self.shared.is_closed()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.recovery.next_deadline()
    }

    /// ========== OFFER SIDE ==========

    pub async fn start_as_initiator(&mut self) -> Result<(), NegotiationError> {
        if self.negotiation != NegotiationState::New {
            return Err(NegotiationError::InvalidState {
                op: "start negotiation",
                state: self.negotiation,
            });
        }
        self.events.peer_state(&self.peer_id, PeerState::Connecting);
        self.send_offer(false).await
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), NegotiationError> {
        let connection = self.shared.connection.clone();

        let offer = match connection.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(e) if e.is_transient() => {
                self.ensure_open()?;
                self.recovery.offer_retry.schedule(Instant::now(), ice_restart);
                tracing::warn!(
                    "Offer for {} not created ({e}), retry #{} scheduled",
                    self.peer_id,
                    self.recovery.offer_retry.attempts()
                );
                return Ok(());
            }
            Err(e) => {
                self.ensure_open()?;
                return Err(NegotiationError::LocalDescription(e));
            }
        };
        self.ensure_open()?;

        connection
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.ensure_open()?;

        self.recovery.offer_retry.succeeded();
        self.negotiation = NegotiationState::LocalOfferSet;
        self.publish();
        tracing::info!(
            "Sending {}offer to {}",
            if ice_restart { "ICE restart " } else { "" },
            self.peer_id
        );
        self.send(OutboundSignal::Offer {
            peer_id: self.peer_id.clone(),
            sdp: offer,
        });
        Ok(())
    }

    pub async fn receive_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.negotiation != NegotiationState::LocalOfferSet {
            return Err(NegotiationError::InvalidState {
                op: "apply remote answer",
                state: self.negotiation,
            });
        }

        // The engine is left holding our offer with no way back to Stable.
        self.shared
            .connection
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::AnswerRejected)?;
        self.ensure_open()?;

        self.flush_pending().await?;
        self.negotiation = NegotiationState::Stable;
        self.publish();
        tracing::info!("Answer from {} applied", self.peer_id);
        Ok(())
    }

    /// ========== ANSWER SIDE ==========

    pub async fn receive_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        match self.negotiation {
            NegotiationState::New => {
                self.events.peer_state(&self.peer_id, PeerState::Connecting);
            }
            NegotiationState::Stable => {
                tracing::info!("Renegotiation offer from {}", self.peer_id);
            }
            NegotiationState::LocalOfferSet => {
                // Both sides offered; ours stands.
                tracing::warn!("Glare with {}: ignoring remote offer", self.peer_id);
                return Ok(());
            }
            NegotiationState::Closed => return Err(NegotiationError::SessionClosed),
            state => {
                return Err(NegotiationError::InvalidState {
                    op: "apply remote offer",
                    state,
                })
            }
        }

        let connection = self.shared.connection.clone();

        connection
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::RemoteDescription)?;
        self.ensure_open()?;
        self.recovery.offer_retry.cancel_initial();

        self.flush_pending().await?;
        self.negotiation = NegotiationState::RemoteOfferSet;
        self.publish();

        let answer = connection
            .create_answer()
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.ensure_open()?;

        connection
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.ensure_open()?;

        self.negotiation = NegotiationState::Stable;
        self.publish();
        tracing::info!("Sending answer to {}", self.peer_id);
        self.send(OutboundSignal::Answer {
            peer_id: self.peer_id.clone(),
            sdp: answer,
        });
        Ok(())
    }

    /// ========== CANDIDATES ==========

    pub async fn receive_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        dump_candidate("REMOTE", self.peer_id.as_str(), &candidate);

        if self.negotiation == NegotiationState::Closed {
            tracing::debug!("Dropping candidate for closed session {}", self.peer_id);
            return Ok(());
        }

        if self.negotiation.buffers_candidates() {
            self.pending.push(candidate);
            tracing::debug!(
                "Queued candidate from {} ({} pending)",
                self.peer_id,
                self.pending.len()
            );
            self.publish();
            return Ok(());
        }

        self.apply_candidate(candidate).await;
        self.ensure_open()
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.shared.connection.add_ice_candidate(candidate).await {
            tracing::warn!("Candidate from {} rejected: {e}", self.peer_id);
        }
    }

    async fn flush_pending(&mut self) -> Result<(), NegotiationError> {
        let queued = self.pending.drain();
        if queued.is_empty() {
            return Ok(());
        }
        tracing::debug!("Applying {} queued candidates from {}", queued.len(), self.peer_id);
        for candidate in queued {
            self.apply_candidate(candidate).await;
            self.ensure_open()?;
        }
        Ok(())
    }

    /// ========== ENGINE EVENTS ==========

    pub async fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", self.peer_id.as_str(), &candidate);
                self.gathered.record(&candidate);
                self.send(OutboundSignal::Candidate {
                    peer_id: self.peer_id.clone(),
                    candidate,
                });
                Ok(())
            }
            ConnectionEvent::GatheringComplete => {
                self.gathered.log(self.peer_id.as_str());
                Ok(())
            }
            ConnectionEvent::Connectivity(state) => self.on_connectivity(state).await,
            ConnectionEvent::RemoteTrack(track) => {
                tracing::info!("Remote {:?} track {} from {}", track.kind, track.id, self.peer_id);
                self.events.emit(RoomEvent::RemoteStreamAvailable {
                    peer_id: self.peer_id.clone(),
                    track,
                });
                Ok(())
            }
        }
    }

    pub async fn on_connectivity(&mut self, next: ConnectivityState) -> Result<(), NegotiationError> {
        let prev = self.connectivity;
        if prev == next || prev == ConnectivityState::Closed {
            return Ok(());
        }
        self.connectivity = next;
        self.publish();
        tracing::info!("ICE {:?} -> {:?} for {}", prev, next, self.peer_id);

        match next {
            ConnectivityState::Connected | ConnectivityState::Completed => {
                self.recovery.grace.cancel();
                self.recovery.restart_wait.cancel();
                self.recovery.restart.reset();
                if !prev.is_up() {
                    self.events.peer_state(&self.peer_id, PeerState::Connected);
                }
                Ok(())
            }
            ConnectivityState::Disconnected => {
                self.recovery.grace.arm(Instant::now());
                self.events.peer_state(&self.peer_id, PeerState::Recovering);
                Ok(())
            }
            ConnectivityState::Failed => {
                self.recovery.grace.cancel();
                self.restart_ice().await
            }
            ConnectivityState::New | ConnectivityState::Checking | ConnectivityState::Closed => Ok(()),
        }
    }

    async fn restart_ice(&mut self) -> Result<(), NegotiationError> {
        if !self.recovery.restart.try_consume() {
            return Err(NegotiationError::RestartsExhausted(self.recovery.restart.used()));
        }
        self.events.peer_state(&self.peer_id, PeerState::Recovering);
        self.recovery.restart_wait.arm(Instant::now());

        match self.role {
            Role::Initiator if self.negotiation == NegotiationState::Stable => {
                tracing::info!("ICE failed for {}, restarting", self.peer_id);
                self.send_offer(true).await
            }
            Role::Initiator => {
                tracing::info!(
                    "ICE failed for {} mid-negotiation ({:?}), restart deferred",
                    self.peer_id,
                    self.negotiation
                );
                self.recovery.offer_retry.schedule(Instant::now(), true);
                Ok(())
            }
            Role::Responder => {
                tracing::info!("ICE failed for {}, waiting for restart offer", self.peer_id);
                Ok(())
            }
        }
    }

    /// Fires whichever recovery timers have come due
    pub async fn on_timer(&mut self, now: Instant) -> Result<(), NegotiationError> {
        if self.recovery.restart_wait.take_expired(now) && !self.connectivity.is_up() {
            tracing::warn!("{} did not recover after ICE restart", self.peer_id);
            return Err(NegotiationError::RestartTimedOut(
                self.recovery.restart_wait.period(),
            ));
        }
        if self.recovery.grace.take_expired(now) && self.connectivity == ConnectivityState::Disconnected {
            tracing::warn!("{} still disconnected after grace period", self.peer_id);
            self.on_connectivity(ConnectivityState::Failed).await?;
        }
        if let Some(ice_restart) = self.recovery.offer_retry.take_due(now) {
            self.retry_offer(now, ice_restart).await?;
        }
        Ok(())
    }

    async fn retry_offer(&mut self, now: Instant, ice_restart: bool) -> Result<(), NegotiationError> {
        match self.negotiation {
            NegotiationState::New => self.send_offer(ice_restart).await,
            NegotiationState::Stable if ice_restart => self.send_offer(true).await,
            NegotiationState::LocalOfferSet | NegotiationState::RemoteOfferSet if ice_restart => {
                self.recovery.offer_retry.schedule(now, true);
                Ok(())
            }
            state => {
                tracing::debug!("Offer retry for {} dropped in {:?}", self.peer_id, state);
                Ok(())
            }
        }
    }

    /// ========== TEARDOWN ==========

    /// Idempotent. Drops the queue, stops timers, closes the engine
    /// connection and lets go of the local media.
    pub async fn close(&mut self) {
        if self.negotiation == NegotiationState::Closed {
            return;
        }
        self.negotiation = NegotiationState::Closed;
        self.connectivity = ConnectivityState::Closed;
        self.pending.clear();
        self.recovery.cancel_timers();
        self.shared.close_connection().await;
        self.media = None;
        self.publish();
        tracing::info!("Session with {} closed", self.peer_id);
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn send(&self, signal: OutboundSignal) {
        if let Err(e) = self.signaling.send(signal) {
            tracing::warn!("Signal to {} not sent: {e}", self.peer_id);
        }
    }

    fn publish(&self) {
        debug_assert!(
            self.pending.is_empty() || self.negotiation.buffers_candidates(),
            "queued candidates in {:?}",
            self.negotiation
        );
        self.shared.status.send_replace(SessionStatus {
            negotiation: self.negotiation,
            connectivity: self.connectivity,
            pending_candidates: self.pending.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::engine::mock::{Call, MockConnection, MockEngine};
    use crate::engine::RtcEngine;
    use crate::peer::types::SdpKind;

    struct Harness {
        session: PeerSession,
        conn: Arc<MockConnection>,
        engine: Arc<MockEngine>,
        wire: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    }

    impl Harness {
        async fn new(role: Role) -> Self {
            let engine = MockEngine::new();
            let (sink, _conn_events) = mpsc::unbounded_channel();
            let peer: PeerId = "b".into();
            engine.create_connection(&peer, sink).await.unwrap();
            let conn = engine.connection("b").unwrap();

            let (frames, wire) = mpsc::unbounded_channel();
            let (events, events_rx) = RoomEvents::channel();
            let session = PeerSession::new(
                peer,
                role,
                Arc::new(SessionShared::new(conn.clone())),
                LocalMediaHandle::new(Vec::new()),
                SignalingSender::new(frames),
                events,
                Recovery::new(1, Duration::from_secs(1), Duration::from_secs(10)),
            );
            Self {
                session,
                conn,
                engine,
                wire,
                events: events_rx,
            }
        }

        fn sent(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.wire.try_recv() {
                let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                out.push(value["event"].as_str().unwrap().to_owned());
            }
            out
        }

        fn states(&mut self) -> Vec<PeerState> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let RoomEvent::PeerStateChanged { state, .. } = event {
                    out.push(state);
                }
            }
            out
        }
    }

    fn cand(n: u8) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn initiator_offers_then_settles_on_answer() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::LocalOfferSet);
        assert_eq!(h.sent(), vec!["offer"]);

        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::Stable);
        assert_eq!(h.states(), vec![PeerState::Connecting]);
    }

    #[tokio::test]
    async fn responder_answers_offer() {
        let mut h = Harness::new(Role::Responder).await;
        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::Stable);
        assert_eq!(h.sent(), vec!["answer"]);
        assert_eq!(
            h.conn.calls(),
            vec![
                Call::SetRemote(SdpKind::Offer),
                Call::CreateAnswer,
                Call::SetLocal(SdpKind::Answer),
            ]
        );
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let mut h = Harness::new(Role::Responder).await;
        h.session.receive_candidate(cand(1)).await.unwrap();
        h.session.receive_candidate(cand(2)).await.unwrap();
        assert_eq!(h.session.pending_candidates(), 2);
        assert!(h.conn.applied_candidates().is_empty());

        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.pending_candidates(), 0);
        assert_eq!(
            h.conn.applied_candidates(),
            vec![cand(1).candidate, cand(2).candidate]
        );

        // Remote description present: applied straight away.
        h.session.receive_candidate(cand(3)).await.unwrap();
        assert_eq!(h.conn.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn candidates_flush_before_answer_settles() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session.receive_candidate(cand(1)).await.unwrap();
        assert_eq!(h.session.pending_candidates(), 1);

        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        let calls = h.conn.calls();
        let remote = calls
            .iter()
            .position(|c| *c == Call::SetRemote(SdpKind::Answer))
            .unwrap();
        let applied = calls
            .iter()
            .position(|c| matches!(c, Call::AddCandidate(_)))
            .unwrap();
        assert!(remote < applied);
    }

    #[tokio::test]
    async fn answer_in_wrong_state_is_rejected_without_change() {
        let mut h = Harness::new(Role::Responder).await;
        let err = h
            .session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidState { .. }));
        assert!(!err.is_fatal());
        assert_eq!(h.session.negotiation(), NegotiationState::New);
        assert!(h.conn.calls().is_empty());
    }

    #[tokio::test]
    async fn glare_keeps_local_offer() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::LocalOfferSet);
        assert_eq!(h.conn.count(&Call::CreateAnswer), 0);
    }

    #[tokio::test]
    async fn rejected_remote_offer_leaves_state_untouched() {
        let mut h = Harness::new(Role::Responder).await;
        h.engine.script.reject_remote.store(true, Ordering::SeqCst);
        let err = h
            .session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::RemoteDescription(_)));
        assert_eq!(h.session.negotiation(), NegotiationState::New);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_answer_is_fatal() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session.receive_candidate(cand(1)).await.unwrap();
        h.engine.script.reject_remote.store(true, Ordering::SeqCst);

        let err = h
            .session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::AnswerRejected(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn status_shows_no_queue_once_remote_description_is_set() {
        let mut h = Harness::new(Role::Responder).await;
        let status = h.session.shared.subscribe();
        h.session.receive_candidate(cand(1)).await.unwrap();
        h.session.receive_candidate(cand(2)).await.unwrap();
        assert_eq!(status.borrow().pending_candidates, 2);

        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let last = *status.borrow();
        assert_eq!(last.negotiation, NegotiationState::Stable);
        assert_eq!(last.pending_candidates, 0);
    }

    #[tokio::test]
    async fn failed_answer_creation_is_fatal() {
        let mut h = Harness::new(Role::Responder).await;
        h.engine.script.fail_answers.store(true, Ordering::SeqCst);
        let err = h
            .session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_offer_is_retried_after_delay() {
        let mut h = Harness::new(Role::Initiator).await;
        h.engine.script.busy_offers.store(1, Ordering::SeqCst);
        h.session.start_as_initiator().await.unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::New);
        assert!(h.sent().is_empty());

        let deadline = h.session.next_deadline().unwrap();
        h.session.on_timer(deadline - Duration::from_millis(1)).await.unwrap();
        assert!(h.sent().is_empty());

        h.session.on_timer(deadline).await.unwrap();
        assert_eq!(h.sent(), vec!["offer"]);
        assert_eq!(h.session.next_deadline(), None);
    }

    #[tokio::test]
    async fn ice_failure_restarts_once_from_initiator() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        h.sent();

        h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 1);
        assert_eq!(h.sent(), vec!["offer"]);

        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Checking).await.unwrap();
        let err = h
            .session
            .on_connectivity(ConnectivityState::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::RestartsExhausted(1)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn recovery_refills_restart_budget() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();

        for _ in 0..2 {
            h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();
            h.session
                .receive_answer(SessionDescription::answer("v=0"))
                .await
                .unwrap();
            h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        }
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 2);
    }

    #[tokio::test]
    async fn responder_waits_for_restart_offer() {
        let mut h = Harness::new(Role::Responder).await;
        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        h.sent();
        h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 0);
        assert!(h.sent().is_empty());
        assert_eq!(h.states().last(), Some(&PeerState::Recovering));
    }

    #[tokio::test(start_paused = true)]
    async fn responder_gives_up_when_no_restart_offer_arrives() {
        let mut h = Harness::new(Role::Responder).await;
        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();

        let deadline = h.session.next_deadline().unwrap();
        h.session.on_timer(deadline - Duration::from_millis(1)).await.unwrap();

        let err = h.session.on_timer(deadline).await.unwrap_err();
        assert!(matches!(err, NegotiationError::RestartTimedOut(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_wait_ends_when_connectivity_returns() {
        let mut h = Harness::new(Role::Responder).await;
        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();
        assert!(h.session.next_deadline().is_some());

        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        assert_eq!(h.session.next_deadline(), None);
        assert_eq!(h.sent(), vec!["answer", "answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_restart_is_time_bounded() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Failed).await.unwrap();
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 1);

        let deadline = h.session.next_deadline().unwrap();
        assert!(matches!(
            h.session.on_timer(deadline).await,
            Err(NegotiationError::RestartTimedOut(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_retry_dropped_once_remote_offer_is_answered() {
        let mut h = Harness::new(Role::Initiator).await;
        h.engine.script.busy_offers.store(1, Ordering::SeqCst);
        h.session.start_as_initiator().await.unwrap();
        let deadline = h.session.next_deadline().unwrap();

        h.session
            .receive_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.negotiation(), NegotiationState::Stable);
        assert_eq!(h.session.next_deadline(), None);

        h.session.on_timer(deadline).await.unwrap();
        assert_eq!(h.sent(), vec!["answer"]);
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: false }), 1);
    }

    #[tokio::test]
    async fn no_restart_without_failure() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        for state in [
            ConnectivityState::Checking,
            ConnectivityState::Connected,
            ConnectivityState::Completed,
            ConnectivityState::Closed,
        ] {
            h.session.on_connectivity(state).await.unwrap();
        }
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_expiry_counts_as_failure() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        h.session.on_connectivity(ConnectivityState::Disconnected).await.unwrap();

        let deadline = h.session.next_deadline().unwrap();
        h.session.on_timer(deadline).await.unwrap();
        assert_eq!(h.session.connectivity(), ConnectivityState::Failed);
        assert_eq!(h.conn.count(&Call::CreateOffer { ice_restart: true }), 1);
    }

    #[tokio::test]
    async fn reconnect_within_grace_cancels_timer() {
        let mut h = Harness::new(Role::Responder).await;
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        h.session.on_connectivity(ConnectivityState::Disconnected).await.unwrap();
        assert!(h.session.next_deadline().is_some());
        h.session.on_connectivity(ConnectivityState::Connected).await.unwrap();
        assert_eq!(h.session.next_deadline(), None);
    }

    #[tokio::test]
    async fn local_candidates_are_trickled() {
        let mut h = Harness::new(Role::Initiator).await;
        h.session.start_as_initiator().await.unwrap();
        h.session
            .on_connection_event(ConnectionEvent::LocalCandidate(cand(7)))
            .await
            .unwrap();

        let frames: Vec<_> = std::iter::from_fn(|| h.wire.try_recv().ok()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].contains(r#""event":"candidate""#));
        assert!(frames[1].contains(r#""peerId":"b""#));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_queue() {
        let mut h = Harness::new(Role::Responder).await;
        h.session.receive_candidate(cand(1)).await.unwrap();
        h.session.close().await;
        h.session.close().await;

        assert_eq!(h.session.pending_candidates(), 0);
        assert_eq!(h.conn.count(&Call::Close), 1);
        assert!(h.session.is_closed());

        h.session.receive_candidate(cand(2)).await.unwrap();
        assert!(h.conn.applied_candidates().is_empty());
        assert!(matches!(
            h.session.receive_offer(SessionDescription::offer("v=0")).await,
            Err(NegotiationError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn offer_resolving_after_close_is_discarded() {
        let mut h = Harness::new(Role::Initiator).await;
        h.engine.script.hold_offers.store(true, Ordering::SeqCst);
        let shared = h.session.shared.clone();

        let closer = async {
            tokio::task::yield_now().await;
            shared.close_connection().await;
        };
        let (result, _) = tokio::join!(h.session.start_as_initiator(), closer);

        assert!(matches!(result, Err(NegotiationError::SessionClosed)));
        assert_eq!(h.conn.count(&Call::SetLocal(SdpKind::Offer)), 0);
        assert!(h.sent().is_empty());
    }
}
