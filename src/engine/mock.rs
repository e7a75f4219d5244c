//! Scripted engine for tests: records every call and lets the test drive
//! connection events by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::engine::{ConnectionEvent, ConnectionEventSink, RtcConnection, RtcEngine};
use crate::error::EngineError;
use crate::media::LocalMediaHandle;
use crate::peer::types::{IceCandidate, PeerId, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTracks(usize),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

/// Behaviour shared by every connection the engine hands out
#[derive(Default)]
pub struct Script {
    /// Number of upcoming `create_offer` calls that report `Busy`
    pub busy_offers: AtomicUsize,
    /// Offers block until the connection is closed
    pub hold_offers: AtomicBool,
    pub reject_remote: AtomicBool,
    pub fail_answers: AtomicBool,
    pub fail_connections: AtomicBool,
}

#[derive(Default)]
pub struct MockEngine {
    pub script: Arc<Script>,
    connections: Mutex<Vec<(PeerId, Arc<MockConnection>)>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent connection created for `peer`
    pub fn connection(&self, peer: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == peer)
            .map(|(_, conn)| conn.clone())
    }

    pub fn connection_count(&self, peer: &str) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == peer)
            .count()
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>, EngineError> {
        if self.script.fail_connections.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("scripted connection failure".into()));
        }
        let conn = Arc::new(MockConnection::new(peer_id.clone(), self.script.clone(), events));
        self.connections
            .lock()
            .unwrap()
            .push((peer_id.clone(), conn.clone()));
        Ok(conn)
    }
}

pub struct MockConnection {
    peer_id: PeerId,
    script: Arc<Script>,
    events: ConnectionEventSink,
    calls: Mutex<Vec<Call>>,
    gate: watch::Sender<bool>,
    offers: AtomicUsize,
}

impl MockConnection {
    pub fn new(peer_id: PeerId, script: Arc<Script>, events: ConnectionEventSink) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            peer_id,
            script,
            events,
            calls: Mutex::new(Vec::new()),
            gate,
            offers: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Injects an engine callback as if the engine had fired it
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn add_local_tracks(&self, media: &LocalMediaHandle) -> Result<(), EngineError> {
        self.record(Call::AddTracks(media.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        self.record(Call::CreateOffer { ice_restart });

        let busy = self
            .script
            .busy_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(EngineError::Busy("scripted".into()));
        }

        if self.script.hold_offers.load(Ordering::SeqCst) {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }

        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}-{n}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(Call::CreateAnswer);
        if self.script.fail_answers.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("scripted answer failure".into()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.peer_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(Call::SetRemote(desc.kind));
        if self.script.reject_remote.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("scripted remote failure".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(Call::Close);
        self.gate.send_replace(true);
        Ok(())
    }
}
