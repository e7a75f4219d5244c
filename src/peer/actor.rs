//! One task per peer session.
//!
//! Inputs for a peer (signaling commands, engine callbacks, timers) are
//! funnelled through a single `select!` loop, so negotiation for one peer is
//! strictly serialized while different peers proceed concurrently.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::engine::ConnectionEvent;
use crate::error::NegotiationError;
use crate::events::{PeerState, RoomEvents};
use crate::peer::session::{PeerSession, SessionShared, SessionStatus};
use crate::peer::types::{IceCandidate, PeerId, Role, SessionDescription};

#[derive(Debug)]
pub enum SessionCommand {
    StartAsInitiator,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    Close,
}

/// Sent to the orchestrator when a session task exits on its own
#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub peer_id: PeerId,
    pub generation: u64,
    pub error: Option<String>,
}

/// Cheap, cloneable control surface of a running session
#[derive(Clone)]
pub struct SessionHandle {
    peer_id: PeerId,
    role: Role,
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<SessionShared>,
    status: watch::Receiver<SessionStatus>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn new(
        peer_id: PeerId,
        role: Role,
        generation: u64,
        commands: mpsc::UnboundedSender<SessionCommand>,
        shared: Arc<SessionShared>,
    ) -> Self {
        let status = shared.subscribe();
        Self {
            peer_id,
            role,
            generation,
            commands,
            shared,
            status,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.commands.is_closed()
    }

    /// Queues a command; false when the task is already gone
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Closes the connection right away, even if the task is parked on an
    /// engine call, then asks the task to finish.
    pub async fn close(&self) {
        self.shared.close_connection().await;
        let _ = self.commands.send(SessionCommand::Close);
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn dispatch(session: &mut PeerSession, command: SessionCommand) -> Result<(), NegotiationError> {
    match command {
        SessionCommand::StartAsInitiator => session.start_as_initiator().await,
        SessionCommand::RemoteOffer(offer) => session.receive_offer(offer).await,
        SessionCommand::RemoteAnswer(answer) => session.receive_answer(answer).await,
        SessionCommand::RemoteCandidate(candidate) => session.receive_candidate(candidate).await,
        SessionCommand::Close => {
            session.close().await;
            Ok(())
        }
    }
}

pub async fn run(
    mut session: PeerSession,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    events: RoomEvents,
    ended: mpsc::UnboundedSender<SessionEnded>,
    generation: u64,
) {
    let peer_id = session.peer_id().clone();
    tracing::debug!("Session task for {peer_id} started (generation {generation})");

    let mut error = None;
    loop {
        let deadline = session.next_deadline();
        let step = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => dispatch(&mut session, command).await,
                None => break,
            },
            Some(event) = connection_events.recv() => session.on_connection_event(event).await,
            _ = wait_for(deadline) => session.on_timer(Instant::now()).await,
        };

        match step {
            Ok(()) => {}
            Err(NegotiationError::SessionClosed) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!("Session with {peer_id} failed: {e}");
                error = Some(e.to_string());
                break;
            }
            Err(e) => tracing::warn!("Dropped input for {peer_id}: {e}"),
        }

        if session.is_closed() {
            break;
        }
    }

    session.close().await;
    if error.is_some() {
        events.peer_state(&peer_id, PeerState::Failed);
    }
    let _ = ended.send(SessionEnded {
        peer_id: peer_id.clone(),
        generation,
        error,
    });
    tracing::debug!("Session task for {peer_id} finished");
}
