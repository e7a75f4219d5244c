//! Room-scoped map of remote peer → live session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::RoomConfig;
use crate::engine::RtcEngine;
use crate::error::NegotiationError;
use crate::events::RoomEvents;
use crate::media::LocalMediaHandle;
use crate::peer::actor::{self, SessionEnded, SessionHandle};
use crate::peer::recovery::Recovery;
use crate::peer::session::{PeerSession, SessionShared};
use crate::peer::types::{PeerId, Role};
use crate::signaling::SignalingSender;

/// Everything a new session needs from the room
pub struct SessionFactory {
    pub engine: Arc<dyn RtcEngine>,
    pub media: LocalMediaHandle,
    pub signaling: SignalingSender,
    pub events: RoomEvents,
    pub ended: mpsc::UnboundedSender<SessionEnded>,
    pub restart_budget: u32,
    pub offer_retry_delay: Duration,
    pub disconnect_grace: Duration,
}

impl SessionFactory {
    pub fn new(
        config: &RoomConfig,
        engine: Arc<dyn RtcEngine>,
        media: LocalMediaHandle,
        signaling: SignalingSender,
        events: RoomEvents,
        ended: mpsc::UnboundedSender<SessionEnded>,
    ) -> Self {
        Self {
            engine,
            media,
            signaling,
            events,
            ended,
            restart_budget: config.ice_restart_budget,
            offer_retry_delay: config.offer_retry_delay(),
            disconnect_grace: config.disconnect_grace(),
        }
    }

    async fn spawn(
        &self,
        peer_id: &PeerId,
        role: Role,
        generation: u64,
    ) -> Result<(SessionHandle, JoinHandle<()>), NegotiationError> {
        let (sink, connection_events) = mpsc::unbounded_channel();
        let connection = self
            .engine
            .create_connection(peer_id, sink)
            .await
            .map_err(NegotiationError::Connection)?;

        if let Err(e) = connection.add_local_tracks(&self.media).await {
            let _ = connection.close().await;
            return Err(NegotiationError::Connection(e));
        }

        let shared = Arc::new(SessionShared::new(connection));
        let session = PeerSession::new(
            peer_id.clone(),
            role,
            shared.clone(),
            self.media.clone(),
            self.signaling.clone(),
            self.events.clone(),
            Recovery::new(self.restart_budget, self.offer_retry_delay, self.disconnect_grace),
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(actor::run(
            session,
            commands,
            connection_events,
            self.events.clone(),
            self.ended.clone(),
            generation,
        ));
        Ok((SessionHandle::new(peer_id.clone(), role, generation, commands_tx, shared), task))
    }
}

struct Entry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// At most one live session per remote peer id.
pub struct SessionRegistry {
    factory: SessionFactory,
    sessions: HashMap<PeerId, Entry>,
    /// Tasks of removed sessions, still winding down
    retired: Vec<JoinHandle<()>>,
    next_generation: u64,
    teardown_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(factory: SessionFactory, teardown_timeout: Duration) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            retired: Vec::new(),
            next_generation: 0,
            teardown_timeout,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<SessionHandle> {
        self.sessions.get(peer_id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the live session for `peer_id`, creating one in `role` if
    /// there is none. The flag tells whether a session was created.
    /// An entry whose session already closed is replaced.
    pub async fn get_or_create(
        &mut self,
        peer_id: &PeerId,
        role: Role,
    ) -> Result<(SessionHandle, bool), NegotiationError> {
        let live = self
            .sessions
            .get(peer_id)
            .map(|entry| !entry.handle.is_closed())
            .unwrap_or(false);
        if live {
            if let Some(entry) = self.sessions.get(peer_id) {
                return Ok((entry.handle.clone(), false));
            }
        }

        if let Some(stale) = self.sessions.remove(peer_id) {
            tracing::debug!("Replacing closed session for {peer_id}");
            self.retire(stale).await;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (handle, task) = self.factory.spawn(peer_id, role, generation).await?;
        tracing::info!("Session for {peer_id} created as {role:?} (generation {generation})");
        self.sessions.insert(
            peer_id.clone(),
            Entry {
                handle: handle.clone(),
                task,
            },
        );
        Ok((handle, true))
    }

    /// Closes and forgets the session for `peer_id`. No-op for unknown ids.
    pub async fn remove(&mut self, peer_id: &PeerId) -> bool {
        match self.sessions.remove(peer_id) {
            Some(entry) => {
                tracing::info!("Removing session for {peer_id}");
                self.retire(entry).await;
                true
            }
            None => false,
        }
    }

    /// Forgets the entry only if it still belongs to `generation`
    pub async fn remove_generation(&mut self, peer_id: &PeerId, generation: u64) -> bool {
        let matches = self
            .sessions
            .get(peer_id)
            .map(|entry| entry.handle.generation() == generation)
            .unwrap_or(false);
        if matches {
            self.remove(peer_id).await
        } else {
            false
        }
    }

    async fn retire(&mut self, entry: Entry) {
        entry.handle.close().await;
        self.retired.retain(|task| !task.is_finished());
        self.retired.push(entry.task);
    }

    /// Closes every session and waits for their tasks, up to the teardown
    /// timeout; stragglers are aborted.
    pub async fn close_all(&mut self) {
        let entries: Vec<Entry> = self.sessions.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.handle.close().await;
        }

        let mut tasks: Vec<JoinHandle<()>> = entries.into_iter().map(|entry| entry.task).collect();
        tasks.append(&mut self.retired);
        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        let joined = timeout(self.teardown_timeout, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!("Session teardown exceeded {:?}, aborting", self.teardown_timeout);
            for task in tasks.iter().filter(|task| !task.is_finished()) {
                task.abort();
            }
        }
        tracing::debug!("Closed {count} session task(s)");
    }
}
