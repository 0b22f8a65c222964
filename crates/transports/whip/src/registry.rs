//! Concurrent session registry
//!
//! The registry map is the single source of truth for whether a session is
//! alive. Admission and removal are serialized by one lock; a per-entry
//! `removed` flag checked under that same lock makes transport release happen
//! exactly once, however many callers race to remove a session.

use crate::codec::Codec;
use crate::session::{ConnectionState, Session, SessionEvent, SessionId, SessionSnapshot, StateChange};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 256;

struct Entry {
    session: Arc<Session>,
    /// Set by the first `remove`; the entry stays until resources are released
    removed: bool,
}

struct RegistryInner {
    sessions: HashMap<SessionId, Entry>,
    accepting: bool,
}

/// Owned registry of live sessions, shared by the ingest facade, the bridge
/// event consumers and the lifecycle supervisor
pub struct SessionRegistry {
    limit: usize,
    inner: Mutex<RegistryInner>,
    notifications: broadcast::Sender<StateChange>,
}

impl SessionRegistry {
    /// Create a registry admitting at most `limit` concurrent sessions
    pub fn new(limit: usize) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            limit,
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                accepting: true,
            }),
            notifications,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit a new session in state `New`
    ///
    /// Sessions pending removal still count against the limit until their
    /// resources are released.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] if the registry is full
    /// - [`Error::SessionExists`] if `id` is already registered
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    pub fn admit(&self, id: SessionId, codecs: Vec<Codec>) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock();

        if !inner.accepting {
            return Err(Error::ShuttingDown);
        }

        if inner.sessions.len() >= self.limit {
            return Err(Error::CapacityExceeded { limit: self.limit });
        }

        if inner.sessions.contains_key(&id) {
            return Err(Error::SessionExists(id.to_string()));
        }

        let session = Arc::new(Session::new(id.clone(), codecs));
        inner.sessions.insert(
            id,
            Entry {
                session: Arc::clone(&session),
                removed: false,
            },
        );

        debug!(
            session_id = %session.id(),
            active = inner.sessions.len(),
            "Admitted session"
        );

        Ok(session)
    }

    /// Look up a live session; sessions pending removal are not returned
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .get(id)
            .filter(|entry| !entry.removed)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Remove a session, releasing its transport first
    ///
    /// A session that is still live is closed on the way out, so holders of
    /// its handle never see it stuck in a non-terminal state. Idempotent: only
    /// the first call for a given session releases resources and returns
    /// `true`.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            match inner.sessions.get_mut(id) {
                Some(entry) if !entry.removed => {
                    entry.removed = true;
                    Arc::clone(&entry.session)
                }
                _ => return false,
            }
        };

        if let Some(change) = session.apply(SessionEvent::Teardown) {
            let _ = self.notifications.send(change);
        }

        if let Some(transport) = session.take_transport() {
            if let Err(e) = transport.close().await {
                warn!(session_id = %id, "Failed to close transport: {}", e);
            }
        }

        let active = {
            let mut inner = self.inner.lock();
            inner.sessions.remove(id);
            inner.sessions.len()
        };

        info!(
            session_id = %id,
            state = %session.state(),
            active,
            "Removed session"
        );

        true
    }

    /// Explicit teardown: transition to `Closed`, then remove
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] if no live session has this id.
    pub async fn teardown(&self, id: &SessionId) -> Result<()> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        match session.apply(SessionEvent::Teardown) {
            Some(change) => self.report(change).await,
            // Already terminal; make sure it is gone
            None => {
                self.remove(id).await;
            }
        }

        Ok(())
    }

    /// Consume a state change: publish it, and reap the session if it ended
    pub async fn report(&self, change: StateChange) {
        let terminal = change.to.is_terminal();
        let id = change.session_id.clone();

        if change.to == ConnectionState::Failed {
            warn!(
                session_id = %id,
                from = %change.from,
                reason = change.reason.as_deref().unwrap_or("unknown"),
                "Session failed"
            );
        } else {
            info!(session_id = %id, from = %change.from, to = %change.to, "Session state changed");
        }

        // No subscribers is fine
        let _ = self.notifications.send(change);

        if terminal {
            self.remove(&id).await;
        }
    }

    /// Subscribe to state changes of every session
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notifications.subscribe()
    }

    /// Number of registered sessions, including those pending removal
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    /// Live sessions, in no particular order
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|entry| !entry.removed)
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }

    /// Sessions that reached a terminal state but are still registered
    pub(crate) fn terminal_sessions(&self) -> Vec<SessionId> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|(_, entry)| !entry.removed && entry.session.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions().iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at_ms);
        snapshots
    }

    /// Stop admitting and close every remaining session
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = {
            let mut inner = self.inner.lock();
            inner.accepting = false;
            inner.sessions.keys().cloned().collect()
        };

        info!(sessions = ids.len(), "Shutting down session registry");

        for id in ids {
            if let Err(e) = self.teardown(&id).await {
                debug!(session_id = %id, "Teardown during shutdown: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("limit", &self.limit)
            .field("active", &self.len())
            .finish()
    }
}
