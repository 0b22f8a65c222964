//! Per-ingest session state
//!
//! A [`Session`] is one ingest attempt from accepted offer to teardown. Its
//! connection state lives behind a single mutex, which is the serialization
//! point for every transition: bridge events and supervisor timeouts are
//! applied one at a time, in the order they take the lock.

use crate::bridge::TransportHandle;
use crate::codec::Codec;
use crate::config::TimeoutPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Opaque unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Admitted, transport not started
    New,
    /// ICE gathering / connectivity checks / DTLS handshake in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover within the grace period
    Disconnected,
    /// Torn down on request (terminal)
    Closed,
    /// Transport failure or timeout (terminal)
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// State reached by applying `event`, or `None` if the event does not
    /// apply in this state
    pub fn next(self, event: &SessionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;

        if self.is_terminal() {
            return None;
        }

        match (self, event) {
            (_, SessionEvent::Teardown) => Some(Closed),
            (New, SessionEvent::GatheringStarted) => Some(Connecting),
            (Connecting, SessionEvent::Connected) => Some(Connected),
            (Disconnected, SessionEvent::Connected) => Some(Connected),
            (Connected, SessionEvent::Disconnected) => Some(Disconnected),
            (_, SessionEvent::TransportFailed(_)) => Some(Failed),
            (New | Connecting | Disconnected, SessionEvent::TimedOut) => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local negotiation done, ICE gathering started
    GatheringStarted,
    /// ICE connectivity and DTLS handshake completed (or recovered)
    Connected,
    /// ICE connectivity lost
    Disconnected,
    /// Unrecoverable transport error
    TransportFailed(String),
    /// Supervisor-enforced timeout
    TimedOut,
    /// Explicit teardown
    Teardown,
}

/// A state change that was applied to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub session_id: SessionId,
    pub from: ConnectionState,
    pub to: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: ConnectionState,
    pub codecs: Vec<Codec>,
    /// Unix time of admission in milliseconds
    pub created_at_ms: u64,
    /// Time spent in the current state
    pub state_age_ms: u64,
    /// Time since the last transition or media packet
    pub idle_ms: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
}

/// One ingest attempt
pub struct Session {
    id: SessionId,
    codecs: Vec<Codec>,
    created_at: SystemTime,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<ConnectionState>,
}

struct SessionInner {
    state: ConnectionState,
    state_since: Instant,
    last_activity: Instant,
    bytes_received: u64,
    packets_received: u64,
    transport: Option<Box<dyn TransportHandle>>,
    /// Set once the transport has been taken for release
    released: bool,
}

impl Session {
    pub fn new(id: SessionId, codecs: Vec<Codec>) -> Self {
        let now = Instant::now();
        Self {
            id,
            codecs,
            created_at: SystemTime::now(),
            inner: Mutex::new(SessionInner {
                state: ConnectionState::New,
                state_since: now,
                last_activity: now,
                bytes_received: 0,
                packets_received: 0,
                transport: None,
                released: false,
            }),
            state_tx: watch::channel(ConnectionState::New).0,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// When the session entered its current state
    pub fn state_since(&self) -> Instant {
        self.inner.lock().state_since
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Follow state changes as they are applied
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the session is in a terminal state
    pub async fn ended(&self) {
        let mut state = self.state_tx.subscribe();
        // The sender lives as long as `self`
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    /// Apply a state machine input
    ///
    /// Returns the applied change, or `None` if the event was ignored. Terminal
    /// states absorb every event.
    pub fn apply(&self, event: SessionEvent) -> Option<StateChange> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, event)
    }

    /// Fail the session if it has overstayed its current state
    ///
    /// `New` and `Connecting` are bounded by the connecting timeout,
    /// `Disconnected` by the grace period. The check and the transition happen
    /// under one lock so a concurrent recovery cannot be overwritten.
    pub fn expire(&self, now: Instant, policy: &TimeoutPolicy) -> Option<StateChange> {
        let mut inner = self.inner.lock();
        let limit = match inner.state {
            ConnectionState::New | ConnectionState::Connecting => policy.connecting_timeout,
            ConnectionState::Disconnected => policy.disconnected_grace,
            _ => return None,
        };

        if now.saturating_duration_since(inner.state_since) < limit {
            return None;
        }

        self.transition(&mut inner, SessionEvent::TimedOut)
    }

    fn transition(&self, inner: &mut SessionInner, event: SessionEvent) -> Option<StateChange> {
        let from = inner.state;
        let to = from.next(&event)?;

        let now = Instant::now();
        inner.state = to;
        inner.state_since = now;
        inner.last_activity = now;
        self.state_tx.send_replace(to);

        let reason = match event {
            SessionEvent::TransportFailed(reason) => Some(reason),
            SessionEvent::TimedOut => Some(format!("timed out in {}", from)),
            _ => None,
        };

        debug!(session_id = %self.id, %from, %to, "Session state change");

        Some(StateChange {
            session_id: self.id.clone(),
            from,
            to,
            reason,
        })
    }

    /// Account for received media
    pub fn record_media(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.bytes_received += bytes as u64;
        inner.packets_received += 1;
        inner.last_activity = Instant::now();
    }

    /// Hand the session its running transport
    ///
    /// Gives the handle back if the session's resources were already released,
    /// in which case the caller must close it.
    pub fn attach_transport(
        &self,
        transport: Box<dyn TransportHandle>,
    ) -> std::result::Result<(), Box<dyn TransportHandle>> {
        let mut inner = self.inner.lock();
        if inner.released || inner.transport.is_some() {
            return Err(transport);
        }
        inner.transport = Some(transport);
        Ok(())
    }

    /// Take the transport for release; later calls and attaches see nothing
    pub fn take_transport(&self) -> Option<Box<dyn TransportHandle>> {
        let mut inner = self.inner.lock();
        inner.released = true;
        inner.transport.take()
    }

    pub fn has_transport(&self) -> bool {
        self.inner.lock().transport.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        SessionSnapshot {
            id: self.id.clone(),
            state: inner.state,
            codecs: self.codecs.clone(),
            created_at_ms: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            state_age_ms: now.duration_since(inner.state_since).as_millis() as u64,
            idle_ms: now.duration_since(inner.last_activity).as_millis() as u64,
            bytes_received: inner.bytes_received,
            packets_received: inner.packets_received,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("has_transport", &inner.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(SessionId::from("test"), vec![Codec::Opus])
    }

    #[test]
    fn test_session_id_is_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_happy_path() {
        let s = session();
        assert_eq!(s.state(), ConnectionState::New);

        let change = s.apply(SessionEvent::GatheringStarted).unwrap();
        assert_eq!((change.from, change.to), (ConnectionState::New, ConnectionState::Connecting));
        s.apply(SessionEvent::Connected).unwrap();
        s.apply(SessionEvent::Disconnected).unwrap();
        s.apply(SessionEvent::Connected).unwrap();
        assert_eq!(s.state(), ConnectionState::Connected);

        let change = s.apply(SessionEvent::Teardown).unwrap();
        assert_eq!((change.from, change.to), (ConnectionState::Connected, ConnectionState::Closed));
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        let s = session();
        s.apply(SessionEvent::TransportFailed("ice".into())).unwrap();
        assert_eq!(s.state(), ConnectionState::Failed);

        for event in [
            SessionEvent::GatheringStarted,
            SessionEvent::Connected,
            SessionEvent::Teardown,
            SessionEvent::TimedOut,
        ] {
            assert!(s.apply(event).is_none());
        }
        assert_eq!(s.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_invalid_transitions_are_ignored() {
        let s = session();
        assert!(s.apply(SessionEvent::Connected).is_none());
        assert!(s.apply(SessionEvent::Disconnected).is_none());
        assert_eq!(s.state(), ConnectionState::New);

        s.apply(SessionEvent::GatheringStarted).unwrap();
        s.apply(SessionEvent::Connected).unwrap();
        // No establishment timeout once connected
        assert!(s.apply(SessionEvent::TimedOut).is_none());
    }

    #[tokio::test]
    async fn test_watch_state_sees_terminal_state() {
        let s = session();
        let mut state = s.watch_state();
        assert_eq!(*state.borrow(), ConnectionState::New);

        s.apply(SessionEvent::Teardown).unwrap();
        let reached = state.wait_for(|state| state.is_terminal()).await.unwrap();
        assert_eq!(*reached, ConnectionState::Closed);
    }

    #[test]
    fn test_timeout_reason() {
        let s = session();
        s.apply(SessionEvent::GatheringStarted).unwrap();
        let change = s.apply(SessionEvent::TimedOut).unwrap();
        assert_eq!(change.to, ConnectionState::Failed);
        assert_eq!(change.reason.as_deref(), Some("timed out in connecting"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_ages_and_activity() {
        let s = session();
        tokio::time::advance(Duration::from_secs(3)).await;
        s.record_media(1200);
        s.record_media(800);

        let snapshot = s.snapshot();
        assert_eq!(snapshot.state, ConnectionState::New);
        assert_eq!(snapshot.state_age_ms, 3000);
        assert_eq!(snapshot.idle_ms, 0);
        assert_eq!(snapshot.bytes_received, 2000);
        assert_eq!(snapshot.packets_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_respects_policy() {
        let policy = TimeoutPolicy {
            connecting_timeout: Duration::from_secs(15),
            disconnected_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        };
        let s = session();
        s.apply(SessionEvent::GatheringStarted).unwrap();
        s.apply(SessionEvent::Connected).unwrap();
        s.apply(SessionEvent::Disconnected).unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(s.expire(Instant::now(), &policy).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let change = s.expire(Instant::now(), &policy).unwrap();
        assert_eq!((change.from, change.to), (ConnectionState::Disconnected, ConnectionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_never_expires() {
        let s = session();
        s.apply(SessionEvent::GatheringStarted).unwrap();
        s.apply(SessionEvent::Connected).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(s.expire(Instant::now(), &TimeoutPolicy::default()).is_none());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
    }
}
