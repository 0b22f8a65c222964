//! Transport bridge between sessions and the network stack
//!
//! A [`TransportFactory`] starts the ICE/DTLS/SRTP machinery for one admitted
//! session. Network callbacks never touch session state directly: they post
//! [`BridgeEvent`]s into a per-session channel whose single consumer applies
//! them to the session in order and reports the resulting state changes to
//! the registry.

use crate::registry::SessionRegistry;
use crate::sdp::{Offer, TransportParams};
use crate::session::{Session, SessionEvent, SessionId};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Network-side happenings reported by a running transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Local description applied, ICE gathering started
    GatheringStarted,
    /// ICE connected and DTLS handshake done, or connectivity recovered
    Connected,
    /// ICE connectivity lost
    Disconnected,
    /// Unrecoverable ICE/DTLS error
    Failed(String),
    /// An RTP packet arrived
    MediaReceived { bytes: usize },
}

impl BridgeEvent {
    fn into_session_event(self) -> Option<SessionEvent> {
        match self {
            BridgeEvent::GatheringStarted => Some(SessionEvent::GatheringStarted),
            BridgeEvent::Connected => Some(SessionEvent::Connected),
            BridgeEvent::Disconnected => Some(SessionEvent::Disconnected),
            BridgeEvent::Failed(reason) => Some(SessionEvent::TransportFailed(reason)),
            BridgeEvent::MediaReceived { .. } => None,
        }
    }
}

/// Non-owning handle a transport uses to report back to its session
#[derive(Debug, Clone)]
pub struct BridgeEventSender {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeEventSender {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Post an event; returns false once the session stopped listening
    pub fn send(&self, event: BridgeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running transport owned by a session
///
/// Closing releases everything the transport holds: ICE agent, DTLS context
/// and the leased UDP port.
#[async_trait]
pub trait TransportHandle: Send {
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Starts transports for admitted sessions
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Start receiving for `offer` with the negotiated `params`
    ///
    /// Called off the request path. Errors are surfaced as a transport
    /// failure of the session, never to the original request.
    async fn start(
        &self,
        offer: Offer,
        params: TransportParams,
        events: BridgeEventSender,
    ) -> Result<Box<dyn TransportHandle>>;
}

/// Start the transport for `session` in the background
///
/// Spawns the transport start and the session's event consumer. If the
/// session is released before the transport comes up, the fresh transport is
/// closed instead of attached.
pub fn spawn_transport(
    factory: Arc<dyn TransportFactory>,
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    offer: Offer,
    params: TransportParams,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let events = BridgeEventSender::new(session.id().clone(), tx);

    tokio::spawn(pump_events(
        Arc::clone(&session),
        Arc::clone(&registry),
        rx,
    ));

    tokio::spawn(async move {
        let session_id = session.id().clone();
        match factory.start(offer, params, events.clone()).await {
            Ok(transport) => {
                if let Err(transport) = session.attach_transport(transport) {
                    debug!(%session_id, "Session released before transport start, closing");
                    if let Err(e) = transport.close().await {
                        warn!(%session_id, "Failed to close orphaned transport: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!(%session_id, "Transport start failed: {}", e);
                events.send(BridgeEvent::Failed(e.to_string()));
            }
        }
    })
}

/// Single consumer of a session's bridge events
///
/// Stops once the session is terminal, whoever ended it; later sends on the
/// session's [`BridgeEventSender`] then report a closed channel.
async fn pump_events(
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    mut rx: mpsc::UnboundedReceiver<BridgeEvent>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = session.ended() => break,
        };

        if let BridgeEvent::MediaReceived { bytes } = event {
            session.record_media(bytes);
            continue;
        }

        if let Some(change) = event.into_session_event().and_then(|e| session.apply(e)) {
            registry.report(change).await;
        }
    }

    debug!(session_id = %session.id(), "Bridge event stream ended");
}
