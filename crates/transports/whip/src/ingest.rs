//! Ingest facade called by the HTTP layer

use crate::bridge::{spawn_transport, TransportFactory};
use crate::config::{DtlsFingerprint, TransportConfig, WhipIngestConfig};
use crate::credentials::{CredentialSource, RandomCredentials};
use crate::ports::PortAllocator;
use crate::registry::SessionRegistry;
use crate::sdp::{Negotiation, Negotiator, Offer};
use crate::session::{SessionId, SessionSnapshot};
use crate::supervisor::{LifecycleSupervisor, SupervisorHandle};
use crate::webrtc_bridge::WebRtcTransportFactory;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Successful ingest: the `201 Created` response to send back
#[derive(Debug, Clone)]
pub struct IngestResponse {
    /// SDP answer body
    pub answer: String,
    /// Always 201
    pub status: u16,
    /// Session resource path, target of the teardown request
    pub location: String,
    pub session_id: SessionId,
    /// `Link` header values advertising STUN/TURN servers
    pub ice_server_links: Vec<String>,
}

/// WHIP session negotiation and lifecycle engine
///
/// Owns the session registry for the lifetime of the server: created on
/// startup, [`shutdown`](Self::shutdown) rejects new sessions and closes the
/// remaining ones.
pub struct WhipIngest {
    config: WhipIngestConfig,
    negotiator: Negotiator,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn TransportFactory>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    ice_server_links: Vec<String>,
}

impl WhipIngest {
    /// Create an ingest engine over a transport factory
    ///
    /// `fingerprint` must belong to the certificate the factory's transports
    /// present during the DTLS handshake.
    pub fn new(
        config: WhipIngestConfig,
        factory: Arc<dyn TransportFactory>,
        fingerprint: DtlsFingerprint,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(TransportConfig::from_config(&config, fingerprint)?);
        let ports = PortAllocator::new(config.udp_port_min, config.udp_port_max)?;
        let ice_server_links = transport
            .ice_servers
            .iter()
            .flat_map(|server| server.link_headers())
            .collect();

        info!(
            max_sessions = config.max_sessions,
            udp_ports = %format!("{}-{}", config.udp_port_min, config.udp_port_max),
            codecs = ?config.codecs,
            "WHIP ingest configured"
        );

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            negotiator: Negotiator::new(transport, ports, credentials),
            factory,
            supervisor: Mutex::new(None),
            ice_server_links,
            config,
        })
    }

    /// Create an ingest engine backed by webrtc-rs with random ICE credentials
    pub fn with_webrtc(config: WhipIngestConfig) -> Result<Self> {
        let factory = WebRtcTransportFactory::new()?;
        let fingerprint = factory.fingerprint().clone();
        Self::new(
            config,
            Arc::new(factory),
            fingerprint,
            Arc::new(RandomCredentials),
        )
    }

    /// Start the lifecycle supervisor; a no-op if already running
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_none() {
            *supervisor = Some(
                LifecycleSupervisor::new(Arc::clone(&self.registry), self.config.timeouts())
                    .spawn(),
            );
        }
    }

    /// Negotiate and admit a session for an inbound offer
    ///
    /// Returns once the answer is ready; the transport comes up in the
    /// background. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Any negotiation or admission error, see [`Error::kind`] for the
    /// status mapping. Nothing is retried and no resource stays allocated.
    #[instrument(skip_all, fields(offer_bytes = raw_offer.len()))]
    pub fn handle_ingest(&self, raw_offer: &[u8], content_type: &str) -> Result<IngestResponse> {
        let offer = Offer::from_request(raw_offer, content_type, self.config.max_offer_bytes)?;

        if !self.registry.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        let Negotiation { answer, params } = self.negotiator.negotiate(&offer)?;

        let mut codecs: Vec<_> = params.codecs.iter().map(|c| c.codec).collect();
        codecs.dedup();

        let session_id = SessionId::new();
        // On rejection `params` is dropped here, returning the port
        let session = self.registry.admit(session_id.clone(), codecs)?;

        spawn_transport(
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            session,
            offer,
            params,
        );

        info!(
            session_id = %session_id,
            active = self.registry.len(),
            "Accepted WHIP session"
        );

        Ok(IngestResponse {
            answer: answer.into_string(),
            status: 201,
            location: self.location(&session_id),
            session_id,
            ice_server_links: self.ice_server_links.clone(),
        })
    }

    /// Tear down a session; returns the HTTP status to answer with
    ///
    /// 200 when the session existed, 404 otherwise.
    pub async fn handle_teardown(&self, session_id: &str) -> u16 {
        let id = SessionId::from(session_id);
        match self.registry.teardown(&id).await {
            Ok(()) => {
                info!(session_id = %id, "Session torn down by client");
                200
            }
            Err(e) => {
                debug!(session_id = %id, "Teardown rejected: {}", e);
                404
            }
        }
    }

    /// Resource path for a session
    pub fn location(&self, session_id: &SessionId) -> String {
        format!(
            "{}/{}",
            self.config.whip_path.trim_end_matches('/'),
            session_id
        )
    }

    pub fn config(&self) -> &WhipIngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// `Link` header values advertising the configured ICE servers
    pub fn ice_server_links(&self) -> &[String] {
        &self.ice_server_links
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.registry.snapshots()
    }

    /// Reject new sessions, stop the supervisor and close every session
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        self.registry.shutdown().await;
        info!("WHIP ingest stopped");
    }
}

impl std::fmt::Debug for WhipIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhipIngest")
            .field("whip_path", &self.config.whip_path)
            .field("registry", &self.registry)
            .finish()
    }
}
