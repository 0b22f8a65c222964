//! webrtc-rs transport
//!
//! The answer sent to the publisher is rendered by the negotiator, so the
//! peer connection created here is configured to honour it: ICE-lite agent
//! with the answer's credentials bound to the leased port, the server-wide
//! DTLS certificate whose fingerprint the answer advertises, and the passive
//! DTLS role.
//!
//! STUN/TURN servers are only advertised to publishers: a lite agent gathers
//! host candidates exclusively and webrtc-ice refuses server URLs for it.

use crate::bridge::{BridgeEvent, BridgeEventSender, TransportFactory, TransportHandle};
use crate::config::{DtlsFingerprint, TimeoutPolicy};
use crate::ports::PortLease;
use crate::sdp::{Offer, TransportParams};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::certificate::RTCCertificate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Subject name of the generated server certificate
const CERTIFICATE_SUBJECT: &str = "whip-ingest";

/// Lifetime of the generated server certificate
const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Silence after which the ICE agent reports disconnected (webrtc-ice default)
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack between the supervisor's deadlines and the agent giving up
const ICE_FAILED_MARGIN: Duration = Duration::from_secs(10);

/// Starts one webrtc-rs peer connection per session
pub struct WebRtcTransportFactory {
    certificate: RTCCertificate,
    fingerprint: DtlsFingerprint,
}

impl WebRtcTransportFactory {
    /// Create a factory with a freshly generated self-signed certificate
    pub fn new() -> Result<Self> {
        let dtls_certificate = webrtc::dtls::crypto::Certificate::generate_self_signed(vec![
            CERTIFICATE_SUBJECT.to_string(),
        ])
        .map_err(|e| Error::WebRtcError(format!("Failed to generate certificate: {}", e)))?;

        let certificate =
            RTCCertificate::from_existing(dtls_certificate, SystemTime::now() + CERTIFICATE_LIFETIME);
        let fingerprint = select_fingerprint(&certificate)?;

        info!(
            algorithm = %fingerprint.algorithm,
            "Generated DTLS certificate"
        );

        Ok(Self {
            certificate,
            fingerprint,
        })
    }

    /// Fingerprint of the server certificate, advertised in every answer
    pub fn fingerprint(&self) -> &DtlsFingerprint {
        &self.fingerprint
    }
}

/// ICE failed timeout that never pre-empts the supervisor
///
/// webrtc-ice fails a checking agent after `disconnected + failed` and a
/// disconnected one after `failed`; both must outlast the supervisor's
/// connecting timeout and disconnected grace.
fn ice_failed_timeout(policy: &TimeoutPolicy) -> Duration {
    policy.connecting_timeout + policy.disconnected_grace + ICE_FAILED_MARGIN
}

/// Bridge event for a peer connection state, if it changes the session
fn bridge_event(state: RTCPeerConnectionState) -> Option<BridgeEvent> {
    match state {
        RTCPeerConnectionState::Connected => Some(BridgeEvent::Connected),
        RTCPeerConnectionState::Disconnected => Some(BridgeEvent::Disconnected),
        RTCPeerConnectionState::Failed => {
            Some(BridgeEvent::Failed("ICE/DTLS connection failed".to_string()))
        }
        // Only a remote close gets here; local teardown ends the session first
        RTCPeerConnectionState::Closed => {
            Some(BridgeEvent::Failed("peer connection closed".to_string()))
        }
        _ => None,
    }
}

fn select_fingerprint(certificate: &RTCCertificate) -> Result<DtlsFingerprint> {
    let fingerprints = certificate.get_fingerprints();
    fingerprints
        .iter()
        .find(|f| f.algorithm.eq_ignore_ascii_case("sha-256"))
        .or_else(|| fingerprints.first())
        .map(|f| DtlsFingerprint {
            algorithm: f.algorithm.clone(),
            value: f.value.to_uppercase(),
        })
        .ok_or_else(|| Error::WebRtcError("certificate has no fingerprint".to_string()))
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn start(
        &self,
        offer: Offer,
        params: TransportParams,
        events: BridgeEventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        let TransportParams {
            credentials,
            port,
            config,
            ..
        } = params;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_lite(true);
        setting_engine.set_ice_credentials(credentials.ufrag.clone(), credentials.pwd.clone());
        // Loopback interfaces are skipped unless asked for
        if config.public_ips.iter().any(|ip| ip.is_loopback()) {
            setting_engine.set_include_loopback_candidate(true);
        }
        setting_engine.set_nat_1to1_ips(
            config.public_ips.iter().map(|ip| ip.to_string()).collect(),
            RTCIceCandidateType::Host,
        );
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(
            EphemeralUDP::new(port.port(), port.port())
                .map_err(|e| Error::WebRtcError(format!("Invalid UDP port: {}", e)))?,
        ));
        setting_engine
            .set_answering_dtls_role(DTLSRole::Server)
            .map_err(|e| Error::WebRtcError(format!("Failed to set DTLS role: {}", e)))?;
        setting_engine.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ice_failed_timeout(&config.timeouts)),
            None,
        );

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            certificates: vec![self.certificate.clone()],
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!(session_id = %state_events.session_id(), ?state, "Peer connection state");
                if let Some(event) = bridge_event(state) {
                    state_events.send(event);
                }
                Box::pin(async {})
            },
        ));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                info!(
                    session_id = %events.session_id(),
                    kind = %track.kind(),
                    ssrc = track.ssrc(),
                    "Receiving track"
                );

                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if !events.send(BridgeEvent::MediaReceived {
                            bytes: packet.payload.len(),
                        }) {
                            break;
                        }
                    }
                    debug!(session_id = %events.session_id(), "Track ended");
                });
            })
        }));

        let remote = RTCSessionDescription::offer(offer.as_str().to_string())
            .map_err(|e| Error::WebRtcError(format!("Invalid offer SDP: {}", e)))?;
        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set remote description: {}", e)))?;

        let local = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;

        events.send(BridgeEvent::GatheringStarted);

        peer_connection
            .set_local_description(local)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;

        info!(
            session_id = %events.session_id(),
            port = port.port(),
            "Peer connection started"
        );

        Ok(Box::new(WebRtcTransport {
            peer_connection,
            _port: port,
        }))
    }
}

/// Running peer connection plus the UDP port it is bound to
struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    /// Released after the peer connection is closed
    _port: PortLease,
}

#[async_trait]
impl TransportHandle for WebRtcTransport {
    async fn close(self: Box<Self>) -> Result<()> {
        let result = self.peer_connection.close().await;
        if let Err(ref e) = result {
            warn!("Failed to close peer connection: {}", e);
        }
        result.map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
