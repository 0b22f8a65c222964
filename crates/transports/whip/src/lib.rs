//! WHIP session negotiation and lifecycle engine
//!
//! This crate turns an inbound WHIP (WebRTC-HTTP Ingestion Protocol) SDP offer
//! into an active, monitored, revocable WebRTC receiving session, and manages
//! the set of concurrent sessions.
//!
//! # Features
//!
//! - **Local negotiation**: codec intersection against an allow-list and an
//!   ICE-lite answer rendered without network I/O
//! - **Bounded admission**: atomic capacity limit and UDP port leasing
//! - **Explicit state machine**: one serialized state per session, driven by
//!   transport events posted over a channel
//! - **Lifecycle supervision**: connecting timeout, disconnect grace period
//!   and reaping of ended sessions
//! - **webrtc-rs transport**: ICE, DTLS and SRTP handled by the `webrtc` crate
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  HTTP layer (POST offer / DELETE session)             │
//! │  ↓                                                    │
//! │  WhipIngest                                           │
//! │  ├─ Negotiator (offer → answer, port lease, ICE creds)│
//! │  ├─ SessionRegistry (admit / get / remove)            │
//! │  │   └─ Session (state machine, transport handle)     │
//! │  ├─ TransportFactory (webrtc-rs peer connection)      │
//! │  │   └─ BridgeEvent channel → Session                 │
//! │  └─ LifecycleSupervisor (timeouts, reaping)           │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use whip_ingest::{Codec, WhipIngestConfig};
//!
//! let config = WhipIngestConfig::default()
//!     .with_max_sessions(100)
//!     .with_codecs(vec![Codec::Opus, Codec::Vp8]);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_sessions, 100);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use whip_ingest::{WhipIngest, WhipIngestConfig};
//!
//! # async fn example(offer: &[u8]) -> whip_ingest::Result<()> {
//! let ingest = WhipIngest::with_webrtc(WhipIngestConfig::default())?;
//! ingest.start();
//!
//! let response = ingest.handle_ingest(offer, "application/sdp")?;
//! println!("answer for {} at {}", response.session_id, response.location);
//!
//! ingest.handle_teardown(response.session_id.as_str()).await;
//! ingest.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ingest;
pub mod ports;
pub mod registry;
pub mod sdp;
pub mod session;
pub mod supervisor;
mod webrtc_bridge;

pub use bridge::{BridgeEvent, BridgeEventSender, TransportFactory, TransportHandle};
pub use codec::{Codec, MediaKind, NegotiatedCodec};
pub use config::{
    DtlsFingerprint, IceServer, TimeoutPolicy, TransportConfig, TurnServerConfig, WhipIngestConfig,
};
pub use credentials::{CredentialSource, FixedCredentials, IceCredentials, RandomCredentials};
pub use error::{Error, ErrorKind, Result};
pub use ingest::{IngestResponse, WhipIngest};
pub use ports::{PortAllocator, PortLease};
pub use registry::SessionRegistry;
pub use sdp::{Answer, AnsweredMedia, Negotiation, Negotiator, Offer, TransportParams, SDP_CONTENT_TYPE};
pub use session::{ConnectionState, Session, SessionEvent, SessionId, SessionSnapshot, StateChange};
pub use supervisor::{LifecycleSupervisor, SupervisorHandle, SweepReport};
pub use webrtc_bridge::WebRtcTransportFactory;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
