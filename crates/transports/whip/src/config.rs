//! Configuration types for WHIP ingest

use crate::codec::Codec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for [`WhipIngest`](crate::WhipIngest)
///
/// Consumed, not parsed, by the core: the server binary builds it from CLI
/// flags, environment variables and an optional TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhipIngestConfig {
    /// Maximum concurrent sessions (default: 500)
    pub max_sessions: usize,

    /// Maximum SDP offer size in bytes (default: 5000)
    pub max_offer_bytes: usize,

    /// Lowest UDP port handed out for ICE (default: 50000)
    pub udp_port_min: u16,

    /// Highest UDP port handed out for ICE, inclusive (default: 50050)
    pub udp_port_max: u16,

    /// STUN server URLs advertised to publishers
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Codec allow-list (default: Opus, VP8, H264)
    pub codecs: Vec<Codec>,

    /// Addresses advertised as host candidates in answers
    pub public_ips: Vec<String>,

    /// Time a session may spend establishing ICE + DTLS (default: 15000ms)
    pub connecting_timeout_ms: u64,

    /// Time a disconnected session may take to recover (default: 10000ms)
    pub disconnected_grace_ms: u64,

    /// Lifecycle sweep interval (default: 5000ms)
    pub sweep_interval_ms: u64,

    /// WHIP endpoint path; session resources live below it (default: /whip)
    pub whip_path: String,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for WhipIngestConfig {
    fn default() -> Self {
        Self {
            max_sessions: 500,
            max_offer_bytes: 5000,
            udp_port_min: 50000,
            udp_port_max: 50050,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            codecs: vec![Codec::Opus, Codec::Vp8, Codec::H264],
            public_ips: vec!["127.0.0.1".to_string()],
            connecting_timeout_ms: 15_000,
            disconnected_grace_ms: 10_000,
            sweep_interval_ms: 5_000,
            whip_path: "/whip".to_string(),
        }
    }
}

impl WhipIngestConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - `max_sessions` or `max_offer_bytes` is zero
    /// - the UDP port range is empty or inverted
    /// - the codec allow-list is empty
    /// - a STUN/TURN URL has the wrong scheme
    /// - a public IP does not parse
    /// - any timeout is zero
    /// - `whip_path` does not start with `/`
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig(
                "max_sessions must be at least 1".to_string(),
            ));
        }

        if self.max_offer_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_offer_bytes must be at least 1".to_string(),
            ));
        }

        if self.udp_port_min == 0 || self.udp_port_min > self.udp_port_max {
            return Err(Error::InvalidConfig(format!(
                "invalid UDP port range {}-{}",
                self.udp_port_min, self.udp_port_max
            )));
        }

        if self.codecs.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one codec must be allowed".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.public_ips.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one public IP is required".to_string(),
            ));
        }
        for ip in &self.public_ips {
            ip.parse::<IpAddr>().map_err(|e| {
                Error::InvalidConfig(format!("invalid public IP '{}': {}", ip, e))
            })?;
        }

        if self.connecting_timeout_ms == 0
            || self.disconnected_grace_ms == 0
            || self.sweep_interval_ms == 0
        {
            return Err(Error::InvalidConfig(
                "timeouts and sweep interval must be non-zero".to_string(),
            ));
        }

        if !self.whip_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "whip_path must start with '/', got {}",
                self.whip_path
            )));
        }

        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidConfig(format!("invalid TOML config: {}", e)))
    }

    /// Load a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Timeout policy for the lifecycle supervisor
    pub fn timeouts(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            connecting_timeout: Duration::from_millis(self.connecting_timeout_ms),
            disconnected_grace: Duration::from_millis(self.disconnected_grace_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    /// STUN and TURN servers in the form advertised to clients
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .chain(self.turn_servers.iter().map(|turn| IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            }))
            .collect()
    }

    /// Set the maximum number of concurrent sessions
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the UDP port range used for ICE
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.udp_port_min = min;
        self.udp_port_max = max;
        self
    }

    /// Replace the codec allow-list
    pub fn with_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the addresses advertised as host candidates
    pub fn with_public_ips(mut self, public_ips: Vec<String>) -> Self {
        self.public_ips = public_ips;
        self
    }
}

/// Durations enforced by the lifecycle supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Connection-establishment timeout (New/Connecting -> Failed)
    pub connecting_timeout: Duration,
    /// Recovery grace period (Disconnected -> Failed)
    pub disconnected_grace: Duration,
    /// Interval between sweeps
    pub sweep_interval: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        WhipIngestConfig::default().timeouts()
    }
}

/// ICE server entry advertised to publishers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// `Link` header values for this server, one per URL
    pub fn link_headers(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|url| match (&self.username, &self.credential) {
                (Some(username), Some(credential)) => format!(
                    "<{}>; rel=\"ice-server\"; username=\"{}\"; credential=\"{}\"; credential-type=\"password\"",
                    url, username, credential
                ),
                _ => format!("<{}>; rel=\"ice-server\"", url),
            })
            .collect()
    }
}

/// DTLS certificate fingerprint placed into every answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsFingerprint {
    /// Hash function name, e.g. `sha-256`
    pub algorithm: String,
    /// Colon-separated uppercase hex digest
    pub value: String,
}

/// Read-only transport settings shared by every negotiation
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Codec allow-list in preference order
    pub codecs: Vec<Codec>,
    /// STUN/TURN servers advertised to publishers; an ICE-lite agent never
    /// contacts them itself
    pub ice_servers: Vec<IceServer>,
    /// Supervisor timeouts the transport must not pre-empt
    pub timeouts: TimeoutPolicy,
    /// Addresses advertised as host candidates
    pub public_ips: Vec<IpAddr>,
    /// Server DTLS certificate fingerprint
    pub fingerprint: DtlsFingerprint,
}

impl TransportConfig {
    /// Build the transport view of a validated config
    pub fn from_config(config: &WhipIngestConfig, fingerprint: DtlsFingerprint) -> Result<Self> {
        let public_ips = config
            .public_ips
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|e| {
                    Error::InvalidConfig(format!("invalid public IP '{}': {}", ip, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            codecs: config.codecs.clone(),
            ice_servers: config.ice_servers(),
            timeouts: config.timeouts(),
            public_ips,
            fingerprint,
        })
    }
}
