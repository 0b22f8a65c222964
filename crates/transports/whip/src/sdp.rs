//! Offer validation and answer generation
//!
//! Negotiation is local computation only: the offer is parsed with the SDP
//! parser shipped in `webrtc`, the codec intersection is computed against the
//! configured allow-list, a UDP port is leased and an ICE-lite answer is
//! rendered. Given the same offer, config and port, the answer differs only
//! in its ICE credentials.

use crate::codec::{Codec, MediaKind, NegotiatedCodec};
use crate::config::TransportConfig;
use crate::credentials::{CredentialSource, IceCredentials};
use crate::ports::{PortAllocator, PortLease};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument};
use webrtc::sdp::description::common::Attribute;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::SessionDescription;

/// SDP media type required on WHIP requests and responses
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Raw SDP offer received from a publisher
///
/// Construction checks media type, size and encoding only; syntax is checked
/// during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    sdp: String,
}

impl Offer {
    /// Validate a request body
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOffer`] if the content type is not `application/sdp`,
    /// the body is empty or larger than `max_bytes`, or it is not UTF-8.
    pub fn from_request(raw: &[u8], content_type: &str, max_bytes: usize) -> Result<Self> {
        if !is_sdp_content_type(content_type) {
            return Err(Error::InvalidOffer(format!(
                "Content-Type must be {}, got '{}'",
                SDP_CONTENT_TYPE, content_type
            )));
        }

        if raw.is_empty() {
            return Err(Error::InvalidOffer("empty offer".to_string()));
        }

        if raw.len() > max_bytes {
            return Err(Error::InvalidOffer(format!(
                "offer is {} bytes, limit is {}",
                raw.len(),
                max_bytes
            )));
        }

        let sdp = std::str::from_utf8(raw)
            .map_err(|e| Error::InvalidOffer(format!("offer is not UTF-8: {}", e)))?;

        Ok(Self {
            sdp: sdp.to_string(),
        })
    }

    /// Wrap SDP text that already passed the request gate
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.sdp
    }

    pub fn len(&self) -> usize {
        self.sdp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sdp.is_empty()
    }
}

/// `application/sdp`, optionally followed by parameters
fn is_sdp_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(SDP_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Outcome for one offered media section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsweredMedia {
    pub mid: String,
    pub media: String,
    /// Transport protocol of the offered section, e.g. `UDP/DTLS/SCTP`
    pub protocol: String,
    /// First offered format, echoed when the section is rejected
    pub format: String,
    /// Accepted codecs; empty means the section was rejected
    pub codecs: Vec<NegotiatedCodec>,
}

impl AnsweredMedia {
    pub fn is_accepted(&self) -> bool {
        !self.codecs.is_empty()
    }
}

/// SDP answer paired with the offer it was negotiated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    sdp: String,
    media: Vec<AnsweredMedia>,
}

impl Answer {
    pub fn as_str(&self) -> &str {
        &self.sdp
    }

    pub fn into_string(self) -> String {
        self.sdp
    }

    /// Per-section negotiation result, in offer order
    pub fn media(&self) -> &[AnsweredMedia] {
        &self.media
    }

    /// Every accepted codec across all sections
    pub fn codecs(&self) -> impl Iterator<Item = &NegotiatedCodec> {
        self.media.iter().flat_map(|m| m.codecs.iter())
    }
}

/// Transport parameters fixed by a negotiation
///
/// Owns the port lease: dropping the parameters returns the port.
#[derive(Debug)]
pub struct TransportParams {
    pub credentials: IceCredentials,
    pub port: PortLease,
    pub codecs: Vec<NegotiatedCodec>,
    pub config: Arc<TransportConfig>,
}

/// Answer plus the transport parameters needed to honour it
#[derive(Debug)]
pub struct Negotiation {
    pub answer: Answer,
    pub params: TransportParams,
}

/// Codec/transport negotiator bound to one server configuration
pub struct Negotiator {
    config: Arc<TransportConfig>,
    ports: PortAllocator,
    credentials: Arc<dyn CredentialSource>,
}

impl Negotiator {
    pub fn new(
        config: Arc<TransportConfig>,
        ports: PortAllocator,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            config,
            ports,
            credentials,
        }
    }

    /// Negotiate an answer for `offer`
    #[instrument(skip_all, fields(offer_bytes = offer.len()))]
    pub fn negotiate(&self, offer: &Offer) -> Result<Negotiation> {
        negotiate(
            offer,
            &self.config,
            &self.ports,
            self.credentials.as_ref(),
        )
    }
}

/// Negotiate an answer for `offer` under `config`
///
/// # Errors
///
/// - [`Error::InvalidOffer`] if the offer is not a usable session description
/// - [`Error::NoCompatibleCodec`] if no offered codec is allowed
/// - [`Error::ResourceExhausted`] if no UDP port is free
pub fn negotiate(
    offer: &Offer,
    config: &Arc<TransportConfig>,
    ports: &PortAllocator,
    credentials: &dyn CredentialSource,
) -> Result<Negotiation> {
    let parsed = parse_offer(offer)?;

    let media: Vec<AnsweredMedia> = parsed
        .media_descriptions
        .iter()
        .enumerate()
        .map(|(index, m)| select_codecs(index, m, &parsed.attributes, &config.codecs))
        .collect();

    let codecs: Vec<NegotiatedCodec> = media.iter().flat_map(|m| m.codecs.clone()).collect();
    if codecs.is_empty() {
        let offered: Vec<String> = parsed
            .media_descriptions
            .iter()
            .flat_map(offered_encodings)
            .collect();
        return Err(Error::NoCompatibleCodec(format!(
            "offered [{}], allowed [{}]",
            offered.join(", "),
            config
                .codecs
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let port = ports.allocate()?;
    let credentials = credentials.ice_credentials();

    let sdp = render_answer(
        parsed.origin.session_id,
        &media,
        &credentials,
        config,
        port.port(),
    );

    debug!(
        port = port.port(),
        codecs = ?codecs.iter().map(|c| c.codec).collect::<Vec<_>>(),
        "Negotiated answer"
    );

    Ok(Negotiation {
        answer: Answer { sdp, media },
        params: TransportParams {
            credentials,
            port,
            codecs,
            config: Arc::clone(config),
        },
    })
}

fn parse_offer(offer: &Offer) -> Result<SessionDescription> {
    let mut reader = Cursor::new(offer.as_str().as_bytes());
    let parsed = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| Error::InvalidOffer(format!("unparseable SDP: {}", e)))?;

    if parsed.media_descriptions.is_empty() {
        return Err(Error::InvalidOffer("offer has no media sections".to_string()));
    }

    let has_session_attr = |key: &str| parsed.attributes.iter().any(|a| a.key == key);
    let every_media_has = |key: &str| {
        parsed
            .media_descriptions
            .iter()
            .all(|m| m.attributes.iter().any(|a| a.key == key))
    };

    if !has_session_attr("fingerprint") && !every_media_has("fingerprint") {
        return Err(Error::InvalidOffer(
            "offer has no DTLS fingerprint".to_string(),
        ));
    }

    if !has_session_attr("ice-ufrag") && !every_media_has("ice-ufrag") {
        return Err(Error::InvalidOffer(
            "offer has no ICE credentials".to_string(),
        ));
    }

    Ok(parsed)
}

fn attribute_value<'a>(attributes: &'a [Attribute], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_deref())
}

/// Direction attribute of a media section, falling back to the session level
fn direction<'a>(media: &'a MediaDescription, session: &'a [Attribute]) -> &'a str {
    const DIRECTIONS: [&str; 4] = ["sendrecv", "sendonly", "recvonly", "inactive"];
    media
        .attributes
        .iter()
        .chain(session.iter())
        .find(|a| DIRECTIONS.contains(&a.key.as_str()))
        .map(|a| a.key.as_str())
        .unwrap_or("sendrecv")
}

/// Encoding names for static payload types that may appear without rtpmap
fn static_rtpmap(payload_type: u8) -> Option<&'static str> {
    match payload_type {
        0 => Some("PCMU/8000"),
        8 => Some("PCMA/8000"),
        9 => Some("G722/8000"),
        _ => None,
    }
}

fn rtpmaps(media: &MediaDescription) -> HashMap<u8, String> {
    let mut maps: HashMap<u8, String> = media
        .attributes
        .iter()
        .filter(|a| a.key == "rtpmap")
        .filter_map(|a| a.value.as_deref())
        .filter_map(|value| {
            let (pt, rest) = value.split_once(' ')?;
            Some((pt.trim().parse::<u8>().ok()?, rest.trim().to_string()))
        })
        .collect();

    for format in &media.media_name.formats {
        if let Ok(pt) = format.parse::<u8>() {
            if let Some(rtpmap) = static_rtpmap(pt) {
                maps.entry(pt).or_insert_with(|| rtpmap.to_string());
            }
        }
    }

    maps
}

fn offered_encodings(media: &MediaDescription) -> Vec<String> {
    let maps = rtpmaps(media);
    media
        .media_name
        .formats
        .iter()
        .filter_map(|f| f.parse::<u8>().ok())
        .filter_map(|pt| maps.get(&pt))
        .map(|rtpmap| rtpmap.split('/').next().unwrap_or_default().to_string())
        .collect()
}

fn select_codecs(
    index: usize,
    media: &MediaDescription,
    session: &[Attribute],
    allowed: &[Codec],
) -> AnsweredMedia {
    let mid = attribute_value(&media.attributes, "mid")
        .map(str::to_string)
        .unwrap_or_else(|| index.to_string());
    let protocol = media.media_name.protos.join("/");
    let format = media
        .media_name
        .formats
        .first()
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    let rejected = |mid: String| AnsweredMedia {
        mid,
        media: media.media_name.media.clone(),
        protocol: protocol.clone(),
        format: format.clone(),
        codecs: Vec::new(),
    };

    let Some(kind) = MediaKind::from_media(&media.media_name.media) else {
        return rejected(mid);
    };

    // The publisher must be sending something for an ingest to make sense
    if matches!(direction(media, session), "recvonly" | "inactive") {
        return rejected(mid);
    }

    let maps = rtpmaps(media);
    let fmtps: HashMap<u8, String> = media
        .attributes
        .iter()
        .filter(|a| a.key == "fmtp")
        .filter_map(|a| a.value.as_deref())
        .filter_map(|value| {
            let (pt, rest) = value.split_once(' ')?;
            Some((pt.trim().parse::<u8>().ok()?, rest.trim().to_string()))
        })
        .collect();
    let feedback: Vec<(Option<u8>, String)> = media
        .attributes
        .iter()
        .filter(|a| a.key == "rtcp-fb")
        .filter_map(|a| a.value.as_deref())
        .filter_map(|value| {
            let (pt, rest) = value.split_once(' ')?;
            let pt = if pt == "*" { None } else { Some(pt.parse::<u8>().ok()?) };
            Some((pt, rest.trim().to_string()))
        })
        .collect();

    let codecs = media
        .media_name
        .formats
        .iter()
        .filter_map(|f| f.parse::<u8>().ok())
        .filter_map(|pt| {
            let rtpmap = maps.get(&pt)?;
            let mut parts = rtpmap.split('/');
            let codec = Codec::from_encoding_name(parts.next()?)?;
            let clock_rate = parts.next()?.parse::<u32>().ok()?;
            if codec.media_kind() != kind
                || codec.clock_rate() != clock_rate
                || !allowed.contains(&codec)
            {
                return None;
            }

            Some(NegotiatedCodec {
                payload_type: pt,
                codec,
                rtpmap: rtpmap.clone(),
                fmtp: fmtps.get(&pt).cloned(),
                rtcp_fb: feedback
                    .iter()
                    .filter(|(fb_pt, _)| fb_pt.map_or(true, |p| p == pt))
                    .map(|(_, fb)| fb.clone())
                    .collect(),
            })
        })
        .collect();

    AnsweredMedia {
        mid,
        media: media.media_name.media.clone(),
        protocol,
        format,
        codecs,
    }
}

/// Host candidate priority for local preference `index` (RFC 8445 5.1.2.1)
fn host_priority(index: usize) -> u32 {
    let local_preference = 65535u32.saturating_sub(index as u32);
    (126 << 24) | (local_preference << 8) | (256 - 1)
}

fn address_line(ip: Option<&IpAddr>) -> String {
    match ip {
        Some(IpAddr::V6(v6)) => format!("IN IP6 {}", v6),
        Some(IpAddr::V4(v4)) => format!("IN IP4 {}", v4),
        None => "IN IP4 0.0.0.0".to_string(),
    }
}

fn render_answer(
    session_id: u64,
    media: &[AnsweredMedia],
    credentials: &IceCredentials,
    config: &TransportConfig,
    port: u16,
) -> String {
    let connection = address_line(config.public_ips.first());
    let bundle: Vec<&str> = media
        .iter()
        .filter(|m| m.is_accepted())
        .map(|m| m.mid.as_str())
        .collect();

    // fmt::Write into a String cannot fail
    let mut sdp = String::new();
    let _ = write!(sdp, "v=0\r\n");
    let _ = write!(sdp, "o=- {} 1 {}\r\n", session_id, connection);
    let _ = write!(sdp, "s=-\r\n");
    let _ = write!(sdp, "t=0 0\r\n");
    let _ = write!(sdp, "a=ice-lite\r\n");
    let _ = write!(sdp, "a=group:BUNDLE {}\r\n", bundle.join(" "));

    for section in media {
        if !section.is_accepted() {
            // Mirrors the offered protocol and format, port 0
            let _ = write!(
                sdp,
                "m={} 0 {} {}\r\n",
                section.media, section.protocol, section.format
            );
            let _ = write!(sdp, "c=IN IP4 0.0.0.0\r\n");
            let _ = write!(sdp, "a=mid:{}\r\n", section.mid);
            let _ = write!(sdp, "a=inactive\r\n");
            continue;
        }

        let payload_types: Vec<String> = section
            .codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect();
        let _ = write!(
            sdp,
            "m={} {} UDP/TLS/RTP/SAVPF {}\r\n",
            section.media,
            port,
            payload_types.join(" ")
        );
        let _ = write!(sdp, "c={}\r\n", connection);
        let _ = write!(sdp, "a=mid:{}\r\n", section.mid);
        let _ = write!(sdp, "a=ice-ufrag:{}\r\n", credentials.ufrag);
        let _ = write!(sdp, "a=ice-pwd:{}\r\n", credentials.pwd);
        let _ = write!(
            sdp,
            "a=fingerprint:{} {}\r\n",
            config.fingerprint.algorithm, config.fingerprint.value
        );
        let _ = write!(sdp, "a=setup:passive\r\n");
        let _ = write!(sdp, "a=recvonly\r\n");
        let _ = write!(sdp, "a=rtcp-mux\r\n");

        for codec in &section.codecs {
            let _ = write!(sdp, "a=rtpmap:{} {}\r\n", codec.payload_type, codec.rtpmap);
            if let Some(fmtp) = &codec.fmtp {
                let _ = write!(sdp, "a=fmtp:{} {}\r\n", codec.payload_type, fmtp);
            }
            for fb in &codec.rtcp_fb {
                let _ = write!(sdp, "a=rtcp-fb:{} {}\r\n", codec.payload_type, fb);
            }
        }

        for (index, ip) in config.public_ips.iter().enumerate() {
            let _ = write!(
                sdp,
                "a=candidate:{} 1 udp {} {} {} typ host\r\n",
                index + 1,
                host_priority(index),
                ip,
                port
            );
        }
        let _ = write!(sdp, "a=end-of-candidates\r\n");
    }

    sdp
}
