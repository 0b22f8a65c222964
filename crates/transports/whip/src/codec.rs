//! Codec allow-list types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by an SDP media section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Parse the `m=` media token
    pub fn from_media(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Codecs the server can be configured to accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Opus (48 kHz, required by WebRTC)
    Opus,
    /// G.722 wideband audio
    G722,
    /// G.711 mu-law
    Pcmu,
    /// G.711 A-law
    Pcma,
    /// VP8
    Vp8,
    /// VP9
    Vp9,
    /// H.264
    H264,
    /// AV1
    Av1,
}

impl Codec {
    pub const ALL: [Codec; 8] = [
        Codec::Opus,
        Codec::G722,
        Codec::Pcmu,
        Codec::Pcma,
        Codec::Vp8,
        Codec::Vp9,
        Codec::H264,
        Codec::Av1,
    ];

    /// Encoding name as it appears in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::Opus => "opus",
            Codec::G722 => "G722",
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::Av1 => "AV1",
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            Codec::Opus | Codec::G722 | Codec::Pcmu | Codec::Pcma => MediaKind::Audio,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 | Codec::Av1 => MediaKind::Video,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48000,
            Codec::G722 | Codec::Pcmu | Codec::Pcma => 8000,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 | Codec::Av1 => 90000,
        }
    }

    /// Look up a codec by its rtpmap encoding name (case-insensitive)
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|codec| codec.encoding_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// A payload type accepted during negotiation
///
/// Payload type, rtpmap and fmtp are echoed from the offer so the publisher
/// keeps sending with the numbering it chose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedCodec {
    pub payload_type: u8,
    pub codec: Codec,
    /// rtpmap value without the payload type, e.g. `opus/48000/2`
    pub rtpmap: String,
    /// fmtp parameters, e.g. `minptime=10;useinbandfec=1`
    pub fmtp: Option<String>,
    /// rtcp-fb values without the payload type, e.g. `nack pli`
    pub rtcp_fb: Vec<String>,
}
