//! WHIP ingest integration test harness
//!
//! Provides:
//! - A scripted transport factory whose sessions are driven by the test
//! - Canned SDP offers shaped like browser/OBS publisher offers
//! - Polling helpers for state that settles asynchronously
//!
//! Basic usage pattern:
//!
//! 1. Build an ingest with [`scripted_ingest`]
//! 2. POST an offer with `ingest.handle_ingest(..)`
//! 3. Wait for the transport with [`ScriptedFactory::wait_started`]
//! 4. Drive network events through the returned [`BridgeEventSender`]

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use whip_ingest::{
    BridgeEvent, BridgeEventSender, DtlsFingerprint, Error, FixedCredentials, Offer, PortLease,
    Result, SessionId, TransportFactory, TransportHandle, TransportParams, WhipIngest,
    WhipIngestConfig,
};

pub const FINGERPRINT: &str = "sha-256 5B:4E:30:87:58:6A:32:C1:E4:8F:29:6C:94:55:03:D9:CF:62:2B:3A:7E:43:0E:AF:2E:A6:31:73:5E:69:E6:F5";

/// Initialize test logging once; repeated calls are ignored
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("whip_ingest=debug")
        .with_test_writer()
        .try_init();
}

/// Build a publisher offer with one section per non-empty codec list
///
/// Payload types start at 96 for audio and 106 for video.
pub fn offer(audio: &[&str], video: &[&str]) -> String {
    let mut sdp = String::from(
        "v=0\r\n\
         o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0 1\r\n\
         a=msid-semantic: WMS\r\n",
    );

    for (mid, (kind, codecs)) in [("audio", audio), ("video", video)].iter().enumerate() {
        if codecs.is_empty() {
            continue;
        }
        let payload_types: Vec<String> = (0..codecs.len())
            .map(|i| (96 + mid * 10 + i).to_string())
            .collect();

        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n",
            kind,
            payload_types.join(" ")
        ));
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=rtcp:9 IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=ice-ufrag:EsAw\r\n");
        sdp.push_str("a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n");
        sdp.push_str("a=ice-options:trickle\r\n");
        sdp.push_str(&format!("a=fingerprint:{}\r\n", FINGERPRINT));
        sdp.push_str("a=setup:actpass\r\n");
        sdp.push_str(&format!("a=mid:{}\r\n", mid));
        sdp.push_str("a=sendonly\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
        for (pt, codec) in payload_types.iter().zip(codecs.iter()) {
            sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, codec));
            if codec.starts_with("opus") {
                sdp.push_str(&format!("a=fmtp:{} minptime=10;useinbandfec=1\r\n", pt));
            }
            sdp.push_str(&format!("a=rtcp-fb:{} nack\r\n", pt));
        }
    }

    sdp
}

/// Typical browser offer: Opus audio, VP8 + H264 video
pub fn browser_offer() -> String {
    offer(&["opus/48000/2"], &["VP8/90000", "H264/90000"])
}

/// Configuration with small, test-friendly limits
pub fn test_config(max_sessions: usize) -> WhipIngestConfig {
    WhipIngestConfig::default()
        .with_max_sessions(max_sessions)
        .with_port_range(40000, 40999)
        .with_public_ips(vec!["203.0.113.7".to_string()])
}

pub fn test_fingerprint() -> DtlsFingerprint {
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value: "AA:BB:CC:DD".to_string(),
    }
}

/// Ingest over a scripted factory with fixed ICE credentials
pub fn scripted_ingest(config: WhipIngestConfig) -> (Arc<WhipIngest>, Arc<ScriptedFactory>) {
    let factory = Arc::new(ScriptedFactory::default());
    let ingest = WhipIngest::new(
        config,
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        test_fingerprint(),
        Arc::new(FixedCredentials::new(
            "harnessufrag0001",
            "harnesspasswordharnesspassword01",
        )),
    )
    .expect("valid test config");
    (Arc::new(ingest), factory)
}

/// Transport factory whose network side is played by the test
#[derive(Default)]
pub struct ScriptedFactory {
    started: Mutex<HashMap<SessionId, BridgeEventSender>>,
    closes: Arc<AtomicUsize>,
    fail_start: AtomicBool,
}

impl ScriptedFactory {
    /// Make every following start fail
    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Number of transports closed so far
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.lock().len()
    }

    /// Wait until the transport for `id` started and return its event sender
    pub async fn wait_started(&self, id: &SessionId) -> BridgeEventSender {
        for _ in 0..200 {
            if let Some(events) = self.started.lock().get(id).cloned() {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport for session {} never started", id);
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn start(
        &self,
        _offer: Offer,
        params: TransportParams,
        events: BridgeEventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::TransportFailure("scripted start failure".to_string()));
        }

        events.send(BridgeEvent::GatheringStarted);
        self.started
            .lock()
            .insert(events.session_id().clone(), events.clone());

        Ok(Box::new(ScriptedTransport {
            _port: params.port,
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedTransport {
    _port: PortLease,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportHandle for ScriptedTransport {
    async fn close(self: Box<Self>) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after ~1s of polling
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {}", what);
}
