//! WHIP ingest server binary entry point
//!
//! Accepts WebRTC publishers (OBS, browsers, GStreamer `whipclientsink`)
//! over the WebRTC-HTTP Ingestion Protocol.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:8080, endpoint /whip, UDP 50000-50050
//! cargo run -p whip-ingest-server
//!
//! # Load a TOML config, override the advertised address
//! cargo run -p whip-ingest-server -- \
//!   --config ./whip.toml \
//!   --public-ips 203.0.113.7
//!
//! # Advertise a TURN relay
//! cargo run -p whip-ingest-server -- \
//!   --turn-servers turn:turn.example.com:3478:user:secret
//! ```

mod routes;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use whip_ingest::{Codec, TurnServerConfig, WhipIngest, WhipIngestConfig};

/// WHIP Ingest Server
///
/// Negotiates WebRTC ingest sessions over HTTP and supervises their
/// lifecycle. Flags and environment variables override the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "WHIP_LISTEN_ADDRESS")]
    listen: SocketAddr,

    /// TOML configuration file
    #[arg(short, long, env = "WHIP_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrent sessions
    #[arg(long, env = "WHIP_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Maximum SDP offer size in bytes
    #[arg(long, env = "WHIP_MAX_OFFER_BYTES")]
    max_offer_bytes: Option<usize>,

    /// Lowest UDP port used for ICE
    #[arg(long, env = "WHIP_UDP_PORT_MIN")]
    udp_port_min: Option<u16>,

    /// Highest UDP port used for ICE
    #[arg(long, env = "WHIP_UDP_PORT_MAX")]
    udp_port_max: Option<u16>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "WHIP_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// TURN servers as turn:host:port:username:password (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = parse_turn_server,
        env = "WHIP_TURN_SERVERS"
    )]
    turn_servers: Option<Vec<TurnServerConfig>>,

    /// Accepted codecs, e.g. opus,vp8,h264 (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = parse_codec,
        env = "WHIP_CODECS"
    )]
    codecs: Option<Vec<Codec>>,

    /// Addresses advertised as ICE host candidates (comma-separated)
    #[arg(long, value_delimiter = ',', env = "WHIP_PUBLIC_IPS")]
    public_ips: Option<Vec<String>>,

    /// Connection establishment timeout in milliseconds
    #[arg(long, env = "WHIP_CONNECTING_TIMEOUT_MS")]
    connecting_timeout_ms: Option<u64>,

    /// Grace period for disconnected sessions in milliseconds
    #[arg(long, env = "WHIP_DISCONNECTED_GRACE_MS")]
    disconnected_grace_ms: Option<u64>,

    /// WHIP endpoint path
    #[arg(long, env = "WHIP_PATH")]
    whip_path: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "WHIP_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Defaults, then the config file, then flags and environment
    fn load_config(&self) -> anyhow::Result<WhipIngestConfig> {
        let mut config = match &self.config {
            Some(path) => WhipIngestConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => WhipIngestConfig::default(),
        };

        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(max_offer_bytes) = self.max_offer_bytes {
            config.max_offer_bytes = max_offer_bytes;
        }
        if let Some(min) = self.udp_port_min {
            config.udp_port_min = min;
        }
        if let Some(max) = self.udp_port_max {
            config.udp_port_max = max;
        }
        if let Some(stun_servers) = &self.stun_servers {
            config.stun_servers = stun_servers.clone();
        }
        if let Some(turn_servers) = &self.turn_servers {
            config.turn_servers = turn_servers.clone();
        }
        if let Some(codecs) = &self.codecs {
            config.codecs = codecs.clone();
        }
        if let Some(public_ips) = &self.public_ips {
            config.public_ips = public_ips.clone();
        }
        if let Some(ms) = self.connecting_timeout_ms {
            config.connecting_timeout_ms = ms;
        }
        if let Some(ms) = self.disconnected_grace_ms {
            config.disconnected_grace_ms = ms;
        }
        if let Some(whip_path) = &self.whip_path {
            config.whip_path = whip_path.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    // Password first: the URL itself contains colons
    let mut parts = s.rsplitn(3, ':');
    let credential = parts.next();
    let username = parts.next();
    let url = parts.next();

    match (url, username, credential) {
        (Some(url), Some(username), Some(credential))
            if (url.starts_with("turn:") || url.starts_with("turns:"))
                && url.matches(':').count() >= 2
                && !username.is_empty() =>
        {
            Ok(TurnServerConfig {
                url: url.to_string(),
                username: username.to_string(),
                credential: credential.to_string(),
            })
        }
        _ => Err(format!(
            "expected turn:host:port:username:password, got '{}'",
            s
        )),
    }
}

fn parse_codec(s: &str) -> Result<Codec, String> {
    Codec::from_encoding_name(s.trim()).ok_or_else(|| format!("unknown codec '{}'", s))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\n[SIGNAL] Ctrl+C received, initiating shutdown...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("[SIGNAL] Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            eprintln!("[WATCHDOG] Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("whip-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    let config = args.load_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %args.listen,
        whip_path = %config.whip_path,
        max_sessions = config.max_sessions,
        public_ips = ?config.public_ips,
        "WHIP ingest server starting"
    );

    let ingest = Arc::new(WhipIngest::with_webrtc(config)?);
    ingest.start();

    let app = routes::router(Arc::clone(&ingest));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("WHIP endpoint listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        info!("Shutdown signal received, stopping HTTP server...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_future)
        .await?;

    ingest.shutdown().await;
    info!("WHIP ingest server shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG, falling back to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
