//! Snowflake-style circumvention proxy — CLI entrypoint.
//!
//! Wires the broker client, rate limiter, and scheduler from a loaded
//! [`Configuration`], then runs the poll loop until interrupted. The
//! concrete WebRTC datachannel and WebSocket relay transports are out of
//! scope for this crate (see `proxy_core::transport`); this binary runs
//! against placeholder factories that fail clearly on first use, so an
//! embedder supplying real transports is a drop-in replacement of
//! [`build_transport_factory`] and [`build_peer_connection_factory`] below.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use proxy_core::{
    BrokerClient, BrokerTransport, NullObserver, NullRateLimit, PeerConnection,
    PeerConnectionFactory, ProxyError, RateLimit, ReqwestBrokerTransport, Scheduler,
    TokenBucketRateLimit, TransportFactory, TransportHandle,
};
use snowflake_config::Configuration;

/// Timeout applied to the broker's offer-poll endpoint. The source protocol
/// leaves this request unbounded; a single-threaded scheduler hanging on a
/// dead broker would never poll again, so a conservative ceiling is applied
/// here rather than in the library (see DESIGN.md).
const BROKER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "snowflake-proxy")]
#[command(about = "Volunteer circumvention proxy: broker polling, session forwarding, adaptive scheduling")]
struct Args {
    /// Path to a TOML configuration file. Missing files fall back to
    /// built-in defaults.
    #[arg(short, long, default_value = "snowflake-proxy.toml")]
    config: PathBuf,

    /// Run a single broker poll and exit instead of serving indefinitely.
    #[arg(long)]
    once: bool,

    /// Override `log_format` from the configuration file ("pretty" or "json").
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(config: &Configuration, override_format: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let format = override_format.unwrap_or(&config.log_format);
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Configuration::from_file(&args.config)
        .context("loading configuration")?;
    init_tracing(&config, args.log_format.as_deref());

    info!(broker = %config.broker_url, relay = %config.default_relay_url, "starting snowflake proxy");

    let config = Arc::new(config);

    let broker_transport: Arc<dyn BrokerTransport> =
        Arc::new(ReqwestBrokerTransport::new(BROKER_HTTP_TIMEOUT).context("building broker http client")?);
    let broker = Arc::new(BrokerClient::new(
        broker_transport,
        &config.broker_url,
        config.proxy_type.clone(),
        config.allowed_relay_pattern.clone(),
    ));

    let rate_limiter: Arc<dyn RateLimit> = match config.rate_limit_bytes_per_sec {
        Some(bytes_per_sec) => Arc::new(TokenBucketRateLimit::new(
            bytes_per_sec,
            config.rate_limit_window_secs,
        )),
        None => Arc::new(NullRateLimit),
    };

    let scheduler = Scheduler::new(
        Arc::clone(&config),
        broker,
        rate_limiter,
        build_transport_factory(),
        build_peer_connection_factory(),
        Arc::new(NullObserver),
    );

    if args.once {
        info!("running a single poll pass (--once)");
        scheduler.begin_serving_clients();
        tokio::time::sleep(config.poll_interval_default()).await;
        scheduler.disable().await;
        return Ok(());
    }

    scheduler.begin_serving_clients();

    let reporter = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let stats = scheduler.stats();
                info!(
                    live_sessions = stats.live_sessions,
                    poll_interval_ms = stats.poll_interval_ms,
                    retries = stats.retries,
                    our_nat = %stats.our_nat,
                    "scheduler snapshot"
                );
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    reporter.abort();
    scheduler.disable().await;

    Ok(())
}

/// Placeholder relay/datachannel factory: every connection attempt fails
/// immediately with a clear error. Swap in a `tokio-tungstenite`-backed
/// implementation to actually reach a relay.
fn build_transport_factory() -> Arc<dyn TransportFactory> {
    Arc::new(UnimplementedTransportFactory)
}

/// Placeholder peer-connection factory: every negotiation step fails
/// immediately. Swap in a `webrtc-rs`-backed implementation to actually
/// negotiate with clients.
fn build_peer_connection_factory() -> Arc<dyn PeerConnectionFactory> {
    Arc::new(UnimplementedPeerConnectionFactory)
}

struct UnimplementedTransportFactory;

#[async_trait]
impl TransportFactory for UnimplementedTransportFactory {
    async fn connect(&self, url: &str) -> proxy_core::Result<TransportHandle> {
        Err(ProxyError::Transport(format!(
            "no relay transport implementation configured (wanted to connect to {url})"
        )))
    }
}

struct UnimplementedPeerConnection;

#[async_trait]
impl PeerConnection for UnimplementedPeerConnection {
    async fn set_remote_description(&self, _offer_sdp: &str) -> proxy_core::Result<()> {
        Err(ProxyError::Internal(
            "no WebRTC peer-connection implementation configured".into(),
        ))
    }

    async fn create_answer(&self) -> proxy_core::Result<String> {
        Err(ProxyError::Internal(
            "no WebRTC peer-connection implementation configured".into(),
        ))
    }

    async fn ice_gathering_complete(&self) {
        std::future::pending().await
    }

    async fn accept_data_channel(&self) -> proxy_core::Result<TransportHandle> {
        Err(ProxyError::Internal(
            "no WebRTC peer-connection implementation configured".into(),
        ))
    }
}

struct UnimplementedPeerConnectionFactory;

impl PeerConnectionFactory for UnimplementedPeerConnectionFactory {
    fn create(&self, _ice_servers: &[String]) -> Arc<dyn PeerConnection> {
        Arc::new(UnimplementedPeerConnection)
    }
}
