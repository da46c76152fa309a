//! Transport capability abstractions.
//!
//! A browser-based circumvention proxy ties sessions directly to browser
//! transport objects (a `WebSocket` and an `RTCPeerConnection`/
//! `RTCDataChannel`). This runtime instead drives the session state machine
//! against a transport capability, so the concrete WebRTC and WebSocket
//! stacks stay out of this crate entirely — callers provide implementations
//! of the traits below, e.g. backed by `webrtc-rs` and `tokio-tungstenite`
//! in a deployment, or by [`crate::testing`]'s fakes in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Events a duplex transport emits after it is created. Delivered on an
/// unbounded channel so a handler never blocks the transport's own I/O.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is ready to send and has started delivering messages.
    Open,
    /// One inbound message, in arrival order.
    Message(Vec<u8>),
    /// The remote end (or local close()) ended the transport cleanly.
    Closed,
    /// The transport failed; treated identically to `Closed` by sessions.
    Error(String),
}

/// A bidirectional, reliable, binary-framed duplex — either the client
/// datachannel or the outbound relay connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue `data` for sending. Implementations should not block past
    /// handing the buffer to the underlying transport.
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Current underlying send-buffer depth in bytes, used by the session's
    /// `flush` loop to respect `MAX_BUFFER_BYTES`.
    fn buffered_amount(&self) -> usize;

    /// Idempotent. Further sends after close are an error.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport(open={})", self.is_open())
    }
}

/// A transport bundled with the event stream it emits.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Produces outbound transports. The proxy core uses this for the relay
/// leg, which it opens itself once a session moves past signalling.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open an outbound duplex transport to `url` (a `wss://` relay
    /// address, once past relay-pattern validation).
    async fn connect(&self, url: &str) -> Result<TransportHandle>;
}

/// Negotiates a peer-to-peer datachannel with a client, given its SDP
/// offer. Mirrors the calls a WebRTC negotiation needs: `setRemoteDescription`,
/// `createAnswer`, `setLocalDescription`, and the ICE-gathering-complete
/// signal.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Accepts the client's offer. Failure here means `receiveOffer` returns
    /// false without modifying session state.
    async fn set_remote_description(&self, offer_sdp: &str) -> Result<()>;

    /// Produces and installs the local answer description, returning its
    /// SDP string. Failure here closes the session.
    async fn create_answer(&self) -> Result<String>;

    /// Resolves once ICE gathering reaches the `complete` state. Raced
    /// against `answerTimeout` by the caller.
    async fn ice_gathering_complete(&self);

    /// Resolves once the client opens its datachannel, yielding the
    /// resulting transport. Modelled as a single awaitable instead of a
    /// registered callback so the peer connection never needs a reference
    /// back to the session that owns it.
    async fn accept_data_channel(&self) -> Result<TransportHandle>;
}

/// Produces [`PeerConnection`]s configured with the proxy's ICE servers.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, ice_servers: &[String]) -> Arc<dyn PeerConnection>;
}

/// The HTTP capability the broker client needs: one POST, returning a
/// status code and whatever JSON body came back (or an error if the
/// request never completed). Abstracted for the same reason as
/// `TransportFactory`: it lets broker logic run against an in-memory fake.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(u16, serde_json::Value)>;
}
