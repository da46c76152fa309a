//! In-memory fakes for the transport, peer-connection, and broker-HTTP
//! capabilities, used by this crate's own unit tests and available to
//! downstream integration tests that want to drive the scheduler or a
//! session without a live network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{ProxyError, Result};
use crate::transport::{
    BrokerTransport, PeerConnection, PeerConnectionFactory, Transport, TransportEvent,
    TransportFactory, TransportHandle,
};

struct FakeTransportState {
    open: bool,
    buffered: usize,
    sent: Vec<Vec<u8>>,
    fail_sends: bool,
}

/// An in-memory duplex transport. Construct via [`fake_transport_pair`].
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ProxyError::Transport("send on closed fake transport".into()));
        }
        if state.fail_sends {
            return Err(ProxyError::Transport("simulated send failure".into()));
        }
        state.buffered += data.len();
        state.sent.push(data);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    async fn close(&self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Test-side handle for driving a [`FakeTransport`]'s lifecycle and
/// inspecting what was sent through it.
#[derive(Clone)]
pub struct FakeTransportController {
    state: Arc<Mutex<FakeTransportState>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeTransportController {
    pub fn open(&self) {
        self.state.lock().open = true;
        let _ = self.event_tx.send(TransportEvent::Open);
    }

    pub fn deliver(&self, bytes: Vec<u8>) {
        let _ = self.event_tx.send(TransportEvent::Message(bytes));
    }

    pub fn close(&self) {
        self.state.lock().open = false;
        let _ = self.event_tx.send(TransportEvent::Closed);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.state.lock().open = false;
        let _ = self.event_tx.send(TransportEvent::Error(message.into()));
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Simulate the peer having drained `n` bytes from its receive buffer.
    pub fn drain(&self, n: usize) {
        let mut state = self.state.lock();
        state.buffered = state.buffered.saturating_sub(n);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }
}

/// Build one fake transport plus the controller and event receiver used to
/// drive it. The transport starts closed; call `controller.open()` to
/// simulate the underlying connection completing.
pub fn fake_transport_pair() -> (
    Arc<dyn Transport>,
    FakeTransportController,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let state = Arc::new(Mutex::new(FakeTransportState {
        open: false,
        buffered: 0,
        sent: Vec::new(),
        fail_sends: false,
    }));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(FakeTransport {
        state: state.clone(),
    });
    let controller = FakeTransportController { state, event_tx };
    (transport, controller, event_rx)
}

/// A [`TransportFactory`] that hands out fake transports and reports each
/// connection attempt (url, controller) on a channel the test retains.
pub struct FakeTransportFactory {
    auto_open: bool,
    notify: mpsc::UnboundedSender<(String, FakeTransportController)>,
    fail_connect: AtomicBool,
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, url: &str) -> Result<TransportHandle> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(ProxyError::Transport(format!(
                "simulated connect failure for {url}"
            )));
        }
        let (transport, controller, events) = fake_transport_pair();
        if self.auto_open {
            controller.open();
        }
        let _ = self.notify.send((url.to_string(), controller));
        Ok(TransportHandle { transport, events })
    }
}

impl FakeTransportFactory {
    pub fn fail_next_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }
}

/// `auto_open` controls whether each connected transport immediately fires
/// `TransportEvent::Open`, which is convenient for tests that don't care
/// about the connect race and only want open-by-default relay transports.
pub fn fake_transport_factory(
    auto_open: bool,
) -> (
    Arc<FakeTransportFactory>,
    mpsc::UnboundedReceiver<(String, FakeTransportController)>,
) {
    let (notify, rx) = mpsc::unbounded_channel();
    (
        Arc::new(FakeTransportFactory {
            auto_open,
            notify,
            fail_connect: AtomicBool::new(false),
        }),
        rx,
    )
}

/// A scriptable fake peer connection covering the four WebRTC negotiation
/// calls a session drives: `setRemoteDescription`, `createAnswer`,
/// ICE-gathering-complete, and data-channel accept.
pub struct FakePeerConnection {
    set_remote_ok: AtomicBool,
    create_answer_ok: AtomicBool,
    answer_sdp: Mutex<String>,
    ice_notify: Arc<Notify>,
    data_channel_rx: Mutex<Option<oneshot::Receiver<TransportHandle>>>,
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn set_remote_description(&self, _offer_sdp: &str) -> Result<()> {
        if self.set_remote_ok.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ProxyError::InvalidOffer(
                "fake rejected remote description".into(),
            ))
        }
    }

    async fn create_answer(&self) -> Result<String> {
        if self.create_answer_ok.load(Ordering::Relaxed) {
            Ok(self.answer_sdp.lock().clone())
        } else {
            Err(ProxyError::AnswerCreationFailed(
                "fake failed to create answer".into(),
            ))
        }
    }

    async fn ice_gathering_complete(&self) {
        self.ice_notify.notified().await;
    }

    async fn accept_data_channel(&self) -> Result<TransportHandle> {
        let rx = self.data_channel_rx.lock().take();
        match rx {
            Some(rx) => rx
                .await
                .map_err(|_| ProxyError::Internal("data channel never opened".into())),
            None => std::future::pending().await,
        }
    }
}

/// Test-side control handle for a [`FakePeerConnection`].
pub struct FakePeerConnectionController {
    inner: Arc<FakePeerConnection>,
    data_channel_tx: Mutex<Option<oneshot::Sender<TransportHandle>>>,
}

impl FakePeerConnectionController {
    pub fn fail_set_remote_description(&self) {
        self.inner.set_remote_ok.store(false, Ordering::Relaxed);
    }

    pub fn fail_create_answer(&self) {
        self.inner.create_answer_ok.store(false, Ordering::Relaxed);
    }

    pub fn set_answer_sdp(&self, sdp: impl Into<String>) {
        *self.inner.answer_sdp.lock() = sdp.into();
    }

    pub fn complete_ice_gathering(&self) {
        self.inner.ice_notify.notify_one();
    }

    /// Simulate the client's datachannel opening, handing the session the
    /// given fake transport as its client-side leg.
    pub fn open_data_channel(&self, handle: TransportHandle) {
        if let Some(tx) = self.data_channel_tx.lock().take() {
            let _ = tx.send(handle);
        }
    }
}

pub fn fake_peer_connection() -> (Arc<FakePeerConnection>, FakePeerConnectionController) {
    let (tx, rx) = oneshot::channel();
    let inner = Arc::new(FakePeerConnection {
        set_remote_ok: AtomicBool::new(true),
        create_answer_ok: AtomicBool::new(true),
        answer_sdp: Mutex::new("fake-answer-sdp".to_string()),
        ice_notify: Arc::new(Notify::new()),
        data_channel_rx: Mutex::new(Some(rx)),
    });
    let controller = FakePeerConnectionController {
        inner: inner.clone(),
        data_channel_tx: Mutex::new(Some(tx)),
    };
    (inner, controller)
}

/// A [`PeerConnectionFactory`] that reports each created connection's
/// controller on a channel the test retains.
pub struct FakePeerConnectionFactory {
    notify: mpsc::UnboundedSender<FakePeerConnectionController>,
}

impl PeerConnectionFactory for FakePeerConnectionFactory {
    fn create(&self, _ice_servers: &[String]) -> Arc<dyn PeerConnection> {
        let (pc, controller) = fake_peer_connection();
        let _ = self.notify.send(controller);
        pc
    }
}

pub fn fake_peer_connection_factory() -> (
    Arc<FakePeerConnectionFactory>,
    mpsc::UnboundedReceiver<FakePeerConnectionController>,
) {
    let (notify, rx) = mpsc::unbounded_channel();
    (Arc::new(FakePeerConnectionFactory { notify }), rx)
}

/// A scriptable fake broker HTTP transport. Responses are consumed in FIFO
/// order; once exhausted, it answers `{"Status": "no match"}` with a 200,
/// matching the broker's expected idle response.
pub struct FakeBrokerTransport {
    responses: Mutex<VecDeque<Result<(u16, serde_json::Value)>>>,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeBrokerTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: Result<(u16, serde_json::Value)>) {
        self.responses.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<(String, serde_json::Value)> {
        self.requests.lock().clone()
    }
}

impl Default for FakeBrokerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for FakeBrokerTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(u16, serde_json::Value)> {
        self.requests.lock().push((url.to_string(), body));
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok((200, serde_json::json!({"Status": "no match"}))))
    }
}
