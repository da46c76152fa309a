//! The per-client session state machine: offer/answer signalling, relay
//! connect, bidirectional forwarding, and teardown.
//!
//! This is the proxy's busiest component. A session owns exactly one client
//! transport and at most one relay transport and outlives neither; the
//! whole lifecycle after `begin()` runs inside a single spawned task so the
//! forwarding queues and timers never need a lock (only the handful of
//! fields another component reads — state, counted, relay URL — live behind
//! `parking_lot::Mutex`/atomics).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::Instrument;

use snowflake_config::{Configuration, MAX_BUFFER_BYTES};

use crate::error::ProxyError;
use crate::observer::ProxyObserver;
use crate::rate_limit::RateLimit;
use crate::relay_pattern;
use crate::transport::{
    PeerConnection, PeerConnectionFactory, Transport, TransportEvent, TransportFactory,
    TransportHandle,
};
use crate::types::SessionId;

/// `Closed` is terminal; every other state may transition directly to it on
/// error or timeout. Only `Forwarding` contributes to the live client count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialised,
    AwaitingOffer,
    AwaitingIceComplete,
    AwaitingClientOpen,
    AwaitingRelayOpen,
    Forwarding,
    Closed,
}

#[derive(Deserialize)]
struct OfferSdp {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

struct SessionInner {
    id: SessionId,
    config: Arc<Configuration>,
    rate_limiter: Arc<dyn RateLimit>,
    transport_factory: Arc<dyn TransportFactory>,
    pc_factory: Arc<dyn PeerConnectionFactory>,
    observer: Arc<dyn ProxyObserver>,
    state: Mutex<SessionState>,
    relay_url: Mutex<String>,
    client_ip: Mutex<Option<String>>,
    pc: Mutex<Option<Arc<dyn PeerConnection>>>,
    client_transport: Mutex<Option<Arc<dyn Transport>>>,
    relay_transport: Mutex<Option<Arc<dyn Transport>>>,
    counted: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    cleanup: Mutex<Option<Box<dyn FnOnce(SessionId) + Send>>>,
    /// Carries `sid` on every log event emitted for this session's
    /// lifetime, so broker/session/scheduler logs can be correlated by
    /// session id without threading a logger handle everywhere.
    span: tracing::Span,
}

/// A single `client <-> proxy <-> relay` conduit.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        config: Arc<Configuration>,
        rate_limiter: Arc<dyn RateLimit>,
        transport_factory: Arc<dyn TransportFactory>,
        pc_factory: Arc<dyn PeerConnectionFactory>,
        observer: Arc<dyn ProxyObserver>,
        cleanup: impl FnOnce(SessionId) + Send + 'static,
    ) -> Arc<Self> {
        let default_relay = config.default_relay_url.clone();
        let span = tracing::info_span!("session", sid = %id);
        Arc::new(Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                rate_limiter,
                transport_factory,
                pc_factory,
                observer,
                state: Mutex::new(SessionState::Initialised),
                relay_url: Mutex::new(default_relay),
                client_ip: Mutex::new(None),
                pc: Mutex::new(None),
                client_transport: Mutex::new(None),
                relay_transport: Mutex::new(None),
                counted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                cleanup: Mutex::new(Some(Box::new(cleanup))),
                span,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_counted(&self) -> bool {
        self.inner.counted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, s: SessionState) {
        *self.inner.state.lock() = s;
        tracing::trace!(sid = %self.inner.id, state = ?s, "session state transition");
    }

    /// Creates the client-side peer connection and starts waiting for its
    /// datachannel to open. The wait runs in a spawned task so `begin()`
    /// itself returns immediately.
    pub fn begin(self: &Arc<Self>) {
        let pc = self.inner.pc_factory.create(&self.inner.config.ice_servers);
        *self.inner.pc.lock() = Some(pc);
        self.set_state(SessionState::AwaitingOffer);
        let span = self.inner.span.clone();
        tokio::spawn(Arc::clone(self).run().instrument(span));
    }

    /// Overrides the relay URL this session will connect to, once, after
    /// validating it against the allowed pattern. Exposed separately from
    /// `receive_offer` for callers that already trust the URL (tests,
    /// mostly); `receive_offer` itself performs the same validation on
    /// broker-supplied URLs before calling this.
    pub fn set_relay_url(&self, url: String) -> Result<(), ProxyError> {
        validate_relay_url(&url, &self.inner.config.allowed_relay_pattern)?;
        *self.inner.relay_url.lock() = url;
        Ok(())
    }

    /// Processes a broker-delivered offer. `send_answer` is called at most
    /// once, with the locally generated answer SDP, as soon as either ICE
    /// gathering completes or `answerTimeout` elapses — whichever comes
    /// first. Returns false (without ever calling `send_answer`) for every
    /// rejection case; the caller is expected to close the session when
    /// that happens.
    pub async fn receive_offer(
        self: &Arc<Self>,
        offer_json: &str,
        relay_url: Option<String>,
        send_answer: impl FnOnce(String) + Send + 'static,
    ) -> bool {
        if let Some(candidate) = relay_url {
            match validate_relay_url(&candidate, &self.inner.config.allowed_relay_pattern) {
                Ok(()) => *self.inner.relay_url.lock() = candidate,
                Err(e) => {
                    tracing::warn!(sid = %self.inner.id, error = %e, "rejecting broker-supplied relay url");
                    return false;
                }
            }
        }

        let offer: OfferSdp = match serde_json::from_str(offer_json) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(sid = %self.inner.id, error = %e, "offer did not parse");
                return false;
            }
        };
        if offer.kind != "offer" {
            tracing::warn!(sid = %self.inner.id, kind = %offer.kind, "rejecting non-offer sdp");
            return false;
        }

        *self.inner.client_ip.lock() = extract_client_ip(&offer.sdp);

        let pc = match self.inner.pc.lock().clone() {
            Some(pc) => pc,
            None => {
                tracing::warn!(sid = %self.inner.id, "receive_offer called before begin()");
                return false;
            }
        };

        if pc.set_remote_description(&offer.sdp).await.is_err() {
            return false;
        }

        self.set_state(SessionState::AwaitingIceComplete);

        let answer_sdp = match pc.create_answer().await {
            Ok(sdp) => sdp,
            Err(_) => {
                self.close("answer creation failed").await;
                return false;
            }
        };

        tokio::select! {
            _ = pc.ice_gathering_complete() => {}
            _ = tokio::time::sleep(self.inner.config.answer_timeout()) => {}
        }
        send_answer(answer_sdp);

        self.set_state(SessionState::AwaitingClientOpen);
        true
    }

    /// Idempotent. Closes whichever transports are open, balances the
    /// client-count notification, and fires the cleanup hook exactly once.
    pub async fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(sid = %self.inner.id, reason, "closing session");

        if let Some(t) = self.inner.client_transport.lock().take() {
            t.close().await;
        }
        if let Some(t) = self.inner.relay_transport.lock().take() {
            t.close().await;
        }
        if self.inner.counted.swap(false, Ordering::SeqCst) {
            self.inner.observer.decrease_clients();
        }
        self.set_state(SessionState::Closed);
        self.inner.close_notify.notify_waiters();

        if let Some(cleanup) = self.inner.cleanup.lock().take() {
            cleanup(self.inner.id);
        }
    }

    async fn run(self: Arc<Self>) {
        let pc = match self.inner.pc.lock().clone() {
            Some(p) => p,
            None => return,
        };
        if self.is_closed() {
            return;
        }

        let client_handle = tokio::select! {
            result = pc.accept_data_channel() => result,
            _ = self.inner.close_notify.notified() => return,
        };
        let client_handle = match client_handle {
            Ok(h) => h,
            Err(e) => {
                self.close(&format!("client transport failed: {e}")).await;
                return;
            }
        };
        if self.is_closed() {
            // Closed by another task (e.g. `Scheduler::disable()`) while we
            // were awaiting the datachannel. `self.close()` already ran and
            // found no transport stored yet, so this just-acquired handle is
            // ours alone to release.
            client_handle.transport.close().await;
            return;
        }

        *self.inner.client_transport.lock() = Some(client_handle.transport.clone());
        if !self.inner.counted.swap(true, Ordering::SeqCst) {
            self.inner.observer.increase_clients();
        }
        self.set_state(SessionState::AwaitingRelayOpen);

        let relay_handle = match tokio::time::timeout(
            self.inner.config.relay_connect_timeout(),
            self.open_relay(),
        )
        .await
        {
            Err(_) => {
                self.close("relay connect timed out").await;
                return;
            }
            Ok(Err(e)) => {
                self.close(&format!("relay connect failed: {e}")).await;
                return;
            }
            Ok(Ok(h)) => h,
        };
        if self.is_closed() {
            // Same race as above, one checkpoint later: the client transport
            // was already stored and so was closed by the racing `close()`,
            // but this relay handle was not and is ours alone to release.
            relay_handle.transport.close().await;
            return;
        }

        *self.inner.relay_transport.lock() = Some(relay_handle.transport.clone());
        self.inner.observer.set_status("connected");
        self.set_state(SessionState::Forwarding);

        let reason = self.pump(client_handle, relay_handle).await;
        self.close(reason).await;
    }

    /// Builds the final relay URL (appending `client_ip` when the offer's
    /// SDP yielded a public-looking ICE candidate address, per the wire
    /// contract the relay expects) and connects, waiting for the `Open`
    /// event rather than trusting `connect()`'s return alone.
    async fn open_relay(&self) -> crate::error::Result<TransportHandle> {
        let base_url = self.inner.relay_url.lock().clone();
        let final_url = match self.inner.client_ip.lock().clone() {
            Some(ip) => append_client_ip(&base_url, &ip),
            None => base_url,
        };

        let mut handle = self.inner.transport_factory.connect(&final_url).await?;
        loop {
            match handle.events.recv().await {
                Some(TransportEvent::Open) => return Ok(handle),
                Some(TransportEvent::Message(_)) => continue,
                Some(TransportEvent::Closed) | Some(TransportEvent::Error(_)) | None => {
                    return Err(ProxyError::Transport(
                        "relay transport closed before opening".into(),
                    ));
                }
            }
        }
    }

    /// Runs until either transport closes, the stale-message watchdog
    /// fires, or the session is closed externally. Returns the reason, used
    /// only for logging by the caller.
    async fn pump(
        self: &Arc<Self>,
        mut client: TransportHandle,
        mut relay: TransportHandle,
    ) -> &'static str {
        let mut client_to_relay: VecDeque<Vec<u8>> = VecDeque::new();
        let mut relay_to_client: VecDeque<Vec<u8>> = VecDeque::new();
        let mut stale_deadline = tokio::time::Instant::now() + self.inner.config.message_timeout();
        let mut deferred_flush: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                maybe_ev = client.events.recv() => {
                    match maybe_ev {
                        Some(TransportEvent::Message(bytes)) => {
                            stale_deadline = tokio::time::Instant::now() + self.inner.config.message_timeout();
                            client_to_relay.push_back(bytes);
                            self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                        }
                        Some(TransportEvent::Open) => {}
                        Some(TransportEvent::Closed) | Some(TransportEvent::Error(_)) | None => {
                            self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                            return "client transport closed";
                        }
                    }
                }
                maybe_ev = relay.events.recv() => {
                    match maybe_ev {
                        Some(TransportEvent::Message(bytes)) => {
                            relay_to_client.push_back(bytes);
                            self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                        }
                        Some(TransportEvent::Open) => {}
                        Some(TransportEvent::Closed) | Some(TransportEvent::Error(_)) | None => {
                            self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                            return "relay transport closed";
                        }
                    }
                }
                _ = tokio::time::sleep_until(stale_deadline) => {
                    self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                    return "stale-message watchdog";
                }
                _ = sleep_until_opt(deferred_flush) => {
                    deferred_flush = None;
                    self.run_flush(&client.transport, &relay.transport, &mut client_to_relay, &mut relay_to_client, &mut deferred_flush).await;
                }
                _ = self.inner.close_notify.notified() => {
                    return "closed externally";
                }
            }
            if self.is_closed() {
                return "closed externally";
            }
        }
    }

    async fn run_flush(
        &self,
        client: &Arc<dyn Transport>,
        relay: &Arc<dyn Transport>,
        client_to_relay: &mut VecDeque<Vec<u8>>,
        relay_to_client: &mut VecDeque<Vec<u8>>,
        deferred_flush: &mut Option<tokio::time::Instant>,
    ) {
        let when = try_flush(
            self.inner.rate_limiter.as_ref(),
            client.as_ref(),
            relay.as_ref(),
            client_to_relay,
            relay_to_client,
        )
        .await;
        *deferred_flush =
            when.map(|secs| tokio::time::Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    }
}

/// Drains both queues while the rate limiter allows it and progress is
/// being made. Returns `Some(seconds)` to arm a deferred flush if anything
/// is left queued afterwards.
async fn try_flush(
    rate_limiter: &dyn RateLimit,
    client: &dyn Transport,
    relay: &dyn Transport,
    client_to_relay: &mut VecDeque<Vec<u8>>,
    relay_to_client: &mut VecDeque<Vec<u8>>,
) -> Option<f64> {
    loop {
        if rate_limiter.is_limited() {
            break;
        }
        let mut progress = false;

        if !client_to_relay.is_empty() && relay.is_open() && relay.buffered_amount() < MAX_BUFFER_BYTES {
            let chunk = client_to_relay.pop_front().expect("checked non-empty");
            let len = chunk.len() as u32;
            if relay.send(chunk).await.is_ok() {
                rate_limiter.update(len);
            }
            progress = true;
        }

        if !relay_to_client.is_empty() && client.is_open() && client.buffered_amount() < MAX_BUFFER_BYTES {
            let chunk = relay_to_client.pop_front().expect("checked non-empty");
            let len = chunk.len() as u32;
            if client.send(chunk).await.is_ok() {
                rate_limiter.update(len);
            }
            progress = true;
        }

        if !progress {
            break;
        }
    }

    if !client_to_relay.is_empty() || !relay_to_client.is_empty() {
        Some(rate_limiter.when())
    } else {
        None
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn validate_relay_url(candidate: &str, pattern: &str) -> Result<(), ProxyError> {
    let parsed = url::Url::parse(candidate).map_err(|e| ProxyError::RelayUrlRejected {
        url: candidate.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "wss" {
        return Err(ProxyError::RelayUrlRejected {
            url: candidate.to_string(),
            reason: "scheme must be wss".to_string(),
        });
    }
    let host = parsed.host_str().ok_or_else(|| ProxyError::RelayUrlRejected {
        url: candidate.to_string(),
        reason: "missing host".to_string(),
    })?;
    if !relay_pattern::matches(pattern, host) {
        return Err(ProxyError::RelayUrlRejected {
            url: candidate.to_string(),
            reason: format!("host {host} does not match allowed pattern {pattern}"),
        });
    }
    Ok(())
}

fn append_client_ip(url: &str, ip: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("client_ip", ip);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Scans SDP for an ICE `a=candidate` line whose address looks like a
/// routable public IPv4 host. Private, loopback, and link-local ranges are
/// excluded; the first surviving candidate wins.
fn extract_client_ip(sdp: &str) -> Option<String> {
    for line in sdp.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("a=candidate:") else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // foundation component transport priority address port "typ" type ...
        let address = fields.get(4)?;
        if is_public_looking_ipv4(address) {
            return Some(address.to_string());
        }
    }
    None
}

fn is_public_looking_ipv4(addr: &str) -> bool {
    let octets: Vec<u8> = addr.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 {
        return false;
    }
    let (a, b) = (octets[0], octets[1]);
    match (a, b) {
        (10, _) => false,
        (127, _) => false,
        (169, 254) => false,
        (172, 16..=31) => false,
        (192, 168) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use crate::testing::{
        fake_peer_connection_factory, fake_transport_factory, fake_transport_pair,
    };
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Arc<Configuration> {
        let mut cfg = Configuration::default();
        cfg.relay_connect_timeout_ms = 200;
        cfg.answer_timeout_ms = 100;
        cfg.message_timeout_ms = 500;
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn successful_signalling_calls_send_answer_once() {
        let (pc_factory, mut pc_events) = fake_peer_connection_factory();
        let (transport_factory, _connects) = fake_transport_factory(true);
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(crate::rate_limit::NullRateLimit);
        let cleanup_called = Arc::new(AtomicBool::new(false));
        let cleanup_flag = cleanup_called.clone();

        let session = Session::new(
            SessionId::new_random(),
            test_config(),
            rate_limiter,
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            move |_| cleanup_flag.store(true, Ordering::SeqCst),
        );
        session.begin();
        let pc_controller = pc_events.recv().await.expect("peer connection created");
        pc_controller.complete_ice_gathering();

        let (answer_tx, answer_rx) = tokio::sync::oneshot::channel();
        let answered = session
            .receive_offer(
                r#"{"type":"offer","sdp":"v=0"}"#,
                None,
                move |sdp| {
                    let _ = answer_tx.send(sdp);
                },
            )
            .await;

        assert!(answered);
        let answer = answer_rx.await.unwrap();
        assert_eq!(answer, "fake-answer-sdp");
        assert_eq!(session.state(), SessionState::AwaitingClientOpen);
    }

    #[tokio::test]
    async fn invalid_offer_type_returns_false_without_answering() {
        let (pc_factory, _pc_events) = fake_peer_connection_factory();
        let (transport_factory, _connects) = fake_transport_factory(true);
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(crate::rate_limit::NullRateLimit);

        let session = Session::new(
            SessionId::new_random(),
            test_config(),
            rate_limiter,
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            |_| {},
        );
        session.begin();

        let answered_count = Arc::new(AtomicUsize::new(0));
        let counter = answered_count.clone();
        let answered = session
            .receive_offer(
                r#"{"type":"not a good offer","sdp":"foo"}"#,
                None,
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert!(!answered);
        assert_eq!(answered_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disallowed_relay_url_is_rejected_without_answering() {
        let (pc_factory, _pc_events) = fake_peer_connection_factory();
        let (transport_factory, _connects) = fake_transport_factory(true);
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(crate::rate_limit::NullRateLimit);

        let mut cfg = Configuration::default();
        cfg.allowed_relay_pattern = "snowflake.torproject.net".to_string();
        let session = Session::new(
            SessionId::new_random(),
            Arc::new(cfg),
            rate_limiter,
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            |_| {},
        );
        session.begin();

        let answered = session
            .receive_offer(
                r#"{"type":"offer","sdp":"v=0"}"#,
                Some("wss://attacker.example/".to_string()),
                |_| panic!("must not be called"),
            )
            .await;

        assert!(!answered);
    }

    #[tokio::test]
    async fn forwards_bytes_in_both_directions_until_client_closes() {
        let (pc_factory, mut pc_events) = fake_peer_connection_factory();
        let (transport_factory, mut connects) = fake_transport_factory(true);
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(crate::rate_limit::NullRateLimit);

        let session = Session::new(
            SessionId::new_random(),
            test_config(),
            rate_limiter,
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            |_| {},
        );
        session.begin();

        let pc_controller = pc_events.recv().await.expect("peer connection created");
        pc_controller.complete_ice_gathering();

        let (client_transport, client_controller, client_events) = fake_transport_pair();
        client_controller.open();
        let (answer_tx, _answer_rx) = tokio::sync::oneshot::channel();
        session
            .receive_offer(r#"{"type":"offer","sdp":"v=0"}"#, None, move |sdp| {
                let _ = answer_tx.send(sdp);
            })
            .await;
        pc_controller.open_data_channel(TransportHandle {
            transport: client_transport,
            events: client_events,
        });

        let (relay_url, relay_controller) = connects.recv().await.expect("relay connect attempted");
        assert_eq!(relay_url, "wss://snowflake.freehaven.net/");

        client_controller.deliver(b"hello relay".to_vec());

        // Give the spawned task a few scheduler turns to process the pump.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if !relay_controller.sent().is_empty() {
                break;
            }
        }
        assert_eq!(relay_controller.sent(), vec![b"hello relay".to_vec()]);

        relay_controller.deliver(b"hello client".to_vec());
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if !client_controller.sent().is_empty() {
                break;
            }
        }
        assert_eq!(client_controller.sent(), vec![b"hello client".to_vec()]);
    }

    #[tokio::test]
    async fn relay_connect_timeout_closes_session_without_panicking() {
        let (pc_factory, mut pc_events) = fake_peer_connection_factory();
        // `auto_open: false` means connections never fire `TransportEvent::Open`,
        // so `open_relay` blocks until the relay-connect timeout races it out.
        let (transport_factory, mut connects) = fake_transport_factory(false);
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(crate::rate_limit::NullRateLimit);
        let cleanup_called = Arc::new(AtomicBool::new(false));
        let cleanup_flag = cleanup_called.clone();

        let session = Session::new(
            SessionId::new_random(),
            test_config(),
            rate_limiter,
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            move |_| cleanup_flag.store(true, Ordering::SeqCst),
        );
        session.begin();

        let pc_controller = pc_events.recv().await.expect("peer connection created");
        pc_controller.complete_ice_gathering();
        let (_answer_tx, _answer_rx) = tokio::sync::oneshot::channel();
        session
            .receive_offer(r#"{"type":"offer","sdp":"v=0"}"#, None, |_| {})
            .await;

        let (client_transport, client_controller, client_events) = fake_transport_pair();
        client_controller.open();
        pc_controller.open_data_channel(TransportHandle {
            transport: client_transport,
            events: client_events,
        });

        let _ = connects.recv().await.expect("relay connect attempted");
        // Never call relay_controller's open(): the 200ms relay_connect_timeout
        // in test_config() must fire and close the session on its own.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(cleanup_called.load(Ordering::SeqCst));
    }

    #[test]
    fn extracts_public_looking_candidate_and_skips_private_ranges() {
        let sdp = "a=candidate:1 1 udp 2122260223 10.0.0.5 54400 typ host\r\n\
                   a=candidate:2 1 udp 2122260223 203.0.113.9 54401 typ host\r\n";
        assert_eq!(extract_client_ip(sdp).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn no_candidate_lines_yields_none() {
        assert_eq!(extract_client_ip("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n"), None);
    }

    #[test]
    fn appends_client_ip_query_param() {
        let url = append_client_ip("wss://snowflake.freehaven.net/", "203.0.113.9");
        assert_eq!(url, "wss://snowflake.freehaven.net/?client_ip=203.0.113.9");
    }
}
