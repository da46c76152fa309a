//! The NAT-adaptive broker-poll scheduler: owns the live session set, runs
//! the poll loop, and adjusts poll cadence and concurrency from how each
//! poll's datachannel negotiation turns out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use snowflake_config::Configuration;

use crate::broker::BrokerClient;
use crate::observer::ProxyObserver;
use crate::rate_limit::RateLimit;
use crate::session::{Session, SessionState};
use crate::transport::{PeerConnectionFactory, TransportFactory};
use crate::types::{NatType, SessionId};

/// A point-in-time snapshot of scheduler counters, for a host UI or metrics
/// endpoint to poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerStats {
    pub live_sessions: usize,
    pub poll_interval_ms: u64,
    pub retries: u64,
    pub nat_failures: u32,
    pub our_nat: NatType,
    pub max_num_clients: usize,
}

struct SchedulerState {
    sessions: HashMap<SessionId, Arc<Session>>,
    poll_interval_ms: u64,
    nat_failures: u32,
    our_nat: NatType,
    max_num_clients: usize,
    disabled: bool,
}

/// Owns the session set and drives the adaptive broker-poll loop.
pub struct Scheduler {
    config: Arc<Configuration>,
    broker: Arc<BrokerClient>,
    rate_limiter: Arc<dyn RateLimit>,
    transport_factory: Arc<dyn TransportFactory>,
    pc_factory: Arc<dyn PeerConnectionFactory>,
    observer: Arc<dyn ProxyObserver>,
    state: Mutex<SchedulerState>,
    retries: AtomicU64,
    poll_generation: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        config: Arc<Configuration>,
        broker: Arc<BrokerClient>,
        rate_limiter: Arc<dyn RateLimit>,
        transport_factory: Arc<dyn TransportFactory>,
        pc_factory: Arc<dyn PeerConnectionFactory>,
        observer: Arc<dyn ProxyObserver>,
    ) -> Arc<Self> {
        let max_num_clients = config.max_num_clients;
        let poll_interval_ms = config.poll_interval_default_ms;
        Arc::new(Self {
            config,
            broker,
            rate_limiter,
            transport_factory,
            pc_factory,
            observer,
            state: Mutex::new(SchedulerState {
                sessions: HashMap::new(),
                poll_interval_ms,
                nat_failures: 0,
                our_nat: NatType::Unknown,
                max_num_clients,
                disabled: false,
            }),
            retries: AtomicU64::new(0),
            poll_generation: AtomicUsize::new(0),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            live_sessions: state.sessions.len(),
            poll_interval_ms: state.poll_interval_ms,
            retries: self.retries.load(Ordering::SeqCst),
            nat_failures: state.nat_failures,
            our_nat: state.our_nat,
            max_num_clients: state.max_num_clients,
        }
    }

    fn live_session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Starts the poll loop, spawned as a background task. Each iteration
    /// reschedules itself via `tokio::time::sleep` for the current poll
    /// interval, which may shrink or grow between iterations as the
    /// adaptive policy kicks in.
    pub fn begin_serving_clients(self: &Arc<Self>) {
        let generation = self.poll_generation.load(Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).serve_loop(generation));
    }

    async fn serve_loop(self: Arc<Self>, generation: usize) {
        loop {
            if self.poll_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if self.state.lock().disabled {
                return;
            }

            if self.live_session_count() < self.state.lock().max_num_clients {
                self.poll_broker().await;
            }

            let interval_ms = self.state.lock().poll_interval_ms;
            tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
        }
    }

    async fn poll_broker(self: &Arc<Self>) {
        let sid = SessionId::new_random();
        let our_nat = self.state.lock().our_nat;
        let live_count = self.live_session_count();

        let scheduler = Arc::clone(self);
        let session = Session::new(
            sid,
            Arc::clone(&self.config),
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.transport_factory),
            Arc::clone(&self.pc_factory),
            Arc::clone(&self.observer),
            move |id| {
                scheduler.state.lock().sessions.remove(&id);
            },
        );
        self.state.lock().sessions.insert(sid, Arc::clone(&session));
        self.retries.fetch_add(1, Ordering::SeqCst);

        let offer = match self
            .broker
            .register_and_fetch_offer(sid, our_nat, live_count)
            .await
        {
            Ok(offer) => offer,
            Err(e) => {
                if !e.is_no_match() {
                    tracing::warn!(sid = %sid, error = %e, "broker poll failed");
                }
                session.close("broker poll failed").await;
                return;
            }
        };

        session.begin();

        let broker = Arc::clone(&self.broker);
        let answer_sid = sid;
        let accepted = session
            .receive_offer(&offer.offer_sdp, offer.relay_url, move |answer_sdp| {
                tokio::spawn(async move {
                    broker.submit_answer(answer_sid, &answer_sdp).await;
                });
            })
            .await;

        if !accepted {
            session.close("offer rejected").await;
            return;
        }

        let scheduler = Arc::clone(self);
        let datachannel_timeout = self.config.datachannel_timeout();
        let client_nat = offer.client_nat;
        tokio::spawn(async move {
            tokio::time::sleep(datachannel_timeout).await;
            scheduler.on_datachannel_timeout(&session, client_nat).await;
        });
    }

    /// Fires `datachannelTimeout` after an accepted offer: if the session
    /// reached `Forwarding` in time, that's a success for the adaptive
    /// policy; otherwise it's closed and counted as a failure.
    async fn on_datachannel_timeout(self: &Arc<Self>, session: &Arc<Session>, client_nat: NatType) {
        let webrtc_is_ready = session.state() == SessionState::Forwarding;
        if !webrtc_is_ready {
            session.close("datachannel timed out").await;
        }
        self.apply_adaptive_policy(webrtc_is_ready, client_nat);
    }

    fn apply_adaptive_policy(&self, webrtc_is_ready: bool, client_nat: NatType) {
        let mut state = self.state.lock();
        if webrtc_is_ready {
            state.poll_interval_ms = state
                .poll_interval_ms
                .saturating_sub(self.config.poll_interval_adjustment_ms)
                .max(self.config.poll_interval_default_ms);
            state.nat_failures = 0;
            if state.our_nat == NatType::Unrestricted {
                state.poll_interval_ms = self.config.poll_interval_fast_ms;
                state.max_num_clients = 2;
            }
        } else {
            state.poll_interval_ms = state
                .poll_interval_ms
                .saturating_add(self.config.poll_interval_adjustment_ms)
                .min(self.config.poll_interval_slowest_ms);
            if client_nat == NatType::Restricted {
                state.nat_failures += 1;
                if state.nat_failures >= 3 {
                    state.our_nat = NatType::Restricted;
                    state.nat_failures = 0;
                    state.max_num_clients = 1;
                    self.observer.set_nat_type(NatType::Restricted);
                }
            }
        }
    }

    /// Cancels the poll loop and closes every live session.
    pub async fn disable(self: &Arc<Self>) {
        self.poll_generation.fetch_add(1, Ordering::SeqCst);
        self.state.lock().disabled = true;
        let sessions: Vec<Arc<Session>> = self.state.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.close("scheduler disabled").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use crate::testing::{
        fake_peer_connection_factory, fake_transport_factory, FakeBrokerTransport,
    };
    use serde_json::json;

    fn test_config() -> Arc<Configuration> {
        let mut cfg = Configuration::default();
        cfg.poll_interval_default_ms = 1;
        cfg.poll_interval_fast_ms = 1;
        cfg.poll_interval_slowest_ms = 1000;
        cfg.poll_interval_adjustment_ms = 1;
        cfg.datachannel_timeout_ms = 30;
        cfg.relay_connect_timeout_ms = 200;
        cfg.answer_timeout_ms = 10;
        Arc::new(cfg)
    }

    fn test_scheduler(
        fake_broker: Arc<FakeBrokerTransport>,
    ) -> Arc<Scheduler> {
        let (pc_factory, _pc_events) = fake_peer_connection_factory();
        let (transport_factory, _connects) = fake_transport_factory(true);
        let broker = Arc::new(BrokerClient::new(
            fake_broker,
            "broker.example",
            "standalone",
            "snowflake.torproject.net",
        ));
        Scheduler::new(
            test_config(),
            broker,
            Arc::new(crate::rate_limit::NullRateLimit),
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
        )
    }

    #[tokio::test]
    async fn construction_starts_with_zero_sessions_and_retries() {
        let fake_broker = Arc::new(FakeBrokerTransport::new());
        let scheduler = test_scheduler(fake_broker);
        let stats = scheduler.stats();
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test]
    async fn poll_skipped_at_capacity_but_not_stopped() {
        let fake_broker = Arc::new(FakeBrokerTransport::new());
        let scheduler = test_scheduler(fake_broker.clone());

        {
            let mut state = scheduler.state.lock();
            state.max_num_clients = 1;
        }
        let (pc_factory, _e) = fake_peer_connection_factory();
        let (transport_factory, _c) = fake_transport_factory(true);
        let occupying = Session::new(
            SessionId::new_random(),
            scheduler.config.clone(),
            Arc::new(crate::rate_limit::NullRateLimit),
            transport_factory,
            pc_factory,
            Arc::new(NullObserver),
            |_| {},
        );
        scheduler
            .state
            .lock()
            .sessions
            .insert(occupying.id(), occupying);

        scheduler.begin_serving_clients();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(
            fake_broker.requests().is_empty(),
            "broker must not be polled while at capacity"
        );
        assert_eq!(scheduler.live_session_count(), 1);
        scheduler.disable().await;
    }

    #[tokio::test]
    async fn successful_poll_registers_and_answers() {
        let fake_broker = Arc::new(FakeBrokerTransport::new());
        fake_broker.push_response(Ok((
            200,
            json!({
                "Status": "client match",
                "Offer": r#"{"type":"offer","sdp":"v=0"}"#,
                "NAT": "unknown",
            }),
        )));
        let scheduler = test_scheduler(fake_broker.clone());

        scheduler.poll_broker().await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let requests = fake_broker.requests();
        assert_eq!(requests.len(), 2, "proxy registration and answer submission");
        assert_eq!(requests[0].0, "https://broker.example/proxy");
        assert_eq!(requests[1].0, "https://broker.example/answer");
        scheduler.disable().await;
    }

    #[test]
    fn adaptive_policy_backs_off_on_failure_and_speeds_up_on_success() {
        let fake_broker = Arc::new(FakeBrokerTransport::new());
        let scheduler = test_scheduler(fake_broker);

        let before = scheduler.stats().poll_interval_ms;
        scheduler.apply_adaptive_policy(false, NatType::Unknown);
        assert!(scheduler.stats().poll_interval_ms > before);

        scheduler.apply_adaptive_policy(true, NatType::Unknown);
        assert_eq!(scheduler.stats().poll_interval_ms, scheduler.config.poll_interval_default_ms);
    }

    #[test]
    fn three_restricted_failures_flip_own_nat_and_cap_clients() {
        let fake_broker = Arc::new(FakeBrokerTransport::new());
        let scheduler = test_scheduler(fake_broker);

        for _ in 0..3 {
            scheduler.apply_adaptive_policy(false, NatType::Restricted);
        }
        let stats = scheduler.stats();
        assert_eq!(stats.our_nat, NatType::Restricted);
        assert_eq!(stats.max_num_clients, 1);
        assert_eq!(stats.nat_failures, 0);
    }
}
