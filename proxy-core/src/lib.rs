//! Core proxy runtime: broker client, session state machine, and the
//! NAT-adaptive scheduler that ties them together. The concrete WebRTC and
//! WebSocket stacks, and any UI, are supplied by the embedder through the
//! traits in [`transport`] and [`observer`].

pub mod broker;
pub mod error;
pub mod observer;
pub mod rate_limit;
pub mod relay_pattern;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod transport;
pub mod types;

pub use broker::{BrokerClient, OfferResult, ReqwestBrokerTransport};
pub use error::{ProxyError, Result};
pub use observer::{NullObserver, ProxyObserver};
pub use rate_limit::{NullRateLimit, RateLimit, TokenBucketRateLimit};
pub use scheduler::{Scheduler, SchedulerStats};
pub use session::{Session, SessionState};
pub use transport::{
    BrokerTransport, PeerConnection, PeerConnectionFactory, Transport, TransportEvent,
    TransportFactory, TransportHandle,
};
pub use types::{NatType, SessionId};
