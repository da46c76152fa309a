//! Error taxonomy for the proxy core.
//!
//! None of these are fatal to the process: the scheduler logs them and
//! moves on. `ProxyError` exists so every call site can log a
//! self-contained message without re-deriving context from the call stack.

use thiserror::Error;

/// Result alias used throughout the proxy core.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Broker responded with a non-200 status or an unrecognised JSON shape.
    #[error("broker request to {path} failed: {reason}")]
    BrokerUnexpected { path: String, reason: String },

    /// Broker reported `"no match"` — no client is currently waiting. Not a
    /// failure, just an empty poll; callers should not count this as an
    /// adaptive-policy failure.
    #[error("broker reported no client waiting")]
    BrokerNoMatch,

    /// Transport-level failure reaching the broker (connection refused,
    /// DNS failure, TLS failure, timeout).
    #[error("broker transport error: {0}")]
    BrokerTransport(String),

    /// Offer was not of type `"offer"`, failed to parse, or
    /// `setRemoteDescription` rejected it.
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// Broker-supplied relay URL failed the scheme or pattern check.
    #[error("relay url {url} rejected: {reason}")]
    RelayUrlRejected { url: String, reason: String },

    /// Local answer description could not be created.
    #[error("answer creation failed: {0}")]
    AnswerCreationFailed(String),

    /// Relay transport did not reach `open` within the configured timeout.
    #[error("relay connect timed out after {0:?}")]
    RelayConnectTimeout(std::time::Duration),

    /// Client datachannel did not reach `open` within the configured
    /// timeout.
    #[error("datachannel timed out after {0:?}")]
    DatachannelTimeout(std::time::Duration),

    /// No client->relay traffic within `messageTimeout`.
    #[error("stale-message watchdog fired after {0:?}")]
    StaleMessageWatchdog(std::time::Duration),

    /// A transport reported a hard error outside of the above timeouts.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration failed validation at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Any other internal invariant violation. Should not normally occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// True for the one expected, non-exceptional broker outcome. Used by
    /// the scheduler to skip the adaptive-failure bookkeeping.
    pub fn is_no_match(&self) -> bool {
        matches!(self, ProxyError::BrokerNoMatch)
    }
}
