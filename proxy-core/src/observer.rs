//! The UI/host collaborator interface the core consumes: a badge count, a
//! status line, a log sink, and the proxy's own NAT classification. None of
//! this is implemented here — the UI itself is out of scope — but the core
//! needs something to call so it isn't reaching for an ambient global.

use crate::types::NatType;

pub trait ProxyObserver: Send + Sync {
    fn set_status(&self, _message: &str) {}
    fn increase_clients(&self) {}
    fn decrease_clients(&self) {}
    fn log(&self, _message: &str) {}
    fn set_nat_type(&self, _nat: NatType) {}
}

/// Discards every notification. The default when an embedder doesn't wire
/// up a UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProxyObserver for NullObserver {}
