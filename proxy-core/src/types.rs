//! Small shared value types used across the broker, session, and scheduler.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// NAT classification as reported by the out-of-scope NAT probe, or as
/// inferred by the scheduler's adaptive policy. Learning is one-way: a
/// proxy may transition to `Restricted` but never back to `Unknown` or
/// `Unrestricted` within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    Unknown,
    Unrestricted,
    Restricted,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Unknown => "unknown",
            NatType::Unrestricted => "unrestricted",
            NatType::Restricted => "restricted",
        };
        f.write_str(s)
    }
}

impl NatType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Unrestricted => "unrestricted",
            NatType::Restricted => "restricted",
        }
    }

    pub fn from_wire_str(s: &str) -> Self {
        match s {
            "unrestricted" => NatType::Unrestricted,
            "restricted" => NatType::Restricted,
            _ => NatType::Unknown,
        }
    }
}

/// A 16-hex-character session identifier (64 bits of entropy), drawn from a
/// cryptographic RNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 8]);

impl SessionId {
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
