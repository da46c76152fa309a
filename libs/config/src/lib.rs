//! Immutable runtime configuration for the snowflake proxy core.
//!
//! A single [`Configuration`] value is built once at startup — from defaults,
//! a TOML file, and environment overrides, in that precedence order — and
//! then shared read-only across the broker client, every session, and the
//! scheduler for the lifetime of the process.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Minimum permitted rate limit: below this the limiter would starve
/// sessions faster than a single TCP segment can drain.
pub const MIN_RATE_LIMIT_BYTES_PER_SEC: u32 = 10 * 1024;

/// Soft upper bound on a session's own outbound buffering, applied by the
/// session's `flush` loop against each destination transport.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Default broker and relay endpoints, bit-exact with the upstream proxy
/// for compatibility.
pub const DEFAULT_BROKER_URL: &str = "snowflake-broker.freehaven.net";
pub const DEFAULT_RELAY_URL: &str = "wss://snowflake.freehaven.net";
pub const DEFAULT_ALLOWED_RELAY_PATTERN: &str = "snowflake.torproject.net";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Immutable configuration shared by every component of the proxy runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Rendezvous server. Normalised (scheme + trailing slash) by the broker
    /// client at construction, not here — see `broker::BrokerClient::new`.
    pub broker_url: String,

    /// Relay used when the broker does not supply one of its own.
    pub default_relay_url: String,

    /// Hostname pattern a broker-supplied relay URL must satisfy.
    /// A leading `^` requires exact match; otherwise a suffix match.
    pub allowed_relay_pattern: String,

    /// Outbound bytes/sec budget. `None` means unlimited (null rate limiter).
    pub rate_limit_bytes_per_sec: Option<u32>,

    /// Sliding-history window backing the rate limiter, in seconds.
    pub rate_limit_window_secs: f64,

    /// Poll cadence, in milliseconds, bounded by `poll_interval_fast` and
    /// `poll_interval_slowest`.
    pub poll_interval_default_ms: u64,
    pub poll_interval_fast_ms: u64,
    pub poll_interval_slowest_ms: u64,
    pub poll_interval_adjustment_ms: u64,

    /// Time allowed for the client datachannel to open after an offer is
    /// accepted, before the scheduler gives up on the session.
    pub datachannel_timeout_ms: u64,

    /// Stale-message watchdog: a forwarding session with no client->relay
    /// traffic for this long is closed.
    pub message_timeout_ms: u64,

    /// Upper bound on ICE-gathering before the answer is sent anyway.
    pub answer_timeout_ms: u64,

    /// Hard timeout from relay-transport creation to `open`.
    pub relay_connect_timeout_ms: u64,

    /// Concurrency cap enforced by the scheduler.
    pub max_num_clients: usize,

    /// ICE server URLs handed to the client peer-connection factory.
    pub ice_servers: Vec<String>,

    /// Free-form tag the broker uses to group proxies by capability.
    pub proxy_type: String,

    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"`.
    pub log_level: String,

    /// `"pretty"` or `"json"`.
    pub log_format: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            default_relay_url: DEFAULT_RELAY_URL.to_string(),
            allowed_relay_pattern: DEFAULT_ALLOWED_RELAY_PATTERN.to_string(),
            rate_limit_bytes_per_sec: None,
            rate_limit_window_secs: 5.0,
            poll_interval_default_ms: 60_000,
            poll_interval_fast_ms: 30_000,
            poll_interval_slowest_ms: 6 * 60 * 60 * 1000,
            poll_interval_adjustment_ms: 100_000,
            datachannel_timeout_ms: 20_000,
            message_timeout_ms: 30_000,
            answer_timeout_ms: 6_000,
            relay_connect_timeout_ms: 5_000,
            max_num_clients: 1,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            proxy_type: "standalone".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Configuration {
    /// Load defaults, then a TOML file if it exists, then environment
    /// overrides prefixed `SNOWFLAKE_PROXY_` (double-underscore nesting,
    /// matching this codebase's other services).
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let defaults = Configuration::default();
        let defaults_toml =
            toml::to_string(&defaults).context("serialising built-in defaults")?;

        let mut builder = config_crate::Config::builder().add_source(config_crate::File::from_str(
            &defaults_toml,
            config_crate::FileFormat::Toml,
        ));

        if path.exists() {
            builder = builder.add_source(config_crate::File::from(path));
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
        }

        let builder = builder.add_source(
            config_crate::Environment::with_prefix("SNOWFLAKE_PROXY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Configuration = builder
            .build()
            .context("building configuration layers")?
            .try_deserialize()
            .context("deserialising configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Defensive checks run once at construction; never re-checked at
    /// runtime since the value is immutable thereafter.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.rate_limit_bytes_per_sec {
            if rate < MIN_RATE_LIMIT_BYTES_PER_SEC {
                bail!(
                    "rate_limit_bytes_per_sec {} is below the {} byte/s floor",
                    rate,
                    MIN_RATE_LIMIT_BYTES_PER_SEC
                );
            }
        }
        if self.rate_limit_window_secs <= 0.0 {
            bail!("rate_limit_window_secs must be positive");
        }
        if self.max_num_clients == 0 {
            bail!("max_num_clients must be at least 1");
        }
        if self.allowed_relay_pattern.is_empty() {
            bail!("allowed_relay_pattern must not be empty");
        }
        for (name, ms) in [
            ("datachannel_timeout_ms", self.datachannel_timeout_ms),
            ("message_timeout_ms", self.message_timeout_ms),
            ("answer_timeout_ms", self.answer_timeout_ms),
            ("relay_connect_timeout_ms", self.relay_connect_timeout_ms),
            ("poll_interval_default_ms", self.poll_interval_default_ms),
            ("poll_interval_fast_ms", self.poll_interval_fast_ms),
            ("poll_interval_slowest_ms", self.poll_interval_slowest_ms),
        ] {
            if ms == 0 {
                bail!("{name} must be positive");
            }
        }
        Ok(())
    }

    pub fn datachannel_timeout(&self) -> Duration {
        Duration::from_millis(self.datachannel_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }

    pub fn poll_interval_default(&self) -> Duration {
        Duration::from_millis(self.poll_interval_default_ms)
    }

    pub fn poll_interval_fast(&self) -> Duration {
        Duration::from_millis(self.poll_interval_fast_ms)
    }

    pub fn poll_interval_slowest(&self) -> Duration {
        Duration::from_millis(self.poll_interval_slowest_ms)
    }

    pub fn poll_interval_adjustment(&self) -> Duration {
        Duration::from_millis(self.poll_interval_adjustment_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream_endpoints() {
        let cfg = Configuration::default();
        assert_eq!(cfg.broker_url, "snowflake-broker.freehaven.net");
        assert_eq!(cfg.default_relay_url, "wss://snowflake.freehaven.net");
        assert_eq!(cfg.allowed_relay_pattern, "snowflake.torproject.net");
        assert_eq!(cfg.poll_interval_default_ms, 60_000);
        assert_eq!(cfg.poll_interval_fast_ms, 30_000);
        assert_eq!(cfg.poll_interval_slowest_ms, 6 * 60 * 60 * 1000);
        assert_eq!(cfg.poll_interval_adjustment_ms, 100_000);
        assert_eq!(cfg.datachannel_timeout_ms, 20_000);
        assert_eq!(cfg.message_timeout_ms, 30_000);
        assert_eq!(cfg.answer_timeout_ms, 6_000);
        assert_eq!(cfg.max_num_clients, 1);
        assert_eq!(cfg.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_rate_limit_below_floor() {
        let mut cfg = Configuration::default();
        cfg.rate_limit_bytes_per_sec = Some(1024);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_rate_limit_at_floor() {
        let mut cfg = Configuration::default();
        cfg.rate_limit_bytes_per_sec = Some(MIN_RATE_LIMIT_BYTES_PER_SEC);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_clients() {
        let mut cfg = Configuration::default();
        cfg.max_num_clients = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_toml_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            r#"
            broker_url = "custom-broker.example.net"
            max_num_clients = 2
            "#,
        )
        .unwrap();

        let cfg = Configuration::from_file(&path).unwrap();
        assert_eq!(cfg.broker_url, "custom-broker.example.net");
        assert_eq!(cfg.max_num_clients, 2);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.default_relay_url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Configuration::from_file("/nonexistent/path/proxy.toml").unwrap();
        assert_eq!(cfg.broker_url, DEFAULT_BROKER_URL);
    }

    #[test]
    fn env_var_overrides_file_and_defaults() {
        // SAFETY: `std::env::set_var` is unsafe since Rust 2024 edition
        // guidance because it mutates process-global state; this test
        // doesn't run concurrently with anything else that reads these keys,
        // and both are removed again before the test returns.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(&path, "max_num_clients = 2\n").unwrap();

        unsafe {
            std::env::set_var("SNOWFLAKE_PROXY_MAX_NUM_CLIENTS", "3");
        }
        let cfg = Configuration::from_file(&path);
        unsafe {
            std::env::remove_var("SNOWFLAKE_PROXY_MAX_NUM_CLIENTS");
        }

        let cfg = cfg.unwrap();
        assert_eq!(
            cfg.max_num_clients, 3,
            "environment override must win over both the file and the default"
        );
    }
}
