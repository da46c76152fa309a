//! Validates a broker-supplied relay hostname against the configured
//! `allowedRelayPattern`.

/// `pattern` beginning with `^` requires bytewise exact equality with `host`
/// (the `^` is stripped first); otherwise `host` must end with `pattern`.
pub fn matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('^') {
        Some(exact) => host == exact,
        None => host.ends_with(pattern),
    }
}
