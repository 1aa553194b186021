//! Prometheus counters for filter outcomes.
//!
//! Every filter instance owns its counters; the prefix comes from the
//! filter's `stat_prefix` so several listeners can share one registry.

use prometheus::{IntCounter, Registry};

/// Counters for the external authorization filter.
#[derive(Debug, Clone)]
pub struct AuthzStats {
    /// Checks that returned OK
    pub ok: IntCounter,
    /// Checks that returned Denied
    pub denied: IntCounter,
    /// Checks that failed (transport, timeout, protocol)
    pub error: IntCounter,
    /// Failed checks that were let through by failure-mode-allow
    pub failure_mode_allowed: IntCounter,
}

impl AuthzStats {
    /// Create the counters and register them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a counter with the same name is already
    /// registered (duplicate `stat_prefix`).
    pub fn register(prefix: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let stats = Self::new(prefix)?;
        registry.register(Box::new(stats.ok.clone()))?;
        registry.register(Box::new(stats.denied.clone()))?;
        registry.register(Box::new(stats.error.clone()))?;
        registry.register(Box::new(stats.failure_mode_allowed.clone()))?;
        Ok(stats)
    }

    /// Create counters that are not exported anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the sanitized prefix still yields an invalid name.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let prefix = sanitize_prefix(prefix);
        Ok(Self {
            ok: counter(&prefix, "ext_authz_ok", "Authorization checks that allowed the request")?,
            denied: counter(&prefix, "ext_authz_denied", "Authorization checks that denied the request")?,
            error: counter(&prefix, "ext_authz_error", "Authorization checks that failed")?,
            failure_mode_allowed: counter(
                &prefix,
                "ext_authz_failure_mode_allowed",
                "Failed authorization checks allowed by failure_mode_allow",
            )?,
        })
    }
}

/// Counters for the scope authorization filter.
#[derive(Debug, Clone)]
pub struct ScopeStats {
    /// Requests allowed by a matching rule
    pub allowed: IntCounter,
    /// Requests rejected for missing scopes
    pub denied: IntCounter,
    /// Requests that matched no rule
    pub unmatched: IntCounter,
}

impl ScopeStats {
    /// Create the counters and register them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate registration.
    pub fn register(prefix: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let stats = Self::new(prefix)?;
        registry.register(Box::new(stats.allowed.clone()))?;
        registry.register(Box::new(stats.denied.clone()))?;
        registry.register(Box::new(stats.unmatched.clone()))?;
        Ok(stats)
    }

    /// Create counters that are not exported anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the sanitized prefix still yields an invalid name.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let prefix = sanitize_prefix(prefix);
        Ok(Self {
            allowed: counter(&prefix, "scope_authz_allowed", "Requests allowed by scope rules")?,
            denied: counter(&prefix, "scope_authz_denied", "Requests denied by scope rules")?,
            unmatched: counter(&prefix, "scope_authz_unmatched", "Requests that matched no scope rule")?,
        })
    }
}

fn counter(prefix: &str, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    IntCounter::new(format!("{prefix}{name}"), help)
}

/// Map a stat prefix such as `ingress.http.` onto a valid metric prefix.
fn sanitize_prefix(prefix: &str) -> String {
    let mut out: String = prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if !out.is_empty() && !out.ends_with('_') {
        out.push('_');
    }
    out
}
