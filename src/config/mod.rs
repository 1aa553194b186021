//! Runtime configuration of the authorization filters.
//!
//! Raw, serde-facing structures live in [`file`]. They are validated once
//! into the immutable types below, which are shared read-only (behind
//! `Arc`) by every stream of a filter chain.

pub mod file;

use std::collections::BTreeMap;
use std::sync::Arc;

use http::StatusCode;
use serde::Deserialize;

use crate::check::ContextExtensions;
use crate::metrics::AuthzStats;

// ============================================================================
// Sampling
// ============================================================================

/// Denominator of a [`FractionalPercent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denominator {
    /// Per hundred
    #[default]
    Hundred,
    /// Per ten thousand
    TenThousand,
    /// Per million
    Million,
}

impl Denominator {
    /// Numeric value of the denominator.
    pub fn value(self) -> u64 {
        match self {
            Denominator::Hundred => 100,
            Denominator::TenThousand => 10_000,
            Denominator::Million => 1_000_000,
        }
    }
}

/// A fraction of requests, e.g. 25 per hundred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FractionalPercent {
    /// Numerator; values above the denominator saturate at 100%
    pub numerator: u32,
    /// Denominator
    #[serde(default)]
    pub denominator: Denominator,
}

impl FractionalPercent {
    /// Returns `true` if a request with the given random draw is sampled in.
    pub fn sample(&self, random: u64) -> bool {
        random % self.denominator.value() < u64::from(self.numerator)
    }
}

/// Source of random draws for runtime sampling.
pub trait RandomSource: Send + Sync {
    /// Next uniformly distributed value.
    fn next_u64(&self) -> u64;
}

/// [`RandomSource`] backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u64(&self) -> u64 {
        rand::random()
    }
}

// ============================================================================
// Filter configuration
// ============================================================================

/// What the encode path does when a response check denies or fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseDenialMode {
    /// Replace the upstream response with the synthesized reply.
    #[default]
    LocalReply,
    /// Abort the exchange without a reply.
    ResetStream,
    /// Keep encoding stalled; the host eventually tears the stream down.
    Stall,
}

/// Process-wide configuration of the external authorization filter.
///
/// Immutable after construction; all streams share one instance.
pub struct FilterConfig {
    allow_partial_message: bool,
    failure_mode_allow: bool,
    clear_route_cache: bool,
    max_request_bytes: u32,
    status_on_error: StatusCode,
    filter_enabled: Option<FractionalPercent>,
    metadata_context_namespaces: Vec<String>,
    include_peer_certificate: bool,
    intercept_response: bool,
    response_denial: ResponseDenialMode,
    stats: AuthzStats,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterConfig")
            .field("allow_partial_message", &self.allow_partial_message)
            .field("failure_mode_allow", &self.failure_mode_allow)
            .field("clear_route_cache", &self.clear_route_cache)
            .field("max_request_bytes", &self.max_request_bytes)
            .field("status_on_error", &self.status_on_error)
            .field("filter_enabled", &self.filter_enabled)
            .field("metadata_context_namespaces", &self.metadata_context_namespaces)
            .field("include_peer_certificate", &self.include_peer_certificate)
            .field("intercept_response", &self.intercept_response)
            .field("response_denial", &self.response_denial)
            .finish_non_exhaustive()
    }
}

impl FilterConfig {
    /// Start building a configuration with defaults.
    pub fn builder() -> FilterConfigBuilder {
        FilterConfigBuilder::default()
    }

    /// Forward a truncated body once the cap is reached instead of failing.
    pub fn allow_partial_message(&self) -> bool {
        self.allow_partial_message
    }

    /// Let the stream through when the check call itself fails.
    pub fn failure_mode_allow(&self) -> bool {
        self.failure_mode_allow
    }

    /// Invalidate the cached route after header mutations.
    pub fn clear_route_cache(&self) -> bool {
        self.clear_route_cache
    }

    /// Body cap in bytes (0 disables buffering).
    pub fn max_request_bytes(&self) -> u32 {
        self.max_request_bytes
    }

    /// `max_request_bytes` as a buffer length.
    pub fn max_request_len(&self) -> usize {
        usize::try_from(self.max_request_bytes).unwrap_or(usize::MAX)
    }

    /// Status of the reply sent when a check fails closed.
    pub fn status_on_error(&self) -> StatusCode {
        self.status_on_error
    }

    /// Runtime sampling: `true` unless `filter_enabled` samples this request out.
    pub fn filter_enabled(&self) -> bool {
        match &self.filter_enabled {
            Some(percent) => percent.sample(self.random.next_u64()),
            None => true,
        }
    }

    /// Dynamic metadata namespaces forwarded to the check service.
    pub fn metadata_context_namespaces(&self) -> &[String] {
        &self.metadata_context_namespaces
    }

    /// Attach the downstream peer certificate to check requests.
    pub fn include_peer_certificate(&self) -> bool {
        self.include_peer_certificate
    }

    /// Run a response-direction check on the encode path.
    pub fn intercept_response(&self) -> bool {
        self.intercept_response
    }

    /// Encode-path policy for denials and fail-closed errors.
    pub fn response_denial(&self) -> ResponseDenialMode {
        self.response_denial
    }

    /// Outcome counters.
    pub fn stats(&self) -> &AuthzStats {
        &self.stats
    }
}

/// Builder for [`FilterConfig`].
pub struct FilterConfigBuilder {
    allow_partial_message: bool,
    failure_mode_allow: bool,
    clear_route_cache: bool,
    max_request_bytes: u32,
    status_on_error: StatusCode,
    filter_enabled: Option<FractionalPercent>,
    metadata_context_namespaces: Vec<String>,
    include_peer_certificate: bool,
    intercept_response: bool,
    response_denial: ResponseDenialMode,
    stats: Option<AuthzStats>,
    random: Arc<dyn RandomSource>,
}

impl Default for FilterConfigBuilder {
    fn default() -> Self {
        Self {
            allow_partial_message: false,
            failure_mode_allow: false,
            clear_route_cache: false,
            max_request_bytes: 0,
            status_on_error: StatusCode::FORBIDDEN,
            filter_enabled: None,
            metadata_context_namespaces: Vec::new(),
            include_peer_certificate: false,
            intercept_response: false,
            response_denial: ResponseDenialMode::default(),
            stats: None,
            random: Arc::new(ThreadRandom),
        }
    }
}

impl FilterConfigBuilder {
    /// See [`FilterConfig::allow_partial_message`].
    #[must_use]
    pub fn allow_partial_message(mut self, allow: bool) -> Self {
        self.allow_partial_message = allow;
        self
    }

    /// See [`FilterConfig::failure_mode_allow`].
    #[must_use]
    pub fn failure_mode_allow(mut self, allow: bool) -> Self {
        self.failure_mode_allow = allow;
        self
    }

    /// See [`FilterConfig::clear_route_cache`].
    #[must_use]
    pub fn clear_route_cache(mut self, clear: bool) -> Self {
        self.clear_route_cache = clear;
        self
    }

    /// See [`FilterConfig::max_request_bytes`].
    #[must_use]
    pub fn max_request_bytes(mut self, bytes: u32) -> Self {
        self.max_request_bytes = bytes;
        self
    }

    /// Status for fail-closed replies; out-of-range codes become 403.
    #[must_use]
    pub fn status_on_error(mut self, code: u16) -> Self {
        self.status_on_error = to_error_code(code);
        self
    }

    /// See [`FilterConfig::filter_enabled`].
    #[must_use]
    pub fn filter_enabled(mut self, percent: Option<FractionalPercent>) -> Self {
        self.filter_enabled = percent;
        self
    }

    /// See [`FilterConfig::metadata_context_namespaces`].
    #[must_use]
    pub fn metadata_context_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.metadata_context_namespaces = namespaces;
        self
    }

    /// See [`FilterConfig::include_peer_certificate`].
    #[must_use]
    pub fn include_peer_certificate(mut self, include: bool) -> Self {
        self.include_peer_certificate = include;
        self
    }

    /// See [`FilterConfig::intercept_response`].
    #[must_use]
    pub fn intercept_response(mut self, intercept: bool) -> Self {
        self.intercept_response = intercept;
        self
    }

    /// See [`FilterConfig::response_denial`].
    #[must_use]
    pub fn response_denial(mut self, mode: ResponseDenialMode) -> Self {
        self.response_denial = mode;
        self
    }

    /// Use pre-registered counters.
    #[must_use]
    pub fn stats(mut self, stats: AuthzStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Replace the random source used for sampling.
    #[must_use]
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Finish the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error only if default counters cannot be created.
    pub fn build(self) -> Result<FilterConfig, prometheus::Error> {
        let stats = match self.stats {
            Some(stats) => stats,
            None => AuthzStats::new("")?,
        };
        Ok(FilterConfig {
            allow_partial_message: self.allow_partial_message,
            failure_mode_allow: self.failure_mode_allow,
            clear_route_cache: self.clear_route_cache,
            max_request_bytes: self.max_request_bytes,
            status_on_error: self.status_on_error,
            filter_enabled: self.filter_enabled,
            metadata_context_namespaces: self.metadata_context_namespaces,
            include_peer_certificate: self.include_peer_certificate,
            intercept_response: self.intercept_response,
            response_denial: self.response_denial,
            stats,
            random: self.random,
        })
    }
}

/// Clamp a configured status to a valid HTTP code; anything else is 403.
pub fn to_error_code(code: u16) -> StatusCode {
    if (100..=511).contains(&code) {
        StatusCode::from_u16(code).unwrap_or(StatusCode::FORBIDDEN)
    } else {
        StatusCode::FORBIDDEN
    }
}

// ============================================================================
// Per-route override
// ============================================================================

/// Per-route (or per-virtual-host) override of the authorization filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfigPerRoute {
    disabled: bool,
    context_extensions: ContextExtensions,
}

impl FilterConfigPerRoute {
    /// Create an override.
    pub fn new(disabled: bool, context_extensions: BTreeMap<String, String>) -> Self {
        Self {
            disabled,
            context_extensions,
        }
    }

    /// Skip the check on this route.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Context extensions added to the check request.
    pub fn context_extensions(&self) -> &ContextExtensions {
        &self.context_extensions
    }

    /// Move the context extensions out.
    pub fn take_context_extensions(&mut self) -> ContextExtensions {
        std::mem::take(&mut self.context_extensions)
    }

    /// Fold a more specific override into this one.
    ///
    /// `disabled` is always taken from `more_specific`, even when that
    /// re-enables the filter. Context extensions are merged key by key and
    /// the more specific value wins.
    pub fn merge(&mut self, more_specific: &FilterConfigPerRoute) {
        self.disabled = more_specific.disabled;
        for (key, value) in &more_specific.context_extensions {
            self.context_extensions.insert(key.clone(), value.clone());
        }
    }
}
