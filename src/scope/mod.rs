//! Scope-claim authorization.
//!
//! Checks the scopes of an already validated token against ordered rules.
//! The token payload is read from stream dynamic metadata, where an earlier
//! authentication step left it. No network calls are made.
//!
//! The first rule whose matcher accepts the request decides: the request
//! passes when the granted scopes intersect the rule's scopes. A request
//! that matches no rule passes unless `deny_unmatched` is set.

pub mod matcher;

pub use matcher::{HeaderMatch, RequestMatcher};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, request};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::file::ScopeAuthzFile;
use crate::error::ConfigError;
use crate::filter::{
    DataStatus, DecoderFilterCallbacks, FilterFactory, HeadersStatus, LocalReply, StreamFilter,
    StreamInfo, TrailersStatus,
};
use crate::metrics::ScopeStats;

/// Details recorded on a scope denial.
pub const SCOPE_DENIED_DETAILS: &str = "scope_authz_denied";

/// Dynamic metadata namespace holding the verified token payload.
pub const DEFAULT_METADATA_NAMESPACE: &str = "envoy.filters.http.jwt_authn";
/// Key of the payload inside the namespace.
pub const DEFAULT_PAYLOAD_KEY: &str = "jwt_payload";
/// Claim carrying the granted scopes.
pub const DEFAULT_SCOPE_CLAIM: &str = "scope";

/// A request matcher and the scopes that satisfy it.
#[derive(Debug, Clone)]
pub struct RequirementRule {
    matcher: RequestMatcher,
    scopes: BTreeSet<String>,
}

impl RequirementRule {
    /// Require any of `scopes` for requests matching `matcher`.
    pub fn new(matcher: RequestMatcher, scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            matcher,
            scopes: scopes.into_iter().collect(),
        }
    }
}

/// Outcome of evaluating the rules for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    /// A rule matched and a granted scope satisfies it.
    Allowed,
    /// A rule matched but no granted scope satisfies it.
    Denied,
    /// No rule matched.
    Unmatched,
}

/// Immutable scope filter configuration.
#[derive(Debug)]
pub struct ScopeConfig {
    rules: Vec<RequirementRule>,
    metadata_namespace: String,
    payload_key: String,
    scope_claim: String,
    deny_unmatched: bool,
    stats: ScopeStats,
}

impl ScopeConfig {
    /// Config with the default claim location; unmatched requests pass.
    pub fn new(rules: Vec<RequirementRule>, stats: ScopeStats) -> Self {
        Self {
            rules,
            metadata_namespace: DEFAULT_METADATA_NAMESPACE.to_string(),
            payload_key: DEFAULT_PAYLOAD_KEY.to_string(),
            scope_claim: DEFAULT_SCOPE_CLAIM.to_string(),
            deny_unmatched: false,
            stats,
        }
    }

    /// Build from the filter's file form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a bad matcher or a rule without
    /// scopes.
    pub fn from_file(file: &ScopeAuthzFile, stats: ScopeStats) -> Result<Self, ConfigError> {
        let rules = file
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let field = format!("rules[{i}]");
                if rule.scopes.is_empty() {
                    return Err(ConfigError::invalid(
                        format!("{field}.scopes"),
                        "at least one scope is required",
                    ));
                }
                let matcher = RequestMatcher::from_file(&rule.matcher, &format!("{field}.match"))?;
                Ok(RequirementRule::new(matcher, rule.scopes.iter().cloned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = Self::new(rules, stats);
        if let Some(ns) = &file.metadata_namespace {
            config.metadata_namespace = ns.clone();
        }
        if let Some(key) = &file.payload_key {
            config.payload_key = key.clone();
        }
        if let Some(claim) = &file.scope_claim {
            config.scope_claim = claim.clone();
        }
        config.deny_unmatched = file.deny_unmatched;
        Ok(config)
    }

    /// Deny requests no rule matches.
    #[must_use]
    pub fn deny_unmatched(mut self, deny: bool) -> Self {
        self.deny_unmatched = deny;
        self
    }

    /// Decision counters.
    pub fn stats(&self) -> &ScopeStats {
        &self.stats
    }

    /// Evaluate the rules against a request and its granted scopes.
    pub fn evaluate(&self, head: &request::Parts, granted: Option<&BTreeSet<String>>) -> ScopeDecision {
        let Some(rule) = self.rules.iter().find(|rule| rule.matcher.matches(head)) else {
            return ScopeDecision::Unmatched;
        };
        match granted {
            Some(granted) if !rule.scopes.is_disjoint(granted) => ScopeDecision::Allowed,
            _ => ScopeDecision::Denied,
        }
    }

    /// Granted scopes from the stream's dynamic metadata, if a payload is
    /// present.
    pub fn granted_scopes(&self, info: &StreamInfo) -> Option<BTreeSet<String>> {
        let payload = info
            .dynamic_metadata
            .get(&self.metadata_namespace)?
            .get(&self.payload_key)?;
        Some(claim_scopes(payload.get(&self.scope_claim)))
    }
}

/// Scopes in a claim: a space-separated string or an array of strings.
pub fn claim_scopes(claim: Option<&Value>) -> BTreeSet<String> {
    match claim {
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Decoder-only filter enforcing scope rules on request headers.
pub struct ScopeFilter {
    config: Arc<ScopeConfig>,
}

impl ScopeFilter {
    /// Create the filter for one exchange.
    pub fn new(config: Arc<ScopeConfig>) -> Self {
        Self { config }
    }

    /// Per-exchange constructor sharing `config`.
    pub fn factory(config: Arc<ScopeConfig>) -> FilterFactory {
        Arc::new(move || Box::new(ScopeFilter::new(config.clone())) as Box<dyn StreamFilter>)
    }
}

#[async_trait]
impl StreamFilter for ScopeFilter {
    fn decode_headers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        _end_stream: bool,
    ) -> HeadersStatus {
        let granted = self.config.granted_scopes(callbacks.stream_info());
        let decision = self.config.evaluate(callbacks.request_head(), granted.as_ref());
        let stats = self.config.stats();
        trace!(?decision, "scope rules evaluated");
        let deny = match decision {
            ScopeDecision::Allowed => {
                stats.allowed.inc();
                false
            }
            ScopeDecision::Denied => {
                stats.denied.inc();
                true
            }
            ScopeDecision::Unmatched => {
                stats.unmatched.inc();
                self.config.deny_unmatched
            }
        };
        if !deny {
            return HeadersStatus::Continue;
        }
        debug!(path = %callbacks.request_head().uri.path(), "request lacks a required scope");
        callbacks.send_local_reply(LocalReply::new(StatusCode::FORBIDDEN, SCOPE_DENIED_DETAILS));
        HeadersStatus::StopIteration
    }

    fn decode_data(
        &mut self,
        _callbacks: &mut dyn DecoderFilterCallbacks,
        _data: &mut Bytes,
        _end_stream: bool,
    ) -> DataStatus {
        DataStatus::Continue
    }

    fn decode_trailers(
        &mut self,
        _callbacks: &mut dyn DecoderFilterCallbacks,
        _trailers: &mut HeaderMap,
    ) -> TrailersStatus {
        TrailersStatus::Continue
    }

    fn on_destroy(&mut self) {}
}
