//! File forms of the bootstrap and filter configurations.
//!
//! Everything here deserializes straight from YAML (or JSON, for typed
//! filter configs embedded in the bootstrap) and is validated into the
//! runtime types by the `into_*`/`to_*` methods. Durations are humantime
//! strings such as `250ms` or `2s`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use serde::Deserialize;
use url::Url;

use super::{FilterConfig, FilterConfigPerRoute, FractionalPercent, ResponseDenialMode};
use crate::check::http_client::HttpServiceConfig;
use crate::check::rpc_client::RpcServiceConfig;
use crate::check::{CheckServiceConfig, HeaderEntry};
use crate::error::ConfigError;
use crate::metrics::AuthzStats;
use crate::timeout::DEFAULT_CHECK_TIMEOUT;

/// Default cap on a collected request body.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

// ============================================================================
// Bootstrap
// ============================================================================

/// Top-level bootstrap file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapFile {
    /// Downstream listener
    pub listener: ListenerFile,
    /// Admin listener (metrics, health)
    #[serde(default)]
    pub admin: Option<ListenerFile>,
    /// Upstream all proxied routes forward to
    pub upstream: UpstreamFile,
    /// The HTTP filter run on every exchange
    pub filter: FilterFile,
    /// Route table
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostFile>,
}

impl BootstrapFile {
    /// Read and parse a bootstrap file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] for YAML errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse a bootstrap document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for YAML errors.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(text)?)
    }
}

/// A listening socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerFile {
    /// Bind address
    pub address: SocketAddr,
}

/// Upstream service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamFile {
    /// Base URL (scheme and authority are used)
    pub url: String,
    /// Request timeout (default 30s)
    #[serde(default)]
    pub timeout: Option<String>,
    /// Largest request body collected for forwarding (default 16 MiB)
    #[serde(default)]
    pub max_request_body_bytes: Option<usize>,
}

impl UpstreamFile {
    /// Validated base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable or non-HTTP URLs.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        parse_http_url(&self.url, "upstream.url")
    }

    /// Request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable durations.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(self.timeout.as_deref(), Duration::from_secs(30), "upstream.timeout")
    }

    /// Cap on the request body collected for forwarding.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero cap.
    pub fn max_request_body_bytes(&self) -> Result<usize, ConfigError> {
        match self.max_request_body_bytes {
            None => Ok(DEFAULT_MAX_REQUEST_BODY_BYTES),
            Some(0) => Err(ConfigError::invalid(
                "upstream.max_request_body_bytes",
                "must be greater than zero",
            )),
            Some(bytes) => Ok(bytes),
        }
    }
}

/// Filter instance: registry tag plus its typed config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterFile {
    /// Registered type tag, also the key of per-route overrides
    pub name: String,
    /// Filter-specific config, parsed by the registered constructor
    #[serde(default)]
    pub typed_config: serde_json::Value,
}

/// Virtual host entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualHostFile {
    /// Name for logs
    pub name: String,
    /// Domains (`a.com`, `*.a.com`, `*`)
    pub domains: Vec<String>,
    /// Virtual-host-level filter overrides, keyed by filter name
    #[serde(default)]
    pub per_filter_config: BTreeMap<String, serde_json::Value>,
    /// Ordered routes
    #[serde(default)]
    pub routes: Vec<RouteFile>,
}

/// Route entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteFile {
    /// Name for logs
    #[serde(default)]
    pub name: Option<String>,
    /// Path matcher
    #[serde(rename = "match")]
    pub matcher: PathMatchFile,
    /// Upstream cluster; absent for direct responses
    #[serde(default)]
    pub cluster: Option<String>,
    /// Fixed reply for routes without a cluster
    #[serde(default)]
    pub direct_response: Option<DirectResponseFile>,
    /// Route-level filter overrides, keyed by filter name
    #[serde(default)]
    pub per_filter_config: BTreeMap<String, serde_json::Value>,
}

/// Path matcher; exactly one field is set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathMatchFile {
    /// Path prefix
    #[serde(default)]
    pub prefix: Option<String>,
    /// Exact path
    #[serde(default)]
    pub path: Option<String>,
    /// Regular expression over the whole path
    #[serde(default)]
    pub regex: Option<String>,
}

/// Fixed reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectResponseFile {
    /// Status code
    pub status: u16,
    /// Body
    #[serde(default)]
    pub body: String,
}

// ============================================================================
// External authorization filter
// ============================================================================

/// Typed config of the external authorization filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtAuthzFile {
    /// Raw HTTP backend
    #[serde(default)]
    pub http_service: Option<HttpServiceFile>,
    /// JSON-RPC backend
    #[serde(default)]
    pub rpc_service: Option<RpcServiceFile>,
    /// Body buffering
    #[serde(default)]
    pub with_request_body: Option<BufferSettingsFile>,
    /// Allow the stream when the check call fails
    #[serde(default)]
    pub failure_mode_allow: bool,
    /// Clear the route cache after header mutations
    #[serde(default)]
    pub clear_route_cache: bool,
    /// Status of fail-closed replies (default 403)
    #[serde(default)]
    pub status_on_error: Option<u16>,
    /// Runtime sampling of the filter
    #[serde(default)]
    pub filter_enabled: Option<FractionalPercent>,
    /// Dynamic metadata namespaces sent to the service
    #[serde(default)]
    pub metadata_context_namespaces: Vec<String>,
    /// Send the peer certificate
    #[serde(default)]
    pub include_peer_certificate: bool,
    /// Metric name prefix
    #[serde(default)]
    pub stat_prefix: String,
    /// Response interception
    #[serde(default)]
    pub response: Option<ResponseInterceptFile>,
    /// Encode-path reaction to denials and fail-closed errors
    #[serde(default)]
    pub response_denial: ResponseDenialMode,
}

/// Raw HTTP backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpServiceFile {
    /// Where the service lives
    pub server_uri: ServerUriFile,
    /// Prefix placed before the original path
    #[serde(default)]
    pub path_prefix: String,
    /// Extra request headers to forward
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    /// Static headers added to every call
    #[serde(default)]
    pub headers_to_add: Vec<HeaderPairFile>,
    /// Reply headers copied onto the upstream request
    #[serde(default)]
    pub allowed_upstream_headers: Vec<String>,
    /// Reply headers relayed to the client on denial
    #[serde(default)]
    pub allowed_client_headers: Vec<String>,
}

/// Service endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerUriFile {
    /// Base URI
    pub uri: String,
    /// Cluster name
    #[serde(default)]
    pub cluster: Option<String>,
    /// Per-call timeout (default 200ms)
    #[serde(default)]
    pub timeout: Option<String>,
}

/// JSON-RPC backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcServiceFile {
    /// Endpoint URI
    pub uri: String,
    /// Per-call timeout (default 200ms)
    #[serde(default)]
    pub timeout: Option<String>,
    /// Headers sent with every call
    #[serde(default)]
    pub initial_metadata: Vec<HeaderPairFile>,
}

/// A header name/value pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderPairFile {
    /// Header name
    pub key: String,
    /// Header value
    pub value: String,
}

/// Body buffering settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferSettingsFile {
    /// Cap on buffered bytes
    pub max_request_bytes: u32,
    /// Check with a truncated body instead of rejecting oversized ones
    #[serde(default)]
    pub allow_partial_message: bool,
}

/// Response interception settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseInterceptFile {
    /// Run response-direction checks
    #[serde(default)]
    pub enabled: bool,
    /// Raw HTTP backend for responses (defaults to the request backend)
    #[serde(default)]
    pub http_service: Option<HttpServiceFile>,
    /// JSON-RPC backend for responses (defaults to the request backend)
    #[serde(default)]
    pub rpc_service: Option<RpcServiceFile>,
}

impl ExtAuthzFile {
    /// Backend for request-direction checks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] unless exactly one backend is set
    /// and valid.
    pub fn request_service(&self) -> Result<CheckServiceConfig, ConfigError> {
        match service_from(self.http_service.as_ref(), self.rpc_service.as_ref(), "")? {
            Some(service) => Ok(service),
            None => Err(ConfigError::invalid(
                "http_service",
                "one of http_service or rpc_service is required",
            )),
        }
    }

    /// Backend for response-direction checks, `None` when interception is off.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid backend.
    pub fn response_service(&self) -> Result<Option<CheckServiceConfig>, ConfigError> {
        let Some(response) = self.response.as_ref().filter(|r| r.enabled) else {
            return Ok(None);
        };
        match service_from(
            response.http_service.as_ref(),
            response.rpc_service.as_ref(),
            "response.",
        )? {
            Some(service) => Ok(Some(service)),
            None => self.request_service().map(Some),
        }
    }

    /// Runtime filter configuration with the given counters.
    pub fn to_filter_config(&self, stats: AuthzStats) -> Result<FilterConfig, ConfigError> {
        let (max_request_bytes, allow_partial) = self
            .with_request_body
            .as_ref()
            .map_or((0, false), |b| (b.max_request_bytes, b.allow_partial_message));
        let mut builder = FilterConfig::builder()
            .max_request_bytes(max_request_bytes)
            .allow_partial_message(allow_partial)
            .failure_mode_allow(self.failure_mode_allow)
            .clear_route_cache(self.clear_route_cache)
            .filter_enabled(self.filter_enabled)
            .metadata_context_namespaces(self.metadata_context_namespaces.clone())
            .include_peer_certificate(self.include_peer_certificate)
            .intercept_response(self.response.as_ref().is_some_and(|r| r.enabled))
            .response_denial(self.response_denial)
            .stats(stats);
        if let Some(code) = self.status_on_error {
            builder = builder.status_on_error(code);
        }
        if let Some(percent) = &self.filter_enabled {
            if u64::from(percent.numerator) > percent.denominator.value() {
                tracing::warn!(
                    numerator = percent.numerator,
                    "filter_enabled numerator exceeds its denominator; sampling saturates at 100%"
                );
            }
        }
        Ok(builder.build()?)
    }
}

fn service_from(
    http: Option<&HttpServiceFile>,
    rpc: Option<&RpcServiceFile>,
    prefix: &str,
) -> Result<Option<CheckServiceConfig>, ConfigError> {
    match (http, rpc) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            format!("{prefix}http_service"),
            "http_service and rpc_service are mutually exclusive",
        )),
        (Some(http), None) => http.to_config(prefix).map(|c| Some(CheckServiceConfig::Http(c))),
        (None, Some(rpc)) => rpc.to_config(prefix).map(|c| Some(CheckServiceConfig::Rpc(c))),
        (None, None) => Ok(None),
    }
}

impl HttpServiceFile {
    fn to_config(&self, prefix: &str) -> Result<HttpServiceConfig, ConfigError> {
        let field = format!("{prefix}http_service");
        let mut config = HttpServiceConfig::new(parse_http_url(
            &self.server_uri.uri,
            &format!("{field}.server_uri.uri"),
        )?);
        config.cluster = self.server_uri.cluster.clone();
        config.timeout = parse_duration(
            self.server_uri.timeout.as_deref(),
            DEFAULT_CHECK_TIMEOUT,
            &format!("{field}.server_uri.timeout"),
        )?;
        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            return Err(ConfigError::invalid(
                format!("{field}.path_prefix"),
                "must start with '/'",
            ));
        }
        config.path_prefix = self.path_prefix.trim_end_matches('/').to_string();
        config.allowed_headers =
            parse_names(&self.allowed_headers, &format!("{field}.allowed_headers"))?;
        config.headers_to_add = parse_pairs(&self.headers_to_add, &format!("{field}.headers_to_add"))?;
        config.allowed_upstream_headers = parse_names(
            &self.allowed_upstream_headers,
            &format!("{field}.allowed_upstream_headers"),
        )?;
        config.allowed_client_headers = parse_names(
            &self.allowed_client_headers,
            &format!("{field}.allowed_client_headers"),
        )?;
        Ok(config)
    }
}

impl RpcServiceFile {
    fn to_config(&self, prefix: &str) -> Result<RpcServiceConfig, ConfigError> {
        let field = format!("{prefix}rpc_service");
        let mut config = RpcServiceConfig::new(parse_http_url(&self.uri, &format!("{field}.uri"))?);
        config.timeout = parse_duration(
            self.timeout.as_deref(),
            DEFAULT_CHECK_TIMEOUT,
            &format!("{field}.timeout"),
        )?;
        config.initial_metadata =
            parse_pairs(&self.initial_metadata, &format!("{field}.initial_metadata"))?;
        Ok(config)
    }
}

// ============================================================================
// Per-route override
// ============================================================================

/// Per-route override of the external authorization filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtAuthzPerRouteFile {
    /// Skip the check on this route
    #[serde(default)]
    pub disabled: bool,
    /// Check settings
    #[serde(default)]
    pub check_settings: Option<CheckSettingsFile>,
}

/// Check settings of a per-route override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSettingsFile {
    /// Extensions added to the check request
    #[serde(default)]
    pub context_extensions: BTreeMap<String, String>,
}

impl From<ExtAuthzPerRouteFile> for FilterConfigPerRoute {
    fn from(file: ExtAuthzPerRouteFile) -> Self {
        FilterConfigPerRoute::new(
            file.disabled,
            file.check_settings
                .map(|s| s.context_extensions)
                .unwrap_or_default(),
        )
    }
}

// ============================================================================
// Scope authorization filter
// ============================================================================

/// Typed config of the scope authorization filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeAuthzFile {
    /// Ordered rules; the first match decides
    #[serde(default)]
    pub rules: Vec<ScopeRuleFile>,
    /// Metadata namespace holding the token payload
    #[serde(default)]
    pub metadata_namespace: Option<String>,
    /// Key of the payload within the namespace
    #[serde(default)]
    pub payload_key: Option<String>,
    /// Claim listing the granted scopes
    #[serde(default)]
    pub scope_claim: Option<String>,
    /// Reject requests that match no rule
    #[serde(default)]
    pub deny_unmatched: bool,
    /// Metric name prefix
    #[serde(default)]
    pub stat_prefix: String,
}

/// One scope rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeRuleFile {
    /// Request matcher
    #[serde(rename = "match")]
    pub matcher: RuleMatchFile,
    /// Accepted scopes; any one suffices
    pub scopes: Vec<String>,
}

/// Request matcher of a scope rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleMatchFile {
    /// Path prefix
    #[serde(default)]
    pub prefix: Option<String>,
    /// Exact path
    #[serde(default)]
    pub path: Option<String>,
    /// Regular expression over the whole path
    #[serde(default)]
    pub regex: Option<String>,
    /// Header conditions; all must hold
    #[serde(default)]
    pub headers: Vec<HeaderMatchFile>,
}

impl RuleMatchFile {
    /// The path part of the matcher.
    pub fn path_match(&self) -> PathMatchFile {
        PathMatchFile {
            prefix: self.prefix.clone(),
            path: self.path.clone(),
            regex: self.regex.clone(),
        }
    }
}

/// Header condition: exact value, or presence when `exact` is absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatchFile {
    /// Header name
    pub name: String,
    /// Required value
    #[serde(default)]
    pub exact: Option<String>,
    /// Invert the condition
    #[serde(default)]
    pub invert: bool,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_http_url(raw: &str, field: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme {other:?}"),
        )),
    }
}

fn parse_duration(raw: Option<&str>, default: Duration, field: &str) -> Result<Duration, ConfigError> {
    match raw {
        Some(raw) => humantime::parse_duration(raw).map_err(|e| ConfigError::invalid(field, e.to_string())),
        None => Ok(default),
    }
}

/// Parse a header name, lowercasing it.
pub(crate) fn parse_name(raw: &str, field: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(raw.to_ascii_lowercase().as_bytes())
        .map_err(|_| ConfigError::invalid(field, format!("invalid header name {raw:?}")))
}

fn parse_names(raw: &[String], field: &str) -> Result<Vec<HeaderName>, ConfigError> {
    raw.iter().map(|name| parse_name(name, field)).collect()
}

fn parse_pairs(raw: &[HeaderPairFile], field: &str) -> Result<Vec<HeaderEntry>, ConfigError> {
    raw.iter()
        .map(|pair| {
            let name = parse_name(&pair.key, field)?;
            let value = HeaderValue::from_str(&pair.value).map_err(|_| {
                ConfigError::invalid(field, format!("invalid value for header {:?}", pair.key))
            })?;
            Ok((name, value))
        })
        .collect()
}
