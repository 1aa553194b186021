//! External authorization check: request/response model and client contract.
//!
//! A [`CheckClient`] performs exactly one call per [`CheckRequest`]. The
//! state machines never call a client directly; they go through
//! [`dispatch`], which runs the call on its own task and hands back a
//! cancellable [`PendingCheck`].
//!
//! Two backends are provided:
//!
//! - [`http_client::HttpCheckClient`]: raw HTTP to an authorization cluster,
//!   path-prefixed.
//! - [`rpc_client::RpcCheckClient`]: JSON-RPC 2.0 with a fixed method descriptor.

pub mod dispatch;
pub mod http_client;
pub mod rpc_client;
pub mod wire;

pub use dispatch::{PendingCheck, dispatch};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::timeout::{TimeoutClient, TimeoutConfig};

/// Namespaced structured metadata (namespace → struct value).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Context extensions attached by route configuration.
pub type ContextExtensions = BTreeMap<String, String>;

/// A single header mutation entry.
pub type HeaderEntry = (HeaderName, HeaderValue);

/// Which side of the exchange a check was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound request (decode path).
    Request,
    /// Outbound response (encode path).
    Response,
}

impl Direction {
    /// Lowercase name used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Attributes of the HTTP exchange that are not headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpAttributes {
    /// Request method
    pub method: Option<Method>,
    /// Request path including query
    pub path: Option<String>,
    /// Request authority
    pub host: Option<String>,
    /// Response status (response direction only)
    pub status: Option<StatusCode>,
}

/// Immutable authorization query built once per attempt.
///
/// Built fresh for each direction and never shared between the decode and
/// encode machines.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// Direction this check covers
    pub direction: Direction,
    /// Method, path, host and (for responses) status
    pub attributes: HttpAttributes,
    /// Subject headers (ordered, case-insensitive multi-map)
    pub headers: HeaderMap,
    /// Buffered body, truncated to the configured cap
    pub body: Option<Bytes>,
    /// True when `body` was cut at the cap
    pub partial_body: bool,
    /// Route-level context extensions
    pub context_extensions: ContextExtensions,
    /// Dynamic metadata filtered to the configured namespaces
    pub metadata_context: Metadata,
    /// URL-encoded PEM of the downstream peer certificate
    pub peer_certificate: Option<String>,
}

impl CheckRequest {
    /// Start a request for `direction` with the given subject headers.
    pub fn new(direction: Direction, headers: HeaderMap) -> Self {
        Self {
            direction,
            attributes: HttpAttributes::default(),
            headers,
            body: None,
            partial_body: false,
            context_extensions: ContextExtensions::new(),
            metadata_context: Metadata::new(),
            peer_certificate: None,
        }
    }

    /// Attach body bytes, keeping at most `max_bytes`.
    ///
    /// A `max_bytes` of zero attaches nothing.
    #[must_use]
    pub fn with_body(mut self, body: Option<&[u8]>, max_bytes: usize) -> Self {
        if max_bytes == 0 {
            return self;
        }
        if let Some(body) = body {
            let len = body.len().min(max_bytes);
            self.partial_body = body.len() > max_bytes;
            self.body = Some(Bytes::copy_from_slice(&body[..len]));
        }
        self
    }
}

/// Outcome class of a check call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Authorized; header mutations may apply.
    Ok,
    /// Explicitly rejected by the authorization service.
    Denied,
    /// The call itself failed (transport, timeout, malformed reply).
    Error,
}

/// Result of one external check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    /// Outcome class
    pub status: CheckStatus,
    /// Status code for the synthesized reply (Denied)
    pub status_code: StatusCode,
    /// Body for the synthesized reply (Denied)
    pub body: String,
    /// Headers to set (replace-or-insert); on Denied, reply headers
    pub headers_to_add: Vec<HeaderEntry>,
    /// Headers to append only when the key already exists
    pub headers_to_append: Vec<HeaderEntry>,
}

impl CheckResponse {
    /// An authorized response with no mutations.
    pub fn ok() -> Self {
        Self {
            status: CheckStatus::Ok,
            status_code: StatusCode::OK,
            body: String::new(),
            headers_to_add: Vec::new(),
            headers_to_append: Vec::new(),
        }
    }

    /// A denial with the given reply status.
    pub fn denied(status_code: StatusCode) -> Self {
        Self {
            status: CheckStatus::Denied,
            status_code,
            ..Self::ok()
        }
    }

    /// A failed call.
    pub fn error() -> Self {
        Self {
            status: CheckStatus::Error,
            status_code: StatusCode::FORBIDDEN,
            ..Self::ok()
        }
    }

    /// Set the reply body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header to `headers_to_add`.
    #[must_use]
    pub fn add_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers_to_add.push((name, value));
        self
    }

    /// Add a header to `headers_to_append`.
    #[must_use]
    pub fn append_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers_to_append.push((name, value));
        self
    }

    /// Returns `true` if either mutation list is non-empty.
    pub fn has_mutations(&self) -> bool {
        !self.headers_to_add.is_empty() || !self.headers_to_append.is_empty()
    }
}

impl Default for CheckResponse {
    /// Default response is a failed call (fail-closed).
    fn default() -> Self {
        Self::error()
    }
}

/// Failure of a check call. Mapped to [`CheckStatus::Error`] by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Connection or I/O failure
    #[error("Authorization transport error: {details}")]
    Transport {
        /// Error details (safe for logging, not user-facing)
        details: String,
    },

    /// The call did not complete within its deadline
    #[error("Authorization call timed out after {timeout:?}")]
    Timeout {
        /// The per-call timeout that elapsed
        timeout: Duration,
    },

    /// Reply could not be understood
    #[error("Authorization protocol error: {details}")]
    Protocol {
        /// Error details
        details: String,
    },

    /// The pending call was cancelled before completing
    #[error("Authorization call cancelled")]
    Cancelled,
}

/// Client contract for the external authorization service.
///
/// Implementations issue exactly one call per invocation and return either a
/// response (OK or Denied) or a [`CheckError`]. Cancellation is handled by
/// [`dispatch`] dropping the future, so implementations must be cancel-safe.
#[async_trait]
pub trait CheckClient: Send + Sync {
    /// Perform one authorization check.
    ///
    /// # Errors
    ///
    /// Returns [`CheckError`] if the service could not produce a decision.
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, CheckError>;
}

/// Which backend a filter direction talks to.
#[derive(Debug, Clone)]
pub enum CheckServiceConfig {
    /// Raw HTTP to an authorization cluster
    Http(http_client::HttpServiceConfig),
    /// JSON-RPC 2.0
    Rpc(rpc_client::RpcServiceConfig),
}

impl CheckServiceConfig {
    /// Per-call timeout of the configured backend.
    pub fn timeout(&self) -> Duration {
        match self {
            CheckServiceConfig::Http(config) => config.timeout,
            CheckServiceConfig::Rpc(config) => config.timeout,
        }
    }

    /// Build the backend wrapped in its per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CheckError::Transport`] if the underlying HTTP client
    /// cannot be created.
    pub fn build(self) -> Result<std::sync::Arc<dyn CheckClient>, CheckError> {
        let timeout = TimeoutConfig::new(self.timeout());
        let client: std::sync::Arc<dyn CheckClient> = match self {
            CheckServiceConfig::Http(config) => std::sync::Arc::new(TimeoutClient::new(
                http_client::HttpCheckClient::new(config)?,
                timeout,
            )),
            CheckServiceConfig::Rpc(config) => std::sync::Arc::new(TimeoutClient::new(
                rpc_client::RpcCheckClient::new(config)?,
                timeout,
            )),
        };
        Ok(client)
    }
}
