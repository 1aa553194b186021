//! Error types for configuration loading and the exchange driver.
//!
//! Check-call failures live next to the check client in
//! [`crate::check::CheckError`]; denials are outcomes, never errors.

use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
///
/// Raised while loading the bootstrap file or validating a filter's typed
/// config. These are fatal at load time and never reach the stream path.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// YAML or JSON syntax error
    #[error("Config parse error: {details}")]
    Parse {
        /// Parser message
        details: String,
    },

    /// A field holds a value outside its allowed domain
    #[error("Invalid value for {field}: {details}")]
    Invalid {
        /// Dotted path of the offending field
        field: String,
        /// What is wrong with it
        details: String,
    },

    /// No constructor registered for a filter type tag
    #[error("Unknown filter type: {name}")]
    UnknownFilter {
        /// The type tag that was requested
        name: String,
    },

    /// Metric registration failed (duplicate stat prefix)
    #[error("Metrics registration failed: {details}")]
    Metrics {
        /// Prometheus error message
        details: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(field: impl Into<String>, details: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            details: details.into(),
        }
    }
}

impl From<serde_yml::Error> for ConfigError {
    fn from(err: serde_yml::Error) -> Self {
        ConfigError::Parse {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse {
            details: err.to_string(),
        }
    }
}

impl From<prometheus::Error> for ConfigError {
    fn from(err: prometheus::Error) -> Self {
        ConfigError::Metrics {
            details: err.to_string(),
        }
    }
}

/// Errors raised while driving an exchange through the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Upstream could not be reached or failed mid-response
    #[error("Upstream request failed: {details}")]
    Upstream {
        /// Error details (safe for logging)
        details: String,
    },

    /// Upstream did not answer in time
    #[error("Upstream timed out after {timeout:?}")]
    UpstreamTimeout {
        /// The configured upstream timeout
        timeout: Duration,
    },

    /// Downstream body failed while being read
    #[error("Downstream body error: {details}")]
    Body {
        /// Error details
        details: String,
    },

    /// The exchange was aborted (reset) by a filter
    #[error("Stream reset by filter")]
    Reset,
}

impl ProxyError {
    /// HTTP status used when the error is rendered to the downstream client.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            ProxyError::Upstream { .. } => http::StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => http::StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Body { .. } => http::StatusCode::BAD_REQUEST,
            ProxyError::Reset => http::StatusCode::BAD_GATEWAY,
        }
    }
}
