//! JSON-RPC check backend.
//!
//! Each check is one JSON-RPC 2.0 call over HTTP POST. The method name is
//! fixed per direction; the params are a [`CheckRequestMessage`] and the
//! result a [`CheckResponseMessage`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;
use uuid::Uuid;

use super::wire::{CheckRequestMessage, CheckResponseMessage};
use super::{CheckClient, CheckError, CheckRequest, CheckResponse, Direction, HeaderEntry};

/// Method descriptor for request-direction checks.
pub const CHECK_METHOD: &str = "authgate.auth.v1.Authorization/Check";

/// Method descriptor for response-direction checks.
pub const INTERCEPT_METHOD: &str = "authgate.auth.v1.ResponseAuthorization/Intercept";

const JSONRPC_VERSION: &str = "2.0";

/// Method descriptor for a direction.
pub fn method_for(direction: Direction) -> &'static str {
    match direction {
        Direction::Request => CHECK_METHOD,
        Direction::Response => INTERCEPT_METHOD,
    }
}

/// Settings of the RPC backend.
#[derive(Debug, Clone)]
pub struct RpcServiceConfig {
    /// Endpoint receiving the JSON-RPC POSTs
    pub uri: Url,
    /// Per-call timeout
    pub timeout: Duration,
    /// Headers sent with every call
    pub initial_metadata: Vec<HeaderEntry>,
}

impl RpcServiceConfig {
    /// Settings with the default timeout and no metadata.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            timeout: crate::timeout::DEFAULT_CHECK_TIMEOUT,
            initial_metadata: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcCall<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'static str,
    params: &'a CheckRequestMessage,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<CheckResponseMessage>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// [`CheckClient`] speaking JSON-RPC 2.0.
pub struct RpcCheckClient {
    client: reqwest::Client,
    config: RpcServiceConfig,
}

impl RpcCheckClient {
    /// Create the client.
    ///
    /// # Errors
    ///
    /// Returns [`CheckError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: RpcServiceConfig) -> Result<Self, CheckError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CheckError::Transport {
                details: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &RpcServiceConfig {
        &self.config
    }
}

#[async_trait]
impl CheckClient for RpcCheckClient {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, CheckError> {
        let params = CheckRequestMessage::from(&request);
        let id = Uuid::new_v4().to_string();
        let method = method_for(request.direction);
        let call = RpcCall {
            jsonrpc: JSONRPC_VERSION,
            id: id.clone(),
            method,
            params: &params,
        };
        trace!(%id, method, "RPC check");

        let mut builder = self.client.post(self.config.uri.clone()).json(&call);
        for (name, value) in &self.config.initial_metadata {
            builder = builder.header(name.clone(), value.clone());
        }
        let reply = builder.send().await.map_err(|e| CheckError::Transport {
            details: e.to_string(),
        })?;
        if !reply.status().is_success() {
            return Err(CheckError::Protocol {
                details: format!("unexpected HTTP status {}", reply.status()),
            });
        }
        let bytes = reply.bytes().await.map_err(|e| CheckError::Transport {
            details: e.to_string(),
        })?;
        decode_reply(&bytes, &id)
    }
}

/// Decode a JSON-RPC reply body into a [`CheckResponse`].
///
/// # Errors
///
/// Returns [`CheckError::Protocol`] for malformed payloads, mismatched ids,
/// JSON-RPC error objects and replies without a result.
pub fn decode_reply(bytes: &[u8], expected_id: &str) -> Result<CheckResponse, CheckError> {
    let reply: RpcReply = serde_json::from_slice(bytes).map_err(|e| CheckError::Protocol {
        details: format!("malformed reply: {e}"),
    })?;
    if let Some(id) = &reply.id {
        if id.as_str() != Some(expected_id) {
            return Err(CheckError::Protocol {
                details: format!("reply id {id} does not match {expected_id}"),
            });
        }
    }
    if let Some(error) = reply.error {
        return Err(CheckError::Protocol {
            details: format!("service error {}: {}", error.code, error.message),
        });
    }
    let Some(result) = reply.result else {
        return Err(CheckError::Protocol {
            details: "reply carries neither result nor error".to_string(),
        });
    };
    CheckResponse::try_from(result)
}
