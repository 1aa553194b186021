//! JSON wire format of the check service.
//!
//! Shapes follow the external authorization API: a request carries the
//! HTTP attributes and filtered context, a response carries a status code
//! plus either an OK or a denied HTTP response description.

use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use super::{CheckError, CheckRequest, CheckResponse, HeaderEntry};

/// Status code meaning "authorized" in [`RpcStatus::code`].
pub const STATUS_OK: i32 = 0;

/// Status code meaning "permission denied" in [`RpcStatus::code`].
pub const STATUS_PERMISSION_DENIED: i32 = 7;

/// Serialized form of a [`CheckRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequestMessage {
    /// `request` or `response`
    pub direction: String,
    /// HTTP attributes of the exchange
    pub http: HttpRequestMessage,
    /// Route-level context extensions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_extensions: BTreeMap<String, String>,
    /// Filtered dynamic metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_context: BTreeMap<String, serde_json::Value>,
    /// URL-encoded PEM peer certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_certificate: Option<String>,
}

/// HTTP part of a [`CheckRequestMessage`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestMessage {
    /// Request method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Request authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Response status (response direction)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Headers; repeated values are joined with `,`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body as UTF-8 (lossy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Whether `body` was truncated
    #[serde(default)]
    pub partial_body: bool,
}

impl From<&CheckRequest> for CheckRequestMessage {
    fn from(request: &CheckRequest) -> Self {
        Self {
            direction: request.direction.as_str().to_string(),
            http: HttpRequestMessage {
                method: request.attributes.method.as_ref().map(ToString::to_string),
                path: request.attributes.path.clone(),
                host: request.attributes.host.clone(),
                status: request.attributes.status.map(|s| s.as_u16()),
                headers: flatten_headers(&request.headers),
                body: request
                    .body
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned()),
                partial_body: request.partial_body,
            },
            context_extensions: request.context_extensions.clone(),
            metadata_context: request.metadata_context.clone(),
            peer_certificate: request.peer_certificate.clone(),
        }
    }
}

/// Join repeated header values with `,`, skipping non-UTF-8 values.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

/// Status block of a check reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    /// 0 = OK, anything else = denied
    pub code: i32,
    /// Optional human-readable message (never forwarded to clients)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Header entry in a check reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValueOption {
    /// Header name
    pub key: String,
    /// Header value
    pub value: String,
    /// Append to an existing header instead of replacing it
    #[serde(default)]
    pub append: bool,
}

/// Description of the reply sent to the client on denial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedHttpResponse {
    /// HTTP status code (defaults to 403)
    #[serde(default)]
    pub status: Option<u16>,
    /// Headers to set on the reply
    #[serde(default)]
    pub headers: Vec<HeaderValueOption>,
    /// Reply body
    #[serde(default)]
    pub body: String,
}

/// Header mutations applied on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkHttpResponse {
    /// Headers to set or append
    #[serde(default)]
    pub headers: Vec<HeaderValueOption>,
}

/// Serialized form of a [`CheckResponse`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponseMessage {
    /// Decision status
    #[serde(default)]
    pub status: RpcStatus,
    /// Present on denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_response: Option<DeniedHttpResponse>,
    /// Present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_response: Option<OkHttpResponse>,
}

impl TryFrom<CheckResponseMessage> for CheckResponse {
    type Error = CheckError;

    fn try_from(message: CheckResponseMessage) -> Result<Self, Self::Error> {
        if message.status.code == STATUS_OK {
            let mut response = CheckResponse::ok();
            if let Some(ok) = message.ok_response {
                split_headers(&ok.headers, &mut response)?;
            }
            return Ok(response);
        }

        let Some(denied) = message.denied_response else {
            return Ok(CheckResponse::denied(StatusCode::FORBIDDEN));
        };
        let status_code = match denied.status {
            Some(code) => StatusCode::from_u16(code).map_err(|_| CheckError::Protocol {
                details: format!("invalid denied status {code}"),
            })?,
            None => StatusCode::FORBIDDEN,
        };
        let mut response = CheckResponse::denied(status_code).with_body(denied.body);
        split_headers(&denied.headers, &mut response)?;
        // Denied replies have no preexisting headers to append to.
        let appended = std::mem::take(&mut response.headers_to_append);
        response.headers_to_add.extend(appended);
        Ok(response)
    }
}

fn split_headers(
    headers: &[HeaderValueOption],
    response: &mut CheckResponse,
) -> Result<(), CheckError> {
    for header in headers {
        let entry = parse_entry(&header.key, &header.value)?;
        if header.append {
            response.headers_to_append.push(entry);
        } else {
            response.headers_to_add.push(entry);
        }
    }
    Ok(())
}

/// Parse a header name/value pair, lowercasing the name.
///
/// # Errors
///
/// Returns [`CheckError::Protocol`] for names or values that are not valid
/// HTTP header tokens.
pub fn parse_entry(key: &str, value: &str) -> Result<HeaderEntry, CheckError> {
    let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes()).map_err(|_| {
        CheckError::Protocol {
            details: format!("invalid header name {key:?}"),
        }
    })?;
    let value = HeaderValue::from_str(value).map_err(|_| CheckError::Protocol {
        details: format!("invalid value for header {key:?}"),
    })?;
    Ok((name, value))
}
