//! Raw HTTP check backend.
//!
//! The check is expressed as a plain HTTP call to the authorization
//! cluster: the original method and path (behind `path_prefix`), the
//! allowlisted request headers and the buffered body. A `200` reply
//! authorizes; any other status is a denial that is relayed to the client.

use std::time::Duration;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, COOKIE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::trace;
use url::Url;

use super::{CheckClient, CheckError, CheckRequest, CheckResponse, Direction, HeaderEntry};

/// Header carrying the upstream status on response-direction checks.
pub const RESPONSE_STATUS_HEADER: &str = "x-ext-authz-response-status";

/// Request headers forwarded even when `allowed_headers` is empty.
const DEFAULT_ALLOWED_HEADERS: [HeaderName; 3] = [AUTHORIZATION, COOKIE, HOST];

/// Headers never copied between hops.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns `true` for connection-scoped headers.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Settings of the raw HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    /// Base URI of the authorization service
    pub server_uri: Url,
    /// Cluster name, informational
    pub cluster: Option<String>,
    /// Per-call timeout
    pub timeout: Duration,
    /// Prefix placed before the original path
    pub path_prefix: String,
    /// Request headers forwarded in addition to the defaults
    pub allowed_headers: Vec<HeaderName>,
    /// Static headers added to every check call
    pub headers_to_add: Vec<HeaderEntry>,
    /// Authorization reply headers copied onto the upstream request
    pub allowed_upstream_headers: Vec<HeaderName>,
    /// Authorization reply headers relayed to the client on denial
    /// (all non-hop-by-hop headers when empty)
    pub allowed_client_headers: Vec<HeaderName>,
}

impl HttpServiceConfig {
    /// Settings with defaults for everything but the URI.
    pub fn new(server_uri: Url) -> Self {
        Self {
            server_uri,
            cluster: None,
            timeout: crate::timeout::DEFAULT_CHECK_TIMEOUT,
            path_prefix: String::new(),
            allowed_headers: Vec::new(),
            headers_to_add: Vec::new(),
            allowed_upstream_headers: Vec::new(),
            allowed_client_headers: Vec::new(),
        }
    }
}

/// [`CheckClient`] speaking raw HTTP to the authorization service.
pub struct HttpCheckClient {
    client: reqwest::Client,
    config: HttpServiceConfig,
}

impl HttpCheckClient {
    /// Create the client.
    ///
    /// # Errors
    ///
    /// Returns [`CheckError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: HttpServiceConfig) -> Result<Self, CheckError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CheckError::Transport {
                details: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &HttpServiceConfig {
        &self.config
    }

    fn check_url(&self, request: &CheckRequest) -> Result<Url, CheckError> {
        let base = self.config.server_uri.as_str().trim_end_matches('/');
        let path = request.attributes.path.as_deref().unwrap_or("/");
        let raw = format!("{base}{}{path}", self.config.path_prefix);
        Url::parse(&raw).map_err(|e| CheckError::Protocol {
            details: format!("invalid check URL {raw:?}: {e}"),
        })
    }

    fn outbound_headers(&self, request: &CheckRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match request.direction {
            Direction::Request => {
                for name in DEFAULT_ALLOWED_HEADERS
                    .iter()
                    .chain(self.config.allowed_headers.iter())
                {
                    for value in request.headers.get_all(name) {
                        headers.append(name.clone(), value.clone());
                    }
                }
            }
            Direction::Response => {
                for (name, value) in &request.headers {
                    if name != CONTENT_LENGTH && !is_hop_by_hop(name) {
                        headers.append(name.clone(), value.clone());
                    }
                }
                if let Some(status) = request.attributes.status {
                    headers.insert(
                        HeaderName::from_static(RESPONSE_STATUS_HEADER),
                        HeaderValue::from(status.as_u16()),
                    );
                }
            }
        }
        for (name, value) in &self.config.headers_to_add {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    fn decide(&self, status: StatusCode, headers: &HeaderMap, body: String) -> CheckResponse {
        if status == StatusCode::OK {
            let mut response = CheckResponse::ok();
            for name in &self.config.allowed_upstream_headers {
                for value in headers.get_all(name) {
                    response.headers_to_add.push((name.clone(), value.clone()));
                }
            }
            return response;
        }

        let mut response = CheckResponse::denied(status).with_body(body);
        for (name, value) in headers {
            if self.relays_to_client(name) {
                response.headers_to_add.push((name.clone(), value.clone()));
            }
        }
        response
    }

    fn relays_to_client(&self, name: &HeaderName) -> bool {
        if name == CONTENT_LENGTH || name == HOST || is_hop_by_hop(name) {
            return false;
        }
        self.config.allowed_client_headers.is_empty()
            || self.config.allowed_client_headers.contains(name)
    }
}

#[async_trait]
impl CheckClient for HttpCheckClient {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, CheckError> {
        let url = self.check_url(&request)?;
        let method = match request.direction {
            Direction::Request => request.attributes.method.clone().unwrap_or(Method::POST),
            Direction::Response => Method::POST,
        };
        trace!(%url, %method, direction = request.direction.as_str(), "raw HTTP check");

        let mut builder = self
            .client
            .request(method, url)
            .headers(self.outbound_headers(&request));
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let reply = builder.send().await.map_err(transport)?;
        let status = reply.status();
        let headers = reply.headers().clone();
        let body = reply.text().await.map_err(transport)?;
        Ok(self.decide(status, &headers, body))
    }
}

fn transport(err: reqwest::Error) -> CheckError {
    CheckError::Transport {
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Request;
    use axum::response::{IntoResponse, Response};
    use axum::routing::any;
    use crate::check::CheckStatus;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn authz(request: Request) -> Response {
        let path = request.uri().path().to_string();
        let allowed = request
            .headers()
            .get("authorization")
            .is_some_and(|v| v == "Bearer allow");
        let tagged = request.headers().get("x-check-tag").is_some();
        if allowed && tagged && path == "/authz/v1/items" {
            (
                [("x-user", "alice"), ("x-internal", "secret")],
                "ok",
            )
                .into_response()
        } else {
            (
                StatusCode::UNAUTHORIZED,
                [("www-authenticate", "Bearer")],
                format!("denied {path}"),
            )
                .into_response()
        }
    }

    fn client(addr: SocketAddr) -> HttpCheckClient {
        let mut config = HttpServiceConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
        config.path_prefix = "/authz".to_string();
        config.headers_to_add = vec![(
            HeaderName::from_static("x-check-tag"),
            HeaderValue::from_static("1"),
        )];
        config.allowed_upstream_headers = vec![HeaderName::from_static("x-user")];
        HttpCheckClient::new(config).unwrap()
    }

    fn request(authorization: &str) -> CheckRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers.insert("x-not-forwarded", HeaderValue::from_static("1"));
        let mut request = CheckRequest::new(Direction::Request, headers);
        request.attributes.method = Some(Method::GET);
        request.attributes.path = Some("/v1/items".to_string());
        request
    }

    #[tokio::test]
    async fn test_ok_reply_copies_allowed_upstream_headers() {
        let addr = serve(Router::new().fallback(any(authz))).await;
        let response = client(addr).check(request("Bearer allow")).await.unwrap();

        assert_eq!(response.status, CheckStatus::Ok);
        assert_eq!(response.headers_to_add.len(), 1);
        assert_eq!(response.headers_to_add[0].0.as_str(), "x-user");
        assert_eq!(response.headers_to_add[0].1, "alice");
    }

    #[tokio::test]
    async fn test_non_200_reply_is_denial_with_client_headers() {
        let addr = serve(Router::new().fallback(any(authz))).await;
        let response = client(addr).check(request("Bearer nope")).await.unwrap();

        assert_eq!(response.status, CheckStatus::Denied);
        assert_eq!(response.status_code, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body, "denied /authz/v1/items");
        assert!(
            response
                .headers_to_add
                .iter()
                .any(|(k, v)| k == "www-authenticate" && v == "Bearer")
        );
        assert!(response.headers_to_add.iter().all(|(k, _)| k != CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr).check(request("Bearer allow")).await.unwrap_err();
        assert!(matches!(err, CheckError::Transport { .. }));
    }

    #[test]
    fn test_response_direction_headers() {
        let client = HttpCheckClient::new(HttpServiceConfig::new(
            Url::parse("http://authz.local").unwrap(),
        ))
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let mut request = CheckRequest::new(Direction::Response, headers);
        request.attributes.status = Some(StatusCode::CREATED);

        let outbound = client.outbound_headers(&request);
        assert_eq!(outbound.get("content-type").unwrap(), "application/json");
        assert_eq!(outbound.get(RESPONSE_STATUS_HEADER).unwrap(), "201");
        assert!(outbound.get("transfer-encoding").is_none());
    }
}
