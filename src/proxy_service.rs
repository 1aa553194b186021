//! Exchange driver: runs one downstream request through a filter and the
//! upstream.
//!
//! # Flow
//!
//! 1. Request headers, body frames and trailers are fed to the filter's
//!    decode path. Frames held by a `Stop*` status accumulate in the
//!    decoding buffer (bounded by the filter's limit, 413 on overflow).
//!    Whenever the filter stalls on an in-flight check the driver awaits
//!    [`StreamFilter::decode_complete`].
//! 2. The route is resolved (after any route-cache clear). No route yields
//!    404, a direct-response route yields its fixed reply, otherwise the
//!    collected request is forwarded upstream.
//! 3. Response headers go through the encode path, again awaiting
//!    [`StreamFilter::encode_complete`] when stalled. The response body is
//!    then streamed through `encode_data` as it arrives.
//!
//! `on_destroy` runs exactly once, when the exchange ends or the response
//! body is dropped early.
//!
//! The request body is collected before forwarding, up to a per-service cap
//! (413 beyond it); only the response is streamed.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, Request, Response, StatusCode, Uri, request, response};
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{Instrument, Span, debug, field, info, info_span, warn};
use url::Url;

use crate::check::http_client::is_hop_by_hop;
use crate::config::file::DEFAULT_MAX_REQUEST_BODY_BYTES;
use crate::error::ProxyError;
use crate::filter::{
    DataStatus, DecoderFilterCallbacks, EncoderFilterCallbacks, FilterFactory, HeadersStatus,
    LocalReply, ResponseFlag, StreamFilter, StreamFilterCallbacks, StreamInfo, TrailersStatus,
};
use crate::route::{Route, RouteTable};

/// Body type of every response the driver produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Details of the reply sent when the decoding buffer overflows.
pub const PAYLOAD_TOO_LARGE_DETAILS: &str = "request_payload_too_large";

/// Details of the reply sent when no route matches.
pub const ROUTE_NOT_FOUND_DETAILS: &str = "route_not_found";

/// Details of a direct-response route's reply.
pub const DIRECT_RESPONSE_DETAILS: &str = "direct_response";

/// Details of the reply sent when the upstream fails.
pub const UPSTREAM_FAILURE_DETAILS: &str = "upstream_reset_before_response_started";

/// Where allowed requests go.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a fully collected request and return the streaming response.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] or [`ProxyError::UpstreamTimeout`].
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, ProxyError>;
}

/// Upstream reached over HTTP(S) through the pooled hyper client.
pub struct HttpUpstream {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    base: Url,
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a client for `base`, with native TLS roots.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] if the platform roots cannot be
    /// loaded.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ProxyError> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Upstream {
                details: format!("failed to load TLS roots: {e}"),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            client,
            base,
            timeout,
        })
    }
}

/// Upstream URI for a downstream request: the base URL followed by the
/// original path and query.
fn upstream_uri(base: &Url, original: &Uri) -> Result<Uri, ProxyError> {
    let path = original.path_and_query().map_or("/", |pq| pq.as_str());
    let base = base.as_str().trim_end_matches('/');
    format!("{base}{path}")
        .parse()
        .map_err(|e| ProxyError::Upstream {
            details: format!("invalid upstream URI: {e}"),
        })
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, mut request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, ProxyError> {
        *request.uri_mut() = upstream_uri(&self.base, request.uri())?;
        *request.version_mut() = http::Version::HTTP_11;
        strip_hop_by_hop(request.headers_mut());
        request.headers_mut().remove(CONTENT_LENGTH);
        request.headers_mut().remove(HOST);

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout {
                timeout: self.timeout,
            })?
            .map_err(|e| ProxyError::Upstream {
                details: e.to_string(),
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = body
            .map_err(|e| ProxyError::Upstream {
                details: e.to_string(),
            })
            .boxed_unsync();
        Ok(Response::from_parts(parts, body))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Render a body-less reply from bytes.
fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Render a local reply as a downstream response.
pub fn reply_response(reply: LocalReply) -> Response<ProxyBody> {
    reply.into_response().map(full_body)
}

/// Render a driver error as a downstream response.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(err.to_string())));
    *response.status_mut() = err.status_code();
    response
}

// ============================================================================
// Exchange state
// ============================================================================

/// Host-side state of one exchange, handed to the filter as callbacks.
struct Exchange {
    routes: Arc<RouteTable>,
    cached_route: Option<Option<Arc<Route>>>,
    request: request::Parts,
    response: Option<response::Parts>,
    buffer: Option<BytesMut>,
    buffer_limit: Option<usize>,
    forwarded: BytesMut,
    max_body_bytes: usize,
    decode_stopped: bool,
    encode_stopped: bool,
    local_reply: Option<LocalReply>,
    reset: bool,
    info: StreamInfo,
    span: Span,
}

impl Exchange {
    fn new(
        routes: Arc<RouteTable>,
        request: request::Parts,
        max_body_bytes: usize,
        info: StreamInfo,
        span: Span,
    ) -> Self {
        Self {
            routes,
            cached_route: None,
            request,
            response: None,
            buffer: None,
            buffer_limit: None,
            forwarded: BytesMut::new(),
            max_body_bytes,
            decode_stopped: false,
            encode_stopped: false,
            local_reply: None,
            reset: false,
            info,
            span,
        }
    }

    fn host(&self) -> Option<&str> {
        self.request
            .uri
            .authority()
            .map(|a| a.as_str())
            .or_else(|| self.request.headers.get(HOST).and_then(|v| v.to_str().ok()))
    }

    /// Hold `data` in the decoding buffer, enforcing the limit.
    fn buffer_data(&mut self, data: Bytes, enforce_limit: bool) {
        if data.is_empty() {
            return;
        }
        let buffered = self.buffer.as_ref().map_or(0, BytesMut::len);
        let limit = self.buffer_limit.filter(|_| enforce_limit);
        if let Some(limit) = limit.filter(|limit| buffered + data.len() > *limit) {
            debug!(limit, "decoding buffer overflow");
            let reply = self.payload_too_large();
            self.reply(reply);
            return;
        }
        self.buffer
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(&data);
    }

    /// Would `incoming` more bytes push the collected body past the cap?
    fn exceeds_body_cap(&self, incoming: usize) -> bool {
        let buffered = self.buffer.as_ref().map_or(0, BytesMut::len);
        self.forwarded.len() + buffered + incoming > self.max_body_bytes
    }

    fn payload_too_large(&mut self) -> LocalReply {
        self.info.set_response_flag(ResponseFlag::RequestPayloadTooLarge);
        let reply = LocalReply::new(StatusCode::PAYLOAD_TOO_LARGE, PAYLOAD_TOO_LARGE_DETAILS);
        self.info.set_response_code_details(reply.details);
        reply
    }

    fn reply(&mut self, reply: LocalReply) {
        self.info.set_response_code_details(reply.details);
        // The first reply wins.
        if self.local_reply.is_none() {
            self.local_reply = Some(reply);
        }
    }

    fn resume_decoding(&mut self) {
        self.decode_stopped = false;
        if let Some(buffer) = self.buffer.take() {
            self.forwarded.extend_from_slice(&buffer);
        }
    }
}

impl StreamFilterCallbacks for Exchange {
    fn route(&mut self) -> Option<Arc<Route>> {
        if let Some(route) = &self.cached_route {
            return route.clone();
        }
        let route = self.routes.select(self.host(), self.request.uri.path());
        self.cached_route = Some(route.clone());
        route
    }

    fn clear_route_cache(&mut self) {
        self.cached_route = None;
    }

    fn request_head(&self) -> &request::Parts {
        &self.request
    }

    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo {
        &mut self.info
    }

    fn active_span(&self) -> Span {
        self.span.clone()
    }
}

impl DecoderFilterCallbacks for Exchange {
    fn request_head_mut(&mut self) -> &mut request::Parts {
        &mut self.request
    }

    fn decoding_buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    fn add_decoded_data(&mut self, data: Bytes) {
        self.buffer_data(data, true);
    }

    fn set_decoder_buffer_limit(&mut self, limit: usize) {
        self.buffer_limit = Some(limit);
    }

    fn continue_decoding(&mut self) {
        self.resume_decoding();
    }

    fn send_local_reply(&mut self, reply: LocalReply) {
        self.reply(reply);
    }
}

impl EncoderFilterCallbacks for Exchange {
    fn response_head(&self) -> Option<&response::Parts> {
        self.response.as_ref()
    }

    fn response_head_mut(&mut self) -> Option<&mut response::Parts> {
        self.response.as_mut()
    }

    fn continue_encoding(&mut self) {
        self.encode_stopped = false;
    }

    fn send_local_reply(&mut self, reply: LocalReply) {
        self.reply(reply);
    }

    fn reset_stream(&mut self) {
        self.reset = true;
    }
}

// ============================================================================
// Driver
// ============================================================================

enum Decoded {
    Forward(Bytes),
    Reply(LocalReply),
}

/// Serves downstream exchanges through a filter chain of one filter.
pub struct ProxyService {
    routes: Arc<RouteTable>,
    factory: FilterFactory,
    upstream: Arc<dyn Upstream>,
    max_body_bytes: usize,
}

impl ProxyService {
    /// Create the service.
    pub fn new(routes: Arc<RouteTable>, factory: FilterFactory, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            routes,
            factory,
            upstream,
            max_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }

    /// Cap the request body collected for forwarding; larger bodies get 413
    /// whatever the filter's own buffering settings.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Drive one exchange.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Reset`] when a filter aborts the exchange and
    /// [`ProxyError::Body`] when the downstream body fails. Upstream
    /// failures are rendered as 502/504 responses.
    pub async fn handle<B>(&self, request: Request<B>, info: StreamInfo) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: Display,
    {
        let span = info_span!(
            "exchange",
            method = %request.method(),
            path = %request.uri().path(),
            status = field::Empty,
        );
        let result = self.drive(request, info, span.clone()).instrument(span.clone()).await;
        match &result {
            Ok(response) => {
                span.record("status", response.status().as_u16());
            }
            Err(err) => {
                span.record("status", err.status_code().as_u16());
            }
        }
        result
    }

    async fn drive<B>(&self, request: Request<B>, info: StreamInfo, span: Span) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: Display,
    {
        let (parts, mut body) = request.into_parts();
        let mut exchange = Exchange::new(self.routes.clone(), parts, self.max_body_bytes, info, span);
        let mut filter = (self.factory)();

        let decoded = match decode(&mut exchange, filter.as_mut(), &mut body).await {
            Ok(decoded) => decoded,
            Err(err) => {
                filter.on_destroy();
                return Err(err);
            }
        };
        let body = match decoded {
            Decoded::Forward(body) => body,
            Decoded::Reply(reply) => {
                finish(filter.as_mut(), &exchange, reply.status);
                return Ok(reply_response(reply));
            }
        };

        let route = exchange.route();
        let cluster = route.as_deref().and_then(Route::cluster).map(str::to_string);
        let Some(cluster) = cluster else {
            let reply = match route.as_deref().and_then(Route::direct_response) {
                Some(direct) => LocalReply::new(direct.status, DIRECT_RESPONSE_DETAILS)
                    .with_body(String::from_utf8_lossy(&direct.body).into_owned()),
                None => {
                    exchange.info.set_response_flag(ResponseFlag::NoRouteFound);
                    LocalReply::new(StatusCode::NOT_FOUND, ROUTE_NOT_FOUND_DETAILS)
                }
            };
            exchange.info.set_response_code_details(reply.details);
            finish(filter.as_mut(), &exchange, reply.status);
            return Ok(reply_response(reply));
        };

        let mut upstream_request = Request::new(Full::new(body));
        *upstream_request.method_mut() = exchange.request.method.clone();
        *upstream_request.uri_mut() = exchange.request.uri.clone();
        *upstream_request.headers_mut() = exchange.request.headers.clone();
        debug!(%cluster, "forwarding request upstream");

        let response = match self.upstream.send(upstream_request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%cluster, error = %err, "upstream request failed");
                let reply = LocalReply::new(err.status_code(), UPSTREAM_FAILURE_DETAILS)
                    .with_body(err.to_string());
                exchange.info.set_response_code_details(reply.details);
                finish(filter.as_mut(), &exchange, reply.status);
                return Ok(reply_response(reply));
            }
        };

        encode(exchange, filter, response).await
    }
}

/// Log the outcome and tear the filter down.
fn finish(filter: &mut dyn StreamFilter, exchange: &Exchange, status: StatusCode) {
    filter.on_destroy();
    info!(
        status = status.as_u16(),
        details = exchange.info.response_code_details().unwrap_or("via_upstream"),
        flags = ?exchange.info.response_flags(),
        "exchange finished"
    );
}

async fn next_frame<B>(body: &mut B) -> Result<Option<Frame<Bytes>>, ProxyError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    match body.frame().await {
        None => Ok(None),
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(ProxyError::Body {
            details: e.to_string(),
        }),
    }
}

/// Run the decode path to the end of the request.
async fn decode<B>(exchange: &mut Exchange, filter: &mut dyn StreamFilter, body: &mut B) -> Result<Decoded, ProxyError>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: Display,
{
    let end_stream = body.is_end_stream();
    let status = filter.decode_headers(exchange, end_stream);
    if let Some(reply) = exchange.local_reply.take() {
        return Ok(Decoded::Reply(reply));
    }
    exchange.decode_stopped = status != HeadersStatus::Continue;
    if status == HeadersStatus::StopAllIterationAndWatermark {
        filter.decode_complete(exchange).await;
        if let Some(reply) = exchange.local_reply.take() {
            return Ok(Decoded::Reply(reply));
        }
    }

    if !end_stream {
        let mut saw_end = false;
        let mut current = next_frame(body).await?;
        while let Some(frame) = current {
            let next = next_frame(body).await?;
            let last = next.is_none();
            match frame.into_data() {
                Ok(data) => {
                    saw_end |= last;
                    if let Some(reply) = decode_data(exchange, filter, data, last).await {
                        return Ok(Decoded::Reply(reply));
                    }
                }
                Err(frame) => {
                    if let Ok(mut trailers) = frame.into_trailers() {
                        saw_end = true;
                        let status = filter.decode_trailers(exchange, &mut trailers);
                        if let Some(reply) = exchange.local_reply.take() {
                            return Ok(Decoded::Reply(reply));
                        }
                        match status {
                            TrailersStatus::StopIteration => {
                                exchange.decode_stopped = true;
                                filter.decode_complete(exchange).await;
                                if let Some(reply) = exchange.local_reply.take() {
                                    return Ok(Decoded::Reply(reply));
                                }
                            }
                            TrailersStatus::Continue if exchange.decode_stopped => {
                                exchange.resume_decoding();
                            }
                            TrailersStatus::Continue => {}
                        }
                    }
                }
            }
            current = next;
        }
        if !saw_end {
            if let Some(reply) = decode_data(exchange, filter, Bytes::new(), true).await {
                return Ok(Decoded::Reply(reply));
            }
        }
    }

    if exchange.decode_stopped {
        filter.decode_complete(exchange).await;
        if let Some(reply) = exchange.local_reply.take() {
            return Ok(Decoded::Reply(reply));
        }
    }
    if exchange.decode_stopped {
        warn!("filter never resumed the request");
        return Err(ProxyError::Reset);
    }
    Ok(Decoded::Forward(exchange.forwarded.split().freeze()))
}

async fn decode_data(
    exchange: &mut Exchange,
    filter: &mut dyn StreamFilter,
    mut data: Bytes,
    end_stream: bool,
) -> Option<LocalReply> {
    if exchange.exceeds_body_cap(data.len()) {
        debug!(limit = exchange.max_body_bytes, "request body exceeds the forwarding cap");
        return Some(exchange.payload_too_large());
    }
    let status = filter.decode_data(exchange, &mut data, end_stream);
    if let Some(reply) = exchange.local_reply.take() {
        return Some(reply);
    }
    match status {
        DataStatus::Continue => {
            if exchange.decode_stopped {
                exchange.resume_decoding();
            }
            exchange.forwarded.extend_from_slice(&data);
        }
        DataStatus::StopIterationAndBuffer => {
            exchange.decode_stopped = true;
            exchange.buffer_data(data, true);
        }
        DataStatus::StopIterationAndWatermark => {
            exchange.decode_stopped = true;
            exchange.buffer_data(data, false);
            filter.decode_complete(exchange).await;
        }
    }
    exchange.local_reply.take()
}

/// Run the encode path and stream the response body.
async fn encode(
    mut exchange: Exchange,
    mut filter: Box<dyn StreamFilter>,
    response: Response<ProxyBody>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (parts, mut body) = response.into_parts();
    let status = parts.status;
    exchange.response = Some(parts);

    let headers_status = filter.encode_headers(&mut exchange, body.is_end_stream());
    if headers_status != HeadersStatus::Continue {
        exchange.encode_stopped = true;
        filter.encode_complete(&mut exchange).await;
    }

    if let Some(reply) = exchange.local_reply.take() {
        finish(filter.as_mut(), &exchange, reply.status);
        return Ok(reply_response(reply));
    }
    if exchange.reset {
        finish(filter.as_mut(), &exchange, status);
        return Err(ProxyError::Reset);
    }
    if exchange.encode_stopped {
        // Stalled: consume the upstream response, then abort.
        while let Some(Ok(_)) = body.frame().await {}
        finish(filter.as_mut(), &exchange, status);
        return Err(ProxyError::Reset);
    }

    let Some(parts) = exchange.response.take() else {
        finish(filter.as_mut(), &exchange, status);
        return Err(ProxyError::Reset);
    };
    // Keep a copy for filters that look at the head while streaming.
    let mut head = Response::new(());
    *head.status_mut() = parts.status;
    *head.headers_mut() = parts.headers.clone();
    exchange.response = Some(head.into_parts().0);

    let state = ResponseStream {
        filter,
        exchange,
        body,
        destroyed: false,
    };
    let frames = stream::unfold(state, |mut state| async move {
        let item = state.next().await?;
        Some((item, state))
    });
    Ok(Response::from_parts(parts, StreamBody::new(frames).boxed_unsync()))
}

/// Upstream body pumped through the encode path.
struct ResponseStream {
    filter: Box<dyn StreamFilter>,
    exchange: Exchange,
    body: ProxyBody,
    destroyed: bool,
}

impl ResponseStream {
    async fn next(&mut self) -> Option<Result<Frame<Bytes>, ProxyError>> {
        if self.destroyed {
            return None;
        }
        let frame = match self.body.frame().await {
            None => {
                self.destroy();
                return None;
            }
            Some(Err(err)) => {
                warn!(error = %err, "upstream body failed");
                self.destroy();
                return Some(Err(err));
            }
            Some(Ok(frame)) => frame,
        };
        let end_stream = self.body.is_end_stream();

        let frame = match frame.into_data() {
            Ok(mut data) => {
                let status = self.filter.encode_data(&mut self.exchange, &mut data, end_stream);
                if status != DataStatus::Continue && !self.resume().await {
                    return Some(Err(ProxyError::Reset));
                }
                Frame::data(data)
            }
            Err(frame) => match frame.into_trailers() {
                Ok(mut trailers) => {
                    let status = self.filter.encode_trailers(&mut self.exchange, &mut trailers);
                    if status != TrailersStatus::Continue && !self.resume().await {
                        return Some(Err(ProxyError::Reset));
                    }
                    Frame::trailers(trailers)
                }
                Err(frame) => frame,
            },
        };
        Some(Ok(frame))
    }

    /// Wait for the filter after it stopped mid-body; headers are already
    /// out, so anything but a resume aborts the stream.
    async fn resume(&mut self) -> bool {
        self.exchange.encode_stopped = true;
        self.filter.encode_complete(&mut self.exchange).await;
        let resumed = !self.exchange.encode_stopped
            && !self.exchange.reset
            && self.exchange.local_reply.is_none();
        if !resumed {
            debug!("aborting a response after its headers were sent");
            self.destroy();
        }
        resumed
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let status = self
            .exchange
            .response
            .as_ref()
            .map_or(StatusCode::OK, |head| head.status);
        finish(self.filter.as_mut(), &self.exchange, status);
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.destroy();
    }
}
