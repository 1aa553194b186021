//! Stream filter interface between the exchange driver and the filters.
//!
//! The driver owns the exchange (headers, buffered body, stream info) and
//! hands it to the filter through the callback traits on every event. A
//! filter answers each event with a status; a `Stop*` status pauses the
//! corresponding direction until the filter calls `continue_*`, sends a
//! local reply, or (encode path only) resets the stream.
//!
//! Asynchronous work is resumed through [`StreamFilter::decode_complete`]
//! and [`StreamFilter::encode_complete`], which the driver awaits whenever
//! a direction is stalled on an in-flight check. A completion is therefore
//! never observed inside the event that started the check.

pub mod authz;
pub mod buffering;
pub mod decoder;
pub mod disposition;
pub mod encoder;

pub use authz::AuthzFilter;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Response, StatusCode, request, response};
use tracing::Span;

use crate::check::{HeaderEntry, Metadata};
use crate::route::Route;

/// Status returned from a headers event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersStatus {
    /// Pass the headers on.
    Continue,
    /// Hold the headers; body frames are still delivered.
    StopIteration,
    /// Hold the headers and every later frame until resumed.
    StopAllIterationAndWatermark,
}

/// Status returned from a data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Pass buffered data and this frame on.
    Continue,
    /// Buffer the frame and keep delivering later frames.
    StopIterationAndBuffer,
    /// Buffer the frame and stop delivering until resumed.
    StopIterationAndWatermark,
}

/// Status returned from a trailers event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailersStatus {
    /// Pass the trailers on.
    Continue,
    /// Hold until resumed.
    StopIteration,
}

/// Status returned from a metadata event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStatus {
    /// Pass the metadata on.
    Continue,
    /// Hold until resumed.
    StopIteration,
}

/// Flags describing why an exchange ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    /// The external authorization service denied the exchange (or failed
    /// closed).
    UnauthorizedExternalService,
    /// The downstream request body exceeded the buffer limit.
    RequestPayloadTooLarge,
    /// No route matched the request.
    NoRouteFound,
}

/// Per-exchange information shared by both directions.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// Dynamic metadata written by earlier processing, by namespace
    pub dynamic_metadata: Metadata,
    /// URL-encoded PEM of the downstream peer certificate
    pub peer_certificate: Option<String>,
    /// Downstream peer address
    pub downstream_address: Option<std::net::SocketAddr>,
    response_flags: Vec<ResponseFlag>,
    response_code_details: Option<&'static str>,
}

impl StreamInfo {
    /// Record a response flag (idempotent).
    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        if !self.response_flags.contains(&flag) {
            self.response_flags.push(flag);
        }
    }

    /// Returns `true` if `flag` was recorded.
    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags.contains(&flag)
    }

    /// All recorded flags, in the order they were first set.
    pub fn response_flags(&self) -> &[ResponseFlag] {
        &self.response_flags
    }

    /// Details string of the locally generated reply, if any.
    pub fn response_code_details(&self) -> Option<&'static str> {
        self.response_code_details
    }

    /// Record the details string of a locally generated reply.
    pub fn set_response_code_details(&mut self, details: &'static str) {
        self.response_code_details = Some(details);
    }
}

/// A reply synthesized by a filter instead of the upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
    /// Reply status
    pub status: StatusCode,
    /// Reply body (`text/plain`)
    pub body: String,
    /// Headers overriding the defaults; repeated names are all kept
    pub headers: Vec<HeaderEntry>,
    /// Constant reason recorded in the stream info
    pub details: &'static str,
}

impl LocalReply {
    /// A reply with an empty body and no extra headers.
    pub fn new(status: StatusCode, details: &'static str) -> Self {
        Self {
            status,
            body: String::new(),
            headers: Vec::new(),
            details,
        }
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the override headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Vec<HeaderEntry>) -> Self {
        self.headers = headers;
        self
    }

    /// Render the reply.
    ///
    /// Every header named in the overrides is first removed from the
    /// defaults, then all overrides are appended, so an override replaces a
    /// default while repeated overrides (e.g. `set-cookie`) all survive.
    pub fn into_response(self) -> Response<Bytes> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        for (name, _) in &self.headers {
            headers.remove(name);
        }
        for (name, value) in self.headers {
            headers.append(name, value);
        }

        let mut response = Response::new(Bytes::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

/// Callbacks available in both directions.
pub trait StreamFilterCallbacks: Send {
    /// The route selected for this exchange (cached until cleared).
    fn route(&mut self) -> Option<Arc<Route>>;

    /// Drop the cached route so the next lookup re-selects it.
    fn clear_route_cache(&mut self);

    /// Request head as received from downstream (after decode mutations).
    fn request_head(&self) -> &request::Parts;

    /// Stream information.
    fn stream_info(&self) -> &StreamInfo;

    /// Mutable stream information.
    fn stream_info_mut(&mut self) -> &mut StreamInfo;

    /// Span of the exchange; check calls are traced as its children.
    fn active_span(&self) -> Span;
}

/// Decode-path callbacks.
pub trait DecoderFilterCallbacks: StreamFilterCallbacks {
    /// Mutable request head.
    fn request_head_mut(&mut self) -> &mut request::Parts;

    /// Body bytes buffered so far, `None` if nothing was buffered.
    fn decoding_buffer(&self) -> Option<&[u8]>;

    /// Append data to the decoding buffer.
    fn add_decoded_data(&mut self, data: Bytes);

    /// Cap the decoding buffer; exceeding it ends the exchange with 413.
    fn set_decoder_buffer_limit(&mut self, limit: usize);

    /// Resume a stopped decode path.
    fn continue_decoding(&mut self);

    /// End the exchange with a synthesized reply.
    fn send_local_reply(&mut self, reply: LocalReply);
}

/// Encode-path callbacks.
pub trait EncoderFilterCallbacks: StreamFilterCallbacks {
    /// Response head from upstream, once received.
    fn response_head(&self) -> Option<&response::Parts>;

    /// Mutable response head.
    fn response_head_mut(&mut self) -> Option<&mut response::Parts>;

    /// Resume a stopped encode path.
    fn continue_encoding(&mut self);

    /// Replace the upstream response with a synthesized reply.
    fn send_local_reply(&mut self, reply: LocalReply);

    /// Abort the exchange without a reply.
    fn reset_stream(&mut self);
}

/// A per-exchange HTTP filter.
///
/// Decode events are mandatory; encode events default to `Continue` so
/// decoder-only filters implement just the first half.
#[async_trait]
pub trait StreamFilter: Send {
    /// Request headers arrived.
    fn decode_headers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        end_stream: bool,
    ) -> HeadersStatus;

    /// A request body frame arrived. The filter may move bytes out of
    /// `data` (e.g. into the decoding buffer).
    fn decode_data(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        data: &mut Bytes,
        end_stream: bool,
    ) -> DataStatus;

    /// Request trailers arrived.
    fn decode_trailers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        trailers: &mut HeaderMap,
    ) -> TrailersStatus;

    /// Request metadata arrived.
    fn decode_metadata(
        &mut self,
        _callbacks: &mut dyn DecoderFilterCallbacks,
        _metadata: &mut Metadata,
    ) -> MetadataStatus {
        MetadataStatus::Continue
    }

    /// Wait for outstanding decode-side work and act on it.
    async fn decode_complete(&mut self, _callbacks: &mut dyn DecoderFilterCallbacks) {}

    /// Informational (1xx) response headers arrived.
    fn encode_1xx_headers(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _headers: &mut HeaderMap,
    ) -> HeadersStatus {
        HeadersStatus::Continue
    }

    /// Response headers arrived (available through the callbacks).
    fn encode_headers(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _end_stream: bool,
    ) -> HeadersStatus {
        HeadersStatus::Continue
    }

    /// A response body frame arrived.
    fn encode_data(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _data: &mut Bytes,
        _end_stream: bool,
    ) -> DataStatus {
        DataStatus::Continue
    }

    /// Response trailers arrived.
    fn encode_trailers(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _trailers: &mut HeaderMap,
    ) -> TrailersStatus {
        TrailersStatus::Continue
    }

    /// Response metadata arrived.
    fn encode_metadata(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _metadata: &mut Metadata,
    ) -> MetadataStatus {
        MetadataStatus::Continue
    }

    /// Wait for outstanding encode-side work and act on it.
    async fn encode_complete(&mut self, _callbacks: &mut dyn EncoderFilterCallbacks) {}

    /// The exchange is over; cancel anything in flight.
    fn on_destroy(&mut self);
}

/// Per-exchange filter constructor.
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn StreamFilter> + Send + Sync>;

#[cfg(test)]
pub(crate) mod test_support;
