//! In-memory host for driving filters in unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{Request, Response, StatusCode, request, response};
use tokio::sync::Notify;
use tracing::Span;

use super::{
    DecoderFilterCallbacks, EncoderFilterCallbacks, LocalReply, StreamFilterCallbacks, StreamInfo,
};
use crate::check::{CheckClient, CheckError, CheckRequest, CheckResponse};
use crate::route::Route;

/// Records every callback a filter makes.
pub(crate) struct MockCallbacks {
    pub route: Option<Arc<Route>>,
    pub route_cache_cleared: usize,
    pub request: request::Parts,
    pub response: Option<response::Parts>,
    pub buffer: Option<BytesMut>,
    pub buffer_limit: Option<usize>,
    pub decode_continued: usize,
    pub encode_continued: usize,
    pub local_replies: Vec<LocalReply>,
    pub resets: usize,
    pub info: StreamInfo,
}

impl MockCallbacks {
    pub fn new(route: Option<Arc<Route>>, request: Request<()>) -> Self {
        Self {
            route,
            route_cache_cleared: 0,
            request: request.into_parts().0,
            response: None,
            buffer: None,
            buffer_limit: None,
            decode_continued: 0,
            encode_continued: 0,
            local_replies: Vec::new(),
            resets: 0,
            info: StreamInfo::default(),
        }
    }

    pub fn set_response(&mut self, status: StatusCode) {
        let mut response = Response::new(());
        *response.status_mut() = status;
        self.response = Some(response.into_parts().0);
    }
}

impl StreamFilterCallbacks for MockCallbacks {
    fn route(&mut self) -> Option<Arc<Route>> {
        self.route.clone()
    }

    fn clear_route_cache(&mut self) {
        self.route_cache_cleared += 1;
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
        Span::none()
    }
}

impl DecoderFilterCallbacks for MockCallbacks {
    fn request_head_mut(&mut self) -> &mut request::Parts {
        &mut self.request
    }

    fn decoding_buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    fn add_decoded_data(&mut self, data: Bytes) {
        self.buffer.get_or_insert_with(BytesMut::new).extend_from_slice(&data);
    }

    fn set_decoder_buffer_limit(&mut self, limit: usize) {
        self.buffer_limit = Some(limit);
    }

    fn continue_decoding(&mut self) {
        self.decode_continued += 1;
    }

    fn send_local_reply(&mut self, reply: LocalReply) {
        self.info.set_response_code_details(reply.details);
        self.local_replies.push(reply);
    }
}

impl EncoderFilterCallbacks for MockCallbacks {
    fn response_head(&self) -> Option<&response::Parts> {
        self.response.as_ref()
    }

    fn response_head_mut(&mut self) -> Option<&mut response::Parts> {
        self.response.as_mut()
    }

    fn continue_encoding(&mut self) {
        self.encode_continued += 1;
    }

    fn send_local_reply(&mut self, reply: LocalReply) {
        self.info.set_response_code_details(reply.details);
        self.local_replies.push(reply);
    }

    fn reset_stream(&mut self) {
        self.resets += 1;
    }
}

/// Check client answering from a fixed script.
pub(crate) struct ScriptedClient {
    pub result: Result<CheckResponse, CheckError>,
    pub calls: std::sync::Mutex<Vec<CheckRequest>>,
    pub gate: Option<Arc<Notify>>,
}

impl ScriptedClient {
    pub fn new(result: Result<CheckResponse, CheckError>) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: std::sync::Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(result: Result<CheckResponse, CheckError>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: std::sync::Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> CheckRequest {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl CheckClient for ScriptedClient {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, CheckError> {
        self.calls.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result.clone()
    }
}
