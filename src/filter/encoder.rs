//! Encode-path authorization state machine.
//!
//! Mirrors the decode path but acts on the upstream response: the check is
//! issued on response headers, everything after them is held while it runs,
//! and the outcome either mutates the response headers and resumes or
//! rejects the response according to [`ResponseDenialMode`].

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use tracing::{debug, trace, warn};

use super::decoder::{Phase, skip_check_for_route, stream_context};
use super::disposition::{Disposition, apply_allowed};
use super::{
    DataStatus, EncoderFilterCallbacks, HeadersStatus, LocalReply, MetadataStatus, ResponseFlag,
    TrailersStatus,
};
use crate::check::{CheckClient, CheckError, CheckRequest, CheckResponse, Direction, Metadata, dispatch};
use crate::config::{FilterConfig, ResponseDenialMode};

/// Authorizes the upstream response before it is sent downstream.
pub struct ResponseAuthorizer {
    config: Arc<FilterConfig>,
    client: Arc<dyn CheckClient>,
    filter_name: Arc<str>,
    phase: Phase,
}

impl ResponseAuthorizer {
    /// Create the machine for one exchange.
    pub fn new(config: Arc<FilterConfig>, client: Arc<dyn CheckClient>, filter_name: Arc<str>) -> Self {
        Self {
            config,
            client,
            filter_name,
            phase: Phase::NotStarted,
        }
    }

    /// Returns `true` while a check is in flight.
    pub fn is_calling(&self) -> bool {
        self.phase.is_calling()
    }

    /// Informational headers are held while the check runs.
    pub fn encode_1xx_headers(&mut self) -> HeadersStatus {
        if self.phase.is_calling() {
            HeadersStatus::StopAllIterationAndWatermark
        } else {
            HeadersStatus::Continue
        }
    }

    /// Response headers; issues the check unless the route opts out.
    pub fn encode_headers(
        &mut self,
        callbacks: &mut dyn EncoderFilterCallbacks,
        _end_stream: bool,
    ) -> HeadersStatus {
        if !matches!(self.phase, Phase::NotStarted) {
            return HeadersStatus::Continue;
        }
        let route = callbacks.route();
        if skip_check_for_route(route.as_deref(), &self.filter_name)
            || !self.config.intercept_response()
            || !self.config.filter_enabled()
        {
            trace!("response authorization skipped");
            self.phase = Phase::Complete;
            return HeadersStatus::Continue;
        }
        let Some(response) = callbacks.response_head() else {
            self.phase = Phase::Complete;
            return HeadersStatus::Continue;
        };
        let headers = response.headers.clone();
        let status = response.status;

        let (context_extensions, metadata_context, peer_certificate) =
            stream_context(callbacks, route.as_deref(), &self.config, &self.filter_name);
        let head = callbacks.request_head();
        let mut request = CheckRequest::new(Direction::Response, headers);
        request.attributes.method = Some(head.method.clone());
        request.attributes.path = head.uri.path_and_query().map(|pq| pq.as_str().to_string());
        request.attributes.host = head.uri.authority().map(|a| a.as_str().to_string());
        request.attributes.status = Some(status);
        request.context_extensions = context_extensions;
        request.metadata_context = metadata_context;
        request.peer_certificate = peer_certificate;

        trace!(%status, "calling the authorization service for the response");
        let span = callbacks.active_span();
        self.phase = Phase::Calling(dispatch(self.client.clone(), request, &span));
        HeadersStatus::StopAllIterationAndWatermark
    }

    /// A response body frame.
    pub fn encode_data(&mut self, _data: &mut Bytes, _end_stream: bool) -> DataStatus {
        if self.phase.is_calling() {
            DataStatus::StopIterationAndWatermark
        } else {
            DataStatus::Continue
        }
    }

    /// Response trailers.
    pub fn encode_trailers(&mut self, _trailers: &mut HeaderMap) -> TrailersStatus {
        if self.phase.is_calling() {
            TrailersStatus::StopIteration
        } else {
            TrailersStatus::Continue
        }
    }

    /// Response metadata.
    pub fn encode_metadata(&mut self, _metadata: &mut Metadata) -> MetadataStatus {
        if self.phase.is_calling() {
            MetadataStatus::StopIteration
        } else {
            MetadataStatus::Continue
        }
    }

    /// Wait for the in-flight check and apply its outcome.
    pub async fn complete(&mut self, callbacks: &mut dyn EncoderFilterCallbacks) {
        let Phase::Calling(pending) = &mut self.phase else {
            return;
        };
        let result = pending.outcome().await;
        self.phase = Phase::Complete;
        let response = match result {
            Ok(response) => response,
            Err(CheckError::Cancelled) => return,
            Err(err) => {
                warn!(error = %err, "response authorization check failed");
                CheckResponse::error()
            }
        };

        match Disposition::decide(response, &self.config) {
            Disposition::Allow {
                headers_to_add,
                headers_to_append,
            } => {
                trace!(
                    added = headers_to_add.len(),
                    appended = headers_to_append.len(),
                    "response allowed"
                );
                apply_allowed(
                    callbacks,
                    &self.config,
                    |cb| cb.response_head_mut().map(|head| &mut head.headers),
                    &headers_to_add,
                    &headers_to_append,
                );
                callbacks.continue_encoding();
            }
            Disposition::FailureModeAllow => callbacks.continue_encoding(),
            Disposition::Deny(reply) | Disposition::Fail(reply) => {
                self.reject(callbacks, reply);
            }
        }
    }

    /// Cancel an in-flight check; no outcome is applied afterwards.
    pub fn on_destroy(&mut self) {
        if let Phase::Calling(pending) = &mut self.phase {
            pending.cancel();
        }
        self.phase = Phase::Complete;
    }

    fn reject(&self, callbacks: &mut dyn EncoderFilterCallbacks, reply: LocalReply) {
        callbacks
            .stream_info_mut()
            .set_response_flag(ResponseFlag::UnauthorizedExternalService);
        match self.config.response_denial() {
            ResponseDenialMode::LocalReply => {
                debug!(status = %reply.status, "replacing the upstream response");
                callbacks.send_local_reply(reply);
            }
            ResponseDenialMode::ResetStream => {
                debug!("resetting the stream after a rejected response");
                callbacks.stream_info_mut().set_response_code_details(reply.details);
                callbacks.reset_stream();
            }
            ResponseDenialMode::Stall => {
                // Neither continue nor reply: the host drains and resets.
                debug!("holding a rejected response");
                callbacks.stream_info_mut().set_response_code_details(reply.details);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{MockCallbacks, ScriptedClient};
    use crate::route::{PathMatch, Route};
    use http::{HeaderName, HeaderValue, Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::Notify;

    const FILTER: &str = "authgate.filters.http.ext_authz";

    fn callbacks() -> MockCallbacks {
        let route = Arc::new(Route::new(
            "all",
            PathMatch::Prefix("/".into()),
            Some("backend".into()),
        ));
        let mut cb = MockCallbacks::new(
            Some(route),
            Request::get("http://api.local/report").body(()).unwrap(),
        );
        cb.set_response(StatusCode::OK);
        cb
    }

    fn config(mode: ResponseDenialMode) -> Arc<FilterConfig> {
        Arc::new(
            FilterConfig::builder()
                .intercept_response(true)
                .response_denial(mode)
                .build()
                .unwrap(),
        )
    }

    fn machine(config: Arc<FilterConfig>, client: Arc<ScriptedClient>) -> ResponseAuthorizer {
        ResponseAuthorizer::new(config, client, Arc::from(FILTER))
    }

    #[tokio::test]
    async fn test_allowed_response_gets_mutated_headers() {
        let client = ScriptedClient::new(Ok(CheckResponse::ok().add_header(
            HeaderName::from_static("x-checked"),
            HeaderValue::from_static("yes"),
        )));
        let mut machine = machine(config(ResponseDenialMode::LocalReply), client.clone());
        let mut cb = callbacks();

        assert_eq!(
            machine.encode_headers(&mut cb, false),
            HeadersStatus::StopAllIterationAndWatermark
        );
        machine.complete(&mut cb).await;

        assert_eq!(cb.encode_continued, 1);
        let head = cb.response.as_ref().unwrap();
        assert_eq!(head.headers.get("x-checked").unwrap(), "yes");

        let sent = client.last_call();
        assert_eq!(sent.direction, Direction::Response);
        assert_eq!(sent.attributes.status, Some(StatusCode::OK));
        assert_eq!(sent.attributes.path.as_deref(), Some("/report"));
    }

    #[tokio::test]
    async fn test_ok_mutations_and_route_cache() {
        let response = CheckResponse::ok()
            .add_header(
                HeaderName::from_static("cache-control"),
                HeaderValue::from_static("no-store"),
            )
            .append_header(
                HeaderName::from_static("x-missing"),
                HeaderValue::from_static("1"),
            );
        let client = ScriptedClient::new(Ok(response));
        let config = Arc::new(
            FilterConfig::builder()
                .intercept_response(true)
                .clear_route_cache(true)
                .build()
                .unwrap(),
        );
        let mut machine = machine(config, client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        machine.complete(&mut cb).await;

        let head = cb.response.as_ref().unwrap();
        assert_eq!(head.headers.get("cache-control").unwrap(), "no-store");
        assert!(head.headers.get("x-missing").is_none());
        assert_eq!(cb.route_cache_cleared, 1);
        assert_eq!(cb.encode_continued, 1);
    }

    #[tokio::test]
    async fn test_ok_without_mutations_keeps_route_cache() {
        let client = ScriptedClient::new(Ok(CheckResponse::ok()));
        let config = Arc::new(
            FilterConfig::builder()
                .intercept_response(true)
                .clear_route_cache(true)
                .build()
                .unwrap(),
        );
        let mut machine = machine(config, client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        machine.complete(&mut cb).await;

        assert_eq!(cb.route_cache_cleared, 0);
        assert_eq!(cb.encode_continued, 1);
    }

    #[tokio::test]
    async fn test_everything_after_headers_is_held() {
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient::gated(Ok(CheckResponse::ok()), gate.clone());
        let mut machine = machine(config(ResponseDenialMode::LocalReply), client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        assert_eq!(machine.encode_1xx_headers(), HeadersStatus::StopAllIterationAndWatermark);
        let mut data = Bytes::from_static(b"x");
        assert_eq!(
            machine.encode_data(&mut data, false),
            DataStatus::StopIterationAndWatermark
        );
        assert_eq!(
            machine.encode_trailers(&mut HeaderMap::new()),
            TrailersStatus::StopIteration
        );
        assert_eq!(
            machine.encode_metadata(&mut Metadata::new()),
            MetadataStatus::StopIteration
        );

        gate.notify_one();
        machine.complete(&mut cb).await;
        assert_eq!(machine.encode_data(&mut data, true), DataStatus::Continue);
    }

    #[tokio::test]
    async fn test_denied_response_replaced_by_local_reply() {
        let client = ScriptedClient::new(Ok(
            CheckResponse::denied(StatusCode::FORBIDDEN).with_body("redacted")
        ));
        let mut machine = machine(config(ResponseDenialMode::LocalReply), client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        machine.complete(&mut cb).await;

        assert_eq!(cb.encode_continued, 0);
        assert_eq!(cb.local_replies.len(), 1);
        assert_eq!(cb.local_replies[0].body, "redacted");
        assert!(
            cb.info
                .has_response_flag(ResponseFlag::UnauthorizedExternalService)
        );
    }

    #[tokio::test]
    async fn test_denied_response_resets_stream() {
        let client = ScriptedClient::new(Ok(CheckResponse::denied(StatusCode::FORBIDDEN)));
        let mut machine = machine(config(ResponseDenialMode::ResetStream), client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        machine.complete(&mut cb).await;

        assert_eq!(cb.resets, 1);
        assert!(cb.local_replies.is_empty());
    }

    #[tokio::test]
    async fn test_denied_response_stalls() {
        let client = ScriptedClient::new(Ok(CheckResponse::denied(StatusCode::FORBIDDEN)));
        let mut machine = machine(config(ResponseDenialMode::Stall), client);
        let mut cb = callbacks();

        machine.encode_headers(&mut cb, false);
        machine.complete(&mut cb).await;

        assert_eq!(cb.resets, 0);
        assert_eq!(cb.encode_continued, 0);
        assert!(cb.local_replies.is_empty());
        assert_eq!(cb.info.response_code_details(), Some("ext_authz_denied"));
    }

    #[tokio::test]
    async fn test_interception_off_passes_through() {
        let client = ScriptedClient::new(Ok(CheckResponse::denied(StatusCode::FORBIDDEN)));
        let config = Arc::new(FilterConfig::builder().build().unwrap());
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        assert_eq!(machine.encode_headers(&mut cb, false), HeadersStatus::Continue);
        machine.complete(&mut cb).await;
        assert_eq!(client.call_count(), 0);
        assert!(cb.local_replies.is_empty());
    }
}
