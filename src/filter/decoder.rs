//! Decode-path authorization state machine.
//!
//! `NotStarted → Calling → Complete`. The check is issued at most once per
//! exchange: on headers, or once buffering finishes on the final data frame,
//! a full buffer, or trailers. While `Calling`, every decode event is held.

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use tracing::{debug, trace, warn};

use super::buffering::BufferingController;
use super::disposition::{Disposition, apply_allowed};
use super::{
    DataStatus, DecoderFilterCallbacks, HeadersStatus, ResponseFlag, StreamFilterCallbacks,
    TrailersStatus,
};
use crate::check::{
    CheckClient, CheckError, CheckRequest, CheckResponse, ContextExtensions, Direction, Metadata,
    PendingCheck, dispatch,
};
use crate::config::{FilterConfig, FilterConfigPerRoute};
use crate::route::Route;

/// Lifecycle of one direction's check.
#[derive(Debug)]
pub(crate) enum Phase {
    NotStarted,
    Calling(PendingCheck),
    Complete,
}

impl Phase {
    pub(crate) fn is_calling(&self) -> bool {
        matches!(self, Phase::Calling(_))
    }
}

/// Route-derived skip decision: no route, a direct-response route, or an
/// explicit `disabled` override.
pub(crate) fn skip_check_for_route(route: Option<&Route>, filter_name: &str) -> bool {
    let Some(route) = route else {
        return true;
    };
    if route.cluster().is_none() {
        return true;
    }
    route
        .most_specific::<FilterConfigPerRoute>(filter_name)
        .is_some_and(FilterConfigPerRoute::disabled)
}

/// Context extensions, filtered metadata and peer certificate for a check.
pub(crate) fn stream_context(
    callbacks: &mut dyn StreamFilterCallbacks,
    route: Option<&Route>,
    config: &FilterConfig,
    filter_name: &str,
) -> (ContextExtensions, Metadata, Option<String>) {
    let context_extensions = route
        .and_then(|r| {
            r.merged::<FilterConfigPerRoute, _>(filter_name, |base, more| base.merge(more))
        })
        .map(|mut merged| merged.take_context_extensions())
        .unwrap_or_default();

    let info = callbacks.stream_info();
    let metadata = config
        .metadata_context_namespaces()
        .iter()
        .filter_map(|ns| {
            info.dynamic_metadata
                .get(ns)
                .map(|value| (ns.clone(), value.clone()))
        })
        .collect();

    let peer_certificate = if config.include_peer_certificate() {
        info.peer_certificate.clone()
    } else {
        None
    };
    (context_extensions, metadata, peer_certificate)
}

/// Authorizes the request before it is forwarded upstream.
pub struct RequestAuthorizer {
    config: Arc<FilterConfig>,
    client: Arc<dyn CheckClient>,
    filter_name: Arc<str>,
    buffering: BufferingController,
    phase: Phase,
    skip_check: bool,
    buffer_data: bool,
}

impl RequestAuthorizer {
    /// Create the machine for one exchange.
    pub fn new(config: Arc<FilterConfig>, client: Arc<dyn CheckClient>, filter_name: Arc<str>) -> Self {
        let buffering = BufferingController::from_config(&config);
        Self {
            config,
            client,
            filter_name,
            buffering,
            phase: Phase::NotStarted,
            skip_check: false,
            buffer_data: false,
        }
    }

    /// Returns `true` while a check is in flight.
    pub fn is_calling(&self) -> bool {
        self.phase.is_calling()
    }

    /// Returns `true` once the check finished (or the exchange was torn down).
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// Request headers.
    pub fn decode_headers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        end_stream: bool,
    ) -> HeadersStatus {
        let route = callbacks.route();
        self.skip_check = skip_check_for_route(route.as_deref(), &self.filter_name);
        if !self.config.filter_enabled() || self.skip_check {
            trace!(skip_check = self.skip_check, "request authorization skipped");
            self.skip_check = true;
            return HeadersStatus::Continue;
        }

        self.buffer_data = self.buffering.should_buffer(callbacks.request_head(), end_stream);
        if self.buffer_data {
            debug!("buffering the request before authorization");
            if let Some(limit) = self.buffering.decoder_limit() {
                callbacks.set_decoder_buffer_limit(limit);
            }
            return HeadersStatus::StopIteration;
        }

        self.initiate_call(callbacks, route.as_deref());
        self.headers_status()
    }

    /// A request body frame.
    pub fn decode_data(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        data: &mut Bytes,
        end_stream: bool,
    ) -> DataStatus {
        match self.phase {
            Phase::Calling(_) => return DataStatus::StopIterationAndBuffer,
            Phase::Complete => return DataStatus::Continue,
            Phase::NotStarted => {}
        }
        if !self.buffer_data || self.skip_check {
            return DataStatus::Continue;
        }

        let buffered = callbacks.decoding_buffer();
        if self.buffering.would_overflow(buffered, data.len()) {
            // The host's buffer limit rejects the frame with 413; the check
            // never sees a truncated body.
            debug!(incoming = data.len(), "request body exceeds the buffer limit");
            return DataStatus::StopIterationAndBuffer;
        }
        let buffer_is_full = self.buffering.is_buffer_full(buffered);
        if !(end_stream || buffer_is_full) {
            return DataStatus::StopIterationAndBuffer;
        }
        debug!(
            reason = if buffer_is_full { "buffer is full" } else { "stream ended" },
            "finished buffering the request"
        );
        if !buffer_is_full {
            // The final frame must be part of the checked body.
            callbacks.add_decoded_data(std::mem::take(data));
        }
        let route = callbacks.route();
        self.initiate_call(callbacks, route.as_deref());
        if self.phase.is_calling() {
            DataStatus::StopIterationAndWatermark
        } else {
            DataStatus::Continue
        }
    }

    /// Request trailers; a body that never ended is checked now.
    pub fn decode_trailers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        _trailers: &mut HeaderMap,
    ) -> TrailersStatus {
        if self.phase.is_calling() {
            return TrailersStatus::StopIteration;
        }
        if !self.buffer_data || self.skip_check {
            return TrailersStatus::Continue;
        }
        if matches!(self.phase, Phase::NotStarted) {
            debug!("finished buffering the request on trailers");
            let route = callbacks.route();
            self.initiate_call(callbacks, route.as_deref());
        }
        if self.phase.is_calling() {
            TrailersStatus::StopIteration
        } else {
            TrailersStatus::Continue
        }
    }

    /// Wait for the in-flight check and apply its outcome.
    pub async fn complete(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) {
        let Phase::Calling(pending) = &mut self.phase else {
            return;
        };
        let result = pending.outcome().await;
        self.phase = Phase::Complete;
        let response = match result {
            Ok(response) => response,
            Err(CheckError::Cancelled) => return,
            Err(err) => {
                warn!(error = %err, "request authorization check failed");
                CheckResponse::error()
            }
        };
        self.on_complete(callbacks, response);
    }

    /// Cancel an in-flight check; no outcome is applied afterwards.
    pub fn on_destroy(&mut self) {
        if let Phase::Calling(pending) = &mut self.phase {
            pending.cancel();
        }
        if !matches!(self.phase, Phase::NotStarted) {
            self.phase = Phase::Complete;
        }
    }

    fn headers_status(&self) -> HeadersStatus {
        if self.phase.is_calling() {
            HeadersStatus::StopAllIterationAndWatermark
        } else {
            HeadersStatus::Continue
        }
    }

    fn initiate_call(&mut self, callbacks: &mut dyn DecoderFilterCallbacks, route: Option<&Route>) {
        if !matches!(self.phase, Phase::NotStarted) {
            return;
        }

        let (context_extensions, metadata_context, peer_certificate) =
            stream_context(callbacks, route, &self.config, &self.filter_name);
        let head = callbacks.request_head();
        let mut request = CheckRequest::new(Direction::Request, head.headers.clone())
            .with_body(callbacks.decoding_buffer(), self.buffering.max_bytes());
        request.attributes.method = Some(head.method.clone());
        request.attributes.path = head.uri.path_and_query().map(|pq| pq.as_str().to_string());
        request.attributes.host = head
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                head.headers
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        request.context_extensions = context_extensions;
        request.metadata_context = metadata_context;
        request.peer_certificate = peer_certificate;

        trace!("calling the authorization service for the request");
        let span = callbacks.active_span();
        self.phase = Phase::Calling(dispatch(self.client.clone(), request, &span));
    }

    fn on_complete(&mut self, callbacks: &mut dyn DecoderFilterCallbacks, response: CheckResponse) {
        match Disposition::decide(response, &self.config) {
            Disposition::Allow {
                headers_to_add,
                headers_to_append,
            } => {
                trace!(
                    added = headers_to_add.len(),
                    appended = headers_to_append.len(),
                    "request allowed"
                );
                apply_allowed(
                    callbacks,
                    &self.config,
                    |cb| Some(&mut cb.request_head_mut().headers),
                    &headers_to_add,
                    &headers_to_append,
                );
                callbacks.continue_decoding();
            }
            Disposition::FailureModeAllow => {
                trace!("request allowed after a failed check (failure_mode_allow)");
                callbacks.continue_decoding();
            }
            Disposition::Deny(reply) | Disposition::Fail(reply) => {
                trace!(status = %reply.status, details = reply.details, "request rejected");
                callbacks
                    .stream_info_mut()
                    .set_response_flag(ResponseFlag::UnauthorizedExternalService);
                callbacks.send_local_reply(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::disposition::{DENIED_DETAILS, ERROR_DETAILS};
    use crate::filter::test_support::{MockCallbacks, ScriptedClient};
    use crate::route::PathMatch;
    use http::{HeaderName, HeaderValue, Request, StatusCode};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    const FILTER: &str = "authgate.filters.http.ext_authz";

    fn route() -> Arc<Route> {
        Arc::new(Route::new("all", PathMatch::Prefix("/".into()), Some("backend".into())))
    }

    fn callbacks() -> MockCallbacks {
        MockCallbacks::new(
            Some(route()),
            Request::post("http://api.local/v1/items?x=1")
                .header("authorization", "Bearer t")
                .body(())
                .unwrap(),
        )
    }

    fn machine(config: FilterConfig, client: Arc<ScriptedClient>) -> RequestAuthorizer {
        RequestAuthorizer::new(Arc::new(config), client, Arc::from(FILTER))
    }

    fn ok_client() -> Arc<ScriptedClient> {
        ScriptedClient::new(Ok(CheckResponse::ok()))
    }

    #[tokio::test]
    async fn test_zero_cap_checks_on_headers() {
        let client = ok_client();
        let mut machine = machine(FilterConfig::builder().build().unwrap(), client.clone());
        let mut cb = callbacks();

        let status = machine.decode_headers(&mut cb, false);
        assert_eq!(status, HeadersStatus::StopAllIterationAndWatermark);
        assert!(machine.is_calling());
        // Never completed within the event that issued the check.
        assert_eq!(cb.decode_continued, 0);

        machine.complete(&mut cb).await;
        assert_eq!(cb.decode_continued, 1);
        assert_eq!(client.call_count(), 1);

        let sent = client.last_call();
        assert_eq!(sent.direction, Direction::Request);
        assert_eq!(sent.attributes.path.as_deref(), Some("/v1/items?x=1"));
        assert_eq!(sent.attributes.host.as_deref(), Some("api.local"));
        assert!(sent.body.is_none());
    }

    #[tokio::test]
    async fn test_n_chunks_issue_exactly_one_check_after_last() {
        let client = ok_client();
        let config = FilterConfig::builder().max_request_bytes(1024).build().unwrap();
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        assert_eq!(machine.decode_headers(&mut cb, false), HeadersStatus::StopIteration);
        assert_eq!(cb.buffer_limit, Some(1024));

        for chunk in ["a", "b", "c"] {
            let mut data = Bytes::from(chunk);
            assert_eq!(
                machine.decode_data(&mut cb, &mut data, false),
                DataStatus::StopIterationAndBuffer
            );
            cb.add_decoded_data(data);
            assert!(!machine.is_calling());
        }

        let mut last = Bytes::from_static(b"d");
        assert_eq!(
            machine.decode_data(&mut cb, &mut last, true),
            DataStatus::StopIterationAndWatermark
        );
        assert!(last.is_empty());

        machine.complete(&mut cb).await;
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.last_call().body.as_deref(), Some(&b"abcd"[..]));
        assert!(!client.last_call().partial_body);
        assert_eq!(cb.decode_continued, 1);

        // Later frames pass; no second check.
        let mut more = Bytes::from_static(b"e");
        assert_eq!(machine.decode_data(&mut cb, &mut more, true), DataStatus::Continue);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_final_frame_is_never_checked() {
        let client = ok_client();
        let config = FilterConfig::builder().max_request_bytes(4).build().unwrap();
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, false);

        let mut first = Bytes::from_static(b"0123");
        assert_eq!(
            machine.decode_data(&mut cb, &mut first, false),
            DataStatus::StopIterationAndBuffer
        );
        cb.add_decoded_data(first);

        let mut last = Bytes::from_static(b"45678");
        assert_eq!(
            machine.decode_data(&mut cb, &mut last, true),
            DataStatus::StopIterationAndBuffer
        );
        // The frame is handed back for the host to reject.
        assert_eq!(last, Bytes::from_static(b"45678"));
        assert!(!machine.is_calling());
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_end_stream_headers_check_immediately() {
        let client = ok_client();
        let config = FilterConfig::builder().max_request_bytes(1024).build().unwrap();
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        assert_eq!(
            machine.decode_headers(&mut cb, true),
            HeadersStatus::StopAllIterationAndWatermark
        );
        assert!(cb.buffer_limit.is_none());
        machine.complete(&mut cb).await;
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_message_checks_when_buffer_full() {
        let client = ok_client();
        let config = FilterConfig::builder()
            .max_request_bytes(4)
            .allow_partial_message(true)
            .build()
            .unwrap();
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        assert_eq!(machine.decode_headers(&mut cb, false), HeadersStatus::StopIteration);
        assert!(cb.buffer_limit.is_none());

        cb.add_decoded_data(Bytes::from_static(b"012345"));
        let mut data = Bytes::from_static(b"6789");
        assert_eq!(
            machine.decode_data(&mut cb, &mut data, false),
            DataStatus::StopIterationAndWatermark
        );
        // The full-buffer path leaves the frame to the host.
        assert_eq!(data, Bytes::from_static(b"6789"));

        machine.complete(&mut cb).await;
        let sent = client.last_call();
        assert_eq!(sent.body.as_deref(), Some(&b"0123"[..]));
        assert!(sent.partial_body);
    }

    #[tokio::test]
    async fn test_trailers_force_the_check() {
        let client = ok_client();
        let config = FilterConfig::builder().max_request_bytes(1024).build().unwrap();
        let mut machine = machine(config, client.clone());
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, false);
        let mut data = Bytes::from_static(b"body");
        machine.decode_data(&mut cb, &mut data, false);
        cb.add_decoded_data(data);

        let mut trailers = HeaderMap::new();
        assert_eq!(
            machine.decode_trailers(&mut cb, &mut trailers),
            TrailersStatus::StopIteration
        );
        machine.complete(&mut cb).await;
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.last_call().body.as_deref(), Some(&b"body"[..]));
        assert_eq!(
            machine.decode_trailers(&mut cb, &mut trailers),
            TrailersStatus::Continue
        );
    }

    #[tokio::test]
    async fn test_events_stall_while_calling() {
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient::gated(Ok(CheckResponse::ok()), gate.clone());
        let mut machine = machine(FilterConfig::builder().build().unwrap(), client.clone());
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, false);
        let mut data = Bytes::from_static(b"x");
        assert_eq!(
            machine.decode_data(&mut cb, &mut data, false),
            DataStatus::StopIterationAndBuffer
        );
        assert_eq!(
            machine.decode_trailers(&mut cb, &mut HeaderMap::new()),
            TrailersStatus::StopIteration
        );
        assert_eq!(cb.decode_continued, 0);

        gate.notify_one();
        machine.complete(&mut cb).await;
        assert_eq!(cb.decode_continued, 1);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ok_mutations_and_route_cache() {
        let response = CheckResponse::ok()
            .add_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer internal"),
            )
            .append_header(
                HeaderName::from_static("x-missing"),
                HeaderValue::from_static("1"),
            );
        let client = ScriptedClient::new(Ok(response));
        let config = FilterConfig::builder().clear_route_cache(true).build().unwrap();
        let mut machine = machine(config, client);
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, true);
        machine.complete(&mut cb).await;

        assert_eq!(cb.request.headers.get("authorization").unwrap(), "Bearer internal");
        assert!(cb.request.headers.get("x-missing").is_none());
        assert_eq!(cb.route_cache_cleared, 1);
    }

    #[tokio::test]
    async fn test_denied_sends_reply_and_flags_stream() {
        let response = CheckResponse::denied(StatusCode::UNAUTHORIZED).with_body("no");
        let client = ScriptedClient::new(Ok(response));
        let mut machine = machine(FilterConfig::builder().build().unwrap(), client);
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, true);
        machine.complete(&mut cb).await;

        assert_eq!(cb.decode_continued, 0);
        assert_eq!(cb.local_replies.len(), 1);
        assert_eq!(cb.local_replies[0].status, StatusCode::UNAUTHORIZED);
        assert_eq!(cb.local_replies[0].details, DENIED_DETAILS);
        assert!(
            cb.info
                .has_response_flag(ResponseFlag::UnauthorizedExternalService)
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_closed_with_status_on_error() {
        let client = ScriptedClient::new(Err(CheckError::Timeout {
            timeout: Duration::from_millis(200),
        }));
        let config = FilterConfig::builder().status_on_error(503).build().unwrap();
        let mut machine = machine(config, client);
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, true);
        machine.complete(&mut cb).await;

        assert_eq!(cb.decode_continued, 0);
        assert_eq!(cb.local_replies[0].status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(cb.local_replies[0].details, ERROR_DETAILS);
    }

    #[tokio::test]
    async fn test_failure_mode_allow_resumes_like_ok() {
        let client = ScriptedClient::new(Err(CheckError::Transport {
            details: "refused".into(),
        }));
        let config = FilterConfig::builder().failure_mode_allow(true).build().unwrap();
        let stats = config.stats().clone();
        let mut machine = machine(config, client);
        let mut cb = callbacks();
        let before = cb.request.headers.clone();

        machine.decode_headers(&mut cb, true);
        machine.complete(&mut cb).await;

        assert_eq!(cb.decode_continued, 1);
        assert!(cb.local_replies.is_empty());
        assert_eq!(cb.request.headers, before);
        assert_eq!(stats.failure_mode_allowed.get(), 1);
    }

    #[tokio::test]
    async fn test_destroy_while_calling_discards_outcome() {
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient::gated(
            Ok(CheckResponse::denied(StatusCode::FORBIDDEN)),
            gate.clone(),
        );
        let mut machine = machine(FilterConfig::builder().build().unwrap(), client);
        let mut cb = callbacks();

        machine.decode_headers(&mut cb, true);
        machine.on_destroy();
        gate.notify_one();
        tokio::task::yield_now().await;

        machine.complete(&mut cb).await;
        assert!(machine.is_complete());
        assert!(cb.local_replies.is_empty());
        assert_eq!(cb.decode_continued, 0);
    }

    #[test]
    fn test_skip_check_for_route() {
        assert!(skip_check_for_route(None, FILTER));

        let direct = Route::new("direct", PathMatch::Prefix("/".into()), None);
        assert!(skip_check_for_route(Some(&direct), FILTER));

        let disabled = Route::new("r", PathMatch::Prefix("/".into()), Some("c".into()))
            .with_virtual_host_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(false, BTreeMap::new())),
            )
            .with_filter_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(true, BTreeMap::new())),
            );
        assert!(skip_check_for_route(Some(&disabled), FILTER));

        let reenabled = Route::new("r", PathMatch::Prefix("/".into()), Some("c".into()))
            .with_virtual_host_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(true, BTreeMap::new())),
            )
            .with_filter_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(false, BTreeMap::new())),
            );
        assert!(!skip_check_for_route(Some(&reenabled), FILTER));
    }

    #[tokio::test]
    async fn test_disabled_route_skips_and_never_calls() {
        let client = ok_client();
        let route = Arc::new(
            Route::new("r", PathMatch::Prefix("/".into()), Some("c".into())).with_filter_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(true, BTreeMap::new())),
            ),
        );
        let mut cb = MockCallbacks::new(Some(route), Request::get("/").body(()).unwrap());
        let mut machine = machine(FilterConfig::builder().build().unwrap(), client.clone());

        assert_eq!(machine.decode_headers(&mut cb, true), HeadersStatus::Continue);
        let mut data = Bytes::from_static(b"x");
        assert_eq!(machine.decode_data(&mut cb, &mut data, true), DataStatus::Continue);
        tokio::task::yield_now().await;
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_context_extensions_and_metadata_forwarded() {
        let client = ok_client();
        let route = Arc::new(
            Route::new("r", PathMatch::Prefix("/".into()), Some("c".into()))
                .with_virtual_host_config(
                    FILTER,
                    Arc::new(FilterConfigPerRoute::new(
                        false,
                        BTreeMap::from([("a".to_string(), "1".to_string())]),
                    )),
                )
                .with_filter_config(
                    FILTER,
                    Arc::new(FilterConfigPerRoute::new(
                        false,
                        BTreeMap::from([("b".to_string(), "2".to_string())]),
                    )),
                ),
        );
        let mut cb = MockCallbacks::new(Some(route), Request::get("/").body(()).unwrap());
        cb.info
            .dynamic_metadata
            .insert("jwt".to_string(), serde_json::json!({ "sub": "alice" }));
        cb.info
            .dynamic_metadata
            .insert("other".to_string(), serde_json::json!({ "x": 1 }));
        cb.info.peer_certificate = Some("-----BEGIN%20CERT".to_string());

        let config = FilterConfig::builder()
            .metadata_context_namespaces(vec!["jwt".to_string()])
            .include_peer_certificate(true)
            .build()
            .unwrap();
        let mut machine = machine(config, client.clone());
        machine.decode_headers(&mut cb, true);
        machine.complete(&mut cb).await;

        let sent = client.last_call();
        assert_eq!(sent.context_extensions.len(), 2);
        assert_eq!(sent.metadata_context.len(), 1);
        assert!(sent.metadata_context.contains_key("jwt"));
        assert_eq!(sent.peer_certificate.as_deref(), Some("-----BEGIN%20CERT"));
    }
}
