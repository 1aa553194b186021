//! Request body buffering policy.
//!
//! With `max_request_bytes > 0` the decode path holds the request until the
//! body is complete (or, with partial messages allowed, until the cap is
//! reached) so the check can carry the body. Upgrades and header-only
//! requests are checked on headers.

use http::header::{CONNECTION, UPGRADE};
use http::{Method, request};

use crate::config::FilterConfig;

/// Buffering decisions for one filter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingController {
    max_bytes: usize,
    allow_partial: bool,
}

impl BufferingController {
    /// Controller with an explicit cap.
    pub fn new(max_bytes: usize, allow_partial: bool) -> Self {
        Self {
            max_bytes,
            allow_partial,
        }
    }

    /// Controller for a filter configuration.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.max_request_len(), config.allow_partial_message())
    }

    /// Cap on body bytes attached to the check.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Should the body be buffered before the check?
    pub fn should_buffer(&self, head: &request::Parts, end_stream: bool) -> bool {
        self.max_bytes > 0 && !(end_stream || is_upgrade_request(head))
    }

    /// Limit to impose on the host's decoding buffer, if any.
    ///
    /// With partial messages allowed the host must keep accepting data past
    /// the cap; the check just carries the first `max_bytes`.
    pub fn decoder_limit(&self) -> Option<usize> {
        (!self.allow_partial).then_some(self.max_bytes)
    }

    /// Would `incoming` more bytes push a strictly capped buffer past the
    /// cap? With partial messages allowed nothing overflows.
    pub fn would_overflow(&self, buffered: Option<&[u8]>, incoming: usize) -> bool {
        !self.allow_partial && buffered.map_or(0, <[u8]>::len) + incoming > self.max_bytes
    }

    /// Has the buffer reached the cap (only meaningful with partial
    /// messages allowed)?
    pub fn is_buffer_full(&self, buffered: Option<&[u8]>) -> bool {
        match buffered {
            Some(buffer) if self.allow_partial => buffer.len() >= self.max_bytes,
            _ => false,
        }
    }
}

/// WebSocket upgrade or HTTP/2 extended CONNECT.
pub fn is_upgrade_request(head: &request::Parts) -> bool {
    is_websocket_upgrade(head) || is_extended_connect(head)
}

fn is_websocket_upgrade(head: &request::Parts) -> bool {
    let connection_upgrade = head.headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    connection_upgrade
        && head
            .headers
            .get(UPGRADE)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

fn is_extended_connect(head: &request::Parts) -> bool {
    head.method == Method::CONNECT && head.extensions.get::<hyper::ext::Protocol>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn head(request: Request<()>) -> request::Parts {
        request.into_parts().0
    }

    #[test]
    fn test_zero_cap_never_buffers() {
        let controller = BufferingController::new(0, false);
        let parts = head(Request::post("/").body(()).unwrap());
        assert!(!controller.should_buffer(&parts, false));
    }

    #[test]
    fn test_end_stream_headers_never_buffer() {
        let controller = BufferingController::new(1024, false);
        let parts = head(Request::post("/").body(()).unwrap());
        assert!(!controller.should_buffer(&parts, true));
        assert!(controller.should_buffer(&parts, false));
    }

    #[test]
    fn test_websocket_upgrade_skips_buffering() {
        let controller = BufferingController::new(1024, false);
        let parts = head(
            Request::get("/ws")
                .header("connection", "keep-alive, Upgrade")
                .header("upgrade", "WebSocket")
                .body(())
                .unwrap(),
        );
        assert!(is_upgrade_request(&parts));
        assert!(!controller.should_buffer(&parts, false));
    }

    #[test]
    fn test_extended_connect_skips_buffering() {
        let mut request = Request::connect("/chat").body(()).unwrap();
        request
            .extensions_mut()
            .insert(hyper::ext::Protocol::from_static("websocket"));
        assert!(is_upgrade_request(&head(request)));

        let plain = Request::connect("example.com:443").body(()).unwrap();
        assert!(!is_upgrade_request(&head(plain)));
    }

    #[test]
    fn test_overflow_counts_the_incoming_frame() {
        let strict = BufferingController::new(4, false);
        assert!(!strict.would_overflow(None, 4));
        assert!(strict.would_overflow(None, 10));
        assert!(strict.would_overflow(Some(&b"0123"[..]), 5));

        let partial = BufferingController::new(4, true);
        assert!(!partial.would_overflow(Some(&b"0123"[..]), 5));
    }

    #[test]
    fn test_buffer_full_only_with_partial() {
        let strict = BufferingController::new(4, false);
        assert!(!strict.is_buffer_full(Some(&b"0123456"[..])));
        assert_eq!(strict.decoder_limit(), Some(4));

        let partial = BufferingController::new(4, true);
        assert!(!partial.is_buffer_full(None));
        assert!(!partial.is_buffer_full(Some(&b"012"[..])));
        assert!(partial.is_buffer_full(Some(&b"0123"[..])));
        assert_eq!(partial.decoder_limit(), None);
    }
}
