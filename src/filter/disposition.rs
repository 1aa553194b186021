//! Shared reaction to a check outcome.
//!
//! | outcome | failure_mode_allow | result                              |
//! |---------|--------------------|-------------------------------------|
//! | OK      | -                  | apply header mutations, resume      |
//! | Denied  | -                  | reply with the service's status     |
//! | Error   | true               | resume (counted separately)         |
//! | Error   | false              | reply with `status_on_error`        |

use http::HeaderMap;
use tracing::debug;

use super::{LocalReply, StreamFilterCallbacks};
use crate::check::{CheckResponse, CheckStatus, HeaderEntry};
use crate::config::FilterConfig;

/// Details recorded when the service denies the exchange.
pub const DENIED_DETAILS: &str = "ext_authz_denied";

/// Details recorded when the check fails and the filter fails closed.
pub const ERROR_DETAILS: &str = "ext_authz_error";

/// What the acting direction does with a check outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Apply the mutations and resume.
    Allow {
        /// Set (replace or insert)
        headers_to_add: Vec<HeaderEntry>,
        /// Append only where the header already exists
        headers_to_append: Vec<HeaderEntry>,
    },
    /// The check failed but failure-mode-allow lets the exchange through.
    FailureModeAllow,
    /// The service denied the exchange.
    Deny(LocalReply),
    /// The check failed and the filter fails closed.
    Fail(LocalReply),
}

impl Disposition {
    /// Decide and count the outcome.
    pub fn decide(response: CheckResponse, config: &FilterConfig) -> Self {
        let stats = config.stats();
        match response.status {
            CheckStatus::Ok => {
                stats.ok.inc();
                Disposition::Allow {
                    headers_to_add: response.headers_to_add,
                    headers_to_append: response.headers_to_append,
                }
            }
            CheckStatus::Denied => {
                stats.denied.inc();
                Disposition::Deny(
                    LocalReply::new(response.status_code, DENIED_DETAILS)
                        .with_body(response.body)
                        .with_headers(response.headers_to_add),
                )
            }
            CheckStatus::Error => {
                stats.error.inc();
                if config.failure_mode_allow() {
                    stats.failure_mode_allowed.inc();
                    Disposition::FailureModeAllow
                } else {
                    Disposition::Fail(LocalReply::new(config.status_on_error(), ERROR_DETAILS))
                }
            }
        }
    }

}

/// OK-path side effects shared by both directions: clear the cached route
/// when configured and mutations are pending, then mutate `headers`.
pub fn apply_allowed<C>(
    callbacks: &mut C,
    config: &FilterConfig,
    headers: impl FnOnce(&mut C) -> Option<&mut HeaderMap>,
    add: &[HeaderEntry],
    append: &[HeaderEntry],
) where
    C: StreamFilterCallbacks + ?Sized,
{
    if config.clear_route_cache() && !(add.is_empty() && append.is_empty()) {
        debug!("clearing route cache after header mutations");
        callbacks.clear_route_cache();
    }
    if let Some(headers) = headers(callbacks) {
        apply_header_mutations(headers, add, append);
    }
}

/// Apply OK-path header mutations to a live header map.
///
/// `add` entries replace any existing values; `append` entries add a value
/// only to headers that are already present.
pub fn apply_header_mutations(headers: &mut HeaderMap, add: &[HeaderEntry], append: &[HeaderEntry]) {
    for (name, value) in add {
        headers.insert(name.clone(), value.clone());
    }
    for (name, value) in append {
        if headers.contains_key(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::MockCallbacks;
    use http::{HeaderName, HeaderValue, Request, StatusCode};

    fn config(failure_mode_allow: bool) -> FilterConfig {
        FilterConfig::builder()
            .failure_mode_allow(failure_mode_allow)
            .status_on_error(503)
            .build()
            .unwrap()
    }

    fn entry(name: &'static str, value: &'static str) -> HeaderEntry {
        (HeaderName::from_static(name), HeaderValue::from_static(value))
    }

    #[test]
    fn test_ok_allows_with_mutations() {
        let config = config(false);
        let response = CheckResponse::ok().add_header(
            HeaderName::from_static("x-user"),
            HeaderValue::from_static("alice"),
        );
        let disposition = Disposition::decide(response, &config);
        assert_eq!(
            disposition,
            Disposition::Allow {
                headers_to_add: vec![entry("x-user", "alice")],
                headers_to_append: vec![],
            }
        );
        assert_eq!(config.stats().ok.get(), 1);
    }

    #[test]
    fn test_denied_carries_status_body_and_headers() {
        let config = config(true);
        let response = CheckResponse::denied(StatusCode::UNAUTHORIZED)
            .with_body("login")
            .add_header(
                HeaderName::from_static("www-authenticate"),
                HeaderValue::from_static("Bearer"),
            );
        let Disposition::Deny(reply) = Disposition::decide(response, &config) else {
            panic!("expected denial");
        };
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.body, "login");
        assert_eq!(reply.details, DENIED_DETAILS);
        assert_eq!(config.stats().denied.get(), 1);
        assert_eq!(config.stats().failure_mode_allowed.get(), 0);
    }

    #[test]
    fn test_error_fails_closed_with_status_on_error() {
        let config = config(false);
        let disposition = Disposition::decide(CheckResponse::error(), &config);
        assert_eq!(
            disposition,
            Disposition::Fail(LocalReply::new(StatusCode::SERVICE_UNAVAILABLE, ERROR_DETAILS))
        );
        assert_eq!(config.stats().error.get(), 1);
    }

    #[test]
    fn test_error_with_failure_mode_allow_resumes() {
        let config = config(true);
        let disposition = Disposition::decide(CheckResponse::error(), &config);
        assert_eq!(disposition, Disposition::FailureModeAllow);
        assert_eq!(config.stats().error.get(), 1);
        assert_eq!(config.stats().failure_mode_allowed.get(), 1);
    }

    #[test]
    fn test_header_mutations() {
        let mut headers = HeaderMap::new();
        headers.insert("x-a", HeaderValue::from_static("old"));
        headers.insert("x-b", HeaderValue::from_static("1"));

        apply_header_mutations(
            &mut headers,
            &[entry("x-a", "new"), entry("x-c", "3")],
            &[entry("x-b", "2"), entry("x-missing", "9")],
        );

        assert_eq!(headers.get_all("x-a").iter().count(), 1);
        assert_eq!(headers.get("x-a").unwrap(), "new");
        assert_eq!(headers.get_all("x-b").iter().count(), 2);
        assert_eq!(headers.get("x-c").unwrap(), "3");
        assert!(!headers.contains_key("x-missing"));
    }

    #[test]
    fn test_allowed_clears_route_cache_only_with_mutations() {
        let config = FilterConfig::builder().clear_route_cache(true).build().unwrap();
        let mut cb = MockCallbacks::new(None, Request::get("/").body(()).unwrap());

        apply_allowed(&mut cb, &config, |cb| Some(&mut cb.request.headers), &[], &[]);
        assert_eq!(cb.route_cache_cleared, 0);

        apply_allowed(
            &mut cb,
            &config,
            |cb| Some(&mut cb.request.headers),
            &[entry("x-user", "alice")],
            &[],
        );
        assert_eq!(cb.route_cache_cleared, 1);
        assert_eq!(cb.request.headers.get("x-user").unwrap(), "alice");
    }
}
