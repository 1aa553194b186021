//! Request matchers for scope rules.

use http::{HeaderName, request};

use crate::config::file::{HeaderMatchFile, RuleMatchFile};
use crate::config::file::parse_name;
use crate::error::ConfigError;
use crate::route::PathMatch;

/// Header condition of a rule.
#[derive(Debug, Clone)]
pub struct HeaderMatch {
    name: HeaderName,
    exact: Option<String>,
    invert: bool,
}

impl HeaderMatch {
    /// Match `name`, by exact value when given, otherwise by presence.
    pub fn new(name: HeaderName, exact: Option<String>, invert: bool) -> Self {
        Self {
            name,
            exact,
            invert,
        }
    }

    fn from_file(file: &HeaderMatchFile, field: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(
            parse_name(&file.name, field)?,
            file.exact.clone(),
            file.invert,
        ))
    }

    /// Exact value (any occurrence) or presence, optionally inverted.
    pub fn matches(&self, head: &request::Parts) -> bool {
        let mut values = head.headers.get_all(&self.name).iter();
        let hit = match &self.exact {
            Some(exact) => values.any(|v| v.as_bytes() == exact.as_bytes()),
            None => values.next().is_some(),
        };
        hit != self.invert
    }
}

/// Path plus header conditions; all must hold.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    path: PathMatch,
    headers: Vec<HeaderMatch>,
}

impl RequestMatcher {
    /// Matcher over a path condition and header conditions.
    pub fn new(path: PathMatch, headers: Vec<HeaderMatch>) -> Self {
        Self { path, headers }
    }

    /// Build from the rule's file form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a bad path matcher or header name.
    pub fn from_file(file: &RuleMatchFile, field: &str) -> Result<Self, ConfigError> {
        let path = PathMatch::from_file(&file.path_match(), field)?;
        let headers = file
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| HeaderMatch::from_file(h, &format!("{field}.headers[{i}]")))
            .collect::<Result<_, _>>()?;
        Ok(Self::new(path, headers))
    }

    /// Does the request satisfy every condition?
    pub fn matches(&self, head: &request::Parts) -> bool {
        self.path.matches(head.uri.path()) && self.headers.iter().all(|h| h.matches(head))
    }
}
