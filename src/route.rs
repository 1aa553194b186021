//! Route table and per-route filter configuration lookup.
//!
//! A virtual host is selected by the request authority, then the first
//! route whose path matcher accepts the request. Filters attach typed
//! override configs to routes and virtual hosts under their own name; the
//! lookups below resolve them with route-over-virtual-host precedence.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use regex::Regex;

use crate::config::file::{PathMatchFile, RouteFile, VirtualHostFile};
use crate::error::ConfigError;
use crate::registry::FilterRegistry;

/// Opaque per-filter override, downcast by the owning filter.
pub type PerFilterConfig = Arc<dyn Any + Send + Sync>;

/// Path matcher shared by routes and scope rules.
#[derive(Debug, Clone)]
pub enum PathMatch {
    /// Path starts with the prefix
    Prefix(String),
    /// Path equals the value
    Path(String),
    /// Whole path matches the expression
    Regex(Regex),
}

impl PathMatch {
    /// Build a matcher from its file form; exactly one field must be set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if zero or several matchers are
    /// set, or the regex does not compile.
    pub fn from_file(file: &PathMatchFile, field: &str) -> Result<Self, ConfigError> {
        match (&file.prefix, &file.path, &file.regex) {
            (Some(prefix), None, None) => Ok(PathMatch::Prefix(prefix.clone())),
            (None, Some(path), None) => Ok(PathMatch::Path(path.clone())),
            (None, None, Some(regex)) => Regex::new(&format!("^(?:{regex})$"))
                .map(PathMatch::Regex)
                .map_err(|e| ConfigError::invalid(format!("{field}.regex"), e.to_string())),
            _ => Err(ConfigError::invalid(
                field,
                "exactly one of prefix, path or regex is required",
            )),
        }
    }

    /// Returns `true` if `path` (without query) is accepted.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatch::Path(exact) => path == exact,
            PathMatch::Regex(regex) => regex.is_match(path),
        }
    }
}

/// Fixed reply for routes that do not proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    /// Reply status
    pub status: StatusCode,
    /// Reply body
    pub body: Bytes,
}

/// A selected route.
pub struct Route {
    name: String,
    matcher: PathMatch,
    cluster: Option<String>,
    direct_response: Option<DirectResponse>,
    per_filter_config: HashMap<String, PerFilterConfig>,
    virtual_host_config: HashMap<String, PerFilterConfig>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Create a route with no filter overrides.
    pub fn new(name: impl Into<String>, matcher: PathMatch, cluster: Option<String>) -> Self {
        Self {
            name: name.into(),
            matcher,
            cluster,
            direct_response: None,
            per_filter_config: HashMap::new(),
            virtual_host_config: HashMap::new(),
        }
    }

    /// Attach a route-level override for `filter`.
    #[must_use]
    pub fn with_filter_config(mut self, filter: impl Into<String>, config: PerFilterConfig) -> Self {
        self.per_filter_config.insert(filter.into(), config);
        self
    }

    /// Attach a virtual-host-level override for `filter`.
    #[must_use]
    pub fn with_virtual_host_config(
        mut self,
        filter: impl Into<String>,
        config: PerFilterConfig,
    ) -> Self {
        self.virtual_host_config.insert(filter.into(), config);
        self
    }

    /// Reply with a fixed response instead of proxying.
    #[must_use]
    pub fn with_direct_response(mut self, response: DirectResponse) -> Self {
        self.direct_response = Some(response);
        self
    }

    /// Route name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upstream cluster; `None` for direct-response routes.
    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Fixed reply, if any.
    pub fn direct_response(&self) -> Option<&DirectResponse> {
        self.direct_response.as_ref()
    }

    /// The most specific override of type `T` for `filter`: the route's
    /// own, else the virtual host's.
    pub fn most_specific<T: Any>(&self, filter: &str) -> Option<&T> {
        self.per_filter_config
            .get(filter)
            .and_then(|c| c.downcast_ref::<T>())
            .or_else(|| {
                self.virtual_host_config
                    .get(filter)
                    .and_then(|c| c.downcast_ref::<T>())
            })
    }

    /// Fold the virtual-host and route overrides, least specific first.
    ///
    /// Returns `None` when neither level carries a `T` for `filter`.
    pub fn merged<T, F>(&self, filter: &str, merge: F) -> Option<T>
    where
        T: Any + Clone,
        F: Fn(&mut T, &T),
    {
        let levels = [
            self.virtual_host_config.get(filter),
            self.per_filter_config.get(filter),
        ];
        let mut merged: Option<T> = None;
        for config in levels.into_iter().flatten() {
            let Some(config) = config.downcast_ref::<T>() else {
                continue;
            };
            match merged.as_mut() {
                Some(base) => merge(base, config),
                None => merged = Some(config.clone()),
            }
        }
        merged
    }

    fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }
}

/// Virtual host: a domain set and its ordered routes.
#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    domains: Vec<String>,
    routes: Vec<Arc<Route>>,
}

impl VirtualHost {
    /// Create a virtual host.
    pub fn new(name: impl Into<String>, domains: Vec<String>, routes: Vec<Route>) -> Self {
        Self {
            name: name.into(),
            domains: domains.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Virtual host name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable table of virtual hosts.
#[derive(Debug, Default)]
pub struct RouteTable {
    virtual_hosts: Vec<VirtualHost>,
}

impl RouteTable {
    /// Create a table from virtual hosts.
    pub fn new(virtual_hosts: Vec<VirtualHost>) -> Self {
        Self { virtual_hosts }
    }

    /// Build the table from its file form, parsing per-filter overrides
    /// through the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for invalid matchers or overrides of
    /// unknown filters.
    pub fn from_file(
        virtual_hosts: &[VirtualHostFile],
        registry: &FilterRegistry,
    ) -> Result<Self, ConfigError> {
        let mut built = Vec::with_capacity(virtual_hosts.len());
        for (vh_index, vh) in virtual_hosts.iter().enumerate() {
            let vh_field = format!("virtual_hosts[{vh_index}]");
            let mut vh_config = HashMap::new();
            for (filter, value) in &vh.per_filter_config {
                vh_config.insert(filter.clone(), registry.parse_route_config(filter, value)?);
            }

            let mut routes = Vec::with_capacity(vh.routes.len());
            for (index, route) in vh.routes.iter().enumerate() {
                let field = format!("{vh_field}.routes[{index}]");
                routes.push(route_from_file(route, &field, registry, &vh_config)?);
            }
            built.push(VirtualHost::new(vh.name.clone(), vh.domains.clone(), routes));
        }
        Ok(Self::new(built))
    }

    /// Select the route for an authority and path.
    pub fn select(&self, host: Option<&str>, path: &str) -> Option<Arc<Route>> {
        let host = host.map(strip_port).unwrap_or_default().to_ascii_lowercase();
        let vh = self.select_virtual_host(&host)?;
        vh.routes.iter().find(|r| r.matches(path)).cloned()
    }

    fn select_virtual_host(&self, host: &str) -> Option<&VirtualHost> {
        let exact = self
            .virtual_hosts
            .iter()
            .find(|vh| vh.domains.iter().any(|d| d == host));
        if exact.is_some() {
            return exact;
        }

        let mut best: Option<(&VirtualHost, usize)> = None;
        for vh in &self.virtual_hosts {
            for domain in &vh.domains {
                let Some(suffix) = domain.strip_prefix('*') else {
                    continue;
                };
                if suffix.is_empty() || !host.ends_with(suffix) || host.len() == suffix.len() {
                    continue;
                }
                if best.is_none_or(|(_, len)| suffix.len() > len) {
                    best = Some((vh, suffix.len()));
                }
            }
        }
        if let Some((vh, _)) = best {
            return Some(vh);
        }

        self.virtual_hosts
            .iter()
            .find(|vh| vh.domains.iter().any(|d| d == "*"))
    }
}

fn route_from_file(
    file: &RouteFile,
    field: &str,
    registry: &FilterRegistry,
    vh_config: &HashMap<String, PerFilterConfig>,
) -> Result<Route, ConfigError> {
    let matcher = PathMatch::from_file(&file.matcher, &format!("{field}.match"))?;
    let name = file.name.clone().unwrap_or_else(|| field.to_string());
    let mut route = Route::new(name, matcher, file.cluster.clone());
    if let Some(direct) = &file.direct_response {
        let status = StatusCode::from_u16(direct.status).map_err(|e| {
            ConfigError::invalid(format!("{field}.direct_response.status"), e.to_string())
        })?;
        route = route.with_direct_response(DirectResponse {
            status,
            body: Bytes::from(direct.body.clone()),
        });
    }
    for (filter, value) in &file.per_filter_config {
        route = route.with_filter_config(filter.clone(), registry.parse_route_config(filter, value)?);
    }
    for (filter, config) in vh_config {
        route = route.with_virtual_host_config(filter.clone(), config.clone());
    }
    Ok(route)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(v6, _)| &host[..=v6.len()]);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfigPerRoute;
    use std::collections::BTreeMap;

    const FILTER: &str = "authgate.filters.http.ext_authz";

    fn ext(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn table() -> RouteTable {
        RouteTable::new(vec![
            VirtualHost::new(
                "api",
                vec!["api.example.com".to_string()],
                vec![
                    Route::new("health", PathMatch::Path("/healthz".into()), None),
                    Route::new("all", PathMatch::Prefix("/".into()), Some("backend".into())),
                ],
            ),
            VirtualHost::new(
                "wildcard",
                vec!["*.example.com".to_string()],
                vec![Route::new("wild", PathMatch::Prefix("/".into()), Some("b".into()))],
            ),
            VirtualHost::new(
                "default",
                vec!["*".to_string()],
                vec![Route::new("fallback", PathMatch::Prefix("/".into()), Some("c".into()))],
            ),
        ])
    }

    #[test]
    fn test_select_prefers_exact_domain_and_first_route() {
        let table = table();
        let route = table.select(Some("api.example.com:8443"), "/healthz").unwrap();
        assert_eq!(route.name(), "health");
        assert!(route.cluster().is_none());

        let route = table.select(Some("API.example.com"), "/v1").unwrap();
        assert_eq!(route.name(), "all");
    }

    #[test]
    fn test_select_wildcards() {
        let table = table();
        assert_eq!(table.select(Some("www.example.com"), "/").unwrap().name(), "wild");
        assert_eq!(table.select(Some("other.org"), "/").unwrap().name(), "fallback");
        assert_eq!(table.select(None, "/").unwrap().name(), "fallback");
    }

    #[test]
    fn test_select_no_match() {
        let table = RouteTable::new(vec![VirtualHost::new(
            "only",
            vec!["a.com".to_string()],
            vec![Route::new("x", PathMatch::Prefix("/x".into()), None)],
        )]);
        assert!(table.select(Some("b.com"), "/x").is_none());
        assert!(table.select(Some("a.com"), "/y").is_none());
    }

    #[test]
    fn test_most_specific_prefers_route() {
        let route = Route::new("r", PathMatch::Prefix("/".into()), Some("c".into()))
            .with_virtual_host_config(FILTER, Arc::new(FilterConfigPerRoute::new(true, ext(&[]))))
            .with_filter_config(FILTER, Arc::new(FilterConfigPerRoute::new(false, ext(&[]))));

        let config = route.most_specific::<FilterConfigPerRoute>(FILTER).unwrap();
        assert!(!config.disabled());
        assert!(route.most_specific::<FilterConfigPerRoute>("other").is_none());
    }

    #[test]
    fn test_merged_folds_virtual_host_then_route() {
        let route = Route::new("r", PathMatch::Prefix("/".into()), Some("c".into()))
            .with_virtual_host_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(true, ext(&[("a", "1"), ("b", "2")]))),
            )
            .with_filter_config(
                FILTER,
                Arc::new(FilterConfigPerRoute::new(false, ext(&[("b", "3"), ("c", "4")]))),
            );

        let merged = route
            .merged::<FilterConfigPerRoute, _>(FILTER, |base, more| base.merge(more))
            .unwrap();
        assert!(!merged.disabled());
        assert_eq!(
            merged.context_extensions(),
            &ext(&[("a", "1"), ("b", "3"), ("c", "4")])
        );
    }

    #[test]
    fn test_path_match_regex_is_anchored() {
        let matcher = PathMatch::from_file(
            &PathMatchFile {
                regex: Some("/v[0-9]+/items".to_string()),
                ..PathMatchFile::default()
            },
            "match",
        )
        .unwrap();
        assert!(matcher.matches("/v2/items"));
        assert!(!matcher.matches("/v2/items/7"));
    }

    #[test]
    fn test_path_match_requires_exactly_one() {
        let err = PathMatch::from_file(&PathMatchFile::default(), "rules[0].match").unwrap_err();
        assert!(err.to_string().contains("rules[0].match"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.com:80"), "a.com");
        assert_eq!(strip_port("a.com"), "a.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}
