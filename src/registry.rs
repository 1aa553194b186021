//! Filter registry: type tags to constructors.
//!
//! A filter type contributes two functions: one turning its typed config
//! into a per-exchange [`FilterFactory`], and one parsing its per-route
//! override into an opaque [`PerFilterConfig`]. Both run at load time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::FilterConfigPerRoute;
use crate::config::file::{ExtAuthzFile, ExtAuthzPerRouteFile, ScopeAuthzFile};
use crate::error::ConfigError;
use crate::filter::{AuthzFilter, FilterFactory};
use crate::metrics::{AuthzStats, ScopeStats};
use crate::route::PerFilterConfig;
use crate::scope::{ScopeConfig, ScopeFilter};

/// Type tag of the external authorization filter.
pub const EXT_AUTHZ: &str = "authgate.filters.http.ext_authz";

/// Type tag of the scope authorization filter.
pub const SCOPE_AUTHZ: &str = "authgate.filters.http.scope_authz";

/// Process resources available to filter constructors.
pub struct FactoryContext<'a> {
    /// Registry the filter's counters are exported from
    pub registry: &'a prometheus::Registry,
}

/// Builds the per-exchange factory from a filter's typed config.
pub type CreateFilterFn = fn(&Value, &FactoryContext<'_>) -> Result<FilterFactory, ConfigError>;

/// Parses a filter's per-route override.
pub type ParseRouteConfigFn = fn(&Value) -> Result<PerFilterConfig, ConfigError>;

#[derive(Clone, Copy)]
struct Entry {
    create: CreateFilterFn,
    parse_route_config: Option<ParseRouteConfigFn>,
}

/// Registered filter types.
#[derive(Default, Clone)]
pub struct FilterRegistry {
    entries: HashMap<String, Entry>,
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in filters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EXT_AUTHZ, create_ext_authz, Some(parse_ext_authz_route));
        registry.register(SCOPE_AUTHZ, create_scope_authz, None);
        registry
    }

    /// Register (or replace) a filter type.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        create: CreateFilterFn,
        parse_route_config: Option<ParseRouteConfigFn>,
    ) {
        self.entries.insert(
            tag.into(),
            Entry {
                create,
                parse_route_config,
            },
        );
    }

    /// Returns `true` if `tag` is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Build the factory for a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFilter`] for an unregistered tag, or
    /// whatever the filter's constructor rejects.
    pub fn create(
        &self,
        tag: &str,
        config: &Value,
        context: &FactoryContext<'_>,
    ) -> Result<FilterFactory, ConfigError> {
        let entry = self.entry(tag)?;
        let factory = (entry.create)(config, context)?;
        info!(filter = tag, "filter configured");
        Ok(factory)
    }

    /// Parse a per-route override for a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFilter`] for an unregistered tag and
    /// [`ConfigError::Invalid`] when the filter takes no overrides or the
    /// value does not parse.
    pub fn parse_route_config(&self, tag: &str, config: &Value) -> Result<PerFilterConfig, ConfigError> {
        let entry = self.entry(tag)?;
        match entry.parse_route_config {
            Some(parse) => parse(config),
            None => Err(ConfigError::invalid(
                format!("per_filter_config.{tag}"),
                "filter does not accept per-route overrides",
            )),
        }
    }

    fn entry(&self, tag: &str) -> Result<&Entry, ConfigError> {
        self.entries
            .get(tag)
            .ok_or_else(|| ConfigError::UnknownFilter {
                name: tag.to_string(),
            })
    }
}

fn create_ext_authz(config: &Value, context: &FactoryContext<'_>) -> Result<FilterFactory, ConfigError> {
    let file: ExtAuthzFile = serde_json::from_value(config.clone())?;
    let request_client = file
        .request_service()?
        .build()
        .map_err(|e| ConfigError::invalid("http_service", e.to_string()))?;
    let response_client = file
        .response_service()?
        .map(|service| service.build())
        .transpose()
        .map_err(|e| ConfigError::invalid("response", e.to_string()))?;
    let stats = AuthzStats::register(&file.stat_prefix, context.registry)?;
    let filter_config = Arc::new(file.to_filter_config(stats)?);
    Ok(AuthzFilter::factory(
        filter_config,
        request_client,
        response_client,
        EXT_AUTHZ,
    ))
}

fn parse_ext_authz_route(config: &Value) -> Result<PerFilterConfig, ConfigError> {
    let file: ExtAuthzPerRouteFile = serde_json::from_value(config.clone())?;
    Ok(Arc::new(FilterConfigPerRoute::from(file)))
}

fn create_scope_authz(config: &Value, context: &FactoryContext<'_>) -> Result<FilterFactory, ConfigError> {
    let file: ScopeAuthzFile = serde_json::from_value(config.clone())?;
    let stats = ScopeStats::register(&file.stat_prefix, context.registry)?;
    let scope_config = ScopeConfig::from_file(&file, stats)?;
    Ok(ScopeFilter::factory(Arc::new(scope_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ext_authz_config(prefix: &str) -> Value {
        json!({
            "http_service": { "server_uri": { "uri": "http://127.0.0.1:9", "timeout": "50ms" } },
            "stat_prefix": prefix,
        })
    }

    #[test]
    fn test_unknown_tag() {
        let registry = FilterRegistry::with_builtin();
        let prom = prometheus::Registry::new();
        let context = FactoryContext { registry: &prom };
        let err = registry
            .create("authgate.filters.http.nope", &json!({}), &context)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownFilter { .. }));
    }

    #[tokio::test]
    async fn test_ext_authz_builds_and_registers_counters() {
        let registry = FilterRegistry::with_builtin();
        let prom = prometheus::Registry::new();
        let context = FactoryContext { registry: &prom };

        let factory = registry
            .create(EXT_AUTHZ, &ext_authz_config("edge."), &context)
            .unwrap();
        let _filter = factory();
        let mut out = String::new();
        prometheus::TextEncoder::new()
            .encode_utf8(&prom.gather(), &mut out)
            .unwrap();
        assert!(out.contains("edge_ext_authz_ok 0"));

        // The same prefix twice collides.
        let err = registry
            .create(EXT_AUTHZ, &ext_authz_config("edge."), &context)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Metrics { .. }));
    }

    #[test]
    fn test_ext_authz_rejects_missing_backend() {
        let registry = FilterRegistry::with_builtin();
        let prom = prometheus::Registry::new();
        let context = FactoryContext { registry: &prom };
        let err = registry.create(EXT_AUTHZ, &json!({}), &context).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_route_config_parsing() {
        let registry = FilterRegistry::with_builtin();
        let parsed = registry
            .parse_route_config(
                EXT_AUTHZ,
                &json!({ "disabled": false, "check_settings": { "context_extensions": { "k": "v" } } }),
            )
            .unwrap();
        let per_route = parsed.downcast_ref::<FilterConfigPerRoute>().unwrap();
        assert_eq!(per_route.context_extensions().get("k").map(String::as_str), Some("v"));

        assert!(registry.parse_route_config(SCOPE_AUTHZ, &json!({})).is_err());
        assert!(
            registry
                .parse_route_config(EXT_AUTHZ, &json!({ "bogus": 1 }))
                .is_err()
        );
    }
}
