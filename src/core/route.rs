//! Ordered route table.
//!
//! Routes are evaluated top to bottom in registration order and the first
//! matching predicate wins. Matching is pure: it only reads the request line
//! and headers and never touches breakers, pools or the registry.
use std::{sync::Arc, time::Duration};

use hyper::{HeaderMap, Method, header::HeaderName};
use regex::Regex;

use crate::{
    config::{LoadBalanceStrategy, RouteConfig, ServerConfig},
    core::{
        circuit_breaker::{BreakerSettings, CircuitBreaker},
        error::{GatewayError, GatewayResult},
        fallback::Fallback,
    },
};

/// Request matcher for a single route.
#[derive(Debug, Clone)]
pub struct RoutePredicate {
    path_prefix: String,
    path_regex: Option<Regex>,
    methods: Vec<Method>,
    headers: Vec<(HeaderName, Regex)>,
}

impl RoutePredicate {
    /// Match any request whose path starts with `prefix` on a segment boundary.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: prefix.into(),
            path_regex: None,
            methods: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_path_regex(mut self, regex: Regex) -> Self {
        self.path_regex = Some(regex);
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: Regex) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    fn from_config(config: &RouteConfig) -> GatewayResult<Self> {
        let invalid = |what: &str, e: &dyn std::fmt::Display| {
            GatewayError::Configuration(format!("route '{}' {what}: {e}", config.name))
        };

        let mut predicate = Self::prefix(config.path.clone());
        if let Some(pattern) = &config.path_regex {
            predicate.path_regex = Some(Regex::new(pattern).map_err(|e| invalid("path_regex", &e))?);
        }
        predicate.methods = config
            .methods
            .iter()
            .map(|m| {
                m.to_ascii_uppercase()
                    .parse::<Method>()
                    .map_err(|e| invalid("method", &e))
            })
            .collect::<GatewayResult<_>>()?;

        let mut headers: Vec<_> = config.headers.iter().collect();
        headers.sort();
        for (name, pattern) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid("header", &e))?;
            let value = Regex::new(pattern).map_err(|e| invalid("header regex", &e))?;
            predicate.headers.push((name, value));
        }
        Ok(predicate)
    }

    fn matches_prefix(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        if prefix.is_empty() || prefix == "/" {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
            None => false,
        }
    }

    /// Whether the request line and headers satisfy every condition.
    pub fn matches(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if !self.matches_prefix(path) {
            return false;
        }
        if let Some(regex) = &self.path_regex {
            if !regex.is_match(path) {
                return false;
            }
        }
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        self.headers.iter().all(|(name, regex)| {
            headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| regex.is_match(v))
        })
    }
}

/// A compiled route: predicate, target service and its resilience policy.
///
/// Each route owns its circuit breaker; the breaker lives and dies with the
/// route table that contains it.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub predicate: RoutePredicate,
    pub service: String,
    pub strategy: LoadBalanceStrategy,
    pub hash_header: Option<HeaderName>,
    pub strip_prefix: usize,
    pub breaker: CircuitBreaker,
    pub fallback: Fallback,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Route {
    /// Build a round-robin route with default breaker settings and the
    /// generic fallback.
    pub fn new(name: impl Into<String>, predicate: RoutePredicate, service: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), BreakerSettings::default()),
            name,
            predicate,
            service: service.into(),
            strategy: LoadBalanceStrategy::RoundRobin,
            hash_header: None,
            strip_prefix: 0,
            fallback: Fallback::generic(),
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
        }
    }

    /// Compile a route entry, resolving its breaker policy, fallback and
    /// timeouts against the rest of `server`.
    pub fn from_config(config: &RouteConfig, server: &ServerConfig) -> GatewayResult<Self> {
        let breaker_config = server.breaker_for(config).ok_or_else(|| {
            GatewayError::Configuration(format!(
                "route '{}' references unknown circuit breaker '{}'",
                config.name, config.circuit_breaker
            ))
        })?;
        let settings = BreakerSettings::from_config(breaker_config)?;

        let fallback = match &config.fallback {
            Some(name) => {
                let fallback_config = server.fallbacks.get(name).ok_or_else(|| {
                    GatewayError::Configuration(format!(
                        "route '{}' references unknown fallback '{name}'",
                        config.name
                    ))
                })?;
                Fallback::from_config(fallback_config)?
            }
            None => Fallback::generic(),
        };

        let hash_header = config
            .load_balance
            .hash_header
            .as_deref()
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes()).map_err(|e| {
                    GatewayError::Configuration(format!(
                        "route '{}' hash_header: {e}",
                        config.name
                    ))
                })
            })
            .transpose()?;

        let to_config_error = |e: crate::config::ValidationError| GatewayError::Configuration(e.to_string());

        Ok(Self {
            name: config.name.clone(),
            predicate: RoutePredicate::from_config(config)?,
            service: config.service.clone(),
            strategy: config.load_balance.strategy,
            hash_header,
            strip_prefix: config.strip_prefix as usize,
            breaker: CircuitBreaker::new(config.name.clone(), settings),
            fallback,
            connect_timeout: config
                .connect_timeout(&server.upstream)
                .map_err(to_config_error)?,
            response_timeout: config
                .response_timeout(&server.upstream)
                .map_err(to_config_error)?,
        })
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = CircuitBreaker::new(self.name.clone(), settings);
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_strip_prefix(mut self, segments: usize) -> Self {
        self.strip_prefix = segments;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, response: Duration) -> Self {
        self.connect_timeout = connect;
        self.response_timeout = response;
        self
    }

    /// Path forwarded upstream, with the configured number of leading
    /// segments removed.
    pub fn upstream_path(&self, path: &str) -> String {
        if self.strip_prefix == 0 {
            return path.to_string();
        }
        let rest: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(self.strip_prefix)
            .collect();
        let mut stripped = format!("/{}", rest.join("/"));
        if path.ends_with('/') && !rest.is_empty() {
            stripped.push('/');
        }
        stripped
    }
}

/// Immutable, ordered list of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Compile every route of `config`, in order.
    pub fn from_config(config: &ServerConfig) -> GatewayResult<Self> {
        let routes = config
            .routes
            .iter()
            .map(|route| Route::from_config(route, config))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    /// First route whose predicate matches, if any.
    pub fn find(&self, method: &Method, path: &str, headers: &HeaderMap) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.predicate.matches(method, path, headers))
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
