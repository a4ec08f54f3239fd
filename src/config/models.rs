//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs remain concise.
//! Durations are humantime strings ("500ms", "5s", "5m") and are parsed when the
//! runtime objects are built.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::validation::{ValidationError, ValidationResult};

/// Name of the breaker policy every route falls back to.
pub const DEFAULT_BREAKER: &str = "default";

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_breaker_name() -> String {
    DEFAULT_BREAKER.to_string()
}

fn default_weight() -> u32 {
    1
}

/// Parse a humantime duration, naming `field` in the error.
pub fn parse_duration(field: &str, value: &str) -> ValidationResult<Duration> {
    humantime::parse_duration(value).map_err(|e| ValidationError::InvalidField {
        field: field.to_string(),
        message: format!("'{value}' is not a valid duration: {e}"),
    })
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Named breaker policies. A `default` entry is added when absent.
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    #[serde(default)]
    pub fallbacks: HashMap<String, FallbackConfig>,
    /// Routes in evaluation order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Ensure the `default` breaker policy exists.
    pub fn normalize(mut self) -> Self {
        self.circuit_breakers
            .entry(DEFAULT_BREAKER.to_string())
            .or_default();
        self
    }

    /// Resolve the breaker policy a route refers to.
    pub fn breaker_for(&self, route: &RouteConfig) -> Option<&CircuitBreakerConfig> {
        self.circuit_breakers.get(&route.circuit_breaker)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            logging: LoggingConfig::default(),
            registry: RegistryConfig::default(),
            upstream: UpstreamConfig::default(),
            circuit_breakers: HashMap::new(),
            fallbacks: HashMap::new(),
            routes: Vec::new(),
        }
        .normalize()
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Append a route; routes are evaluated in insertion order.
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Add or replace a named breaker policy.
    pub fn circuit_breaker(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breakers.insert(name.into(), config);
        self
    }

    pub fn fallback(mut self, name: impl Into<String>, config: FallbackConfig) -> Self {
        self.config.fallbacks.insert(name.into(), config);
        self
    }

    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.config.registry = config;
        self
    }

    pub fn upstream(mut self, config: UpstreamConfig) -> Self {
        self.config.upstream = config;
        self
    }

    /// Register a static instance, switching the registry to the static kind.
    pub fn static_instance(
        mut self,
        service: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        self.config.registry.kind = RegistryKind::Static;
        self.config
            .registry
            .services
            .entry(service.into())
            .or_default()
            .push(StaticInstance {
                host: host.into(),
                port,
                weight: 1,
            });
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.config.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }
        Ok(self.config.normalize())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "galaxy_gateway=debug,info".
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    #[default]
    Consul,
    Static,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StaticInstance {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Where and how often instance lists are fetched.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    /// Consul agent base URL.
    pub address: String,
    pub datacenter: Option<String>,
    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,
    pub refresh_interval: String,
    pub fetch_timeout: String,
    pub backoff_base: String,
    pub backoff_max: String,
    /// Instance lists for the static kind.
    pub services: HashMap<String, Vec<StaticInstance>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Consul,
            address: "http://127.0.0.1:8500".to_string(),
            datacenter: None,
            token: None,
            refresh_interval: "5s".to_string(),
            fetch_timeout: "2s".to_string(),
            backoff_base: "500ms".to_string(),
            backoff_max: "30s".to_string(),
            services: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> ValidationResult<Duration> {
        parse_duration("registry.refresh_interval", &self.refresh_interval)
    }

    pub fn fetch_timeout(&self) -> ValidationResult<Duration> {
        parse_duration("registry.fetch_timeout", &self.fetch_timeout)
    }

    pub fn backoff_base(&self) -> ValidationResult<Duration> {
        parse_duration("registry.backoff_base", &self.backoff_base)
    }

    pub fn backoff_max(&self) -> ValidationResult<Duration> {
        parse_duration("registry.backoff_max", &self.backoff_max)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout: String,
    pub response_timeout: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "1s".to_string(),
            response_timeout: "5s".to_string(),
        }
    }
}

/// Breaker thresholds. See `core::circuit_breaker` for the state machine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Percent of failed calls in the window that opens the breaker.
    pub failure_rate_threshold: f64,
    pub minimum_calls: u32,
    pub sliding_window_size: u32,
    pub open_duration: String,
    pub max_open_duration: String,
    pub open_backoff_multiplier: f64,
    pub half_open_trial_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            minimum_calls: 20,
            sliding_window_size: 20,
            open_duration: "10s".to_string(),
            max_open_duration: "5m".to_string(),
            open_backoff_multiplier: 2.0,
            half_open_trial_calls: 3,
        }
    }
}

/// Degraded response served in place of an upstream answer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    pub status: u16,
    pub message: String,
    /// Extra JSON returned under `data`.
    pub body: Option<serde_json::Value>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            status: 503,
            message: "Service temporarily unavailable, please retry later".to_string(),
            body: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    ConsistentHash,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LoadBalanceConfig {
    pub strategy: LoadBalanceStrategy,
    /// Request header used as the consistent-hash key.
    pub hash_header: Option<String>,
}

/// One entry of the ordered route table.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub name: String,
    /// Path prefix matched on segment boundaries, e.g. "/api/product".
    pub path: String,
    #[serde(default)]
    pub path_regex: Option<String>,
    /// Allowed methods; empty means any.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Header name to value regex; all must match.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub service: String,
    /// Number of leading path segments removed before forwarding.
    #[serde(default)]
    pub strip_prefix: u32,
    #[serde(default)]
    pub load_balance: LoadBalanceConfig,
    #[serde(default = "default_breaker_name")]
    pub circuit_breaker: String,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub connect_timeout: Option<String>,
    #[serde(default)]
    pub response_timeout: Option<String>,
}

impl RouteConfig {
    /// A prefix route with default policies.
    pub fn new(name: impl Into<String>, path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            path_regex: None,
            methods: Vec::new(),
            headers: HashMap::new(),
            service: service.into(),
            strip_prefix: 0,
            load_balance: LoadBalanceConfig::default(),
            circuit_breaker: default_breaker_name(),
            fallback: None,
            connect_timeout: None,
            response_timeout: None,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balance.strategy = strategy;
        self
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.headers.insert(name.into(), pattern.into());
        self
    }

    pub fn with_path_regex(mut self, pattern: impl Into<String>) -> Self {
        self.path_regex = Some(pattern.into());
        self
    }

    pub fn with_strip_prefix(mut self, segments: u32) -> Self {
        self.strip_prefix = segments;
        self
    }

    pub fn with_circuit_breaker(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = name.into();
        self
    }

    pub fn with_fallback(mut self, name: impl Into<String>) -> Self {
        self.fallback = Some(name.into());
        self
    }

    pub fn with_response_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.response_timeout = Some(timeout.into());
        self
    }

    /// Effective connect timeout, falling back to the upstream default.
    pub fn connect_timeout(&self, upstream: &UpstreamConfig) -> ValidationResult<Duration> {
        let value = self
            .connect_timeout
            .as_deref()
            .unwrap_or(&upstream.connect_timeout);
        parse_duration(&format!("route '{}' connect_timeout", self.name), value)
    }

    /// Effective response timeout, falling back to the upstream default.
    pub fn response_timeout(&self, upstream: &UpstreamConfig) -> ValidationResult<Duration> {
        let value = self
            .response_timeout
            .as_deref()
            .unwrap_or(&upstream.response_timeout);
        parse_duration(&format!("route '{}' response_timeout", self.name), value)
    }
}
