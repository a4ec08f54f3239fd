//! Request-time and startup error taxonomy.
//!
//! Every request-time variant is resolved into a well-formed response by the
//! dispatcher (not-found or fallback). Only [`GatewayError::Configuration`]
//! is allowed to be fatal, and only before the listener accepts traffic.
use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Errors produced while routing, selecting and calling upstream instances.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum GatewayError {
    /// No route predicate matched the inbound request.
    #[error("No route matches {method} {path}")]
    NoRouteMatch { method: String, path: String },

    /// The instance pool for the service is empty.
    #[error("No healthy instances available for service '{service}'")]
    NoHealthyInstances { service: String },

    /// The registry could not be queried. Never surfaced to callers.
    #[error("Service registry unavailable for '{service}': {reason}")]
    RegistryUnavailable { service: String, reason: String },

    /// The route's breaker rejected the call.
    #[error("Circuit breaker for route '{route}' is open")]
    BreakerOpen { route: String },

    /// The upstream did not answer within the response timeout.
    #[error("Upstream {instance} timed out after {timeout:?}")]
    UpstreamTimeout { instance: String, timeout: Duration },

    /// The upstream connection could not be established or broke.
    #[error("Upstream {instance} connection error: {reason}")]
    UpstreamConnectionError { instance: String, reason: String },

    /// The upstream answered with a 5xx status.
    #[error("Upstream {instance} returned server error {status}")]
    UpstreamServerError { instance: String, status: StatusCode },

    /// Invalid route, policy or breaker configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Status used when the error is answered without a route fallback.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatch { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstances { .. }
            | GatewayError::RegistryUnavailable { .. }
            | GatewayError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamConnectionError { .. }
            | GatewayError::UpstreamServerError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error counts against the route's circuit breaker.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::NoHealthyInstances { .. }
                | GatewayError::UpstreamTimeout { .. }
                | GatewayError::UpstreamConnectionError { .. }
                | GatewayError::UpstreamServerError { .. }
        )
    }

    /// Short machine-readable label, used for fallback markers and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatch { .. } => "no_route",
            GatewayError::NoHealthyInstances { .. } => "no_healthy_instances",
            GatewayError::RegistryUnavailable { .. } => "registry_unavailable",
            GatewayError::BreakerOpen { .. } => "breaker_open",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::UpstreamConnectionError { .. } => "upstream_connection_error",
            GatewayError::UpstreamServerError { .. } => "upstream_server_error",
            GatewayError::Configuration(_) => "configuration_error",
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
