//! Degraded responses served when a route cannot reach its service.
use axum::{body::Body, response::Response};
use hyper::{StatusCode, header};
use serde_json::json;

use crate::{
    config::FallbackConfig,
    core::error::{GatewayError, GatewayResult},
};

/// Marker header present on every fallback response.
pub const FALLBACK_HEADER: &str = "x-gateway-fallback";

/// Why a fallback was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    BreakerOpen,
    NoHealthyInstances,
    UpstreamTimeout,
    UpstreamConnectionError,
    UpstreamServerError,
}

impl FallbackReason {
    /// Map a request-time error to a fallback reason. `None` for errors
    /// answered some other way (no route, configuration).
    pub fn from_error(error: &GatewayError) -> Option<Self> {
        match error {
            GatewayError::BreakerOpen { .. } => Some(Self::BreakerOpen),
            GatewayError::NoHealthyInstances { .. } | GatewayError::RegistryUnavailable { .. } => {
                Some(Self::NoHealthyInstances)
            }
            GatewayError::UpstreamTimeout { .. } => Some(Self::UpstreamTimeout),
            GatewayError::UpstreamConnectionError { .. } => Some(Self::UpstreamConnectionError),
            GatewayError::UpstreamServerError { .. } => Some(Self::UpstreamServerError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreakerOpen => "breaker_open",
            Self::NoHealthyInstances => "no_healthy_instances",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamConnectionError => "upstream_connection_error",
            Self::UpstreamServerError => "upstream_server_error",
        }
    }
}

/// A route's fallback handler: a fixed status and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Fallback {
    status: StatusCode,
    message: String,
    data: Option<serde_json::Value>,
}

impl Fallback {
    /// 503 with a generic retry message.
    pub fn generic() -> Self {
        let defaults = FallbackConfig::default();
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: defaults.message,
            data: None,
        }
    }

    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn from_config(config: &FallbackConfig) -> GatewayResult<Self> {
        let status = StatusCode::from_u16(config.status).map_err(|e| {
            GatewayError::Configuration(format!("invalid fallback status {}: {e}", config.status))
        })?;
        Ok(Self {
            status,
            message: config.message.clone(),
            data: config.body.clone(),
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// JSON document returned to the client.
    pub fn body(&self, route: &str, reason: FallbackReason) -> serde_json::Value {
        let mut body = json!({
            "fallback": true,
            "route": route,
            "reason": reason.as_str(),
            "message": self.message,
        });
        if let (Some(data), Some(object)) = (&self.data, body.as_object_mut()) {
            object.insert("data".to_string(), data.clone());
        }
        body
    }

    /// Build the HTTP response for `route`.
    pub fn respond(&self, route: &str, reason: FallbackReason) -> Response {
        let body = self.body(route, reason).to_string();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            FALLBACK_HEADER,
            header::HeaderValue::from_static(reason.as_str()),
        );
        response
    }
}

impl Default for Fallback {
    fn default() -> Self {
        Self::generic()
    }
}
