#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use http::{HeaderName, Method, StatusCode};
use regex::Regex;

use crate::config::models::{
    CircuitBreakerConfig, FallbackConfig, RegistryConfig, RegistryKind, RouteConfig, ServerConfig,
    parse_duration,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Unknown {kind} '{name}' referenced by route '{route}'")]
    UnknownReference {
        kind: &'static str,
        name: String,
        route: String,
    },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }

        let mut names = HashSet::new();
        for route in &config.routes {
            if !names.insert(route.name.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate route name '{}'", route.name),
                });
            }
            errors.extend(Self::validate_route(config, route));
        }

        for (name, breaker) in &config.circuit_breakers {
            errors.extend(Self::validate_circuit_breaker(name, breaker));
        }

        for (name, fallback) in &config.fallbacks {
            if let Err(e) = Self::validate_fallback(name, fallback) {
                errors.push(e);
            }
        }

        errors.extend(Self::validate_registry(&config.registry));

        for (field, value) in [
            ("upstream.connect_timeout", &config.upstream.connect_timeout),
            ("upstream.response_timeout", &config.upstream.response_timeout),
        ] {
            if let Err(e) = Self::validate_positive_duration(field, value) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_route(config: &ServerConfig, route: &RouteConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let name = &route.name;

        if name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' name", route.path),
            });
        }

        if !route.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{name}' path"),
                message: "Route paths must start with '/'".to_string(),
            });
        }

        if let Some(pattern) = &route.path_regex {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{name}' path_regex"),
                    message: format!("Invalid regex: {e}"),
                });
            }
        }

        for method in &route.methods {
            if method.parse::<Method>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{name}' methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        for (header, pattern) in &route.headers {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{name}' headers"),
                    message: format!("'{header}' is not a valid header name"),
                });
            }
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{name}' headers.{header}"),
                    message: format!("Invalid regex: {e}"),
                });
            }
        }

        if route.service.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{name}' service"),
            });
        }

        if let Some(header) = &route.load_balance.hash_header {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{name}' load_balance.hash_header"),
                    message: format!("'{header}' is not a valid header name"),
                });
            }
        }

        if !config.circuit_breakers.contains_key(&route.circuit_breaker) {
            errors.push(ValidationError::UnknownReference {
                kind: "circuit breaker",
                name: route.circuit_breaker.clone(),
                route: name.clone(),
            });
        }

        if let Some(fallback) = &route.fallback {
            if !config.fallbacks.contains_key(fallback) {
                errors.push(ValidationError::UnknownReference {
                    kind: "fallback",
                    name: fallback.clone(),
                    route: name.clone(),
                });
            }
        }

        for (field, value) in [
            ("connect_timeout", &route.connect_timeout),
            ("response_timeout", &route.response_timeout),
        ] {
            if let Some(value) = value {
                if let Err(e) =
                    Self::validate_positive_duration(&format!("route '{name}' {field}"), value)
                {
                    errors.push(e);
                }
            }
        }

        errors
    }

    fn validate_circuit_breaker(name: &str, config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |f: &str| format!("circuit_breakers.{name}.{f}");

        if !(config.failure_rate_threshold > 0.0 && config.failure_rate_threshold <= 100.0) {
            errors.push(ValidationError::InvalidField {
                field: field("failure_rate_threshold"),
                message: "Must be in (0, 100]".to_string(),
            });
        }

        if config.minimum_calls == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("minimum_calls"),
                message: "Must be at least 1".to_string(),
            });
        }

        if config.sliding_window_size < config.minimum_calls {
            errors.push(ValidationError::InvalidField {
                field: field("sliding_window_size"),
                message: format!(
                    "Must be at least minimum_calls ({})",
                    config.minimum_calls
                ),
            });
        }

        if config.half_open_trial_calls == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("half_open_trial_calls"),
                message: "Must be at least 1".to_string(),
            });
        }

        if !config.open_backoff_multiplier.is_finite() || config.open_backoff_multiplier < 1.0 {
            errors.push(ValidationError::InvalidField {
                field: field("open_backoff_multiplier"),
                message: "Must be a finite number of at least 1.0".to_string(),
            });
        }

        let open = Self::validate_positive_duration(&field("open_duration"), &config.open_duration);
        let max = Self::validate_positive_duration(
            &field("max_open_duration"),
            &config.max_open_duration,
        );
        match (open, max) {
            (Ok(open), Ok(max)) if max < open => errors.push(ValidationError::InvalidField {
                field: field("max_open_duration"),
                message: "Must not be shorter than open_duration".to_string(),
            }),
            (open, max) => {
                errors.extend(open.err());
                errors.extend(max.err());
            }
        }

        errors
    }

    fn validate_fallback(name: &str, config: &FallbackConfig) -> ValidationResult<()> {
        if StatusCode::from_u16(config.status).is_err() {
            return Err(ValidationError::InvalidField {
                field: format!("fallbacks.{name}.status"),
                message: format!("{} is not a valid HTTP status code", config.status),
            });
        }
        Ok(())
    }

    fn validate_registry(config: &RegistryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for result in [
            config.refresh_interval(),
            config.fetch_timeout(),
            config.backoff_base(),
            config.backoff_max(),
        ] {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        match config.kind {
            RegistryKind::Consul => {
                if let Err(e) = Self::validate_url(&config.address, "registry.address") {
                    errors.push(e);
                }
            }
            RegistryKind::Static => {
                for (service, instances) in &config.services {
                    for (i, instance) in instances.iter().enumerate() {
                        let field = format!("registry.services.{service}[{i}]");
                        if instance.host.trim().is_empty() {
                            errors.push(ValidationError::MissingField {
                                field: format!("{field}.host"),
                            });
                        }
                        if instance.weight == 0 {
                            errors.push(ValidationError::InvalidField {
                                field: format!("{field}.weight"),
                                message: "Weight must be at least 1".to_string(),
                            });
                        }
                    }
                }
            }
        }

        errors
    }

    fn validate_positive_duration(
        field: &str,
        value: &str,
    ) -> ValidationResult<std::time::Duration> {
        let duration = parse_duration(field, value)?;
        if duration.is_zero() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Duration must be greater than zero".to_string(),
            });
        }
        Ok(duration)
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
