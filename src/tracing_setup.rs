use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize logging from the `[logging]` section. `RUST_LOG`, when set,
/// takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let level = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.level.clone());
    init_tracing_with_config(&level, config.format == LogFormat::Json, true)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!(level, json = json_format, "Gateway logging initialized");
    Ok(())
}

/// Span for one inbound request. `http.status_code` is recorded on completion.
pub fn create_request_span(route: &str, method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        route = route,
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
    )
}

/// Span for one call to an upstream instance.
pub fn create_upstream_span(service: &str, instance: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        service = service,
        instance = instance,
        http.status_code = tracing::field::Empty,
    )
}

/// Span covering the refresh loop of one watched service.
pub fn create_registry_watch_span(service: &str) -> tracing::Span {
    tracing::info_span!("registry_watch", service = service)
}
