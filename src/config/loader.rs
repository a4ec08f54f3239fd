use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::ServerConfig, validation::ServerConfigValidator};

/// Prefix for environment overrides, e.g. `GATEWAY__REGISTRY__ADDRESS`.
pub const ENV_PREFIX: &str = "GATEWAY";
const ENV_SEPARATOR: &str = "__";

/// Load and validate configuration from a file.
/// Supports YAML, JSON and TOML, with environment overrides on top.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    let config = load_config_unchecked(config_path).await?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration without validation (used for validation command)
pub async fn load_config_unchecked(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously, reading overrides from the process environment.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    load_config_with_env(config_path, Environment::with_prefix(ENV_PREFIX))
}

/// Load configuration with an explicit environment source.
pub fn load_config_with_env(config_path: &str, env: Environment) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(env.separator(ENV_SEPARATOR).try_parsing(true))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config.normalize())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{DEFAULT_BREAKER, LoadBalanceStrategy, RegistryKind};

    const YAML: &str = r#"
listen_addr: "127.0.0.1:3000"
registry:
  kind: static
  services:
    product-service:
      - host: "10.0.0.1"
        port: 8080
        weight: 3
circuit_breakers:
  strict:
    failure_rate_threshold: 25.0
    open_duration: "30s"
fallbacks:
  product-cache:
    status: 200
    message: "served from cache"
    body:
      items: []
routes:
  - name: product
    path: /api/product
    service: product-service
    load_balance:
      strategy: weighted
    circuit_breaker: strict
    fallback: product-cache
  - name: order
    path: /api/order
    service: order-service
    methods: [GET, POST]
"#;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::with_suffix(suffix).unwrap();
        write!(temp_file, "{content}").unwrap();
        temp_file
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let temp_file = write_temp(".yaml", YAML);
        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.registry.kind, RegistryKind::Static);
        assert_eq!(config.registry.services["product-service"][0].weight, 3);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].name, "product");
        assert_eq!(
            config.routes[0].load_balance.strategy,
            LoadBalanceStrategy::Weighted
        );
        assert_eq!(config.routes[1].circuit_breaker, DEFAULT_BREAKER);
        assert!(config.circuit_breakers.contains_key(DEFAULT_BREAKER));

        let strict = &config.circuit_breakers["strict"];
        assert_eq!(strict.failure_rate_threshold, 25.0);
        assert_eq!(strict.minimum_calls, 20);
        assert_eq!(
            config.fallbacks["product-cache"].body,
            Some(serde_json::json!({ "items": [] }))
        );
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "routes": [
    { "name": "inventory", "path": "/api/inventory", "service": "inventory-service",
      "load_balance": { "strategy": "consistent_hash", "hash_header": "X-User-Id" } }
  ]
}
"#;
        let temp_file = write_temp(".json", json_content);
        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(
            config.routes[0].load_balance.hash_header.as_deref(),
            Some("X-User-Id")
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let temp_file = write_temp(".yaml", YAML);
        let env = Environment::with_prefix(ENV_PREFIX).source(Some(
            [
                ("GATEWAY__LISTEN_ADDR".to_string(), "0.0.0.0:9000".to_string()),
                (
                    "GATEWAY__UPSTREAM__RESPONSE_TIMEOUT".to_string(),
                    "750ms".to_string(),
                ),
            ]
            .into_iter()
            .collect(),
        ));

        let config = load_config_with_env(temp_file.path().to_str().unwrap(), env).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.upstream.response_timeout, "750ms");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_file = write_temp(
            ".yaml",
            r#"
listen_addr: "127.0.0.1:3000"
routes:
  - name: product
    path: api/product
    service: product-service
    circuit_breaker: missing
"#,
        );
        let path = temp_file.path().to_str().unwrap();
        let err = load_config(path).await.unwrap_err();
        assert!(format!("{err:?}").contains("Unknown circuit breaker 'missing'"));

        // The unchecked variant still parses it for the `validate` command.
        assert!(load_config_unchecked(path).await.is_ok());
    }
}
