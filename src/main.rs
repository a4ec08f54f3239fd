use std::{
    collections::HashSet, future::IntoFuture, net::SocketAddr, path::Path, sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::future::join_all;
use galaxy_gateway::{
    adapters::{
        FileConfigProvider, HttpClientAdapter, HttpHandler, RegistryWatcher, WatchSettings,
        registry,
    },
    config::{ServerConfig, ServerConfigValidator, load_config_unchecked},
    core::GatewayService,
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "gateway.yaml";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

/// Registry watch loops for one service set, stopped together.
struct WatchSet {
    services: HashSet<String>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WatchSet {
    /// Warm up services not in `previous`, then spawn a watch loop for every
    /// service the gateway routes to.
    async fn start(
        gateway: &GatewayService,
        previous: &HashSet<String>,
        shutdown: &GracefulShutdown,
    ) -> Result<Self> {
        let config = gateway.config();
        let registry = registry::from_config(&config.registry)?;
        let settings = WatchSettings::from_config(&config.registry)?;
        let watcher = Arc::new(RegistryWatcher::new(
            registry,
            gateway.pools().clone(),
            settings,
        ));

        let services = gateway.watched_services();
        let fresh: Vec<String> = services
            .iter()
            .filter(|s| !previous.contains(*s))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            let populated = watcher.warm_up(&fresh).await;
            tracing::info!(services = fresh.len(), populated, "Registry warm-up finished");
        }

        let token = shutdown.child_token();
        let handles = watcher.spawn(services.clone(), token.clone());
        Ok(Self {
            services: services.into_iter().collect(),
            token,
            handles,
        })
    }

    async fn stop(self) {
        self.token.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Registry watch task ended abnormally");
            }
        }
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config_provider = Arc::new(
        FileConfigProvider::new(config_path)
            .wrap_err_with(|| format!("Failed to open configuration {config_path}"))?,
    );
    let initial_config = Arc::new(config_provider.load_config().await?);

    tracing_setup::init_tracing(&initial_config.logging)?;
    metrics::init_metrics()?;
    tracing::info!(config = config_path, "Loaded initial configuration");

    let addr: SocketAddr = initial_config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address: {}", initial_config.listen_addr))?;

    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new()?);
    let gateway = Arc::new(GatewayService::from_config(initial_config.clone())?);
    for route in gateway.routes().routes() {
        tracing::info!(
            route = %route.name,
            path = route.predicate.path_prefix(),
            service = %route.service,
            strategy = ?route.strategy,
            "Configured route"
        );
    }

    let graceful_shutdown = GracefulShutdown::new();
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move { signal_handler_shutdown.run_signal_handler().await });

    let watch_set = WatchSet::start(&gateway, &HashSet::new(), &graceful_shutdown).await?;
    let gateway_holder = Arc::new(ArcSwap::new(gateway));

    let reload_task = tokio::spawn(config_reload_loop(
        config_provider,
        gateway_holder.clone(),
        watch_set,
        graceful_shutdown.clone(),
    ));

    let handler = Arc::new(HttpHandler::new(gateway_holder, http_client));
    let app = handler.router();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, "Galaxy gateway listening");

    let shutdown_signal = graceful_shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown_signal.wait_for_shutdown_signal().await })
    .into_future();

    let drain_deadline = {
        let shutdown = graceful_shutdown.clone();
        async move {
            shutdown.token().cancelled().await;
            tokio::time::sleep(shutdown.drain_timeout()).await;
        }
    };

    let server_result = tokio::select! {
        result = server => result.wrap_err("Server error"),
        _ = drain_deadline => {
            tracing::warn!(
                timeout = ?graceful_shutdown.drain_timeout(),
                "In-flight requests did not drain in time"
            );
            Ok(())
        }
    };

    // The listener may also stop on its own error; make sure background
    // tasks see the shutdown either way.
    graceful_shutdown.trigger_shutdown("server stopped");
    match reload_task.await {
        Ok(watch_set) => watch_set.stop().await,
        Err(e) => tracing::warn!(error = %e, "Config reload task ended abnormally"),
    }

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Apply configuration file changes until shutdown; returns the watch set
/// that is live at that point so the caller can stop it.
async fn config_reload_loop(
    provider: Arc<FileConfigProvider>,
    gateway_holder: Arc<ArcSwap<GatewayService>>,
    mut watch_set: WatchSet,
    shutdown: GracefulShutdown,
) -> WatchSet {
    let Some(mut notify_rx) = provider.watch() else {
        tracing::warn!("Config change notifications unavailable; hot reload disabled");
        return watch_set;
    };
    let debounce = Duration::from_millis(500);
    let token = shutdown.token();
    tracing::info!(path = %provider.path().display(), "Config watcher task started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = notify_rx.recv() => {
                if changed.is_none() {
                    break;
                }
            }
        }

        // Editors emit bursts of events; settle before reading the file.
        tokio::time::sleep(debounce).await;
        while notify_rx.try_recv().is_ok() {}

        let new_config = match provider.load_config().await {
            Ok(config) => Arc::new(config),
            Err(e) => {
                tracing::error!(error = ?e, "Failed to reload configuration, keeping old configuration");
                continue;
            }
        };

        let current = gateway_holder.load_full();
        if new_config.listen_addr != current.config().listen_addr {
            tracing::warn!(
                old = %current.config().listen_addr,
                new = %new_config.listen_addr,
                "listen_addr changes take effect after restart"
            );
        }

        let next = match GatewayService::with_balancer(new_config, current.balancer().clone()) {
            Ok(gateway) => Arc::new(gateway),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build route table, keeping old configuration");
                continue;
            }
        };

        let previous = watch_set.services.clone();
        match WatchSet::start(&next, &previous, &shutdown).await {
            Ok(new_watch_set) => {
                gateway_holder.store(next.clone());
                let old = std::mem::replace(&mut watch_set, new_watch_set);
                old.stop().await;
                tracing::info!(
                    routes = next.routes().len(),
                    services = watch_set.services.len(),
                    "Configuration reloaded"
                );
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to start registry watchers, keeping old configuration");
            }
        }
    }

    tracing::info!("Config watcher task is shutting down");
    watch_set
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        return Err(eyre!("Configuration file '{config_path}' not found"));
    }

    let config = load_config_unchecked(config_path)
        .await
        .wrap_err("Configuration parsing failed")?;
    println!("✅ Configuration parsing: OK");

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            print_summary(&config);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Route paths must start with '/'");
            println!("   • circuit_breaker and fallback names must be defined at the top level");
            println!("   • Durations use humantime units, e.g. '500ms', '5s', '1m'");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            Err(eyre!("Configuration '{config_path}' is invalid"))
        }
    }
}

fn print_summary(config: &ServerConfig) {
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Registry: {:?}", config.registry.kind);
    println!("   • Routes: {}", config.routes.len());
    for route in &config.routes {
        println!(
            "     - {} {} -> {} ({:?}, breaker '{}')",
            route.name, route.path, route.service, route.load_balance.strategy, route.circuit_breaker
        );
    }
    println!("   • Circuit Breakers: {}", config.circuit_breakers.len());
    println!("   • Fallbacks: {}", config.fallbacks.len());
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        return Err(eyre!("Configuration file '{config_path}' already exists"));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => {}
        _ => return Err(eyre!("init writes YAML; use a .yaml or .yml path")),
    }

    tokio::fs::write(path, STARTER_CONFIG)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'galaxy-gateway serve --config {config_path}' to start the server");
    Ok(())
}

const STARTER_CONFIG: &str = r#"# Galaxy Gateway configuration

listen_addr: "0.0.0.0:8080"

logging:
  level: info
  format: pretty

registry:
  kind: consul
  address: "http://127.0.0.1:8500"
  refresh_interval: 5s
  fetch_timeout: 2s
  backoff_base: 500ms
  backoff_max: 30s

upstream:
  connect_timeout: 1s
  response_timeout: 5s

circuit_breakers:
  default:
    failure_rate_threshold: 50
    minimum_calls: 20
    sliding_window_size: 20
    open_duration: 10s
    max_open_duration: 5m
    open_backoff_multiplier: 2.0
    half_open_trial_calls: 3

fallbacks:
  default:
    status: 503
    message: "Service temporarily unavailable, please retry later"

routes:
  - name: product
    path: /api/product
    service: product-service
    load_balance:
      strategy: round_robin
    fallback: default

  - name: order
    path: /api/order
    service: order-service
    load_balance:
      strategy: least_connections
    fallback: default

  - name: inventory
    path: /api/inventory
    service: inventory-service
    load_balance:
      strategy: consistent_hash
      hash_header: x-user-id
    fallback: default
"#;

#[cfg(test)]
mod tests {
    use galaxy_gateway::config::load_config;

    use super::*;

    #[tokio::test]
    async fn test_starter_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        let path = path.to_str().unwrap();

        init_config_command(path).await.unwrap();
        let config = load_config(path).await.unwrap();
        let paths: Vec<&str> = config.routes.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["/api/product", "/api/order", "/api/inventory"]);

        // Refuses to overwrite.
        assert!(init_config_command(path).await.is_err());
        validate_config_command(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_rejects_non_yaml_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        assert!(init_config_command(path.to_str().unwrap()).await.is_err());
    }
}
