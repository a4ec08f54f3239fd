//! Galaxy Gateway - an API gateway with registry-driven load balancing and
//! per-route circuit breaking.
//!
//! Every inbound request goes through the same pipeline:
//!
//! 1. the ordered [`RouteTable`](core::RouteTable) picks the first matching route
//! 2. the route's [`CircuitBreaker`](core::CircuitBreaker) admits or rejects the call
//! 3. the [`LoadBalancer`](core::LoadBalancer) picks an instance from the
//!    service's pool, which a [`RegistryWatcher`](adapters::RegistryWatcher)
//!    keeps in sync with Consul (or a static list)
//! 4. the upstream call runs under connect and response timeouts; its outcome
//!    feeds the breaker
//! 5. failures and rejections are answered by the route's fallback
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use galaxy_gateway::{GatewayService, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = load_config("gateway.yaml").await?;
//! let gateway = GatewayService::from_config(Arc::new(cfg))?;
//! println!("{} routes", gateway.routes().len());
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing, balancing and breaker logic inside `core`, which performs no I/O.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; instance pools are published as immutable
//! snapshots through `arc-swap`, so selection never blocks on a refresh.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, HttpClientAdapter, HttpHandler, RegistryWatcher},
    core::{Dispatcher, GatewayError, GatewayService},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
