pub mod config_providers;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod registry;
pub mod registry_watcher;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::{request_id_middleware, request_timing_middleware};
pub use registry::{ConsulRegistry, StaticRegistry};
pub use registry_watcher::{RegistryWatcher, WatchSettings};
