pub mod config_provider;
pub mod http_client;
pub mod service_registry;

pub use config_provider::ConfigProvider;
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use service_registry::{RegistryError, RegistryResult, ServiceRegistry};
