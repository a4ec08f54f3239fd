pub mod consul;
pub mod static_list;

use std::sync::Arc;

pub use consul::ConsulRegistry;
use eyre::{Context, Result};
pub use static_list::StaticRegistry;

use crate::{
    config::{RegistryConfig, RegistryKind},
    ports::service_registry::ServiceRegistry,
};

/// Build the registry adapter selected by `config.kind`.
pub fn from_config(config: &RegistryConfig) -> Result<Arc<dyn ServiceRegistry>> {
    let registry: Arc<dyn ServiceRegistry> = match config.kind {
        RegistryKind::Consul => {
            let timeout = config.fetch_timeout()?;
            Arc::new(
                ConsulRegistry::from_config(config, timeout)
                    .wrap_err("Failed to create Consul registry client")?,
            )
        }
        RegistryKind::Static => Arc::new(StaticRegistry::from_config(config)),
    };
    Ok(registry)
}
