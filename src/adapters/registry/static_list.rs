use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    config::{RegistryConfig, StaticInstance},
    core::instance::Instance,
    ports::service_registry::{RegistryResult, ServiceRegistry},
};

/// Registry backed by instance lists from the configuration file.
///
/// Unknown services resolve to an empty list.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    services: HashMap<String, Vec<StaticInstance>>,
}

impl StaticRegistry {
    pub fn new(services: HashMap<String, Vec<StaticInstance>>) -> Self {
        Self { services }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.services.clone())
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn fetch_instances(&self, service: &str) -> RegistryResult<Vec<Instance>> {
        Ok(self
            .services
            .get(service)
            .map(|list| {
                list.iter()
                    .map(|i| Instance::new(service, i.host.clone(), i.port).with_weight(i.weight))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
