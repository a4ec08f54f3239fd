use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::RegistryConfig,
    core::instance::{HealthStatus, Instance},
    ports::service_registry::{RegistryError, RegistryResult, ServiceRegistry},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
    #[serde(default)]
    checks: Vec<CheckEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    weights: Option<Weights>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Weights {
    passing: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckEntry {
    status: String,
}

impl HealthEntry {
    fn into_instance(self) -> Instance {
        let host = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };
        let status = if self.checks.iter().all(|c| c.status == "passing") {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Instance::new(self.service.service, host, self.service.port)
            .with_weight(self.service.weights.map_or(1, |w| w.passing))
            .with_tags(self.service.tags.unwrap_or_default())
            .with_status(status)
            .with_last_seen(Utc::now())
    }
}

/// Registry adapter for the Consul health API.
///
/// Queries `GET {address}/v1/health/service/{service}?passing=true`, so only
/// instances whose checks all pass are returned.
pub struct ConsulRegistry {
    client: Client,
    address: String,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulRegistry {
    pub fn new(
        address: impl Into<String>,
        datacenter: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Unreachable(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
            datacenter,
            token,
        })
    }

    pub fn from_config(config: &RegistryConfig, timeout: Duration) -> RegistryResult<Self> {
        Self::new(
            config.address.clone(),
            config.datacenter.clone(),
            config.token.clone(),
            timeout,
        )
    }

    fn service_url(&self, service: &str) -> String {
        format!("{}/v1/health/service/{service}", self.address)
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn fetch_instances(&self, service: &str) -> RegistryResult<Vec<Instance>> {
        let mut request = self
            .client
            .get(self.service_url(service))
            .query(&[("passing", "true")]);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc.as_str())]);
        }
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;

        tracing::trace!(service, entries = entries.len(), "Consul health query answered");
        Ok(entries.into_iter().map(HealthEntry::into_instance).collect())
    }

    fn name(&self) -> &'static str {
        "consul"
    }
}
