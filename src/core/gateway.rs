//! Core gateway orchestration service.
//!
//! `GatewayService` binds one immutable configuration generation to the
//! runtime state it needs:
//! * the ordered route table (each route owning its circuit breaker)
//! * the load balancer, shared with previous generations so instance pools
//!   and in-flight counters survive a configuration reload
//!
//! This layer performs no I/O; the dispatcher and the registry watcher do.
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Method};
use serde::Serialize;

use crate::{
    config::{LoadBalanceStrategy, ServerConfig},
    core::{
        circuit_breaker::BreakerSnapshot,
        error::GatewayResult,
        load_balancer::LoadBalancer,
        pool::InstancePools,
        route::{Route, RouteTable},
    },
};

/// Pool summary for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub service: String,
    pub version: u64,
    pub instances: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub name: String,
    pub path: String,
    pub service: String,
    pub strategy: LoadBalanceStrategy,
    pub breaker: BreakerSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub routes: Vec<RouteStatus>,
    pub pools: Vec<PoolStatus>,
}

/// Readiness: healthy when every routed service has at least one instance.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub services: BTreeMap<String, usize>,
}

/// Central state for one configuration generation.
pub struct GatewayService {
    config: Arc<ServerConfig>,
    routes: RouteTable,
    balancer: Arc<LoadBalancer>,
}

impl GatewayService {
    /// Build a gateway with fresh pools and counters.
    pub fn from_config(config: Arc<ServerConfig>) -> GatewayResult<Self> {
        let balancer = Arc::new(LoadBalancer::new(Arc::new(InstancePools::new())));
        Self::with_balancer(config, balancer)
    }

    /// Build a gateway that reuses an existing load balancer (and therefore
    /// its pools and in-flight counters). Breakers always start Closed.
    pub fn with_balancer(config: Arc<ServerConfig>, balancer: Arc<LoadBalancer>) -> GatewayResult<Self> {
        let routes = RouteTable::from_config(&config)?;
        tracing::debug!(routes = routes.len(), "Route table compiled");
        Ok(Self {
            config,
            routes,
            balancer,
        })
    }

    /// Assemble a gateway from pre-built routes.
    pub fn from_parts(config: Arc<ServerConfig>, routes: RouteTable, balancer: Arc<LoadBalancer>) -> Self {
        Self {
            config,
            routes,
            balancer,
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn pools(&self) -> &Arc<InstancePools> {
        self.balancer.pools()
    }

    /// First matching route for the request, if any.
    pub fn find_route(&self, method: &Method, path: &str, headers: &HeaderMap) -> Option<Arc<Route>> {
        self.routes.find(method, path, headers)
    }

    /// Distinct target services, in route order.
    pub fn watched_services(&self) -> Vec<String> {
        let mut services: Vec<String> = Vec::new();
        for route in self.routes.routes() {
            if !services.contains(&route.service) {
                services.push(route.service.clone());
            }
        }
        services
    }

    fn pool_status(&self, service: &str) -> PoolStatus {
        let snapshot = self.pools().snapshot(service);
        PoolStatus {
            service: service.to_string(),
            version: snapshot.version(),
            instances: snapshot.instances().iter().map(|i| i.authority()).collect(),
            published_at: snapshot.published_at(),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        let routes = self
            .routes
            .routes()
            .iter()
            .map(|route| RouteStatus {
                name: route.name.clone(),
                path: route.predicate.path_prefix().to_string(),
                service: route.service.clone(),
                strategy: route.strategy,
                breaker: route.breaker.snapshot(),
            })
            .collect();
        let pools = self
            .watched_services()
            .iter()
            .map(|service| self.pool_status(service))
            .collect();
        GatewayStatus { routes, pools }
    }

    pub fn health(&self) -> HealthReport {
        let services: BTreeMap<String, usize> = self
            .watched_services()
            .into_iter()
            .map(|service| {
                let len = self.pools().snapshot(&service).len();
                (service, len)
            })
            .collect();
        HealthReport {
            healthy: services.values().all(|n| *n > 0),
            services,
        }
    }
}
