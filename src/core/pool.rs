//! Per-service instance pools.
//!
//! Each pool holds an immutable [`PoolSnapshot`] behind an `ArcSwap`, so
//! readers take a snapshot without locking and always observe a complete,
//! fully-formed instance list. The registry watcher is the only writer.
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use scc::HashMap;

use crate::{core::instance::Instance, metrics};

/// A consistent view of a service's healthy instances.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    instances: Arc<[Instance]>,
    version: u64,
    published_at: Option<DateTime<Utc>>,
}

impl PoolSnapshot {
    fn empty() -> Self {
        Self {
            instances: Arc::from(Vec::new()),
            version: 0,
            published_at: None,
        }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Monotonic version; 0 means nothing has been published yet.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Live set of healthy instances for a single service.
#[derive(Debug)]
pub struct InstancePool {
    service: String,
    current: ArcSwap<PoolSnapshot>,
}

impl InstancePool {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            current: ArcSwap::from_pointee(PoolSnapshot::empty()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Return the most recent complete snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.current.load_full()
    }

    /// Atomically replace the snapshot with the healthy subset of
    /// `instances` and bump the version. Returns the new version.
    ///
    /// An empty list is a valid snapshot ("no healthy instances"), distinct
    /// from a failed registry fetch, which must not call this at all.
    pub fn publish(&self, instances: Vec<Instance>) -> u64 {
        let healthy: Arc<[Instance]> = instances
            .into_iter()
            .filter(Instance::is_healthy)
            .collect::<Vec<_>>()
            .into();
        let published_at = Utc::now();

        let previous = self.current.rcu(|current| {
            Arc::new(PoolSnapshot {
                instances: healthy.clone(),
                version: current.version + 1,
                published_at: Some(published_at),
            })
        });
        let version = previous.version + 1;

        metrics::set_pool_instances(&self.service, healthy.len());
        tracing::debug!(
            service = %self.service,
            version,
            instances = healthy.len(),
            "Published instance pool snapshot"
        );
        version
    }
}

/// Process-lifetime registry of pools, created lazily per service name.
#[derive(Debug, Default)]
pub struct InstancePools {
    pools: HashMap<String, Arc<InstancePool>>,
}

impl InstancePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for `service`, creating an empty one on first reference.
    pub fn pool(&self, service: &str) -> Arc<InstancePool> {
        if let Some(pool) = self.pools.read(service, |_, pool| pool.clone()) {
            return pool;
        }
        self.pools
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(InstancePool::new(service)))
            .get()
            .clone()
    }

    /// Snapshot of `service`'s pool (empty, version 0, if never published).
    pub fn snapshot(&self, service: &str) -> Arc<PoolSnapshot> {
        self.pool(service).snapshot()
    }

    /// Publish a new snapshot for `service`.
    pub fn publish(&self, service: &str, instances: Vec<Instance>) -> u64 {
        self.pool(service).publish(instances)
    }

    /// Names of all pools created so far, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services = Vec::with_capacity(self.pools.len());
        self.pools.scan(|name, _| services.push(name.clone()));
        services.sort();
        services
    }
}
