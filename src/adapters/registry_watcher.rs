use std::{sync::Arc, time::Duration};

use eyre::Result;
use futures_util::future::join_all;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::RegistryConfig,
    core::{
        error::{GatewayError, GatewayResult},
        pool::InstancePools,
    },
    metrics,
    ports::service_registry::ServiceRegistry,
    tracing_setup,
    utils::backoff::Backoff,
};

/// Timing for the refresh loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff: Backoff,
}

impl WatchSettings {
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        Ok(Self {
            refresh_interval: config.refresh_interval()?,
            fetch_timeout: config.fetch_timeout()?,
            backoff: Backoff::new(config.backoff_base()?, config.backoff_max()?),
        })
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(2),
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// Keeps instance pools in sync with the service registry.
///
/// One background loop runs per watched service. A successful fetch
/// publishes a new pool snapshot; a failed fetch leaves the last published
/// snapshot in place and is retried with exponential backoff.
pub struct RegistryWatcher {
    registry: Arc<dyn ServiceRegistry>,
    pools: Arc<InstancePools>,
    settings: WatchSettings,
}

impl RegistryWatcher {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        pools: Arc<InstancePools>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            registry,
            pools,
            settings,
        }
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    /// Fetch `service` once and publish the result. Returns the new pool
    /// version, or [`GatewayError::RegistryUnavailable`] with the pool left
    /// untouched.
    pub async fn refresh(&self, service: &str) -> GatewayResult<u64> {
        let unavailable = |reason: String| GatewayError::RegistryUnavailable {
            service: service.to_string(),
            reason,
        };

        let instances = tokio::time::timeout(
            self.settings.fetch_timeout,
            self.registry.fetch_instances(service),
        )
        .await
        .map_err(|_| unavailable(format!("fetch timed out after {:?}", self.settings.fetch_timeout)))?
        .map_err(|e| unavailable(e.to_string()))?;

        Ok(self.pools.publish(service, instances))
    }

    /// Fetch every service once, concurrently. Failures are logged and
    /// otherwise ignored; returns how many services were populated.
    pub async fn warm_up(&self, services: &[String]) -> usize {
        let results = join_all(services.iter().map(|service| async move {
            let result = self.refresh(service).await;
            (service, result)
        }))
        .await;

        let mut populated = 0;
        for (service, result) in results {
            match result {
                Ok(version) => {
                    populated += 1;
                    tracing::info!(
                        service = %service,
                        version,
                        instances = self.pools.snapshot(service).len(),
                        "Initial instance pool loaded"
                    );
                }
                Err(e) => {
                    metrics::increment_registry_refresh_failures(service);
                    tracing::warn!(service = %service, error = %e, "Initial registry fetch failed");
                }
            }
        }
        populated
    }

    /// Refresh loop for one service. Sleeps first (the initial fetch is the
    /// warm-up's job) and exits when `shutdown` is cancelled.
    pub async fn watch(&self, service: String, shutdown: CancellationToken) {
        tracing::info!(
            service = %service,
            registry = self.registry.name(),
            interval = ?self.settings.refresh_interval,
            "Starting registry watch"
        );

        let mut failures: u32 = 0;
        let mut delay = self.settings.refresh_interval;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }

            delay = match self.refresh(&service).await {
                Ok(version) => {
                    if failures > 0 {
                        tracing::info!(
                            service = %service,
                            failures,
                            version,
                            "Registry fetch recovered"
                        );
                    }
                    failures = 0;
                    self.settings.refresh_interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::increment_registry_refresh_failures(&service);
                    let retry_in = self.settings.backoff.delay_with_jitter(failures);
                    tracing::warn!(
                        service = %service,
                        error = %e,
                        failures,
                        retry_in = ?retry_in,
                        stale_version = self.pools.snapshot(&service).version(),
                        "Registry fetch failed, keeping last known pool"
                    );
                    retry_in
                }
            };
        }

        tracing::info!(service = %service, "Registry watch stopped");
    }

    /// Spawn one [`watch`](Self::watch) task per service.
    pub fn spawn(
        self: &Arc<Self>,
        services: Vec<String>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        services
            .into_iter()
            .map(|service| {
                let watcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                let span = tracing_setup::create_registry_watch_span(&service);
                tokio::spawn(async move { watcher.watch(service, shutdown).await }.instrument(span))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        core::instance::Instance,
        ports::service_registry::{RegistryError, RegistryResult},
    };

    /// Answers from a script; repeats the last entry once exhausted.
    struct ScriptedRegistry {
        script: Mutex<VecDeque<RegistryResult<Vec<Instance>>>>,
        last: Mutex<Option<RegistryResult<Vec<Instance>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRegistry {
        fn new(script: Vec<RegistryResult<Vec<Instance>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ServiceRegistry for ScriptedRegistry {
        async fn fetch_instances(&self, _service: &str) -> RegistryResult<Vec<Instance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = next {
                *last = Some(next);
            }
            last.clone()
                .unwrap_or_else(|| Err(RegistryError::Unreachable("empty script".into())))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct SlowRegistry;

    #[async_trait]
    impl ServiceRegistry for SlowRegistry {
        async fn fetch_instances(&self, _service: &str) -> RegistryResult<Vec<Instance>> {
            sleep(Duration::from_secs(10)).await;
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn order_instances() -> Vec<Instance> {
        vec![
            Instance::new("order-service", "127.0.0.1", 9001),
            Instance::new("order-service", "127.0.0.1", 9002),
        ]
    }

    fn fast_settings() -> WatchSettings {
        WatchSettings {
            refresh_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_millis(200),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let pools = Arc::new(InstancePools::new());
        let registry = Arc::new(ScriptedRegistry::new(vec![Ok(order_instances())]));
        let watcher = RegistryWatcher::new(registry, pools.clone(), fast_settings());

        assert_eq!(watcher.refresh("order-service").await.unwrap(), 1);
        assert_eq!(pools.snapshot("order-service").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetches_keep_stale_pool() {
        let pools = Arc::new(InstancePools::new());
        let unreachable = || Err(RegistryError::Unreachable("connection refused".into()));
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Ok(order_instances()),
            unreachable(),
            unreachable(),
            unreachable(),
        ]));
        let watcher = Arc::new(RegistryWatcher::new(
            registry.clone(),
            pools.clone(),
            fast_settings(),
        ));

        assert_eq!(watcher.warm_up(&["order-service".to_string()]).await, 1);
        let before = pools.snapshot("order-service");

        let shutdown = CancellationToken::new();
        let handles = watcher.spawn(vec!["order-service".to_string()], shutdown.clone());
        while registry.calls.load(Ordering::SeqCst) < 4 {
            sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let after = pools.snapshot("order-service");
        assert_eq!(after.version(), before.version());
        assert_eq!(after.instances(), before.instances());
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_unavailable() {
        let pools = Arc::new(InstancePools::new());
        let watcher = RegistryWatcher::new(Arc::new(SlowRegistry), pools.clone(), fast_settings());

        let err = watcher.refresh("order-service").await.unwrap_err();
        assert!(matches!(err, GatewayError::RegistryUnavailable { .. }));
        assert_eq!(pools.snapshot("order-service").version(), 0);
    }

    #[tokio::test]
    async fn test_recovery_publishes_again() {
        let pools = Arc::new(InstancePools::new());
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Err(RegistryError::Unreachable("down".into())),
            Ok(order_instances()),
        ]));
        let watcher = Arc::new(RegistryWatcher::new(registry, pools.clone(), fast_settings()));

        assert_eq!(watcher.warm_up(&["order-service".to_string()]).await, 0);

        let shutdown = CancellationToken::new();
        let handles = watcher.spawn(vec!["order-service".to_string()], shutdown.clone());
        tokio::time::timeout(Duration::from_secs(2), async {
            while pools.snapshot("order-service").is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pools.snapshot("order-service").len(), 2);
    }
}
