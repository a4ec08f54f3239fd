//! Upstream instance selection.
//!
//! A [`LoadBalancer`] owns one strategy object per `(service, strategy)` pair
//! so that cursors and weight state are tracked per service. Every strategy
//! selects an index into a single [`PoolSnapshot`] taken at the start of the
//! call, so a registry publish racing with a selection can never corrupt the
//! result: the caller simply gets an instance from the snapshot it read.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use arc_swap::ArcSwap;
use scc::HashMap;

use crate::{
    config::LoadBalanceStrategy,
    core::{
        error::{GatewayError, GatewayResult},
        instance::Instance,
        pool::{InstancePools, PoolSnapshot},
    },
    metrics,
};

/// Virtual nodes placed on the hash ring per instance.
const VIRTUAL_NODES_PER_INSTANCE: usize = 160;

/// Per-request inputs a strategy may use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    /// Sticky key (client identifier) for hash-based selection.
    pub hash_key: Option<&'a str>,
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Pick an index into `snapshot.instances()`, or `None` if it is empty.
    fn select_index(&self, snapshot: &PoolSnapshot, ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin over the current snapshot. The cursor restarts at zero
/// whenever the pool size changes.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
    pool_len: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_index(&self, snapshot: &PoolSnapshot, _ctx: &SelectionContext<'_>) -> Option<usize> {
        let len = snapshot.len();
        if len == 0 {
            return None;
        }
        if self.pool_len.swap(len, Ordering::AcqRel) != len {
            self.cursor.store(0, Ordering::Release);
        }
        Some(self.cursor.fetch_add(1, Ordering::AcqRel) % len)
    }
}

/// Picks the instance with the fewest in-flight requests; ties go to the
/// earliest instance in pool order.
pub struct LeastConnectionsStrategy {
    service: String,
    in_flight: Arc<InFlightCounters>,
}

impl LeastConnectionsStrategy {
    pub fn new(service: impl Into<String>, in_flight: Arc<InFlightCounters>) -> Self {
        Self {
            service: service.into(),
            in_flight,
        }
    }
}

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select_index(&self, snapshot: &PoolSnapshot, _ctx: &SelectionContext<'_>) -> Option<usize> {
        snapshot
            .instances()
            .iter()
            .enumerate()
            .min_by_key(|(index, instance)| {
                (
                    self.in_flight.current(&self.service, &instance.authority()),
                    *index,
                )
            })
            .map(|(index, _)| index)
    }
}

#[derive(Debug, Default)]
struct WeightedState {
    version: u64,
    current: Vec<i64>,
}

/// Smooth weighted round-robin: spreads heavier instances across the cycle
/// instead of sending them consecutive bursts.
#[derive(Debug, Default)]
pub struct WeightedStrategy {
    state: Mutex<WeightedState>,
}

impl WeightedStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for WeightedStrategy {
    fn select_index(&self, snapshot: &PoolSnapshot, _ctx: &SelectionContext<'_>) -> Option<usize> {
        let instances = snapshot.instances();
        if instances.is_empty() {
            return None;
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.version != snapshot.version() || state.current.len() != instances.len() {
            state.version = snapshot.version();
            state.current = vec![0; instances.len()];
        }

        let total: i64 = instances.iter().map(|i| i64::from(i.weight())).sum();
        let mut best = 0;
        for (index, instance) in instances.iter().enumerate() {
            state.current[index] += i64::from(instance.weight());
            if state.current[index] > state.current[best] {
                best = index;
            }
        }
        state.current[best] -= total;
        Some(best)
    }
}

/// Hash ring built from one snapshot version.
#[derive(Debug)]
struct HashRing {
    version: u64,
    points: Vec<(u64, usize)>,
}

impl HashRing {
    fn build(snapshot: &PoolSnapshot) -> Self {
        let mut points =
            Vec::with_capacity(snapshot.len() * VIRTUAL_NODES_PER_INSTANCE);
        for (index, instance) in snapshot.instances().iter().enumerate() {
            let authority = instance.authority();
            for vnode in 0..VIRTUAL_NODES_PER_INSTANCE {
                points.push((hash_key(&format!("{authority}#{vnode}")), index));
            }
        }
        points.sort_unstable();
        Self {
            version: snapshot.version(),
            points,
        }
    }

    fn lookup(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let position = self.points.partition_point(|(point, _)| *point < hash);
        let (_, index) = self.points[position % self.points.len()];
        Some(index)
    }
}

/// FNV-1a followed by a 64-bit avalanche finalizer so that similar keys
/// (`host:port#1`, `host:port#2`) land far apart on the ring.
fn hash_key(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

/// Sticky selection via consistent hashing. Requests without a key fall
/// back to round-robin.
pub struct ConsistentHashStrategy {
    ring: ArcSwap<HashRing>,
    keyless: RoundRobinStrategy,
}

impl Default for ConsistentHashStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistentHashStrategy {
    pub fn new() -> Self {
        Self {
            ring: ArcSwap::from_pointee(HashRing {
                version: 0,
                points: Vec::new(),
            }),
            keyless: RoundRobinStrategy::new(),
        }
    }

    fn ring_for(&self, snapshot: &PoolSnapshot) -> Arc<HashRing> {
        let cached = self.ring.load_full();
        if cached.version == snapshot.version() {
            return cached;
        }
        let ring = Arc::new(HashRing::build(snapshot));
        // Only move the cache forward; a caller holding an older snapshot
        // still gets a ring matching the snapshot it indexes into.
        if snapshot.version() > cached.version {
            self.ring.store(ring.clone());
        }
        ring
    }
}

impl LoadBalancingStrategy for ConsistentHashStrategy {
    fn select_index(&self, snapshot: &PoolSnapshot, ctx: &SelectionContext<'_>) -> Option<usize> {
        if snapshot.is_empty() {
            return None;
        }
        match ctx.hash_key {
            Some(key) => self.ring_for(snapshot).lookup(key),
            None => self.keyless.select_index(snapshot, ctx),
        }
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new strategy for `service` based on configuration
    pub fn create_strategy(
        strategy: LoadBalanceStrategy,
        service: &str,
        in_flight: Arc<InFlightCounters>,
    ) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::LeastConnections => {
                LeastConnectionsStrategy::new(service, in_flight).boxed()
            }
            LoadBalanceStrategy::Weighted => WeightedStrategy::new().boxed(),
            LoadBalanceStrategy::ConsistentHash => ConsistentHashStrategy::new().boxed(),
        }
    }
}

/// In-flight request counters per `(service, instance authority)`.
///
/// Counters outlive pool snapshots so a refresh that re-lists the same
/// instance keeps its count.
#[derive(Debug, Default)]
pub struct InFlightCounters {
    counters: HashMap<(String, String), Arc<AtomicUsize>>,
}

impl InFlightCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, service: &str, authority: &str) -> Arc<AtomicUsize> {
        let key = (service.to_string(), authority.to_string());
        if let Some(counter) = self.counters.read(&key, |_, c| c.clone()) {
            return counter;
        }
        self.counters
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .get()
            .clone()
    }

    /// Current in-flight count (0 for unknown instances).
    pub fn current(&self, service: &str, authority: &str) -> usize {
        self.counters
            .read(&(service.to_string(), authority.to_string()), |_, c| {
                c.load(Ordering::Acquire)
            })
            .unwrap_or(0)
    }

    /// Sum of all in-flight counters.
    pub fn total(&self) -> usize {
        let mut total = 0;
        self.counters
            .scan(|_, counter| total += counter.load(Ordering::Acquire));
        total
    }

    /// Increment the counter for `instance` and return a guard that
    /// decrements it when dropped.
    pub fn acquire(&self, instance: &Instance) -> InFlightGuard {
        let authority = instance.authority();
        let counter = self.counter(instance.service(), &authority);
        let now = counter.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_inflight_requests(instance.service(), &authority, now);
        InFlightGuard {
            counter,
            service: instance.service().to_string(),
            authority,
        }
    }
}

/// Decrements its in-flight counter on drop, which covers success, failure,
/// timeout and cancellation (the owning future being dropped) alike.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    service: String,
    authority: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::set_inflight_requests(
            &self.service,
            &self.authority,
            previous.saturating_sub(1),
        );
    }
}

/// A selected instance plus the in-flight guard for the call made to it.
#[derive(Debug)]
pub struct Selection {
    pub instance: Instance,
    pub guard: InFlightGuard,
}

/// Selects instances from the shared pools under a per-route policy.
pub struct LoadBalancer {
    pools: Arc<InstancePools>,
    in_flight: Arc<InFlightCounters>,
    strategies: HashMap<(String, LoadBalanceStrategy), Arc<dyn LoadBalancingStrategy>>,
}

impl LoadBalancer {
    pub fn new(pools: Arc<InstancePools>) -> Self {
        Self {
            pools,
            in_flight: Arc::new(InFlightCounters::new()),
            strategies: HashMap::new(),
        }
    }

    pub fn pools(&self) -> &Arc<InstancePools> {
        &self.pools
    }

    pub fn in_flight(&self) -> &Arc<InFlightCounters> {
        &self.in_flight
    }

    fn strategy(
        &self,
        service: &str,
        strategy: LoadBalanceStrategy,
    ) -> Arc<dyn LoadBalancingStrategy> {
        let key = (service.to_string(), strategy);
        if let Some(existing) = self.strategies.read(&key, |_, s| s.clone()) {
            return existing;
        }
        self.strategies
            .entry(key)
            .or_insert_with(|| {
                Arc::from(LoadBalancerFactory::create_strategy(
                    strategy,
                    service,
                    self.in_flight.clone(),
                ))
            })
            .get()
            .clone()
    }

    /// Select one healthy instance of `service`, or fail with
    /// [`GatewayError::NoHealthyInstances`] when the pool is empty.
    pub fn select(
        &self,
        service: &str,
        strategy: LoadBalanceStrategy,
        ctx: &SelectionContext<'_>,
    ) -> GatewayResult<Selection> {
        let snapshot = self.pools.snapshot(service);
        let index = self
            .strategy(service, strategy)
            .select_index(&snapshot, ctx)
            .ok_or_else(|| GatewayError::NoHealthyInstances {
                service: service.to_string(),
            })?;
        let instance = snapshot.instances()[index].clone();
        let guard = self.in_flight.acquire(&instance);
        Ok(Selection { instance, guard })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;

    fn publish(pools: &InstancePools, service: &str, ports: &[u16]) {
        pools.publish(
            service,
            ports
                .iter()
                .map(|p| Instance::new(service, "127.0.0.1", *p))
                .collect(),
        );
    }

    fn balancer_with(service: &str, ports: &[u16]) -> LoadBalancer {
        let pools = Arc::new(InstancePools::new());
        publish(&pools, service, ports);
        LoadBalancer::new(pools)
    }

    #[test]
    fn test_round_robin_in_pool_order() {
        let lb = balancer_with("product-service", &[8001, 8002, 8003]);
        let ports: Vec<u16> = (0..6)
            .map(|_| {
                lb.select(
                    "product-service",
                    LoadBalanceStrategy::RoundRobin,
                    &SelectionContext::default(),
                )
                .unwrap()
                .instance
                .port()
            })
            .collect();
        assert_eq!(ports, vec![8001, 8002, 8003, 8001, 8002, 8003]);
    }

    #[test]
    fn test_round_robin_distribution_is_even() {
        for n in [1usize, 7, 13, 40] {
            let mut counts: StdHashMap<u16, usize> = StdHashMap::new();
            let lb = balancer_with("svc", &[1, 2, 3, 4]);
            for _ in 0..n {
                let selection = lb
                    .select("svc", LoadBalanceStrategy::RoundRobin, &SelectionContext::default())
                    .unwrap();
                *counts.entry(selection.instance.port()).or_default() += 1;
            }
            for port in [1u16, 2, 3, 4] {
                let count = counts.get(&port).copied().unwrap_or(0);
                assert!(count == n / 4 || count == n.div_ceil(4), "n={n} port={port} count={count}");
            }
        }
    }

    #[test]
    fn test_round_robin_resets_on_pool_size_change() {
        let pools = Arc::new(InstancePools::new());
        publish(&pools, "svc", &[1, 2, 3]);
        let lb = LoadBalancer::new(pools.clone());
        let ctx = SelectionContext::default();

        assert_eq!(lb.select("svc", LoadBalanceStrategy::RoundRobin, &ctx).unwrap().instance.port(), 1);
        assert_eq!(lb.select("svc", LoadBalanceStrategy::RoundRobin, &ctx).unwrap().instance.port(), 2);

        publish(&pools, "svc", &[1, 2]);
        assert_eq!(lb.select("svc", LoadBalanceStrategy::RoundRobin, &ctx).unwrap().instance.port(), 1);
    }

    #[test]
    fn test_empty_pool_fails_for_every_strategy() {
        let lb = LoadBalancer::new(Arc::new(InstancePools::new()));
        for strategy in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::LeastConnections,
            LoadBalanceStrategy::Weighted,
            LoadBalanceStrategy::ConsistentHash,
        ] {
            let err = lb
                .select("missing", strategy, &SelectionContext { hash_key: Some("k") })
                .unwrap_err();
            assert_eq!(
                err,
                GatewayError::NoHealthyInstances {
                    service: "missing".to_string()
                }
            );
        }
    }

    #[test]
    fn test_least_connections_prefers_idle_and_breaks_ties_by_order() {
        let lb = balancer_with("svc", &[1, 2, 3]);
        let ctx = SelectionContext::default();

        let first = lb.select("svc", LoadBalanceStrategy::LeastConnections, &ctx).unwrap();
        assert_eq!(first.instance.port(), 1);
        let second = lb.select("svc", LoadBalanceStrategy::LeastConnections, &ctx).unwrap();
        assert_eq!(second.instance.port(), 2);
        let third = lb.select("svc", LoadBalanceStrategy::LeastConnections, &ctx).unwrap();
        assert_eq!(third.instance.port(), 3);

        drop(second);
        let fourth = lb.select("svc", LoadBalanceStrategy::LeastConnections, &ctx).unwrap();
        assert_eq!(fourth.instance.port(), 2);

        drop((first, third, fourth));
        assert_eq!(lb.in_flight().total(), 0);
    }

    #[test]
    fn test_in_flight_counters_return_to_zero() {
        let lb = Arc::new(balancer_with("svc", &[1, 2]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = lb.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let selection = lb
                            .select(
                                "svc",
                                LoadBalanceStrategy::LeastConnections,
                                &SelectionContext::default(),
                            )
                            .unwrap();
                        drop(selection);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lb.in_flight().total(), 0);
        assert_eq!(lb.in_flight().current("svc", "127.0.0.1:1"), 0);
    }

    #[test]
    fn test_guard_never_goes_negative() {
        let counters = InFlightCounters::new();
        let instance = Instance::new("svc", "127.0.0.1", 1);
        let guard = counters.acquire(&instance);
        counters
            .counter("svc", "127.0.0.1:1")
            .store(0, Ordering::Release);
        drop(guard);
        assert_eq!(counters.current("svc", "127.0.0.1:1"), 0);
    }

    #[test]
    fn test_smooth_weighted_sequence() {
        let pools = Arc::new(InstancePools::new());
        pools.publish(
            "svc",
            vec![
                Instance::new("svc", "a", 1).with_weight(5),
                Instance::new("svc", "b", 1),
                Instance::new("svc", "c", 1),
            ],
        );
        let lb = LoadBalancer::new(pools);
        let hosts: Vec<String> = (0..7)
            .map(|_| {
                lb.select("svc", LoadBalanceStrategy::Weighted, &SelectionContext::default())
                    .unwrap()
                    .instance
                    .host()
                    .to_string()
            })
            .collect();
        assert_eq!(hosts, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_consistent_hash_is_sticky() {
        let lb = balancer_with("svc", &[1, 2, 3, 4, 5]);
        for key in ["alice", "bob", "carol", "10.1.2.3"] {
            let ctx = SelectionContext { hash_key: Some(key) };
            let first = lb
                .select("svc", LoadBalanceStrategy::ConsistentHash, &ctx)
                .unwrap()
                .instance
                .port();
            for _ in 0..10 {
                let again = lb
                    .select("svc", LoadBalanceStrategy::ConsistentHash, &ctx)
                    .unwrap()
                    .instance
                    .port();
                assert_eq!(first, again);
            }
        }
    }

    #[test]
    fn test_consistent_hash_remaps_only_to_new_instance() {
        let ports: Vec<u16> = (1..=10).collect();
        let before = {
            let pools = InstancePools::new();
            publish(&pools, "svc", &ports);
            pools.snapshot("svc")
        };
        let mut grown = ports.clone();
        grown.push(11);
        let after = {
            let pools = InstancePools::new();
            publish(&pools, "svc", &grown);
            pools.snapshot("svc")
        };

        let strategy_before = ConsistentHashStrategy::new();
        let strategy_after = ConsistentHashStrategy::new();
        let mut moved = 0;
        for i in 0..2000 {
            let key = format!("client-{i}");
            let ctx = SelectionContext { hash_key: Some(&key) };
            let old = before.instances()[strategy_before.select_index(&before, &ctx).unwrap()].port();
            let new = after.instances()[strategy_after.select_index(&after, &ctx).unwrap()].port();
            if old != new {
                assert_eq!(new, 11, "key {key} moved between existing instances");
                moved += 1;
            }
        }
        // Expected share is 1/11 of 2000 (~182).
        assert!(moved > 60 && moved < 400, "moved {moved}");
    }

    #[test]
    fn test_consistent_hash_without_key_round_robins() {
        let lb = balancer_with("svc", &[1, 2]);
        let ctx = SelectionContext::default();
        let a = lb.select("svc", LoadBalanceStrategy::ConsistentHash, &ctx).unwrap();
        let b = lb.select("svc", LoadBalanceStrategy::ConsistentHash, &ctx).unwrap();
        assert_ne!(a.instance.port(), b.instance.port());
    }
}
