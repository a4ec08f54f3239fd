pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod instance;
pub mod load_balancer;
pub mod pool;
pub mod route;
pub mod upstream_body;

pub use circuit_breaker::{BreakerSettings, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dispatcher::Dispatcher;
pub use error::{GatewayError, GatewayResult};
pub use fallback::{Fallback, FallbackReason};
pub use gateway::GatewayService;
pub use instance::{HealthStatus, Instance};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory};
pub use pool::{InstancePools, PoolSnapshot};
pub use route::{Route, RoutePredicate, RouteTable};
