//! Per-request orchestration: route, guard, select, call, record.
//!
//! For a matched route the steps run strictly in order:
//! 1. ask the route's breaker for a permit (rejected: fallback, no upstream call)
//! 2. select an instance (empty pool: recorded as a failure, fallback)
//! 3. call upstream within the connect and response timeouts
//! 4. record the outcome; 5xx, timeouts and connection errors are failures.
//!    A relayed response is recorded when its body ends, and the response
//!    timeout covers the body as well as the head
//! 5. return the upstream response, or the route's fallback on failure
//!
//! Unmatched requests get a 404 without touching breakers, balancers or pools.
use std::{net::SocketAddr, sync::Arc};

use axum::{body::Body, response::Response};
use hyper::{
    HeaderMap, Request, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use serde_json::json;
use tokio::time::{Instant, timeout_at};
use tracing::Instrument;

use crate::{
    core::{
        circuit_breaker::CallPermit,
        error::GatewayError,
        fallback::FallbackReason,
        gateway::GatewayService,
        instance::Instance,
        load_balancer::SelectionContext,
        route::Route,
        upstream_body::{CallCompletion, UpstreamBody},
    },
    metrics::{self, RequestTimer, UpstreamRequestTimer},
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How a request was answered, used as the `outcome` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Fallback,
    NoRoute,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fallback => "fallback",
            Self::NoRoute => "no_route",
        }
    }
}

pub struct Dispatcher {
    http_client: Arc<dyn HttpClient>,
}

impl Dispatcher {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }

    /// Handle one inbound request against `gateway`. Always produces a
    /// response; request-time errors become fallbacks or a 404.
    pub async fn dispatch(
        &self,
        gateway: &GatewayService,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Response {
        let path = req.uri().path().to_string();
        let Some(route) = gateway.find_route(req.method(), &path, req.headers()) else {
            tracing::debug!(method = %req.method(), path = %path, "No route matched");
            metrics::increment_request_total(
                "unmatched",
                StatusCode::NOT_FOUND.as_u16(),
                DispatchOutcome::NoRoute.as_str(),
            );
            return error_response(&GatewayError::NoRouteMatch {
                method: req.method().to_string(),
                path,
            });
        };

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let span = tracing_setup::create_request_span(&route.name, req.method().as_str(), &path, &request_id);

        async {
            let timer = RequestTimer::new(&route.name);
            let (response, outcome) = self.forward(gateway, &route, req, peer).await;
            let status = response.status().as_u16();
            tracing::Span::current().record("http.status_code", status);
            metrics::increment_request_total(&route.name, status, outcome.as_str());
            tracing::debug!(
                status,
                outcome = outcome.as_str(),
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Request completed"
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn forward(
        &self,
        gateway: &GatewayService,
        route: &Route,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> (Response, DispatchOutcome) {
        let permit = match route.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(error) => return (fallback(route, &error), DispatchOutcome::Fallback),
        };

        let hash_key = selection_key(route, req.headers(), peer);
        let ctx = SelectionContext {
            hash_key: hash_key.as_deref(),
        };
        let selection = match gateway.balancer().select(&route.service, route.strategy, &ctx) {
            Ok(selection) => selection,
            Err(error) => {
                record_error(permit, &error);
                return (fallback(route, &error), DispatchOutcome::Fallback);
            }
        };

        let deadline = Instant::now() + route.response_timeout;
        let result = match build_upstream_request(route, &selection.instance, req, peer) {
            Ok(upstream_req) => {
                self.call_upstream(route, &selection.instance, upstream_req, deadline)
                    .await
            }
            Err(error) => Err(error),
        };

        match result {
            Ok(response) => {
                // Settled when the body ends, still bound by the same deadline.
                let (parts, body) = response.into_parts();
                let completion = CallCompletion {
                    permit,
                    guard: selection.guard,
                    route: route.name.clone(),
                    instance: selection.instance.authority(),
                    response_timeout: route.response_timeout,
                };
                let body = UpstreamBody::new(body, deadline, completion).into_body();
                (Response::from_parts(parts, body), DispatchOutcome::Success)
            }
            Err(error) => {
                drop(selection.guard);
                record_error(permit, &error);
                (fallback(route, &error), DispatchOutcome::Fallback)
            }
        }
    }

    /// Issue the upstream call and wait for its response head until
    /// `deadline`. A 5xx answer is returned as
    /// [`GatewayError::UpstreamServerError`] and its body discarded.
    async fn call_upstream(
        &self,
        route: &Route,
        instance: &Instance,
        req: Request<Body>,
        deadline: Instant,
    ) -> Result<Response, GatewayError> {
        let authority = instance.authority();
        let span = tracing_setup::create_upstream_span(&route.service, &authority);

        async {
            let timer = UpstreamRequestTimer::new(&route.service);
            let call = self.http_client.send_request(req, route.connect_timeout);
            let result = match timeout_at(deadline, call).await {
                Err(_) => Err(GatewayError::UpstreamTimeout {
                    instance: authority.clone(),
                    timeout: route.response_timeout,
                }),
                Ok(Err(HttpClientError::ConnectTimeout(timeout))) => Err(GatewayError::UpstreamTimeout {
                    instance: authority.clone(),
                    timeout,
                }),
                Ok(Err(e)) => Err(GatewayError::UpstreamConnectionError {
                    instance: authority.clone(),
                    reason: e.to_string(),
                }),
                Ok(Ok(response)) if response.status().is_server_error() => {
                    Err(GatewayError::UpstreamServerError {
                        instance: authority.clone(),
                        status: response.status(),
                    })
                }
                Ok(Ok(response)) => Ok(response),
            };

            let status_label = match &result {
                Ok(response) => response.status().as_u16().to_string(),
                Err(GatewayError::UpstreamServerError { status, .. }) => status.as_u16().to_string(),
                Err(error) => error.kind().to_string(),
            };
            metrics::increment_upstream_request_total(&route.service, &authority, &status_label);
            tracing::Span::current().record("http.status_code", status_label.as_str());

            match &result {
                Ok(_) => tracing::debug!(
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    "Upstream responded"
                ),
                Err(error) => tracing::warn!(
                    error = %error,
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    "Upstream call failed"
                ),
            }

            result.map(|mut response| {
                strip_hop_by_hop(response.headers_mut());
                response
            })
        }
        .instrument(span)
        .await
    }
}

/// Resolve a request-time error into the route's fallback response.
fn fallback(route: &Route, error: &GatewayError) -> Response {
    match FallbackReason::from_error(error) {
        Some(reason) => {
            tracing::debug!(route = %route.name, reason = reason.as_str(), "Serving fallback");
            metrics::increment_fallback_total(&route.name, reason.as_str());
            route.fallback.respond(&route.name, reason)
        }
        None => error_response(error),
    }
}

/// Answer for errors without a route fallback. Unmatched requests get the
/// catch-all `{"error":"no_route","path":..}` 404.
fn error_response(error: &GatewayError) -> Response {
    let body = match error {
        GatewayError::NoRouteMatch { path, .. } => json!({ "error": error.kind(), "path": path }),
        _ => json!({ "error": error.kind(), "message": error.to_string() }),
    };
    json_response(error.status_code(), body)
}

/// Settle a permit for a call that ended in `error`. Errors that do not count
/// against the breaker release the permit without an outcome.
fn record_error(permit: CallPermit, error: &GatewayError) {
    if error.is_breaker_failure() {
        permit.failure();
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Client IP: the first `X-Forwarded-For` entry, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|p| p.ip().to_string()))
}

/// Sticky key for consistent hashing: the configured header if present,
/// otherwise the client IP.
fn selection_key(route: &Route, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    route
        .hash_header
        .as_ref()
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| client_ip(headers, peer))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite the inbound request for `instance`: absolute URI with the
/// stripped path, forwarded-* headers, hop-by-hop headers removed and Host
/// pointing at the instance.
fn build_upstream_request(
    route: &Route,
    instance: &Instance,
    req: Request<Body>,
    peer: Option<SocketAddr>,
) -> Result<Request<Body>, GatewayError> {
    let (mut parts, body) = req.into_parts();

    let path = route.upstream_path(parts.uri.path());
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    parts.uri = format!("{}{}", instance.base_url(), path_and_query)
        .parse::<Uri>()
        .map_err(|e| GatewayError::UpstreamConnectionError {
            instance: instance.authority(),
            reason: format!("invalid upstream uri: {e}"),
        })?;

    let original_host = parts.headers.get(header::HOST).cloned();
    let inbound_scheme = parts
        .headers
        .get(X_FORWARDED_PROTO)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));

    strip_hop_by_hop(&mut parts.headers);

    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        let forwarded_for = match parts
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }
    parts.headers.insert(X_FORWARDED_PROTO, inbound_scheme);
    if let Some(host) = original_host {
        parts.headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(authority) = HeaderValue::from_str(&instance.authority()) {
        parts.headers.insert(header::HOST, authority);
    }

    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use axum::body::Bytes;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::{LoadBalanceStrategy, ServerConfig},
        core::{
            circuit_breaker::{BreakerSettings, BreakerState},
            fallback::FALLBACK_HEADER,
            load_balancer::LoadBalancer,
            pool::InstancePools,
            route::{RoutePredicate, RouteTable},
        },
        ports::http_client::HttpClientResult,
    };

    /// Records outgoing requests and answers from a queue (default 200).
    #[derive(Default)]
    struct MockClient {
        seen: Mutex<Vec<Request<Body>>>,
        statuses: Mutex<VecDeque<u16>>,
        delay: Option<Duration>,
        stall_body: bool,
    }

    impl MockClient {
        fn with_statuses(statuses: &[u16]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn authorities(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.uri().authority().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_request(
            &self,
            req: Request<Body>,
            _connect_timeout: Duration,
        ) -> HttpClientResult<Response<Body>> {
            let (parts, _) = req.into_parts();
            self.seen
                .lock()
                .unwrap()
                .push(Request::from_parts(parts, Body::empty()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
            let body = if self.stall_body {
                Body::from_stream(futures_util::stream::pending::<Result<Bytes, std::io::Error>>())
            } else {
                Body::from(format!("upstream {status}"))
            };
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::from_u16(status).unwrap();
            response
                .headers_mut()
                .insert("keep-alive", HeaderValue::from_static("timeout=5"));
            Ok(response)
        }
    }

    fn gateway(route: Route, ports: &[u16]) -> GatewayService {
        let pools = Arc::new(InstancePools::new());
        pools.publish(
            &route.service,
            ports
                .iter()
                .map(|p| Instance::new(route.service.clone(), "127.0.0.1", *p))
                .collect(),
        );
        GatewayService::from_parts(
            Arc::new(ServerConfig::default()),
            RouteTable::new(vec![route]),
            Arc::new(LoadBalancer::new(pools)),
        )
    }

    fn product_route() -> Route {
        Route::new("product", RoutePredicate::prefix("/api/product"), "product-service")
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "gateway.local")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_forwards_with_proxy_headers() {
        let client = Arc::new(MockClient::default());
        let dispatcher = Dispatcher::new(client.clone());
        let gateway = gateway(product_route().with_strip_prefix(1), &[8001]);

        let mut req = get("/api/product/42?color=red");
        req.headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        req.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        let peer: SocketAddr = "10.1.1.1:50000".parse().unwrap();

        let response = dispatcher.dispatch(&gateway, req, Some(peer)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
        assert!(response.headers().get("keep-alive").is_none());

        let seen = client.seen.lock().unwrap();
        let upstream = &seen[0];
        assert_eq!(
            upstream.uri().to_string(),
            "http://127.0.0.1:8001/product/42?color=red"
        );
        assert_eq!(upstream.headers()[X_FORWARDED_FOR], "203.0.113.7, 10.1.1.1");
        assert_eq!(upstream.headers()[X_FORWARDED_PROTO], "http");
        assert_eq!(upstream.headers()[X_FORWARDED_HOST], "gateway.local");
        assert_eq!(upstream.headers()[header::HOST], "127.0.0.1:8001");
        assert!(upstream.headers().get(header::CONNECTION).is_none());
    }

    #[tokio::test]
    async fn test_no_route_is_not_found() {
        let client = Arc::new(MockClient::default());
        let dispatcher = Dispatcher::new(client.clone());
        let gateway = gateway(product_route(), &[8001]);

        let response = dispatcher.dispatch(&gateway, get("/unknown-path"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "no_route", "path": "/unknown-path" })
        );
        assert_eq!(client.calls(), 0);
        let breaker = gateway.routes().routes()[0].breaker.snapshot();
        assert_eq!(breaker.calls_in_window, 0);
    }

    #[tokio::test]
    async fn test_round_robin_across_requests() {
        let client = Arc::new(MockClient::default());
        let dispatcher = Dispatcher::new(client.clone());
        let gateway = gateway(product_route(), &[8001, 8002, 8003]);

        for _ in 0..6 {
            let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(
            client.authorities(),
            [
                "127.0.0.1:8001",
                "127.0.0.1:8002",
                "127.0.0.1:8003",
                "127.0.0.1:8001",
                "127.0.0.1:8002",
                "127.0.0.1:8003"
            ]
        );
    }

    #[tokio::test]
    async fn test_server_error_served_as_fallback() {
        let client = Arc::new(MockClient::with_statuses(&[503, 404]));
        let dispatcher = Dispatcher::new(client.clone());
        let gateway = gateway(product_route(), &[8001]);

        let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[FALLBACK_HEADER], "upstream_server_error");
        let body = body_json(response).await;
        assert_eq!(body["fallback"], true);

        // 4xx passes through untouched and counts as success once relayed.
        let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
        assert_eq!(body_text(response).await, "upstream 404");

        let breaker = gateway.routes().routes()[0].breaker.snapshot();
        assert_eq!(breaker.calls_in_window, 2);
        assert_eq!(breaker.failures_in_window, 1);
    }

    #[tokio::test]
    async fn test_response_timeout_is_failure() {
        let client = Arc::new(MockClient {
            delay: Some(Duration::from_millis(200)),
            ..MockClient::default()
        });
        let dispatcher = Dispatcher::new(client.clone());
        let route = product_route().with_timeouts(Duration::from_millis(50), Duration::from_millis(20));
        let gateway = gateway(route, &[8001]);

        let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
        assert_eq!(response.headers()[FALLBACK_HEADER], "upstream_timeout");
        assert_eq!(gateway.balancer().in_flight().total(), 0);
        assert_eq!(
            gateway.routes().routes()[0].breaker.snapshot().failures_in_window,
            1
        );
    }

    #[tokio::test]
    async fn test_stalled_body_is_bounded_by_response_timeout() {
        let client = Arc::new(MockClient {
            stall_body: true,
            ..MockClient::default()
        });
        let dispatcher = Dispatcher::new(client.clone());
        let route = product_route()
            .with_strategy(LoadBalanceStrategy::LeastConnections)
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(50));
        let gateway = gateway(route, &[8001]);

        let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        // The call is still in progress while the body is outstanding.
        assert_eq!(gateway.balancer().in_flight().total(), 1);
        assert_eq!(gateway.routes().routes()[0].breaker.snapshot().calls_in_window, 0);

        let collected = tokio::time::timeout(Duration::from_secs(2), response.into_body().collect())
            .await
            .expect("body ends at the response deadline");
        assert!(collected.is_err());

        assert_eq!(gateway.balancer().in_flight().total(), 0);
        let breaker = gateway.routes().routes()[0].breaker.snapshot();
        assert_eq!(breaker.calls_in_window, 1);
        assert_eq!(breaker.failures_in_window, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_counts_as_failure_and_trips() {
        let client = Arc::new(MockClient::default());
        let dispatcher = Dispatcher::new(client.clone());
        let route = product_route().with_breaker(BreakerSettings {
            minimum_calls: 4,
            sliding_window_size: 4,
            ..BreakerSettings::default()
        });
        let gateway = gateway(route, &[]);

        for _ in 0..4 {
            let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
            assert_eq!(response.headers()[FALLBACK_HEADER], "no_healthy_instances");
        }
        assert_eq!(gateway.routes().routes()[0].breaker.state(), BreakerState::Open);

        let response = dispatcher.dispatch(&gateway, get("/api/product"), None).await;
        assert_eq!(response.headers()[FALLBACK_HEADER], "breaker_open");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_consistent_hash_uses_header_key() {
        let client = Arc::new(MockClient::default());
        let dispatcher = Dispatcher::new(client.clone());
        let mut route = product_route().with_strategy(LoadBalanceStrategy::ConsistentHash);
        route.hash_header = Some(HeaderName::from_static("x-user-id"));
        let gateway = gateway(route, &[8001, 8002, 8003, 8004]);

        for _ in 0..5 {
            let mut req = get("/api/product");
            req.headers_mut()
                .insert("x-user-id", HeaderValue::from_static("user-17"));
            dispatcher.dispatch(&gateway, req, None).await;
        }
        let authorities = client.authorities();
        assert!(authorities.iter().all(|a| a == &authorities[0]));
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_releases_counters() {
        let client = Arc::new(MockClient {
            delay: Some(Duration::from_secs(5)),
            ..MockClient::default()
        });
        let dispatcher = Dispatcher::new(client.clone());
        let gateway = gateway(
            product_route().with_strategy(LoadBalanceStrategy::LeastConnections),
            &[8001],
        );

        let pending = dispatcher.dispatch(&gateway, get("/api/product"), None);
        let cancelled = tokio::time::timeout(Duration::from_millis(30), pending).await;
        assert!(cancelled.is_err());
        assert_eq!(gateway.balancer().in_flight().total(), 0);
        // Cancelled calls are neither successes nor failures.
        assert_eq!(
            gateway.routes().routes()[0].breaker.snapshot_at(Instant::now()).calls_in_window,
            0
        );
    }

    #[tokio::test]
    async fn test_error_response_without_fallback() {
        let response = error_response(&GatewayError::Configuration("bad policy".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "configuration_error");
        assert_eq!(body["message"], "Configuration error: bad policy");
    }

    #[test]
    fn test_only_breaker_failures_are_recorded() {
        let route = product_route();
        record_error(
            route.breaker.try_acquire().unwrap(),
            &GatewayError::BreakerOpen {
                route: "product".into(),
            },
        );
        assert_eq!(route.breaker.snapshot().calls_in_window, 0);

        record_error(
            route.breaker.try_acquire().unwrap(),
            &GatewayError::NoHealthyInstances {
                service: "product-service".into(),
            },
        );
        let snapshot = route.breaker.snapshot();
        assert_eq!(snapshot.calls_in_window, 1);
        assert_eq!(snapshot.failures_in_window, 1);
    }

    #[test]
    fn test_selection_key_prefers_header_then_forwarded_for() {
        let mut route = product_route();
        route.hash_header = Some(HeaderName::from_static("x-user-id"));
        let peer: SocketAddr = "10.0.0.9:1234".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(selection_key(&route, &headers, Some(peer)).as_deref(), Some("10.0.0.9"));

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1, 10.0.0.2"));
        assert_eq!(
            selection_key(&route, &headers, Some(peer)).as_deref(),
            Some("198.51.100.1")
        );

        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        assert_eq!(selection_key(&route, &headers, Some(peer)).as_deref(), Some("alice"));
    }
}
