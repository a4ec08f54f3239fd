use std::{net::SocketAddr, sync::Arc, time::Instant};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
    middleware,
    routing::any,
};
use hyper::Response;
use serde_json::json;

use crate::{
    adapters::middleware::{request_id_middleware, request_timing_middleware},
    core::{Dispatcher, GatewayService},
    ports::http_client::HttpClient,
};

pub const HEALTH_PATH: &str = "/__gateway/health";
pub const STATUS_PATH: &str = "/__gateway/status";

/// HTTP entry point of the gateway.
///
/// Reserved `/__gateway/*` paths are answered here; everything else goes
/// through the dispatcher against the current [`GatewayService`]. The
/// service is read once per request, so a reload never changes the route
/// table under an in-flight request.
pub struct HttpHandler {
    gateway: Arc<ArcSwap<GatewayService>>,
    dispatcher: Dispatcher,
    started_at: Instant,
}

impl HttpHandler {
    pub fn new(gateway: Arc<ArcSwap<GatewayService>>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway,
            dispatcher: Dispatcher::new(http_client),
            started_at: Instant::now(),
        }
    }

    pub fn gateway(&self) -> &Arc<ArcSwap<GatewayService>> {
        &self.gateway
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let gateway = self.gateway.load_full();
        match req.uri().path() {
            HEALTH_PATH => return self.handle_health_check(&gateway),
            STATUS_PATH => return self.handle_status(&gateway),
            _ => {}
        }
        self.dispatcher.dispatch(&gateway, req, client_addr).await
    }

    /// 200 when every routed service has at least one instance, else 503.
    fn handle_health_check(&self, gateway: &GatewayService) -> Response<AxumBody> {
        let report = gateway.health();
        let status = if report.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        let health_data = json!({
            "status": if report.healthy { "healthy" } else { "unhealthy" },
            "services": report.services,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        json_response(status, health_data)
    }

    fn handle_status(&self, gateway: &GatewayService) -> Response<AxumBody> {
        let status = gateway.status();
        let status_data = json!({
            "service": "galaxy-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "listen_addr": gateway.config().listen_addr,
            "routes": status.routes,
            "pools": status.pools,
            "in_flight": gateway.balancer().in_flight().total(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        json_response(StatusCode::OK, status_data)
    }

    /// Axum router sending every path and method to [`handle_request`],
    /// wrapped in the request-ID and timing middleware.
    ///
    /// [`handle_request`]: Self::handle_request
    pub fn router(self: Arc<Self>) -> Router {
        let handle = move |req: Request| {
            let handler = self.clone();
            async move {
                let client_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                handler.handle_request(req, client_addr).await
            }
        };

        Router::new()
            .route("/", any(handle.clone()))
            .route("/{*path}", any(handle))
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
