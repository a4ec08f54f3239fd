#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use galaxy_gateway::{
    HttpClientAdapter, HttpHandler,
    config::ServerConfig,
    core::{GatewayService, Instance},
};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// A local upstream that counts hits and answers with a status chosen per
/// call number (starting at 1).
pub struct Upstream {
    pub name: String,
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn instance(&self, service: &str) -> Instance {
        Instance::new(service, self.addr.ip().to_string(), self.addr.port())
    }
}

pub async fn spawn_upstream(name: &str) -> Upstream {
    spawn_upstream_with(name, Duration::ZERO, |_| StatusCode::OK).await
}

pub async fn spawn_upstream_with(
    name: &str,
    delay: Duration,
    status_for_call: fn(usize) -> StatusCode,
) -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let body = name.to_string();
    let app = Router::new().fallback(move |_req: Request| {
        let counter = counter.clone();
        let body = body.clone();
        async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            (status_for_call(call), body).into_response()
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream {
        name: name.to_string(),
        addr,
        hits,
    }
}

/// Gateway router over a real HTTP client, plus the swap holder so tests
/// can reach pools and breakers.
pub fn gateway_app(config: ServerConfig) -> (Router, Arc<ArcSwap<GatewayService>>) {
    let gateway = GatewayService::from_config(Arc::new(config)).unwrap();
    let holder = Arc::new(ArcSwap::from_pointee(gateway));
    let client = Arc::new(HttpClientAdapter::new().unwrap());
    let handler = Arc::new(HttpHandler::new(holder.clone(), client));
    (handler.router(), holder)
}

pub async fn send(app: &Router, path: &str) -> Response {
    app.clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
