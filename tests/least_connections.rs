// In-flight accounting under the least-connections policy.
mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_text, gateway_app, send, spawn_upstream, spawn_upstream_with};
use galaxy_gateway::config::{LoadBalanceStrategy, RouteConfig, ServerConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_instance_is_avoided_and_counters_return_to_zero() {
    let slow = spawn_upstream_with("slow", Duration::from_millis(400), |_| StatusCode::OK).await;
    let fast = spawn_upstream("fast").await;

    let config = ServerConfig::builder()
        .route(
            RouteConfig::new("order", "/api/order", "order-service")
                .with_strategy(LoadBalanceStrategy::LeastConnections),
        )
        .build()
        .unwrap();
    let (app, gateway) = gateway_app(config);
    gateway.load().pools().publish(
        "order-service",
        vec![slow.instance("order-service"), fast.instance("order-service")],
    );

    // Ties go to the first instance in pool order.
    let pending = {
        let app = app.clone();
        tokio::spawn(async move { body_text(send(&app, "/api/order/1").await).await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while slow.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(gateway.load().balancer().in_flight().total(), 1);

    for _ in 0..3 {
        let response = send(&app, "/api/order/2").await;
        assert_eq!(body_text(response).await, "fast");
    }

    assert_eq!(pending.await.unwrap(), "slow");
    assert_eq!(slow.hits(), 1);
    assert_eq!(fast.hits(), 3);

    let gateway = gateway.load();
    let in_flight = gateway.balancer().in_flight();
    assert_eq!(in_flight.total(), 0);
    assert_eq!(in_flight.current("order-service", &slow.addr.to_string()), 0);
}

#[tokio::test]
async fn test_timed_out_calls_release_their_slot() {
    let slow = spawn_upstream_with("slow", Duration::from_secs(2), |_| StatusCode::OK).await;

    let config = ServerConfig::builder()
        .route(
            RouteConfig::new("order", "/api/order", "order-service")
                .with_strategy(LoadBalanceStrategy::LeastConnections)
                .with_response_timeout("50ms"),
        )
        .build()
        .unwrap();
    let (app, gateway) = gateway_app(config);
    gateway
        .load()
        .pools()
        .publish("order-service", vec![slow.instance("order-service")]);

    for _ in 0..3 {
        let response = send(&app, "/api/order").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(gateway.load().balancer().in_flight().total(), 0);
}
