//! Rate limiting at the wire surface.

use connectplugin_core::RateLimitSettings;
use connectplugin_host::{HostConfig, HostOptions, ENDPOINT_SERVICE_ROUTER};
use pretty_assertions::assert_eq;
use tests::{wire, TestHost};

#[tokio::test]
async fn router_calls_are_limited_per_caller() {
    let config = HostConfig::default()
        .with_rate_limit(ENDPOINT_SERVICE_ROUTER, RateLimitSettings::new(0.001, 3.0));
    let host = TestHost::spawn(config, HostOptions::default()).await;
    let caller = wire::quick_handshake(&host, "kv").await;

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let response = wire::http()
            .post(host.url("/services/logger/r1/Log"))
            .header("x-plugin-runtime-id", &caller.runtime_id)
            .bearer_auth(&caller.runtime_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
    }

    // First three pass the gate (then legitimately 404); the rest are
    // rejected by the bucket.
    assert_eq!(&statuses[..3], &[404, 404, 404]);
    assert_eq!(&statuses[3..], &[429, 429]);

    host.shutdown().await;
}

#[tokio::test]
async fn limits_are_per_client_key() {
    let config = HostConfig::default()
        .with_rate_limit(ENDPOINT_SERVICE_ROUTER, RateLimitSettings::new(0.001, 1.0));
    let host = TestHost::spawn(config, HostOptions::default()).await;
    let a = wire::quick_handshake(&host, "kv").await;
    let b = wire::quick_handshake(&host, "logger").await;

    for session in [&a, &b] {
        let response = wire::http()
            .post(host.url("/services/logger/r1/Log"))
            .header("x-plugin-runtime-id", &session.runtime_id)
            .bearer_auth(&session.runtime_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        // Each caller has its own full bucket.
        assert_eq!(response.status(), 404);
    }

    host.shutdown().await;
}

#[tokio::test]
async fn exhausted_limit_reports_resource_exhausted() {
    let config = HostConfig::default()
        .with_rate_limit(ENDPOINT_SERVICE_ROUTER, RateLimitSettings::new(0.001, 1.0));
    let host = TestHost::spawn(config, HostOptions::default()).await;
    let caller = wire::quick_handshake(&host, "kv").await;

    for _ in 0..2 {
        let _ = wire::http()
            .post(host.url("/services/logger/r1/Log"))
            .header("x-plugin-runtime-id", &caller.runtime_id)
            .bearer_auth(&caller.runtime_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
    }
    let response = wire::http()
        .post(host.url("/services/logger/r1/Log"))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "resource_exhausted");

    host.shutdown().await;
}

#[tokio::test]
async fn unconfigured_endpoints_are_uncapped() {
    let host = TestHost::spawn_default().await;
    let session = wire::quick_handshake(&host, "kv").await;

    for _ in 0..50 {
        let response = wire::authed_post(
            &host,
            &session,
            "/plugin.v1.ServiceRegistry/DiscoverService",
            serde_json::json!({ "service_type": "logger" }),
        )
        .await;
        assert_eq!(response.status(), 404);
    }

    host.shutdown().await;
}
