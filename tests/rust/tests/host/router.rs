//! Inter-plugin router proxying, credential scrubbing, and failover.

use connectplugin_core::proto::HandshakeResponse;
use pretty_assertions::assert_eq;
use tests::{wire, TestHost};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Handshake a provider whose endpoint is a wiremock server, then
/// register a logger service on it.
async fn provider_with_backend(
    host: &TestHost,
    self_id: &str,
    backend: &MockServer,
    version: &str,
) -> (HandshakeResponse, String) {
    let mut request = wire::handshake_request(self_id);
    request.endpoint = backend.uri();
    request.provides = vec![wire::provides("logger", version)];
    let session = wire::handshake(host, &request).await;

    let response = wire::authed_post(
        host,
        &session,
        "/plugin.v1.ServiceRegistry/RegisterService",
        serde_json::json!({
            "service_type": "logger",
            "version": version,
            "endpoint_path": "/logger.v1",
        }),
    )
    .await;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    (session, body["registration_id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn proxies_to_provider_and_scrubs_credentials() {
    let host = TestHost::spawn_default().await;
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logger.v1/Log"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&backend)
        .await;

    let (_provider, registration_id) =
        provider_with_backend(&host, "logger", &backend, "1.0.0").await;
    let caller = wire::quick_handshake(&host, "kv").await;

    let response = wire::http()
        .post(host.url(&format!("/services/logger/{registration_id}/Log")))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .header("x-request-id", "req-1")
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({ "line": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    // The provider saw the caller annotation but never the caller's
    // credentials.
    let received = backend.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let downstream = &received[0];
    assert_eq!(
        downstream.headers.get("x-plugin-caller").unwrap(),
        caller.runtime_id.as_str()
    );
    assert!(downstream.headers.get("authorization").is_none());
    assert!(downstream.headers.get("x-plugin-runtime-id").is_none());
    assert_eq!(downstream.headers.get("x-request-id").unwrap(), "req-1");

    // The call was attributed in the router log.
    let calls = host.state.call_log.recent(10);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].caller, caller.runtime_id);
    assert_eq!(calls[0].method, "Log");
    assert_eq!(calls[0].status, 200);

    host.shutdown().await;
}

#[tokio::test]
async fn unknown_registration_is_not_found() {
    let host = TestHost::spawn_default().await;
    let caller = wire::quick_handshake(&host, "kv").await;

    let response = wire::http()
        .post(host.url("/services/logger/no-such-registration/Log"))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    host.shutdown().await;
}

#[tokio::test]
async fn unreachable_provider_with_no_alternate_is_unavailable() {
    let host = TestHost::spawn_default().await;

    // Endpoint points at a port nothing listens on.
    let mut request = wire::handshake_request("logger");
    request.endpoint = "http://127.0.0.1:1".into();
    request.provides = vec![wire::provides("logger", "1.0.0")];
    let provider = wire::handshake(&host, &request).await;
    let response = wire::authed_post(
        &host,
        &provider,
        "/plugin.v1.ServiceRegistry/RegisterService",
        serde_json::json!({
            "service_type": "logger",
            "version": "1.0.0",
            "endpoint_path": "/logger.v1",
        }),
    )
    .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let registration_id = body["registration_id"].as_str().unwrap().to_string();

    let caller = wire::quick_handshake(&host, "kv").await;
    let response = wire::http()
        .post(host.url(&format!("/services/logger/{registration_id}/Log")))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unavailable");

    host.shutdown().await;
}

#[tokio::test]
async fn fails_over_to_highest_version_healthy_alternate() {
    let host = TestHost::spawn_default().await;

    let backend_a = MockServer::start().await;
    let backend_b = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logger.v1/Log"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"provider": "b"})),
        )
        .mount(&backend_b)
        .await;

    let (provider_a, registration_a) =
        provider_with_backend(&host, "logger-a", &backend_a, "1.0.0").await;
    let (_provider_b, _registration_b) =
        provider_with_backend(&host, "logger-b", &backend_b, "1.2.0").await;

    host.state.registry.mark_unhealthy(&provider_a.runtime_id);

    let caller = wire::quick_handshake(&host, "kv").await;
    // Addressing the unhealthy provider's registration routes to b.
    let response = wire::http()
        .post(host.url(&format!("/services/logger/{registration_a}/Log")))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["provider"], "b");
    assert!(backend_a.received_requests().await.unwrap().is_empty());

    host.shutdown().await;
}

#[tokio::test]
async fn service_type_mismatch_is_not_found() {
    let host = TestHost::spawn_default().await;
    let backend = MockServer::start().await;
    let (_provider, registration_id) =
        provider_with_backend(&host, "logger", &backend, "1.0.0").await;

    let caller = wire::quick_handshake(&host, "kv").await;
    let response = wire::http()
        .post(host.url(&format!("/services/metrics/{registration_id}/Push")))
        .header("x-plugin-runtime-id", &caller.runtime_id)
        .bearer_auth(&caller.runtime_token)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    host.shutdown().await;
}
