//! Plugin-side client integration against a live host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connectplugin_client::{ClientConfig, PluginClient, RetryPolicy};
use connectplugin_core::proto::RegisterServiceRequest;
use connectplugin_core::{
    CapabilityHandler, CapabilityRequest, CapabilityResponse, DiscoverStrategy, Error,
    RegistryEvent,
};
use connectplugin_host::{CapabilityOffer, HostConfig, HostOptions};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tests::TestHost;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_config(host: &TestHost, self_id: &str, plugin_endpoint: &str) -> ClientConfig {
    ClientConfig::new(&host.base_url, self_id, plugin_endpoint)
}

#[tokio::test]
async fn lazy_handshake_happens_on_first_call() {
    let host = TestHost::spawn_default().await;
    let client =
        PluginClient::new(client_config(&host, "kv", "http://127.0.0.1:59999")).unwrap();

    assert!(client.runtime_id().await.is_none());

    // First authenticated call triggers the handshake.
    let err = client
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let runtime_id = client.runtime_id().await.expect("session established");
    assert!(runtime_id.starts_with("kv-"));

    host.shutdown().await;
}

#[tokio::test]
async fn register_discover_and_call_through_router() {
    let host = TestHost::spawn_default().await;
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logger.v1/Log"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&backend)
        .await;

    let provider = PluginClient::new(client_config(&host, "logger", &backend.uri())).unwrap();
    provider.connect().await.unwrap();
    provider
        .register_service(RegisterServiceRequest {
            service_type: "logger".into(),
            version: "1.0.0".parse().unwrap(),
            endpoint_path: "/logger.v1".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();

    let consumer =
        PluginClient::new(client_config(&host, "kv", "http://127.0.0.1:59998")).unwrap();
    let providers = consumer
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].service_type, "logger");

    let response = consumer
        .call_service(&providers[0], "Log", serde_json::json!({"line": "hello"}))
        .await
        .unwrap();
    assert_eq!(response["ok"], true);

    host.shutdown().await;
}

#[tokio::test]
async fn watch_stream_sees_registrations_and_ends_on_revoke() {
    let host = TestHost::spawn_default().await;

    let watcher =
        PluginClient::new(client_config(&host, "watcher", "http://127.0.0.1:59997")).unwrap();
    watcher.connect().await.unwrap();
    let mut stream = watcher.watch_service("logger").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let provider =
        PluginClient::new(client_config(&host, "logger", "http://127.0.0.1:59996")).unwrap();
    provider.connect().await.unwrap();
    let registered = provider
        .register_service(RegisterServiceRequest {
            service_type: "logger".into(),
            version: "1.0.0".parse().unwrap(),
            endpoint_path: "/logger.v1".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("event before timeout")
        .expect("stream open")
        .expect("decoded event");
    match event {
        RegistryEvent::Added(reg) => {
            assert_eq!(reg.registration_id, registered.registration_id);
        }
        other => panic!("expected ADDED, got {other:?}"),
    }

    // Revoking the watcher ends its stream on the next delivery.
    watcher.revoke().await.unwrap();
    provider
        .register_service(RegisterServiceRequest {
            service_type: "logger".into(),
            version: "1.1.0".parse().unwrap(),
            endpoint_path: "/logger.v1".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();

    let end = tokio::time::timeout(Duration::from_secs(10), stream.next()).await;
    assert!(matches!(end, Ok(None)), "stream should end after revocation");

    host.shutdown().await;
}

struct EchoSecrets;

#[async_trait]
impl CapabilityHandler for EchoSecrets {
    async fn handle(
        &self,
        _request: CapabilityRequest,
    ) -> connectplugin_core::Result<CapabilityResponse> {
        Ok(CapabilityResponse::json(br#"{"value":"hunter2"}"#.to_vec()))
    }
}

#[tokio::test]
async fn capability_request_and_call() {
    let options = HostOptions::default().with_capability(
        "secrets",
        CapabilityOffer::for_everyone(Arc::new(EchoSecrets)),
    );
    let host = TestHost::spawn(HostConfig::default(), options).await;

    let client =
        PluginClient::new(client_config(&host, "kv", "http://127.0.0.1:59995")).unwrap();
    let granted = client.request_capability("secrets").await.unwrap();
    let secret = client
        .call_capability(&granted, "GetSecret", serde_json::json!({"name": "db"}))
        .await
        .unwrap();
    assert_eq!(secret["value"], "hunter2");

    host.shutdown().await;
}

#[tokio::test]
async fn unreachable_host_is_unavailable_after_retries() {
    // Nothing listens here.
    let mut config = ClientConfig::new("http://127.0.0.1:1", "kv", "http://127.0.0.1:59994");
    config.retry_policy = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    };
    config.handshake_timeout = Duration::from_secs(2);
    let client = PluginClient::new(config).unwrap();

    let err = client
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn eager_mode_requires_explicit_connect() {
    let host = TestHost::spawn_default().await;
    let client =
        PluginClient::new(client_config(&host, "kv", "http://127.0.0.1:59992").eager()).unwrap();

    let err = client
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    client.connect().await.unwrap();
    let err = client
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    host.shutdown().await;
}

#[tokio::test]
async fn skip_handshake_blocks_authenticated_calls() {
    let host = TestHost::spawn_default().await;
    let mut config = client_config(&host, "kv", "http://127.0.0.1:59993");
    config.skip_handshake = true;
    let client = PluginClient::new(config).unwrap();

    assert!(client.connect().await.is_ok());
    let err = client
        .discover_service("logger", None, DiscoverStrategy::First)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    // Unauthenticated surfaces still work.
    let health = client.check_health("").await.unwrap();
    assert_eq!(
        health.status,
        connectplugin_core::proto::ServingStatus::Serving
    );

    host.shutdown().await;
}
