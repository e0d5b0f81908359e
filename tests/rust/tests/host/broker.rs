//! Capability broker over the wire.

use std::sync::Arc;

use async_trait::async_trait;
use connectplugin_core::proto::GrantedCapability;
use connectplugin_core::{CapabilityHandler, CapabilityRequest, CapabilityResponse};
use connectplugin_host::{CapabilityOffer, HostConfig, HostOptions};
use pretty_assertions::assert_eq;
use tests::{wire, TestHost};

struct SecretsHandler;

#[async_trait]
impl CapabilityHandler for SecretsHandler {
    async fn handle(
        &self,
        request: CapabilityRequest,
    ) -> connectplugin_core::Result<CapabilityResponse> {
        match request.path.as_str() {
            "GetSecret" => Ok(CapabilityResponse::json(
                br#"{"value":"hunter2"}"#.to_vec(),
            )),
            _ => Ok(CapabilityResponse {
                status: 404,
                content_type: "application/json".into(),
                body: br#"{"error":"no such secret op"}"#.to_vec(),
            }),
        }
    }
}

fn secrets_host_options() -> HostOptions {
    HostOptions::default().with_capability(
        "secrets",
        CapabilityOffer::for_everyone(Arc::new(SecretsHandler)),
    )
}

async fn request_capability(
    host: &TestHost,
    session: &connectplugin_core::proto::HandshakeResponse,
) -> GrantedCapability {
    let response = wire::authed_post(
        host,
        session,
        "/plugin.v1.CapabilityBroker/RequestCapability",
        serde_json::json!({ "capability_type": "secrets" }),
    )
    .await;
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

#[tokio::test]
async fn capability_types_are_advertised_at_handshake() {
    let host = TestHost::spawn(HostConfig::default(), secrets_host_options()).await;
    let session = wire::quick_handshake(&host, "kv").await;
    assert_eq!(session.server_capabilities, vec!["secrets".to_string()]);
    host.shutdown().await;
}

#[tokio::test]
async fn grant_then_call() {
    let host = TestHost::spawn(HostConfig::default(), secrets_host_options()).await;
    let session = wire::quick_handshake(&host, "kv").await;
    let granted = request_capability(&host, &session).await;

    assert!(granted
        .endpoint_url
        .ends_with(&format!("/capabilities/{}/", granted.grant_id)));
    assert_eq!(granted.bearer_token.len(), 44);

    let response = wire::http()
        .post(format!("{}GetSecret", granted.endpoint_url))
        .bearer_auth(&granted.bearer_token)
        .json(&serde_json::json!({ "name": "db" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["value"], "hunter2");

    host.shutdown().await;
}

#[tokio::test]
async fn unknown_capability_is_permission_denied() {
    let host = TestHost::spawn(HostConfig::default(), secrets_host_options()).await;
    let session = wire::quick_handshake(&host, "kv").await;

    let response = wire::authed_post(
        &host,
        &session,
        "/plugin.v1.CapabilityBroker/RequestCapability",
        serde_json::json!({ "capability_type": "filesystem" }),
    )
    .await;
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "permission_denied");

    host.shutdown().await;
}

#[tokio::test]
async fn bad_grant_credentials_are_uniformly_unauthenticated() {
    let host = TestHost::spawn(HostConfig::default(), secrets_host_options()).await;
    let session = wire::quick_handshake(&host, "kv").await;
    let granted = request_capability(&host, &session).await;

    // Wrong bearer on a real grant.
    let mut wrong = granted.bearer_token.clone().into_bytes();
    wrong[0] ^= 0x01;
    let wrong_bearer = wire::http()
        .post(format!("{}GetSecret", granted.endpoint_url))
        .bearer_auth(String::from_utf8(wrong).unwrap())
        .send()
        .await
        .unwrap();

    // Right bearer on an unknown grant.
    let unknown_grant = wire::http()
        .post(host.url("/capabilities/cap-0000000000000000/GetSecret"))
        .bearer_auth(&granted.bearer_token)
        .send()
        .await
        .unwrap();

    assert_eq!(wrong_bearer.status(), 401);
    assert_eq!(unknown_grant.status(), 401);
    let a: serde_json::Value = wrong_bearer.json().await.unwrap();
    let b: serde_json::Value = unknown_grant.json().await.unwrap();
    assert_eq!(a, b);

    host.shutdown().await;
}

#[tokio::test]
async fn runtime_revocation_kills_grants() {
    let host = TestHost::spawn(HostConfig::default(), secrets_host_options()).await;
    let session = wire::quick_handshake(&host, "kv").await;
    let granted = request_capability(&host, &session).await;

    let response = wire::authed_post(
        &host,
        &session,
        "/plugin.v1.HandshakeService/Revoke",
        serde_json::json!({ "runtime_id": session.runtime_id }),
    )
    .await;
    assert!(response.status().is_success());
    assert!(!host.state.broker.grant_exists(&granted.grant_id));

    let response = wire::http()
        .post(format!("{}GetSecret", granted.endpoint_url))
        .bearer_auth(&granted.bearer_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    host.shutdown().await;
}

#[tokio::test]
async fn allow_list_restricts_requesters() {
    let options = HostOptions::default().with_capability(
        "secrets",
        CapabilityOffer::for_plugins(Arc::new(SecretsHandler), ["kv".to_string()]),
    );
    let host = TestHost::spawn(HostConfig::default(), options).await;

    let kv = wire::quick_handshake(&host, "kv").await;
    let other = wire::quick_handshake(&host, "other").await;

    let allowed = wire::authed_post(
        &host,
        &kv,
        "/plugin.v1.CapabilityBroker/RequestCapability",
        serde_json::json!({ "capability_type": "secrets" }),
    )
    .await;
    assert!(allowed.status().is_success());

    let denied = wire::authed_post(
        &host,
        &other,
        "/plugin.v1.CapabilityBroker/RequestCapability",
        serde_json::json!({ "capability_type": "secrets" }),
    )
    .await;
    assert_eq!(denied.status(), 403);

    host.shutdown().await;
}
