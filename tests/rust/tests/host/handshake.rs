//! Handshake negotiation and identity issuance.

use connectplugin_host::HostConfig;
use connectplugin_host::HostOptions;
use pretty_assertions::assert_eq;
use tests::{wire, TestHost};

#[tokio::test]
async fn handshake_mints_identity_and_token() {
    let host = TestHost::spawn_default().await;

    let session = wire::quick_handshake(&host, "kv").await;
    let (name, suffix) = session.runtime_id.rsplit_once('-').unwrap();
    assert_eq!(name, "kv");
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(session.runtime_token.len(), 44);
    assert_eq!(session.negotiated_protocol_version, 1);
    assert!(host.state.registry.runtime_alive(&session.runtime_id));

    host.shutdown().await;
}

#[tokio::test]
async fn identical_requests_mint_distinct_identities() {
    let host = TestHost::spawn_default().await;

    let a = wire::quick_handshake(&host, "kv").await;
    let b = wire::quick_handshake(&host, "kv").await;
    assert_ne!(a.runtime_id, b.runtime_id);
    assert_ne!(a.runtime_token, b.runtime_token);

    host.shutdown().await;
}

#[tokio::test]
async fn unsupported_protocol_version_is_invalid_argument() {
    let host = TestHost::spawn_default().await;

    let mut request = wire::handshake_request("kv");
    request.protocol_version = 99;
    let response = wire::http()
        .post(host.url("/plugin.v1.HandshakeService/Handshake"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_argument");

    host.shutdown().await;
}

#[tokio::test]
async fn magic_cookie_mismatch_is_invalid_argument() {
    let config = HostConfig::default().with_magic_cookie("CONNECT_PLUGIN", "expected");
    let host = TestHost::spawn(config, HostOptions::default()).await;

    let mut request = wire::handshake_request("kv");
    request.magic_cookie_key = Some("CONNECT_PLUGIN".into());
    request.magic_cookie_value = Some("wrong".into());
    let response = wire::http()
        .post(host.url("/plugin.v1.HandshakeService/Handshake"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_argument");

    host.shutdown().await;
}

#[tokio::test]
async fn empty_self_id_is_invalid_argument() {
    let host = TestHost::spawn_default().await;

    let mut request = wire::handshake_request("kv");
    request.self_id = "  ".into();
    let response = wire::http()
        .post(host.url("/plugin.v1.HandshakeService/Handshake"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    host.shutdown().await;
}

#[tokio::test]
async fn revoke_cascades_to_registrations() {
    let host = TestHost::spawn_default().await;
    let session = wire::quick_handshake(&host, "logger").await;

    let response = wire::authed_post(
        &host,
        &session,
        "/plugin.v1.ServiceRegistry/RegisterService",
        serde_json::json!({
            "service_type": "logger",
            "version": "1.0.0",
            "endpoint_path": "/logger.v1",
        }),
    )
    .await;
    assert!(response.status().is_success());

    let response = wire::authed_post(
        &host,
        &session,
        "/plugin.v1.HandshakeService/Revoke",
        serde_json::json!({ "runtime_id": session.runtime_id }),
    )
    .await;
    assert!(response.status().is_success());

    assert!(!host.state.registry.runtime_alive(&session.runtime_id));
    assert_eq!(host.state.token_store.len(), 0);

    // The revoked credentials no longer authenticate.
    let response = wire::authed_post(
        &host,
        &session,
        "/plugin.v1.ServiceRegistry/DiscoverService",
        serde_json::json!({ "service_type": "logger" }),
    )
    .await;
    assert_eq!(response.status(), 401);

    host.shutdown().await;
}

#[tokio::test]
async fn a_runtime_cannot_revoke_another() {
    let host = TestHost::spawn_default().await;
    let a = wire::quick_handshake(&host, "kv").await;
    let b = wire::quick_handshake(&host, "logger").await;

    let response = wire::authed_post(
        &host,
        &a,
        "/plugin.v1.HandshakeService/Revoke",
        serde_json::json!({ "runtime_id": b.runtime_id }),
    )
    .await;
    assert_eq!(response.status(), 403);
    assert!(host.state.registry.runtime_alive(&b.runtime_id));

    host.shutdown().await;
}
