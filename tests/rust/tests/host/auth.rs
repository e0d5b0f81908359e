//! Auth interceptor chain behavior over the wire.

use pretty_assertions::assert_eq;
use tests::{wire, TestHost};

const DISCOVER: &str = "/plugin.v1.ServiceRegistry/DiscoverService";

async fn error_body(response: reqwest::Response) -> (u16, serde_json::Value) {
    let status = response.status().as_u16();
    let body = response.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn missing_credentials_are_unauthenticated() {
    let host = TestHost::spawn_default().await;

    let response = wire::http()
        .post(host.url(DISCOVER))
        .json(&serde_json::json!({ "service_type": "logger" }))
        .send()
        .await
        .unwrap();
    let (status, body) = error_body(response).await;
    assert_eq!(status, 401);
    assert_eq!(body["code"], "unauthenticated");

    host.shutdown().await;
}

#[tokio::test]
async fn failure_sub_cases_are_indistinguishable() {
    let host = TestHost::spawn_default().await;
    let session = wire::quick_handshake(&host, "kv").await;

    // Unknown runtime id.
    let unknown = wire::http()
        .post(host.url(DISCOVER))
        .header("x-plugin-runtime-id", "ghost-00000000")
        .bearer_auth(&session.runtime_token)
        .json(&serde_json::json!({ "service_type": "logger" }))
        .send()
        .await
        .unwrap();

    // Right runtime id, wrong secret of the right length.
    let mut wrong = session.runtime_token.clone().into_bytes();
    wrong[0] ^= 0x01;
    let wrong_secret = wire::http()
        .post(host.url(DISCOVER))
        .header("x-plugin-runtime-id", &session.runtime_id)
        .bearer_auth(String::from_utf8(wrong).unwrap())
        .json(&serde_json::json!({ "service_type": "logger" }))
        .send()
        .await
        .unwrap();

    // Malformed authorization scheme.
    let malformed = wire::http()
        .post(host.url(DISCOVER))
        .header("x-plugin-runtime-id", &session.runtime_id)
        .header("authorization", "Basic abc")
        .json(&serde_json::json!({ "service_type": "logger" }))
        .send()
        .await
        .unwrap();

    let a = error_body(unknown).await;
    let b = error_body(wrong_secret).await;
    let c = error_body(malformed).await;
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.0, 401);
    assert_eq!(a.1["code"], "unauthenticated");

    host.shutdown().await;
}

#[tokio::test]
async fn valid_credentials_authenticate() {
    let host = TestHost::spawn_default().await;
    let session = wire::quick_handshake(&host, "kv").await;

    let response = wire::authed_post(
        &host,
        &session,
        DISCOVER,
        serde_json::json!({ "service_type": "logger" }),
    )
    .await;
    // Authenticated, then legitimately NotFound: nothing provides logger.
    let (status, body) = error_body(response).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");

    host.shutdown().await;
}
