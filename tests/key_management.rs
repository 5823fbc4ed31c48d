//! Admin key-management routes, driven through the full gateway.

mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use common::{TestGateway, get, json_body, key_request};
use ticketing_api_gateway::{
    models::api_key::Permission,
    store::CredentialStore,
};
use uuid::Uuid;

fn post_json(path: &str, key: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(path: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {key}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_admin_issues_key_with_policy_defaults() {
    let gw = TestGateway::new();
    let admin = gw.issue(key_request("ops", vec![Permission::Admin])).await;

    let response = gw
        .send(post_json(
            "/api/v1/keys",
            &admin.key,
            serde_json::json!({"name": "box office", "permissions": ["read"]}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    let new_key = body["key"].as_str().unwrap().to_string();
    assert!(new_key.starts_with("tk_"));
    assert_eq!(body["api_key"]["rate_limit_per_hour"], 1000);
    assert_eq!(body["api_key"]["monthly_quota"], 100_000);
    assert!(body["api_key"].get("key_hash").is_none());

    let me = gw.send(get("/api/v1/me", &new_key)).await;
    assert_eq!(me.status(), StatusCode::OK);
    assert_eq!(json_body(me).await["name"], "box office");
}

#[tokio::test]
async fn test_non_admin_cannot_manage_keys() {
    let gw = TestGateway::new();
    let writer = gw.issue(key_request("pos", vec![Permission::Read, Permission::Write])).await;

    let response = gw
        .send(post_json(
            "/api/v1/keys",
            &writer.key,
            serde_json::json!({"name": "sneaky"}),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "insufficient_permissions"
    );
}

#[tokio::test]
async fn test_revoke_then_activate_round_trip_over_http() {
    let gw = TestGateway::new();
    let admin = gw.issue(key_request("ops", vec![Permission::Admin])).await;
    let target = gw.issue_reader().await;
    let id = target.api_key.id;

    let revoked = gw
        .send(post(&format!("/api/v1/keys/{id}/revoke"), &admin.key))
        .await;
    assert_eq!(revoked.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        gw.send(get("/api/v1/me", &target.key)).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let activated = gw
        .send(post(&format!("/api/v1/keys/{id}/activate"), &admin.key))
        .await;
    assert_eq!(activated.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        gw.send(get("/api/v1/me", &target.key)).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_rotate_returns_new_secret() {
    let gw = TestGateway::new();
    let admin = gw.issue(key_request("ops", vec![Permission::Admin])).await;
    let target = gw.issue_reader().await;

    let response = gw
        .send(post(
            &format!("/api/v1/keys/{}/rotate", target.api_key.id),
            &admin.key,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json_body(response).await["key"].as_str().unwrap().to_string();

    assert_eq!(
        gw.send(get("/api/v1/me", &target.key)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(gw.send(get("/api/v1/me", &rotated)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tenant_admin_is_confined_to_its_tenant() {
    let gw = TestGateway::new();
    let tenant = Uuid::new_v4();
    let mut request = key_request("tenant ops", vec![Permission::Admin]);
    request.tenant_id = Some(tenant);
    let admin = gw.issue(request).await;

    let mut other = key_request("other tenant", vec![Permission::Read]);
    other.tenant_id = Some(Uuid::new_v4());
    let other = gw.issue(other).await;

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/keys/{}", other.api_key.id))
        .header("authorization", format!("Bearer {}", admin.key))
        .body(Body::empty())
        .unwrap();
    let response = gw.send(delete).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(
        gw.credentials
            .find_by_id(other.api_key.id)
            .await
            .unwrap()
            .is_some()
    );

    // Issued keys land in the admin's tenant regardless of the body
    let response = gw
        .send(post_json(
            "/api/v1/keys",
            &admin.key,
            serde_json::json!({"name": "kiosk", "tenant_id": Uuid::new_v4()}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        json_body(response).await["api_key"]["tenant_id"],
        tenant.to_string()
    );
}

#[tokio::test]
async fn test_unknown_key_id_is_not_found() {
    let gw = TestGateway::new();
    let admin = gw.issue(key_request("ops", vec![Permission::Admin])).await;

    let response = gw
        .send(post(
            &format!("/api/v1/keys/{}/deactivate", Uuid::new_v4()),
            &admin.key,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], "api_key_not_found");
}
