//! Shared fixtures: an in-memory gateway and key issuance helpers.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use tower::ServiceExt;

use ticketing_api_gateway::{
    AppState, app,
    middleware::gateway::{Gateway, GatewaySettings},
    models::api_key::{CreateApiKeyRequest, Permission},
    services::api_key_service::{self, ApiKeyPolicy, IssuedApiKey},
    store::memory::{InMemoryCredentialStore, InMemoryUsageLedger},
};

pub const POLICY: ApiKeyPolicy = ApiKeyPolicy {
    bcrypt_cost: 4,
    default_rate_limit_per_hour: 1000,
    default_monthly_quota: 100_000,
};

pub struct TestGateway {
    pub state: AppState,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub ledger: Arc<InMemoryUsageLedger>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with_settings(false, 10_000)
    }

    pub fn with_settings(relaxed_mode: bool, global_rate_limit_per_minute: i64) -> Self {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let gateway = Arc::new(Gateway::new(
            GatewaySettings {
                relaxed_mode,
                public_paths: vec!["/health".to_string()],
                global_rate_limit_per_minute,
            },
            credentials.clone(),
            ledger.clone(),
        ));

        Self {
            state: AppState {
                gateway,
                credentials: credentials.clone(),
                key_policy: POLICY,
            },
            credentials,
            ledger,
        }
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// Send one request and wait for its usage records to land.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        let response = self.router().oneshot(request).await.unwrap();
        self.state.gateway.recorder().flush().await;
        response
    }

    pub async fn issue(&self, request: CreateApiKeyRequest) -> IssuedApiKey {
        api_key_service::create_api_key(self.credentials.as_ref(), &POLICY, request)
            .await
            .unwrap()
    }

    pub async fn issue_reader(&self) -> IssuedApiKey {
        self.issue(key_request("reader", vec![Permission::Read])).await
    }
}

pub fn key_request(name: &str, permissions: Vec<Permission>) -> CreateApiKeyRequest {
    CreateApiKeyRequest {
        name: name.to_string(),
        permissions,
        ..Default::default()
    }
}

pub fn get(path: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("authorization", format!("Bearer {key}"))
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn header_i64(response: &Response<Body>, name: &str) -> i64 {
    response.headers()[name].to_str().unwrap().parse().unwrap()
}
