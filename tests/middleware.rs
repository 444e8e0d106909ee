mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Extension, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::Response,
    routing::get,
};
use gatekeeper::{
    Admission, Key, Keeper, KeeperError, MemoryStore, Stats,
    middleware::{Gatekeeper, check_quota},
    routes::quota::current_quota,
};
use tower::ServiceExt;

fn app(gate: Gatekeeper) -> Router {
    Router::new()
        .route("/", get(|| async { "OK" }))
        .route("/quota", get(current_quota))
        .route(
            "/echo-stats",
            get(|Extension(stats): Extension<Stats>| async move { stats.remaining.to_string() }),
        )
        .layer(axum::middleware::from_fn_with_state(Arc::new(gate), check_quota))
}

fn memory_app(store: MemoryStore) -> Router {
    app(Gatekeeper::new(Arc::new(store)))
}

fn request(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = key {
        builder = builder.header("APIKEY", key);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn nominal_case_with_defaults() {
    let store = MemoryStore::new();
    store.set("someAPIKey", 10);

    let response = memory_app(store)
        .oneshot(request("/", Some("someAPIKey")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["X-API-Limit"], "10");
    assert_eq!(response.headers()["X-API-Remaining"], "9");
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn exhausted_key_gets_429() {
    let store = MemoryStore::new();
    store.set("someAPIKey", 0);

    let response = memory_app(store)
        .oneshot(request("/", Some("someAPIKey")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_text(response).await, "limit reached");
}

#[tokio::test]
async fn unknown_key_gets_401() {
    let response = memory_app(MemoryStore::new())
        .oneshot(request("/", Some("unkonwnAPIKey")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "unknown API key");
}

#[tokio::test]
async fn missing_key_gets_401() {
    let response = memory_app(MemoryStore::new())
        .oneshot(request("/", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "missing API key");
}

#[tokio::test]
async fn empty_key_counts_as_missing() {
    let response = memory_app(MemoryStore::new())
        .oneshot(request("/", Some("")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "missing API key");
}

struct BrokenKeeper;

fn unavailable(key: &Key) -> KeeperError {
    KeeperError::Storage {
        op: "get data",
        key: key.to_string(),
        source: sqlx::Error::PoolTimedOut,
    }
}

#[async_trait]
impl Keeper for BrokenKeeper {
    async fn allow(&self, key: &Key) -> Result<Admission, KeeperError> {
        Err(unavailable(key))
    }

    async fn stats(&self, key: &Key) -> Result<Stats, KeeperError> {
        Err(unavailable(key))
    }
}

#[tokio::test]
async fn infrastructure_errors_get_500() {
    let response = app(Gatekeeper::new(Arc::new(BrokenKeeper)))
        .oneshot(request("/", Some("someAPIKey")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn handlers_see_the_admitted_stats() {
    let store = MemoryStore::new();
    store.set("k", 3);
    let app = memory_app(store);

    let response = app.clone().oneshot(request("/echo-stats", Some("k"))).await.unwrap();
    assert_eq!(body_text(response).await, "2");

    let response = app.oneshot(request("/quota", Some("k"))).await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], 0);
    assert_eq!(body["content"]["remaining"], 1);
    assert_eq!(body["content"]["limit"], 3);
}

#[tokio::test]
async fn header_names_follow_configuration() {
    let store = MemoryStore::new();
    store.set("k", 2);
    let gate = Gatekeeper::with_headers(Arc::new(store), "X-Client-Key", "X-Quota-").unwrap();

    let response = app(gate)
        .oneshot(
            Request::builder()
                .uri("/")
                .header("X-Client-Key", "k")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["X-Quota-Limit"], "2");
    assert_eq!(response.headers()["X-Quota-Remaining"], "1");
}

#[tokio::test]
async fn sql_backed_gate_counts_down() {
    let store = common::sql_store().await;
    store.set("abcd", 2).await.unwrap();
    let app = app(Gatekeeper::new(Arc::new(store)));

    for remaining in ["1", "0"] {
        let response = app.clone().oneshot(request("/", Some("abcd"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-API-Remaining"], remaining);
    }

    let response = app.oneshot(request("/", Some("abcd"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
