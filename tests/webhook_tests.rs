// Webhook tests: signature verification and the schema refresh it gates.

use std::sync::Arc;

use axum::{Router, routing::get};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tokio::net::TcpListener;
use uplink_relay::cache::default_cache_key;
use uplink_relay::uplink::SUPERGRAPH_QUERY;
use uplink_relay::{
    AppState, Cache, CacheItem, Config, MemoryCache, RoundRobinSelector, SharedConfig,
    SupergraphConfig, create_router,
};

const SECRET: &str = "webhook-secret";

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_relay_with_webhook() -> (String, Arc<MemoryCache>, String) {
    let schema_server = spawn(Router::new().route("/schema", get(|| async { "WEBHOOK SDL" }))).await;

    let mut config = Config::default();
    config.cache.duration = 90;
    config.webhook.enabled = true;
    config.webhook.path = "/webhook".to_string();
    config.webhook.secret = SECRET.to_string();
    config.supergraphs = vec![SupergraphConfig {
        graph_ref: "acme@prod".to_string(),
        apollo_key: "service:acme:key".to_string(),
        ..SupergraphConfig::default()
    }];

    let cache = Arc::new(MemoryCache::new(100));
    let state = AppState {
        config: SharedConfig::new(config),
        cache: cache.clone(),
        selector: Arc::new(RoundRobinSelector::new(Vec::new())),
        http_client: reqwest::Client::new(),
    };
    (spawn(create_router(state)).await, cache, schema_server)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn test_signed_webhook_refreshes_schema() {
    let (relay, cache, schema_server) = spawn_relay_with_webhook().await;

    let body = serde_json::to_vec(&json!({
        "eventType": "SCHEMA_PUBLISH",
        "eventID": "event-1",
        "changes": [{ "description": "field added" }],
        "schemaURL": format!("{schema_server}/schema"),
        "graphID": "acme",
        "variantID": "acme@prod",
    }))
    .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{relay}/webhook"))
        .header("x-apollo-signature", sign(&body))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let key = default_cache_key("acme@prod", SUPERGRAPH_QUERY);
    let stored: CacheItem = serde_json::from_slice(&cache.get(&key).await.unwrap()).unwrap();
    assert_eq!(stored.content, b"WEBHOOK SDL");
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let (relay, cache, schema_server) = spawn_relay_with_webhook().await;

    let body = serde_json::to_vec(&json!({
        "schemaURL": format!("{schema_server}/schema"),
        "variantID": "acme@prod",
    }))
    .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{relay}/webhook"))
        .header("x-apollo-signature", "sha256=0000")
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let key = default_cache_key("acme@prod", SUPERGRAPH_QUERY);
    assert!(cache.get(&key).await.is_none());
}

#[tokio::test]
async fn test_webhook_rejects_missing_signature() {
    let (relay, _cache, _schema_server) = spawn_relay_with_webhook().await;

    let response = reqwest::Client::new()
        .post(format!("{relay}/webhook"))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_webhook_rejects_unknown_graph() {
    let (relay, _cache, schema_server) = spawn_relay_with_webhook().await;

    let body = serde_json::to_vec(&json!({
        "schemaURL": format!("{schema_server}/schema"),
        "variantID": "unknown@prod",
    }))
    .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{relay}/webhook"))
        .header("x-apollo-signature", sign(&body))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
