// Pinned artifacts win over live uplink data: a graph pinned to a launch
// ID serves that launch's schema with its completion timestamp.

use std::sync::Arc;

use axum::{Json, Router, routing::post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uplink_relay::pinning::pin_launch_id;
use uplink_relay::{
    AppState, Config, MemoryCache, RoundRobinSelector, SharedConfig, SupergraphConfig,
    create_router,
};

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_pinned_launch_wins_over_poll() {
    let studio = spawn(Router::new().route(
        "/",
        post(|| async {
            Json(json!({
                "data": {
                    "graph": {
                        "variant": {
                            "id": "acme@prod",
                            "launch": {
                                "completedAt": "2024-09-01T10:00:00Z",
                                "build": {
                                    "result": {
                                        "__typename": "BuildSuccess",
                                        "coreSchema": { "coreDocument": "PINNED SDL" }
                                    }
                                }
                            }
                        }
                    }
                }
            }))
        }),
    ))
    .await;

    let mut config = Config::default();
    config.cache.duration = 90;
    config.uplink.studio_api_url = studio.clone();
    config.supergraphs = vec![SupergraphConfig {
        graph_ref: "acme@prod".to_string(),
        apollo_key: "service:acme:key".to_string(),
        launch_id: "L1".to_string(),
        ..SupergraphConfig::default()
    }];

    let cache = Arc::new(MemoryCache::new(config.cache.max_size));
    let shared = SharedConfig::new(config);
    let http_client = reqwest::Client::new();

    pin_launch_id(&shared, cache.as_ref(), &http_client, "L1", "acme@prod")
        .await
        .unwrap();

    let state = AppState {
        config: shared,
        cache,
        // No live uplink is reachable; the pinned entry must carry the
        // request on its own.
        selector: Arc::new(RoundRobinSelector::new(Vec::new())),
        http_client,
    };
    let relay = spawn(create_router(state)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&relay)
        .json(&json!({
            "query": "query SupergraphSdlQuery($apiKey: String!, $graph_ref: String!, $ifAfterId: ID) { routerConfig { __typename } }",
            "variables": {
                "apiKey": "service:acme:key",
                "graph_ref": "acme@prod",
                "ifAfterId": "",
            },
            "operationName": "SupergraphSdlQuery",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers().get("X-Cache-Hit").unwrap(), "true");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["routerConfig"]["supergraphSdl"], "PINNED SDL");
    assert_eq!(body["data"]["routerConfig"]["id"], "2024-09-01T10:00:00Z");
}

#[tokio::test]
async fn test_launch_build_failure_is_an_error() {
    let studio = spawn(Router::new().route(
        "/",
        post(|| async {
            Json(json!({
                "data": {
                    "graph": {
                        "variant": {
                            "id": "acme@prod",
                            "launch": {
                                "completedAt": "2024-09-01T10:00:00Z",
                                "build": {
                                    "result": {
                                        "__typename": "BuildFailure",
                                        "errorMessages": [{ "message": "composition failed" }]
                                    }
                                }
                            }
                        }
                    }
                }
            }))
        }),
    ))
    .await;

    let mut config = Config::default();
    config.uplink.studio_api_url = studio;
    config.supergraphs = vec![SupergraphConfig {
        graph_ref: "acme@prod".to_string(),
        apollo_key: "service:acme:key".to_string(),
        ..SupergraphConfig::default()
    }];

    let cache = MemoryCache::new(10);
    let shared = SharedConfig::new(config);
    let client = reqwest::Client::new();

    let result = pin_launch_id(&shared, &cache, &client, "L1", "acme@prod").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_pin_records_selector_in_config() {
    let studio = spawn(Router::new().route(
        "/",
        post(|| async {
            Json(json!({
                "data": {
                    "graph": {
                        "variant": {
                            "id": "acme@prod",
                            "launch": {
                                "completedAt": "2024-09-01T10:00:00Z",
                                "build": {
                                    "result": {
                                        "__typename": "BuildSuccess",
                                        "coreSchema": { "coreDocument": "PINNED SDL" }
                                    }
                                }
                            }
                        }
                    }
                }
            }))
        }),
    ))
    .await;

    let mut config = Config::default();
    config.uplink.studio_api_url = studio;
    config.supergraphs = vec![SupergraphConfig {
        graph_ref: "acme@prod".to_string(),
        apollo_key: "service:acme:key".to_string(),
        ..SupergraphConfig::default()
    }];

    let cache = MemoryCache::new(10);
    let shared = SharedConfig::new(config);
    let client = reqwest::Client::new();

    pin_launch_id(&shared, &cache, &client, "L2", "acme@prod")
        .await
        .unwrap();

    let current = shared.current();
    assert_eq!(current.supergraphs[0].launch_id, "L2");
}
