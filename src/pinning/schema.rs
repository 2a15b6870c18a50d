use serde::Deserialize;
use tracing::{debug, error};

use super::{SUPERGRAPH_PINNED, find_api_key, insert_pinned_entry, studio_request};
use crate::cache::{Cache, make_cache_key, never_expires};
use crate::config::SharedConfig;
use crate::core::error::{RelayError, Result};
use crate::schema::parse_rfc3339;

const LAUNCH_SCHEMA_QUERY: &str = r#"query UplinkRelay_GetLaunchIDSchema($graphId: ID!, $name: String!, $launchId: ID!) {
    graph(id: $graphId) {
        variant(name: $name) {
            id
            launch(id: $launchId) {
                completedAt
                build {
                    result {
                        __typename
                        ... on BuildSuccess {
                            coreSchema {
                                coreDocument
                            }
                        }
                        ... on BuildFailure {
                            errorMessages {
                                message
                            }
                        }
                    }
                }
            }
        }
    }
}"#;

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    data: LaunchData,
}

#[derive(Debug, Deserialize)]
struct LaunchData {
    graph: Option<LaunchGraph>,
}

#[derive(Debug, Deserialize)]
struct LaunchGraph {
    variant: LaunchVariant,
}

#[derive(Debug, Deserialize)]
struct LaunchVariant {
    id: String,
    launch: Launch,
}

#[derive(Debug, Deserialize)]
struct Launch {
    #[serde(rename = "completedAt")]
    completed_at: String,
    build: LaunchBuild,
}

#[derive(Debug, Deserialize)]
struct LaunchBuild {
    result: BuildResult,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum BuildResult {
    BuildSuccess {
        #[serde(rename = "coreSchema")]
        core_schema: CoreSchema,
    },
    BuildFailure {
        #[serde(rename = "errorMessages")]
        error_messages: Vec<BuildErrorMessage>,
    },
}

#[derive(Debug, Deserialize)]
struct CoreSchema {
    #[serde(rename = "coreDocument")]
    core_document: String,
}

#[derive(Debug, Deserialize)]
struct BuildErrorMessage {
    message: String,
}

/// Pin the schema of a specific launch: fetch the core document from the
/// studio API and store it as the pinned supergraph entry.
pub async fn pin_launch_id(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    launch_id: &str,
    graph_ref: &str,
) -> Result<()> {
    debug!(launch_id, graph_ref, "pinning launch ID");
    let config = shared.current();
    let graph: crate::core::GraphRef = graph_ref.parse()?;
    let api_key = find_api_key(&config, graph_ref)?;

    let request_body = serde_json::json!({
        "query": LAUNCH_SCHEMA_QUERY,
        "variables": {
            "graphId": graph.graph_id,
            "name": graph.variant_id,
            "launchId": launch_id,
        },
        "operationName": "UplinkRelay_GetLaunchIDSchema",
    });

    let response = studio_request(client, &config, &api_key)
        .json(&request_body)
        .send()
        .await
        .map_err(|err| RelayError::Pinning(format!("studio request failed: {err}")))?;
    let body = response
        .bytes()
        .await
        .map_err(|err| RelayError::Pinning(format!("failed to read studio response: {err}")))?;

    let api_response: LaunchResponse = serde_json::from_slice(&body)
        .map_err(|err| RelayError::Pinning(format!("failed to decode studio response: {err}")))?;

    let graph_data = api_response.data.graph.ok_or_else(|| {
        error!(graph_ref, launch_id, "failed to get launch ID schema");
        RelayError::Pinning("failed to get launch ID schema".to_string())
    })?;

    let core_document = match graph_data.variant.launch.build.result {
        BuildResult::BuildSuccess { core_schema } => core_schema.core_document,
        BuildResult::BuildFailure { error_messages } => {
            let messages: Vec<&str> = error_messages
                .iter()
                .map(|error| error.message.as_str())
                .collect();
            error!(graph_ref, launch_id, ?messages, "launch build failed");
            return Err(RelayError::Pinning("failed to get launch ID schema".to_string()));
        }
    };

    let modified_at = parse_rfc3339(&graph_data.variant.launch.completed_at)
        .map_err(|err| RelayError::Pinning(err.to_string()))?;

    if config.cache.enabled {
        let cache_key = make_cache_key(graph_ref, SUPERGRAPH_PINNED, None);
        insert_pinned_entry(
            cache,
            &cache_key,
            core_document.into_bytes(),
            &graph_data.variant.id,
            modified_at,
            never_expires(),
        )
        .await;
    }

    // Record the pin so a management-driven update is visible immediately.
    shared.update_supergraph(graph_ref, |supergraph| {
        supergraph.launch_id = launch_id.to_string();
    });
    Ok(())
}
