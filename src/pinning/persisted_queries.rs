use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error};

use super::{PERSISTED_QUERIES_PINNED, find_api_key, insert_pinned_entry, studio_request};
use crate::cache::{Cache, make_cache_key, never_expires};
use crate::config::{Config, SharedConfig};
use crate::core::error::{RelayError, Result};
use crate::persisted_queries::{
    PATH_PREFIX, PersistedQueries, PersistedQueriesData, PersistedQueriesResponse,
    PersistedQueryChunk, compress_chunk, make_chunk_cache_key, rewrite_base,
};

const PIN_PERSISTED_QUERIES_QUERY: &str = r#"query UplinkRelay_PinPersistedQueries($ref: ID!) {
    variant(ref: $ref) {
        __typename
        ... on InvalidRefFormat {
            message
        }
        ... on Error {
            message
        }
        ... on GraphVariant {
            persistedQueryList {
                builds {
                    edges {
                        node {
                            id
                            manifestChunks {
                                id
                                json
                            }
                        }
                    }
                }
            }
        }
    }
}"#;

#[derive(Debug, Deserialize)]
struct PinResponse {
    data: PinData,
}

#[derive(Debug, Deserialize)]
struct PinData {
    variant: PinVariant,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum PinVariant {
    GraphVariant {
        #[serde(rename = "persistedQueryList")]
        persisted_query_list: PersistedQueryList,
    },
    InvalidRefFormat {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct PersistedQueryList {
    builds: Builds,
}

#[derive(Debug, Deserialize)]
struct Builds {
    edges: Vec<BuildEdge>,
}

#[derive(Debug, Deserialize)]
struct BuildEdge {
    node: BuildNode,
}

#[derive(Debug, Deserialize)]
struct BuildNode {
    id: String,
    #[serde(rename = "manifestChunks")]
    manifest_chunks: Option<Vec<ManifestChunk>>,
}

#[derive(Debug, Deserialize)]
struct ManifestChunk {
    id: String,
    json: String,
}

/// Pin a persisted-query manifest version: look the build up in the studio
/// API, store its chunks through the chunk sub-cache, and store a
/// synthesized manifest envelope as the pinned entry.
pub async fn pin_persisted_queries(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    graph_ref: &str,
    persisted_query_version: &str,
) -> Result<()> {
    debug!(version = persisted_query_version, graph_ref, "pinning PQ version");
    let config = shared.current();
    let api_key = find_api_key(&config, graph_ref)?;

    let request_body = serde_json::json!({
        "query": PIN_PERSISTED_QUERIES_QUERY,
        "variables": { "ref": graph_ref },
        "operationName": "UplinkRelay_PinPersistedQueries",
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

    let api_response: PinResponse = serde_json::from_slice(&body)
        .map_err(|err| RelayError::Pinning(format!("failed to decode studio response: {err}")))?;

    let persisted_query_list = match api_response.data.variant {
        PinVariant::GraphVariant {
            persisted_query_list,
        } => persisted_query_list,
        PinVariant::InvalidRefFormat { message } | PinVariant::Error { message } => {
            error!(graph_ref, version = persisted_query_version, message, "failed to get persisted query list");
            return Err(RelayError::Pinning(message));
        }
    };

    let node = persisted_query_list
        .builds
        .edges
        .into_iter()
        .map(|edge| edge.node)
        .find(|node| node.id == persisted_query_version)
        .ok_or_else(|| {
            RelayError::Pinning(format!(
                "failed to find matching edge for persisted query version {persisted_query_version}"
            ))
        })?;

    if config.cache.enabled {
        let chunks = cache_pinned_chunks(&config, cache, &node).await?;
        debug!(graph_ref, version = persisted_query_version, "cached pinned chunks");

        let envelope = PersistedQueriesResponse {
            data: PersistedQueriesData {
                persisted_queries: PersistedQueries::PersistedQueriesResult {
                    id: node.id.clone(),
                    min_delay_seconds: 60.0,
                    chunks,
                },
            },
        };
        let serialized = serde_json::to_vec(&envelope)?;
        insert_pinned_entry(
            cache,
            &make_cache_key(graph_ref, PERSISTED_QUERIES_PINNED, None),
            serialized,
            &node.id,
            Utc::now(),
            never_expires(),
        )
        .await;
    }

    // Record the pin so a management-driven update is visible immediately.
    shared.update_supergraph(graph_ref, |supergraph| {
        supergraph.persisted_query_version = persisted_query_version.to_string();
    });
    Ok(())
}

/// Store each manifest chunk compressed and build the relay-hosted URL
/// list for the synthesized manifest.
async fn cache_pinned_chunks(
    config: &Config,
    cache: &dyn Cache,
    node: &BuildNode,
) -> Result<Vec<PersistedQueryChunk>> {
    if config.relay.public_url.is_empty() {
        return Err(RelayError::Pinning("public URL not set".to_string()));
    }
    let base = rewrite_base(config)?;

    let manifest_chunks = node.manifest_chunks.as_deref().unwrap_or_default();
    let mut chunks = Vec::with_capacity(manifest_chunks.len());
    for (index, chunk) in manifest_chunks.iter().enumerate() {
        let compressed = compress_chunk(chunk.json.as_bytes())?;
        let cache_key = make_chunk_cache_key(&chunk.id, index);
        cache.set(&cache_key, &compressed, -1).await.map_err(|err| {
            error!(id = chunk.id, "failed to cache persisted query chunk");
            err
        })?;

        chunks.push(PersistedQueryChunk {
            id: chunk.id.clone(),
            urls: vec![format!("{base}{PATH_PREFIX}/{}?i={index}", chunk.id)],
        });
        debug!(id = chunk.id, "cached pinned persisted query chunk");
    }
    Ok(chunks)
}
