//! Supergraph schema fetching and caching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{
    Cache, CacheItem, conditional_args, expiration_time, format_rfc3339, make_cache_key,
    update_newest,
};
use crate::config::SharedConfig;
use crate::core::error::{RelayError, Result};
use crate::core::hash::hash_bytes;
use crate::pinning;
use crate::uplink::{self, RoundRobinSelector, SUPERGRAPH_QUERY};

/// Union uplink returns for a `SupergraphSdlQuery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum RouterConfig {
    RouterConfigResult {
        id: String,
        #[serde(rename = "supergraphSdl", default, skip_serializing_if = "String::is_empty")]
        supergraph_sdl: String,
        #[serde(rename = "minDelaySeconds")]
        min_delay_seconds: f64,
    },
    Unchanged {
        id: String,
        #[serde(rename = "minDelaySeconds")]
        min_delay_seconds: f64,
    },
    FetchError {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupergraphSdlResponse {
    pub data: SupergraphSdlData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupergraphSdlData {
    #[serde(rename = "routerConfig")]
    pub router_config: RouterConfig,
}

pub const SUPERGRAPH_SDL_QUERY: &str = r#"query SupergraphSdlQuery($apiKey: String!, $graph_ref: String!, $ifAfterId: ID) {
    routerConfig(ref: $graph_ref, apiKey: $apiKey, ifAfterId: $ifAfterId) {
        __typename
        ... on RouterConfigResult {
            id
            supergraphSdl: supergraphSDL
            minDelaySeconds
        }
        ... on Unchanged {
            id
            minDelaySeconds
        }
        ... on FetchError {
            code
            message
        }
    }
}"#;

/// Fetch the schema for a graph and cache it. Graphs pinned to a launch ID
/// are delegated to the pinning store instead of polling live.
pub async fn fetch_schema(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    selector: &RoundRobinSelector,
    graph_ref: &str,
) -> Result<()> {
    let config = shared.current();
    let supergraph = config
        .find_supergraph(graph_ref)
        .ok_or_else(|| RelayError::Config(format!("supergraph not found for {graph_ref}")))?;

    if !supergraph.launch_id.is_empty() {
        return pinning::pin_launch_id(shared, cache, client, &supergraph.launch_id, graph_ref)
            .await;
    }

    let variables = serde_json::json!({
        "apiKey": supergraph.apollo_key,
        "graph_ref": graph_ref,
        "ifAfterId": "",
    });
    let body = uplink::uplink_request(
        client,
        selector,
        SUPERGRAPH_SDL_QUERY,
        variables,
        SUPERGRAPH_QUERY,
    )
    .await?;

    let response: SupergraphSdlResponse = serde_json::from_slice(&body)
        .map_err(|err| RelayError::Uplink(format!("failed to decode response body: {err}")))?;

    match response.data.router_config {
        RouterConfig::RouterConfigResult {
            id, supergraph_sdl, ..
        } => {
            let id = parse_rfc3339(&id)?;
            if config.cache.enabled {
                cache_schema(cache, graph_ref, &supergraph_sdl, id, "", config.cache.duration)
                    .await?;
            }
            Ok(())
        }
        RouterConfig::Unchanged { id, .. } => {
            let id = parse_rfc3339(&id)?;
            if config.cache.enabled {
                cache_schema(cache, graph_ref, "", id, "", config.cache.duration).await?;
            }
            Ok(())
        }
        RouterConfig::FetchError { code, message } => {
            Err(RelayError::Uplink(format!("{code}: {message}")))
        }
    }
}

/// Write the schema envelope under the conditional key and promote it to
/// the default key when newer.
pub async fn cache_schema(
    cache: &dyn Cache,
    graph_ref: &str,
    schema: &str,
    id: DateTime<Utc>,
    if_after_id: &str,
    duration: i64,
) -> Result<()> {
    let item = CacheItem {
        id: format_rfc3339(id),
        hash: hash_bytes(schema.as_bytes()),
        expiration: expiration_time(duration),
        last_modified: Utc::now(),
        content: schema.as_bytes().to_vec(),
    };

    if let Err(err) = update_newest(cache, graph_ref, SUPERGRAPH_QUERY, &item).await {
        warn!(graph_ref, %err, "failed to promote schema to the default key");
    }

    let cache_key = make_cache_key(
        graph_ref,
        SUPERGRAPH_QUERY,
        Some(&conditional_args(graph_ref, if_after_id)),
    );
    debug!(graph_ref, cache_key, "caching schema");
    let serialized = serde_json::to_vec(&item)?;
    cache.set(&cache_key, &serialized, duration).await
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| RelayError::Uplink(format!("failed to parse timestamp {value}: {err}")))
}
