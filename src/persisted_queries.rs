//! Persisted-query manifests and their chunk sub-cache.
//!
//! When a public URL is configured the relay stores each chunk body
//! (zlib-compressed) under `pq:<chunkID>:<index>` and rewrites the
//! manifest's chunk URLs to point back at itself, so routers fetch chunk
//! contents from the relay rather than the upstream CDN.

use std::io::{Read, Write};

use chrono::Utc;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{
    Cache, CacheItem, conditional_args, expiration_time, make_cache_key, update_newest,
};
use crate::config::{Config, SharedConfig};
use crate::core::error::{RelayError, Result};
use crate::core::hash::hash_bytes;
use crate::uplink::{self, PERSISTED_QUERIES_QUERY, RoundRobinSelector};

pub const PATH_PREFIX: &str = "/persisted-queries";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueryChunk {
    pub id: String,
    pub urls: Vec<String>,
}

/// Union uplink returns for a `PersistedQueriesManifestQuery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum PersistedQueries {
    PersistedQueriesResult {
        id: String,
        #[serde(rename = "minDelaySeconds")]
        min_delay_seconds: f64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        chunks: Vec<PersistedQueryChunk>,
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

impl PersistedQueries {
    pub fn id(&self) -> &str {
        match self {
            Self::PersistedQueriesResult { id, .. }
            | Self::Unchanged { id, .. } => id,
            Self::FetchError { .. } => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQueriesResponse {
    pub data: PersistedQueriesData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQueriesData {
    #[serde(rename = "persistedQueries")]
    pub persisted_queries: PersistedQueries,
}

pub const PERSISTED_QUERIES_MANIFEST_QUERY: &str = r#"query PersistedQueriesManifestQuery($apiKey: String!, $graph_ref: String!, $ifAfterId: ID) {
    persistedQueries(ref: $graph_ref, apiKey: $apiKey, ifAfterId: $ifAfterId) {
        __typename
        ... on PersistedQueriesResult {
            id
            minDelaySeconds
            chunks {
                id
                urls
            }
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

/// Key for a stored chunk body.
pub fn make_chunk_cache_key(id: &str, index: impl std::fmt::Display) -> String {
    format!("pq:{id}:{index}")
}

/// Split a manifest id of the form `base:version`. Malformed ids yield
/// `("", -1)` so two malformed ids compare equal.
pub fn decode_id(id: &str) -> (String, i64) {
    let mut parts = id.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(version), None) => match version.parse::<i64>() {
            Ok(version) => (base.to_string(), version),
            Err(_) => (String::new(), -1),
        },
        _ => (String::new(), -1),
    }
}

pub fn compress_chunk(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

pub fn decompress_chunk(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Base URL chunks are advertised under: the public URL without its
/// trailing slash, scheme forced to https when TLS is configured.
pub(crate) fn rewrite_base(config: &Config) -> Result<String> {
    let mut public_url = url::Url::parse(&config.relay.public_url)
        .map_err(|_| RelayError::Config(format!("invalid publicURL: {}", config.relay.public_url)))?;
    if !matches!(public_url.scheme(), "http" | "https") {
        return Err(RelayError::Config(format!(
            "invalid publicURL: {}",
            config.relay.public_url
        )));
    }
    if !config.relay.tls.cert.is_empty() || !config.relay.tls.key.is_empty() {
        let _ = public_url.set_scheme("https");
    }
    Ok(public_url.as_str().trim_end_matches('/').to_string())
}

/// Fetch every chunk body, store it compressed, and point the chunk URLs
/// at the relay. With caching disabled or no public URL configured the
/// chunks pass through untouched.
pub async fn cache_chunk_data(
    config: &Config,
    cache: &dyn Cache,
    client: &reqwest::Client,
    chunks: Vec<PersistedQueryChunk>,
) -> Result<Vec<PersistedQueryChunk>> {
    if !config.cache.enabled || config.relay.public_url.is_empty() {
        debug!(
            public_url = config.relay.public_url,
            cache_enabled = config.cache.enabled,
            "chunk caching disabled, passing URLs through"
        );
        return Ok(chunks);
    }
    let base = rewrite_base(config)?;

    let mut rewritten = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut urls = Vec::with_capacity(chunk.urls.len());
        for (index, chunk_url) in chunk.urls.iter().enumerate() {
            let response = client
                .get(chunk_url)
                .send()
                .await
                .map_err(|err| RelayError::Uplink(format!("failed to fetch chunk: {err}")))?;
            let body = response
                .bytes()
                .await
                .map_err(|err| RelayError::Uplink(format!("failed to read chunk: {err}")))?;

            let compressed = compress_chunk(&body)?;
            let cache_key = make_chunk_cache_key(&chunk.id, index);
            cache
                .set(&cache_key, &compressed, config.cache.duration)
                .await?;

            urls.push(format!("{base}{PATH_PREFIX}/{}?i={index}", chunk.id));
        }
        debug!(id = chunk.id, ?urls, "cached persisted query chunk");
        rewritten.push(PersistedQueryChunk { id: chunk.id, urls });
    }
    Ok(rewritten)
}

/// Fetch the persisted-query manifest for a graph, cache its chunks and
/// store the rewritten manifest envelope. Graphs pinned to a manifest
/// version are left alone here.
pub async fn fetch_pq_manifest(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    selector: &RoundRobinSelector,
    graph_ref: &str,
    if_after_id: &str,
) -> Result<()> {
    let config = shared.current();
    let supergraph = config
        .find_supergraph(graph_ref)
        .ok_or_else(|| RelayError::Config(format!("supergraph not found for {graph_ref}")))?;

    if !supergraph.persisted_query_version.is_empty() {
        return Ok(());
    }

    let variables = serde_json::json!({
        "apiKey": supergraph.apollo_key,
        "graph_ref": graph_ref,
        "ifAfterId": if_after_id,
    });
    let body = uplink::uplink_request(
        client,
        selector,
        PERSISTED_QUERIES_MANIFEST_QUERY,
        variables,
        PERSISTED_QUERIES_QUERY,
    )
    .await?;

    let mut response: PersistedQueriesResponse = serde_json::from_slice(&body)
        .map_err(|err| RelayError::Uplink(format!("failed to decode response body: {err}")))?;

    if !config.cache.enabled {
        return Ok(());
    }

    if let PersistedQueries::FetchError { code, message } = &response.data.persisted_queries {
        return Err(RelayError::Uplink(format!("{code}: {message}")));
    }

    let promotable = matches!(
        response.data.persisted_queries,
        PersistedQueries::PersistedQueriesResult { .. }
    );
    response.data.persisted_queries = match response.data.persisted_queries {
        PersistedQueries::PersistedQueriesResult {
            id,
            min_delay_seconds,
            chunks,
        } => {
            let chunks = cache_chunk_data(&config, cache, client, chunks).await?;
            PersistedQueries::PersistedQueriesResult {
                id,
                min_delay_seconds,
                chunks,
            }
        }
        unchanged => unchanged,
    };

    let serialized = serde_json::to_vec(&response)?;
    let item = CacheItem {
        id: response.data.persisted_queries.id().to_string(),
        hash: hash_bytes(&serialized),
        expiration: expiration_time(config.cache.duration),
        last_modified: Utc::now(),
        content: serialized,
    };

    // An Unchanged envelope is only valid for the requester that supplied
    // the conditional token, so it never replaces the default slot.
    if promotable {
        if let Err(err) = update_newest(cache, graph_ref, PERSISTED_QUERIES_QUERY, &item).await {
            warn!(graph_ref, %err, "failed to promote manifest to the default key");
        }
    }

    let cache_key = make_cache_key(
        graph_ref,
        PERSISTED_QUERIES_QUERY,
        Some(&conditional_args(graph_ref, if_after_id)),
    );
    debug!(graph_ref, cache_key, "caching pq manifest");
    let serialized = serde_json::to_vec(&item)?;
    cache.set(&cache_key, &serialized, config.cache.duration).await
}
