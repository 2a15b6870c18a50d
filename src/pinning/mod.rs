//! Pinning: serving statically chosen artifact versions instead of live
//! uplink data. Pinned entries live under alternate operation tokens and
//! never expire.

pub mod license;
pub mod persisted_queries;
pub mod schema;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::cache::{Cache, CacheItem, make_cache_key};
use crate::config::Config;
use crate::core::error::{RelayError, Result};
use crate::core::hash::hash_bytes;
use crate::uplink::{self, LICENSE_QUERY, PERSISTED_QUERIES_QUERY, SUPERGRAPH_QUERY};

pub use license::pin_offline_license;
pub use persisted_queries::pin_persisted_queries;
pub use schema::pin_launch_id;

pub const SUPERGRAPH_PINNED: &str = "SupergraphPinned";
pub const LICENSE_PINNED: &str = "LicensePinned";
pub const PERSISTED_QUERIES_PINNED: &str = "PersistedQueriesPinned";

/// The pinned operation token for an uplink operation name.
pub fn pinned_operation_name(operation_name: &str) -> Option<&'static str> {
    match operation_name {
        SUPERGRAPH_QUERY => Some(SUPERGRAPH_PINNED),
        LICENSE_QUERY => Some(LICENSE_PINNED),
        PERSISTED_QUERIES_QUERY => Some(PERSISTED_QUERIES_PINNED),
        _ => None,
    }
}

pub(crate) fn find_api_key(config: &Config, graph_ref: &str) -> Result<String> {
    config
        .find_supergraph(graph_ref)
        .map(|supergraph| supergraph.apollo_key.clone())
        .ok_or_else(|| RelayError::Pinning(format!("API key not found for graphRef {graph_ref}")))
}

/// Outbound request to the studio API, carrying the relay identity plus
/// the graph's API key.
pub(crate) fn studio_request(
    client: &reqwest::Client,
    config: &Config,
    api_key: &str,
) -> reqwest::RequestBuilder {
    uplink::identity_headers(client.post(&config.uplink.studio_api_url))
        .header("x-api-key", api_key)
}

/// Store a pinned entry. Failures are logged but never bubble up; a pin
/// that cannot be written leaves the previous state untouched.
pub(crate) async fn insert_pinned_entry(
    cache: &dyn Cache,
    key: &str,
    content: Vec<u8>,
    id: &str,
    last_modified: DateTime<Utc>,
    expiration: DateTime<Utc>,
) {
    let item = CacheItem {
        hash: hash_bytes(&content),
        content,
        expiration,
        last_modified,
        id: id.to_string(),
    };
    let serialized = match serde_json::to_vec(&item) {
        Ok(serialized) => serialized,
        Err(err) => {
            error!(key, %err, "failed to encode pinned cache entry");
            return;
        }
    };
    if let Err(err) = cache.set(key, &serialized, -1).await {
        error!(key, %err, "failed to store pinned cache entry");
    }
}

/// Read the pinned entry for an operation. `None` means no entry exists.
/// A returned entry with cleared content renders as `Unchanged`.
pub async fn handle_pinned_entry(
    cache: &dyn Cache,
    graph_ref: &str,
    operation_name: &str,
    if_after_id: &str,
) -> Result<Option<CacheItem>> {
    let pinned_operation = pinned_operation_name(operation_name).ok_or_else(|| {
        RelayError::Pinning(format!("unknown operation name {operation_name}"))
    })?;
    let raw = match cache
        .get(&make_cache_key(graph_ref, pinned_operation, None))
        .await
    {
        Some(raw) => raw,
        None => {
            debug!(operation_name, "no pinned cache entry found");
            return Ok(None);
        }
    };

    let mut entry: CacheItem = serde_json::from_slice(&raw)
        .map_err(|err| RelayError::Pinning(format!("failed to decode pinned entry: {err}")))?;

    if if_after_id.is_empty() {
        return Ok(Some(entry));
    }

    match operation_name {
        // The conditional comparison happens in the response synthesis via
        // the manifest id pair, not a timestamp.
        PERSISTED_QUERIES_QUERY => Ok(Some(entry)),
        // The proxy layer serves the license as-is.
        LICENSE_QUERY => Ok(Some(entry)),
        _ => {
            let if_after = parse_if_after_id(if_after_id)?;
            if entry.last_modified > if_after {
                Ok(Some(entry))
            } else {
                entry.content.clear();
                Ok(Some(entry))
            }
        }
    }
}

/// Routers echo the id the relay handed out, but some send offsets
/// without a colon, so accept both forms.
pub(crate) fn parse_if_after_id(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| RelayError::Pinning(format!("failed to parse ifAfterId {value}: {err}")))
}
