//! Cache substrate for uplink artifacts.
//!
//! Every layer speaks the same `Cache` interface; entries are stored as a
//! JSON `CacheItem` envelope and only ever replaced whole, never mutated
//! in place.

pub mod filesystem;
pub mod memory;
pub mod redis;
pub mod tiered;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::core::error::{RelayError, Result};
use crate::core::graph_ref::GraphRef;
use crate::core::hash::hash_bytes;

pub use filesystem::FilesystemCache;
pub use memory::MemoryCache;
pub use redis::RedisCache;
pub use tiered::TieredCache;

/// Expiration instant that marks an entry as never expiring.
pub fn never_expires() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// A single cached item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem {
    /// Byte content of the cached item.
    #[serde(with = "base64_content")]
    pub content: Vec<u8>,
    /// Expiration time of the cached item; the Unix epoch means never.
    pub expiration: DateTime<Utc>,
    /// Hex SHA-256 of the content.
    pub hash: String,
    /// Last modified time of the cached item.
    pub last_modified: DateTime<Utc>,
    /// Opaque version token from uplink.
    pub id: String,
}

impl CacheItem {
    /// Build an item from content, hashing it and stamping the current time.
    pub fn new(id: impl Into<String>, content: Vec<u8>, duration: i64) -> Self {
        Self {
            hash: hash_bytes(&content),
            expiration: expiration_time(duration),
            last_modified: Utc::now(),
            id: id.into(),
            content,
        }
    }
}

mod base64_content {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A cache layer. Implementations must be safe under concurrent readers
/// and writers. A duration of -1 means the entry never expires and is
/// pinned against eviction where the layer supports pinning.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Retrieve an item if it exists and has not expired.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Add an item with a duration in seconds until expiration.
    async fn set(&self, key: &str, content: &[u8], duration: i64) -> Result<()>;

    /// Remove every entry whose key begins with the prefix.
    async fn delete_with_prefix(&self, prefix: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// `graphID:variantID:operationName`, used for bulk invalidation.
pub fn make_cache_prefix(graph_ref: &str, operation_name: &str) -> String {
    match graph_ref.parse::<GraphRef>() {
        Ok(parsed) => format!(
            "{}:{}:{}",
            parsed.graph_id, parsed.variant_id, operation_name
        ),
        Err(_) => String::new(),
    }
}

/// Generate a cache key from the graph ref, operation name and any extra
/// arguments. Extra arguments are hashed over their sorted JSON form so
/// that equal argument sets always map to the same key.
pub fn make_cache_key(
    graph_ref: &str,
    operation_name: &str,
    extra_args: Option<&BTreeMap<String, Value>>,
) -> String {
    let prefix = make_cache_prefix(graph_ref, operation_name);
    match extra_args {
        Some(args) => {
            let serialized = serde_json::to_vec(args).unwrap_or_default();
            format!("{}:{}", prefix, hash_bytes(&serialized))
        }
        None => prefix,
    }
}

/// Argument map for a conditional request with the given `ifAfterId`.
pub fn conditional_args(graph_ref: &str, if_after_id: &str) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("graph_ref".to_string(), Value::String(graph_ref.to_string())),
        (
            "ifAfterId".to_string(),
            Value::String(if_after_id.to_string()),
        ),
    ])
}

/// The canonical key routers without a conditional token resolve to.
/// Polling writes the same slot, so both sides stay in sync.
pub fn default_cache_key(graph_ref: &str, operation_name: &str) -> String {
    make_cache_key(
        graph_ref,
        operation_name,
        Some(&conditional_args(graph_ref, "")),
    )
}

/// Expiration instant for a duration in seconds; -1 means never.
pub fn expiration_time(duration: i64) -> DateTime<Utc> {
    if duration == -1 {
        return never_expires();
    }
    Utc::now() + Duration::seconds(duration)
}

/// RFC3339 with a `Z` suffix, the format uplink uses for version tokens.
pub fn format_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Replace the default-key entry with the passed item when it is strictly
/// newer and different. New routers ask without a conditional token, so the
/// default slot must always hold the latest artifact with actual data;
/// items without content are ignored.
pub async fn update_newest(
    cache: &dyn Cache,
    graph_ref: &str,
    operation_name: &str,
    item: &CacheItem,
) -> Result<()> {
    if item.content.is_empty() {
        return Ok(());
    }

    let cache_key = default_cache_key(graph_ref, operation_name);
    let current = match cache.get(&cache_key).await {
        Some(raw) => serde_json::from_slice::<CacheItem>(&raw).map_err(|err| {
            error!(cache_key, %err, "error decoding cache entry");
            RelayError::Serialization(err.to_string())
        })?,
        None => CacheItem {
            content: Vec::new(),
            expiration: never_expires(),
            hash: String::new(),
            last_modified: never_expires(),
            id: String::new(),
        },
    };

    if current.last_modified < item.last_modified && current.hash != item.hash {
        let serialized = serde_json::to_vec(item)?;
        return cache.set(&cache_key, &serialized, -1).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_cache_key_without_args() {
        assert_eq!(
            make_cache_key("acme@prod", "SupergraphSdlQuery", None),
            "acme:prod:SupergraphSdlQuery"
        );
    }

    #[test]
    fn test_make_cache_key_invalid_graph_ref() {
        assert_eq!(make_cache_prefix("acme", "SupergraphSdlQuery"), "");
    }

    #[test]
    fn test_default_key_matches_router_key_after_api_key_removal() {
        // A router request carries apiKey; polling does not. Stripping it
        // must land both on the same slot.
        let mut router_vars = BTreeMap::from([
            (
                "apiKey".to_string(),
                Value::String("service:acme:secret".to_string()),
            ),
            (
                "graph_ref".to_string(),
                Value::String("acme@prod".to_string()),
            ),
            ("ifAfterId".to_string(), Value::String(String::new())),
        ]);
        router_vars.remove("apiKey");

        let router_key = make_cache_key("acme@prod", "SupergraphSdlQuery", Some(&router_vars));
        assert_eq!(
            router_key,
            default_cache_key("acme@prod", "SupergraphSdlQuery")
        );
    }

    #[test]
    fn test_expiration_time_indefinite() {
        assert_eq!(expiration_time(-1), never_expires());
    }

    #[test]
    fn test_expiration_time_positive() {
        let expiration = expiration_time(60);
        assert!(expiration > Utc::now());
        assert!(expiration <= Utc::now() + Duration::seconds(61));
    }

    #[test]
    fn test_cache_item_new_invariants() {
        let item = CacheItem::new("v1", b"content".to_vec(), 30);
        assert_eq!(item.hash, hash_bytes(b"content"));
        assert!(item.last_modified <= Utc::now());
        assert!(item.expiration >= item.last_modified);
    }

    #[tokio::test]
    async fn test_update_newest_replaces_older_entry() {
        let cache = MemoryCache::new(10);
        let graph_ref = "acme@prod";

        let older = CacheItem {
            content: b"old".to_vec(),
            expiration: never_expires(),
            hash: hash_bytes(b"old"),
            last_modified: Utc::now() - Duration::hours(1),
            id: "old".to_string(),
        };
        let key = default_cache_key(graph_ref, "SupergraphSdlQuery");
        cache
            .set(&key, &serde_json::to_vec(&older).unwrap(), -1)
            .await
            .unwrap();

        let newer = CacheItem::new("new", b"new".to_vec(), -1);
        update_newest(&cache, graph_ref, "SupergraphSdlQuery", &newer)
            .await
            .unwrap();

        let stored: CacheItem = serde_json::from_slice(&cache.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored, newer);
    }

    #[tokio::test]
    async fn test_update_newest_is_idempotent() {
        let cache = MemoryCache::new(10);
        let graph_ref = "acme@prod";
        let item = CacheItem::new("v1", b"sdl".to_vec(), -1);

        update_newest(&cache, graph_ref, "SupergraphSdlQuery", &item)
            .await
            .unwrap();
        update_newest(&cache, graph_ref, "SupergraphSdlQuery", &item)
            .await
            .unwrap();

        let key = default_cache_key(graph_ref, "SupergraphSdlQuery");
        let stored: CacheItem = serde_json::from_slice(&cache.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored, item);
    }

    #[tokio::test]
    async fn test_update_newest_ignores_empty_content() {
        let cache = MemoryCache::new(10);
        let graph_ref = "acme@prod";
        let unchanged_marker = CacheItem::new("v2", Vec::new(), -1);

        update_newest(&cache, graph_ref, "LicenseQuery", &unchanged_marker)
            .await
            .unwrap();

        let key = default_cache_key(graph_ref, "LicenseQuery");
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_update_newest_keeps_newer_entry() {
        let cache = MemoryCache::new(10);
        let graph_ref = "acme@prod";

        let newer = CacheItem::new("new", b"new".to_vec(), -1);
        let key = default_cache_key(graph_ref, "SupergraphSdlQuery");
        cache
            .set(&key, &serde_json::to_vec(&newer).unwrap(), -1)
            .await
            .unwrap();

        let older = CacheItem {
            content: b"old".to_vec(),
            expiration: never_expires(),
            hash: hash_bytes(b"old"),
            last_modified: Utc::now() - Duration::hours(1),
            id: "old".to_string(),
        };
        update_newest(&cache, graph_ref, "SupergraphSdlQuery", &older)
            .await
            .unwrap();

        let stored: CacheItem = serde_json::from_slice(&cache.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored, newer);
    }
}
