use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{Cache, expiration_time, never_expires};
use crate::core::error::Result;

struct MemoryEntry {
    content: Vec<u8>,
    expiration: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration != never_expires() && self.expiration < now
    }
}

/// Bounded in-process cache. At capacity the entry with the earliest
/// expiration is evicted; entries stored with duration -1 never expire and
/// are never evicted, so only pinned items can push the map past capacity.
pub struct MemoryCache {
    items: RwLock<HashMap<String, MemoryEntry>>,
    max_items: usize,
}

impl MemoryCache {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            max_items,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let items = self.items.read();
        let entry = items.get(key)?;
        if entry.is_expired(Utc::now()) {
            debug!(key, "memory cache entry expired");
            return None;
        }
        Some(entry.content.clone())
    }

    async fn set(&self, key: &str, content: &[u8], duration: i64) -> Result<()> {
        let mut items = self.items.write();

        if items.len() >= self.max_items && !items.contains_key(key) {
            let evict_key = items
                .iter()
                .filter(|(_, entry)| entry.expiration != never_expires())
                .min_by_key(|(_, entry)| entry.expiration)
                .map(|(key, _)| key.clone());
            if let Some(evict_key) = evict_key {
                debug!(key = evict_key, "memory cache evict");
                items.remove(&evict_key);
            }
        }

        items.insert(
            key.to_string(),
            MemoryEntry {
                content: content.to_vec(),
                expiration: expiration_time(duration),
            },
        );
        Ok(())
    }

    async fn delete_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut items = self.items.write();
        items.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
