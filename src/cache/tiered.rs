use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Cache;
use crate::core::error::{RelayError, Result};

/// Ordered composition of cache layers. Reads return the first available
/// value and opportunistically promote it to the faster layers that
/// missed; promotion runs in the background and never fails a read.
pub struct TieredCache {
    caches: Vec<Arc<dyn Cache>>,
    duration: i64,
}

impl TieredCache {
    /// `duration` is the expiry applied when back-filling missed layers.
    pub fn new(caches: Vec<Arc<dyn Cache>>, duration: i64) -> Self {
        Self { caches, duration }
    }
}

#[async_trait]
impl Cache for TieredCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut missed: Vec<Arc<dyn Cache>> = Vec::new();
        for cache in &self.caches {
            match cache.get(key).await {
                Some(content) => {
                    debug!(cache = cache.name(), key, "tiered cache hit");
                    if !missed.is_empty() {
                        let key = key.to_string();
                        let backfill = content.clone();
                        let duration = self.duration;
                        tokio::spawn(async move {
                            for cache in missed {
                                if let Err(err) = cache.set(&key, &backfill, duration).await {
                                    warn!(
                                        cache = cache.name(),
                                        key, %err,
                                        "failed to back-fill cache layer"
                                    );
                                }
                            }
                        });
                    }
                    return Some(content);
                }
                None => missed.push(Arc::clone(cache)),
            }
        }
        None
    }

    async fn set(&self, key: &str, content: &[u8], duration: i64) -> Result<()> {
        let mut last_error: Option<RelayError> = None;
        for cache in &self.caches {
            if let Err(err) = cache.set(key, content, duration).await {
                warn!(cache = cache.name(), key, %err, "failed to set content in cache layer");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut last_error: Option<RelayError> = None;
        for cache in &self.caches {
            if let Err(err) = cache.delete_with_prefix(prefix).await {
                warn!(cache = cache.name(), prefix, %err, "failed to delete from cache layer");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "Tiered"
    }
}
