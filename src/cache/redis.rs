use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::Cache;
use crate::core::error::{RelayError, Result};

/// Thin binding over a Redis server used as a shared remote layer.
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(address: &str, password: &str, database: i64) -> Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{address}/{database}")
        } else {
            format!("redis://:{password}@{address}/{database}")
        };
        let client = redis::Client::open(url)
            .map_err(|err| RelayError::Cache(format!("failed to open redis client: {err}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|err| RelayError::Cache(format!("failed to connect to redis: {err}")))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut connection = self.connection.clone();
        connection
            .get::<_, Option<Vec<u8>>>(key)
            .await
            .ok()
            .flatten()
    }

    async fn set(&self, key: &str, content: &[u8], duration: i64) -> Result<()> {
        let mut connection = self.connection.clone();
        if duration == -1 {
            // No TTL; the key lives until an explicit delete.
            let _: () = connection
                .set(key, content)
                .await
                .map_err(|err| RelayError::Cache(format!("failed to set key {key}: {err}")))?;
        } else {
            let _: () = connection
                .set_ex(key, content, duration as u64)
                .await
                .map_err(|err| RelayError::Cache(format!("failed to set key {key}: {err}")))?;
        }
        Ok(())
    }

    async fn delete_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let keys: Vec<String> = connection
            .keys(format!("{prefix}*"))
            .await
            .map_err(|err| RelayError::Cache(format!("failed to scan prefix {prefix}: {err}")))?;

        if keys.is_empty() {
            return Ok(());
        }

        let _: () = connection.del(keys).await.map_err(|err| {
            RelayError::Cache(format!("failed to delete keys with prefix {prefix}: {err}"))
        })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
