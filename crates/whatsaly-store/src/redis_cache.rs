use async_trait::async_trait;

use crate::cache::SessionCache;
use crate::error::{CacheError, CacheResult};

const SCAN_BATCH: usize = 200;

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    /// Parses the URL; the connection itself is established per purge.
    pub fn open(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|error| CacheError::Unavailable(format!("invalid redis url: {error}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionCache for RedisCache {
    async fn delete_matching(&self, pattern: &str) -> CacheResult<usize> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| CacheError::Unavailable(error.to_string()))?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|error| CacheError::Command(format!("SCAN {pattern}: {error}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(0);
        }
        keys.sort();
        keys.dedup();

        let mut deleted = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let removed: usize = redis::cmd("DEL")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(|error| CacheError::Command(format!("DEL {pattern}: {error}")))?;
            deleted += removed;
        }
        tracing::debug!(pattern, deleted, "purged session cache keys");
        Ok(deleted)
    }
}
