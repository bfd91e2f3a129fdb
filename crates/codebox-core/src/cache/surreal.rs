//! L2: shared tier on SurrealDB, visible to every instance using the same
//! database.

use std::sync::Arc;

use async_trait::async_trait;

use codebox_state::{CacheRecord, SurrealHandle};

use super::{CacheEntry, CacheResult, CacheTier};

pub struct SurrealTier {
    handle: Arc<SurrealHandle>,
}

impl SurrealTier {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl CacheTier for SurrealTier {
    fn name(&self) -> &str {
        "surreal"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let Some(record) = self.handle.get_cache_entry(key).await? else {
            return Ok(None);
        };
        Ok(Some(CacheEntry {
            key: record.key,
            value: serde_json::from_str(&record.value_json)?,
            inserted_at_ms: record.inserted_at_ms,
            expires_at_ms: record.expires_at_ms,
        }))
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        let record = CacheRecord {
            key: entry.key.clone(),
            value_json: serde_json::to_string(&entry.value)?,
            inserted_at_ms: entry.inserted_at_ms,
            expires_at_ms: entry.expires_at_ms,
        };
        self.handle.put_cache_entry(&record).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.handle.delete_cache_entry(key).await?)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.handle.list_cache_keys().await?)
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        Ok(self.handle.purge_expired_cache_entries().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::response::ExecutionResponse;

    #[tokio::test]
    async fn test_roundtrip_through_shared_tier() {
        let handle = Arc::new(SurrealHandle::setup_db().await.unwrap());
        let tier = SurrealTier::new(handle.clone());

        let mut response = ExecutionResponse::new();
        response.success = true;
        response.stdout = "shared\n".into();
        tier.put(&CacheEntry::new("k1", response, Duration::from_secs(60)))
            .await
            .unwrap();

        // A second tier over the same database sees the entry.
        let other = SurrealTier::new(handle);
        let got = other.get("k1").await.unwrap().unwrap();
        assert_eq!(got.value.stdout, "shared\n");
        assert_eq!(other.keys().await.unwrap(), vec!["k1".to_string()]);
        assert!(other.remove("k1").await.unwrap());
        assert!(tier.get("k1").await.unwrap().is_none());
    }
}
