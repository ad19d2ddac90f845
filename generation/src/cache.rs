//! TTL cache over a shared [`KeyValueStore`].
//!
//! Items are stored as JSON [`CacheItem`]s. The backing TTL and the item's
//! own `expires_at` are written in one store call; reads additionally check
//! `expires_at` so an item is never served past its lifetime even if the
//! store has not evicted it yet.

use config::CacheConfig;
use errors::StorageError;
use gen_core::traits::KeyValueStore;
use gen_core::types::{CacheItem, now_millis};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_KEY_PREFIX: &str = "cache:";

const JSON_CONTENT_TYPE: &str = "application/json";

pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into()
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self::with_prefix(store, config.key_prefix.clone())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheItem>, StorageError> {
        let full_key = self.full_key(key);
        let Some(raw) = self.store.get(&full_key).await? else {
            debug!(key = %full_key, "Cache miss");
            return Ok(None);
        };

        let item: CacheItem = match serde_json::from_str(&raw) {
            Ok(item) => item,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Dropping undecodable cache entry");
                self.store.delete(&full_key).await?;
                return Ok(None);
            }
        };

        if item.is_expired_at(now_millis()) {
            debug!(key = %full_key, "Cache entry expired, deleting lazily");
            self.store.delete(&full_key).await?;
            return Ok(None);
        }

        debug!(key = %full_key, "Cache hit");
        Ok(Some(item))
    }

    /// Writes `value` with a fresh `created_at`/`expires_at`. A zero TTL is rejected.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
        content_type: &str,
        metadata: HashMap<String, String>
    ) -> Result<bool, StorageError> {
        if ttl.is_zero() {
            return Err(StorageError::InvalidArgument {
                reason: format!("TTL for cache key {key} must be positive")
            });
        }

        let item = CacheItem::new(value.into(), content_type, ttl, metadata);
        let encoded = serde_json::to_string(&item).map_err(StorageError::json)?;
        let full_key = self.full_key(key);
        self.store.set_with_ttl(&full_key, &encoded, ttl).await?;
        debug!(key = %full_key, ttl_ms = ttl.as_millis() as u64, "Cache set");
        Ok(true)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.store.delete(&self.full_key(key)).await
    }

    /// Same lazy-expiry rule as [`CacheStore::get`].
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// A payload that no longer decodes as `T` is a miss and is deleted.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(item) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&item.content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    key = %self.full_key(key),
                    error = %e,
                    "Dropping cache payload with stale shape"
                );
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration
    ) -> Result<bool, StorageError> {
        let bytes = serde_json::to_vec(value).map_err(StorageError::json)?;
        self.set(key, bytes, ttl, JSON_CONTENT_TYPE, HashMap::new())
            .await
    }
}
