use async_trait::async_trait;
use errors::StorageError;
use gen_core::traits::{CounterStore, KeyValueStore};
use gen_core::types::SlidingWindowOutcome;
use std::time::Duration;

/// Store whose every call fails as if Redis were unreachable.
pub struct FailingStore;

fn unreachable_error() -> StorageError {
    StorageError::ConnectionError {
        backend: "Redis".to_string(),
        reason: "Connection refused".to_string()
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(unreachable_error())
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration
    ) -> Result<(), StorageError> {
        Err(unreachable_error())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StorageError> {
        Err(unreachable_error())
    }

    async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
        Err(unreachable_error())
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment_and_expire_on_first_write(
        &self,
        _key: &str,
        _window: Duration
    ) -> Result<u64, StorageError> {
        Err(unreachable_error())
    }

    async fn sliding_window_acquire(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
        _now_ms: i64,
        _member: &str
    ) -> Result<SlidingWindowOutcome, StorageError> {
        Err(unreachable_error())
    }
}
