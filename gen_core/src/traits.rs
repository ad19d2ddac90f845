use crate::types::{
    Completion, ContentType, Prompt, ProviderRequest, SlidingWindowOutcome, StreamDelta,
    ThemeContext
};
use async_trait::async_trait;
use errors::{ProviderError, StorageError};
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Stream of incremental completion output.
pub type CompletionStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

/// Shared key/value store with native TTL support.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes `value` and its expiry in a single store call.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), StorageError>;

    /// Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Atomic counting primitives used by rate limiting.
///
/// Both operations must be atomic with respect to every other caller sharing
/// the same key, including callers in other processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and sets its expiry to `window` when the new value is 1.
    async fn increment_and_expire_on_first_write(
        &self,
        key: &str,
        window: Duration
    ) -> Result<u64, StorageError>;

    /// Trims entries older than `now_ms - window`, then records `member` at
    /// `now_ms` only if fewer than `limit` entries remain.
    async fn sliding_window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: i64,
        member: &str
    ) -> Result<SlidingWindowOutcome, StorageError>;
}

/// Abstract text-generation provider.
#[async_trait]
pub trait TextGenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<Completion, ProviderError>;

    /// Streams the completion. Providers without native streaming yield the
    /// whole completion as one delta.
    async fn complete_stream(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<CompletionStream, ProviderError> {
        let completion = self.complete(prompt, request).await?;
        let delta = StreamDelta {
            content: completion.text,
            usage: Some(completion.usage)
        };
        Ok(Box::pin(futures_util::stream::iter([Ok(delta)])))
    }
}

/// Renders a theme-aware prompt. Must be pure.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, content_type: &ContentType, theme: Option<&ThemeContext>) -> Prompt;
}
