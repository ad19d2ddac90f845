//! # Loreforge Errors
//!
//! Error taxonomy for the generation broker.
//!
//! - `StorageError`: failures of the shared cache/counter store
//! - `ProviderError`: failures reported by a text-generation provider
//! - `GenerationError`: what a pipeline caller sees
//!
//! All variants use named fields so messages stay readable in logs.

use std::time::Duration;
use thiserror::Error;

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionError { backend: String, reason: String },

    #[error("Query on {backend} failed: {reason}")]
    QueryError { backend: String, reason: String },

    #[error("Serialization error: {error_type} - {reason}")]
    SerializationError { error_type: String, reason: String },

    #[error("Invalid storage argument: {reason}")]
    InvalidArgument { reason: String }
}

impl StorageError {
    pub fn redis_query(reason: impl std::fmt::Display) -> Self {
        StorageError::QueryError {
            backend: "Redis".to_string(),
            reason: reason.to_string()
        }
    }

    pub fn json(reason: impl std::fmt::Display) -> Self {
        StorageError::SerializationError {
            error_type: "JSON".to_string(),
            reason: reason.to_string()
        }
    }
}

/// Errors raised by a text-generation provider for a single call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Provider rate limited: retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("Provider quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Provider call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider API error (status {status:?}): {message}")]
    Api { status: Option<u16>, message: String },

    #[error("Invalid provider response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String }
}

impl ProviderError {
    /// Errors worth retrying against the same model.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Transport { .. } => true,
            ProviderError::Api { status, .. } => status.is_none_or(|s| s >= 500),
            _ => false
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "provider_rate_limited",
            ProviderError::QuotaExceeded { .. } => "quota_exceeded",
            ProviderError::Timeout { .. } => "provider_timeout",
            ProviderError::Api { .. } => "provider_api_error",
            ProviderError::InvalidResponse { .. } => "invalid_response",
            ProviderError::Transport { .. } => "transport_error"
        }
    }
}

/// Errors surfaced by the generation pipeline.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Rate limit exceeded for scope {scope}: limit {limit}, resets at {reset_at}")]
    RateLimitExceeded {
        scope: String,
        limit: u64,
        remaining: u64,
        reset_at: i64,
        retry_after_secs: u64
    },

    #[error("Provider rate limited model {model}: retry after {retry_after_secs:?}s")]
    ProviderRateLimited {
        model: String,
        retry_after_secs: Option<u64>
    },

    #[error("Provider call to {model} timed out after {timeout_ms}ms")]
    ProviderTimeout { model: String, timeout_ms: u64 },

    #[error("Provider API error from {model} (status {status:?}): {message}")]
    ProviderApi {
        model: String,
        status: Option<u16>,
        message: String
    },

    #[error("Quota exceeded for model {model}: {reason}")]
    QuotaExceeded { model: String, reason: String },

    #[error(
        "Generation failed on {primary_model} ({primary}) and fallback {fallback_model} \
         ({fallback})"
    )]
    GenerationFailed {
        primary_model: String,
        primary: ProviderError,
        fallback_model: String,
        fallback: ProviderError
    },

    #[error("Cache store error: {source}")]
    CacheStore {
        #[from]
        source: StorageError
    },

    #[error("Unparseable provider output: {reason}")]
    Parse { reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String }
}

impl GenerationError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        GenerationError::Validation {
            field: field.into(),
            message: message.into()
        }
    }

    /// Maps a provider failure on `model` into the caller-facing taxonomy.
    pub fn from_provider(model: &str, error: ProviderError) -> Self {
        match error {
            ProviderError::RateLimited { retry_after } => GenerationError::ProviderRateLimited {
                model: model.to_string(),
                retry_after_secs: retry_after
            },
            ProviderError::QuotaExceeded { reason } => GenerationError::QuotaExceeded {
                model: model.to_string(),
                reason
            },
            ProviderError::Timeout { timeout_ms } => GenerationError::ProviderTimeout {
                model: model.to_string(),
                timeout_ms
            },
            ProviderError::Api { status, message } => GenerationError::ProviderApi {
                model: model.to_string(),
                status,
                message
            },
            ProviderError::InvalidResponse { reason } | ProviderError::Transport { reason } => {
                GenerationError::ProviderApi {
                    model: model.to_string(),
                    status: None,
                    message: reason
                }
            }
        }
    }

    /// Whether a caller may usefully retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimitExceeded { .. }
                | GenerationError::ProviderRateLimited { .. }
                | GenerationError::ProviderTimeout { .. }
                | GenerationError::QuotaExceeded { .. }
                | GenerationError::GenerationFailed { .. }
        )
    }

    /// Suggested wait before retrying. Quota exhaustion backs off longer than a plain
    /// rate limit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimitExceeded {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            GenerationError::ProviderRateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(retry_after_secs.unwrap_or(5))),
            GenerationError::QuotaExceeded { .. } => Some(Duration::from_secs(3600)),
            GenerationError::ProviderTimeout { .. } => Some(Duration::from_secs(1)),
            _ => None
        }
    }

    /// Stable snake_case label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Validation { .. } => "validation",
            GenerationError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GenerationError::ProviderRateLimited { .. } => "provider_rate_limited",
            GenerationError::ProviderTimeout { .. } => "provider_timeout",
            GenerationError::ProviderApi { .. } => "provider_api_error",
            GenerationError::QuotaExceeded { .. } => "quota_exceeded",
            GenerationError::GenerationFailed { .. } => "generation_failed",
            GenerationError::CacheStore { .. } => "cache_store",
            GenerationError::Parse { .. } => "parse",
            GenerationError::Configuration { .. } => "configuration"
        }
    }
}

pub type PipelineResult<T> = Result<T, GenerationError>;
