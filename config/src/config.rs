//! # Configuration Structures
//!
//! This module defines all configuration structures for the generation broker.
//!
//! All configuration structures:
//! - Use `serde` for serialization/deserialization
//! - Use `validator` for input validation
//! - Provide a `Default` that runs against a local Redis and an
//!   OpenAI-compatible endpoint

use crate::models::{ModelCatalog, ModelSpec, default_models};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Main configuration structure for the generation broker.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Aggregates every subsystem configuration. Constructed once at startup and
/// passed by reference into component constructors.
///
/// ## Usage
/// ```rust,no_run
/// use config::Config;
///
/// let config = Config::default();
/// println!("Redis: {}", config.redis.url);
/// ```
///
/// ## Fields
/// - `redis`: Shared cache/counter store connection
/// - `cache`: Generation result caching
/// - `rate_limit`: Per-scope request limits
/// - `provider`: Text-generation endpoint and call budget
/// - `generation`: Pipeline defaults (models, theme validation)
/// - `models`: Known models and their context windows
/// - `observability`: Metrics exporter and log level
///
/// ## Validation
/// All nested configurations must pass their own validation rules.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub redis: RedisConfig,

    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    #[validate(nested)]
    pub provider: ProviderConfig,

    #[serde(default)]
    #[validate(nested)]
    pub generation: GenerationDefaults,

    #[serde(default)]
    #[validate(nested)]
    pub models: ModelsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub observability: ObservabilityConfig
}

impl Config {
    pub fn model_catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.models.catalog.clone())
    }
}

/// Redis connection configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Manages the connection to the Redis instance shared by every broker
/// process for cached results and rate-limit counters.
///
/// ## Fields
/// - `url`: Redis connection URL (default: "redis://127.0.0.1:6379")
/// - `key_prefix`: Prefix applied to every rate-limit key (default: "")
/// - `timeout_seconds`: Connection timeout (default: 5, range: 1-300)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    #[validate(length(min = 1))]
    pub url: String,

    #[serde(default)]
    pub key_prefix: String,

    #[serde(default = "default_redis_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_timeout() -> u64 {
    5
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
            timeout_seconds: default_redis_timeout()
        }
    }
}

/// Generation result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lifetime of a cached generation result.
    #[serde(default = "default_cache_ttl")]
    #[validate(range(min = 1, max = 604800))]
    pub ttl_seconds: u64,

    #[serde(default = "default_cache_prefix")]
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_prefix() -> String {
    "cache:".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            key_prefix: default_cache_prefix()
        }
    }
}

/// Counting algorithm used for every rate-limit scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    FixedWindow,
    SlidingWindow
}

impl std::str::FromStr for RateLimitAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" | "fixed" => Ok(Self::FixedWindow),
            "sliding_window" | "sliding" => Ok(Self::SlidingWindow),
            other => Err(format!("unknown rate limit algorithm: {other}"))
        }
    }
}

/// Limit for a single rate-limit scope.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ScopeLimit {
    #[validate(range(min = 1))]
    pub limit: u64,

    #[validate(range(min = 1, max = 86400))]
    pub window_seconds: u64,

    #[serde(default = "default_true")]
    pub enabled: bool
}

impl ScopeLimit {
    pub fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
            enabled: true
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Rate limiting configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Defines the independent limits checked before every provider call. A
/// request must pass every enabled scope.
///
/// ## Fields
/// - `algorithm`: `fixed_window` (default) or `sliding_window`
/// - `global`: Limit shared by all requests (default: 600/60s)
/// - `per_model`: Limit per target model (default: 120/60s)
/// - `per_user`: Limit per caller id (default: 30/60s)
/// - `per_operation`: Limit per content type (default: 60/60s)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    #[serde(default = "default_global_limit")]
    #[validate(nested)]
    pub global: ScopeLimit,

    #[serde(default = "default_model_limit")]
    #[validate(nested)]
    pub per_model: ScopeLimit,

    #[serde(default = "default_user_limit")]
    #[validate(nested)]
    pub per_user: ScopeLimit,

    #[serde(default = "default_operation_limit")]
    #[validate(nested)]
    pub per_operation: ScopeLimit
}

fn default_global_limit() -> ScopeLimit {
    ScopeLimit::new(600, 60)
}

fn default_model_limit() -> ScopeLimit {
    ScopeLimit::new(120, 60)
}

fn default_user_limit() -> ScopeLimit {
    ScopeLimit::new(30, 60)
}

fn default_operation_limit() -> ScopeLimit {
    ScopeLimit::new(60, 60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::FixedWindow,
            global: default_global_limit(),
            per_model: default_model_limit(),
            per_user: default_user_limit(),
            per_operation: default_operation_limit()
        }
    }
}

/// Text-generation provider configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Endpoint and call budget for the OpenAI-compatible chat completions
/// provider.
///
/// ## Fields
/// - `base_url`: API root, `/chat/completions` is appended
/// - `api_key`: Bearer token (optional for local endpoints)
/// - `timeout_ms`: Per-attempt timeout (default: 30000)
/// - `max_retries`: Retries for transient errors on one model (default: 2)
/// - `initial_backoff_ms`: First retry delay, doubled each retry (default: 200)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    #[validate(length(min = 1))]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout_ms")]
    #[validate(range(min = 100, max = 600000))]
    pub timeout_ms: u64,

    #[serde(default = "default_provider_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,

    #[serde(default = "default_provider_initial_backoff_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub initial_backoff_ms: u64
}

fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    30000
}

fn default_provider_max_retries() -> u32 {
    2
}

fn default_provider_initial_backoff_ms() -> u64 {
    200
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            timeout_ms: default_provider_timeout_ms(),
            max_retries: default_provider_max_retries(),
            initial_backoff_ms: default_provider_initial_backoff_ms()
        }
    }
}

/// Pipeline defaults applied when a request does not override them.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct GenerationDefaults {
    #[serde(default = "default_model")]
    #[validate(length(min = 1))]
    pub default_model: String,

    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    /// Run the secondary theme-fit check after each generation.
    #[serde(default)]
    pub validate_theme: bool,

    /// Model used for theme validation. Empty means the request's model.
    #[serde(default)]
    pub theme_validation_model: String
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_fallback_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            fallback_model: default_fallback_model(),
            validate_theme: false,
            theme_validation_model: String::new()
        }
    }
}

/// Known models.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ModelsConfig {
    #[serde(default = "default_models")]
    #[validate(length(min = 1), nested)]
    pub catalog: Vec<ModelSpec>
}

/// Observability configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Fields
/// - `metrics_enabled`: Install the Prometheus exporter (default: true)
/// - `metrics_port`: Exporter listen port (default: 9090)
/// - `logging_level`: Default filter when `RUST_LOG` is unset (default: "info")
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    #[validate(range(min = 1, max = 65535))]
    pub metrics_port: u16,

    #[serde(default = "default_logging_level")]
    #[validate(custom(function = "validate_logging_level"))]
    pub logging_level: String
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn validate_logging_level(value: &str) -> Result<(), validator::ValidationError> {
    match value {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validator::ValidationError::new("Invalid logging level"))
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
            logging_level: default_logging_level()
        }
    }
}
