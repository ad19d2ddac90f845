//! # Environment Variable Loader
//!
//! Loads configuration from environment variables following 12-factor app
//! principles. Every variable uses the `LF_` prefix; unset or unparseable
//! values fall back to the defaults.

use crate::config::{
    CacheConfig, Config, GenerationDefaults, ModelsConfig, ObservabilityConfig, ProviderConfig,
    RateLimitAlgorithm, RateLimitConfig, RedisConfig, ScopeLimit
};
use std::env;

/// Load configuration from environment variables.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Builds a [`Config`] from `LF_*` variables. Call `Config::validate()` on
/// the result before use.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_env;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_env()?;
///     println!("Redis: {}", config.redis.url);
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables
/// ### Redis
/// - `LF_REDIS_URL`, `LF_REDIS_KEY_PREFIX`, `LF_REDIS_TIMEOUT_SECONDS`
///
/// ### Cache
/// - `LF_CACHE_ENABLED`, `LF_CACHE_TTL_SECONDS`, `LF_CACHE_KEY_PREFIX`
///
/// ### Rate limiting
/// - `LF_RATE_LIMIT_ALGORITHM` (`fixed_window` / `sliding_window`)
/// - `LF_RATE_LIMIT_{GLOBAL,MODEL,USER,OPERATION}_LIMIT`
/// - `LF_RATE_LIMIT_{GLOBAL,MODEL,USER,OPERATION}_WINDOW_SECONDS`
/// - `LF_RATE_LIMIT_{GLOBAL,MODEL,USER,OPERATION}_ENABLED`
///
/// ### Provider
/// - `LF_PROVIDER_BASE_URL`, `LF_PROVIDER_API_KEY`, `LF_PROVIDER_TIMEOUT_MS`
/// - `LF_PROVIDER_MAX_RETRIES`, `LF_PROVIDER_INITIAL_BACKOFF_MS`
///
/// ### Generation
/// - `LF_DEFAULT_MODEL`, `LF_FALLBACK_MODEL`, `LF_VALIDATE_THEME`,
///   `LF_THEME_VALIDATION_MODEL`
///
/// ### Observability
/// - `LF_METRICS_ENABLED`, `LF_METRICS_PORT`, `LF_LOG_LEVEL`
pub fn load_from_env() -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config {
        redis: load_redis_from_env()?,
        cache: load_cache_from_env()?,
        rate_limit: load_rate_limit_from_env()?,
        provider: load_provider_from_env()?,
        generation: load_generation_from_env()?,
        models: ModelsConfig::default(),
        observability: load_observability_from_env()?
    };

    Ok(config)
}

fn load_redis_from_env() -> Result<RedisConfig, Box<dyn std::error::Error>> {
    let defaults = RedisConfig::default();
    Ok(RedisConfig {
        url: env::var("LF_REDIS_URL").unwrap_or(defaults.url),
        key_prefix: env::var("LF_REDIS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        timeout_seconds: parse_env("LF_REDIS_TIMEOUT_SECONDS").unwrap_or(defaults.timeout_seconds)
    })
}

fn load_cache_from_env() -> Result<CacheConfig, Box<dyn std::error::Error>> {
    let defaults = CacheConfig::default();
    Ok(CacheConfig {
        enabled: parse_env("LF_CACHE_ENABLED").unwrap_or(defaults.enabled),
        ttl_seconds: parse_env("LF_CACHE_TTL_SECONDS").unwrap_or(defaults.ttl_seconds),
        key_prefix: env::var("LF_CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix)
    })
}

fn load_rate_limit_from_env() -> Result<RateLimitConfig, Box<dyn std::error::Error>> {
    let defaults = RateLimitConfig::default();
    let algorithm = match env::var("LF_RATE_LIMIT_ALGORITHM") {
        Ok(value) => value.parse::<RateLimitAlgorithm>()?,
        Err(_) => defaults.algorithm
    };

    Ok(RateLimitConfig {
        algorithm,
        global: load_scope_from_env("GLOBAL", defaults.global),
        per_model: load_scope_from_env("MODEL", defaults.per_model),
        per_user: load_scope_from_env("USER", defaults.per_user),
        per_operation: load_scope_from_env("OPERATION", defaults.per_operation)
    })
}

fn load_scope_from_env(scope: &str, defaults: ScopeLimit) -> ScopeLimit {
    ScopeLimit {
        limit: parse_env(&format!("LF_RATE_LIMIT_{scope}_LIMIT")).unwrap_or(defaults.limit),
        window_seconds: parse_env(&format!("LF_RATE_LIMIT_{scope}_WINDOW_SECONDS"))
            .unwrap_or(defaults.window_seconds),
        enabled: parse_env(&format!("LF_RATE_LIMIT_{scope}_ENABLED")).unwrap_or(defaults.enabled)
    }
}

fn load_provider_from_env() -> Result<ProviderConfig, Box<dyn std::error::Error>> {
    let defaults = ProviderConfig::default();
    Ok(ProviderConfig {
        base_url: env::var("LF_PROVIDER_BASE_URL").unwrap_or(defaults.base_url),
        api_key: env::var("LF_PROVIDER_API_KEY").ok(),
        timeout_ms: parse_env("LF_PROVIDER_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
        max_retries: parse_env("LF_PROVIDER_MAX_RETRIES").unwrap_or(defaults.max_retries),
        initial_backoff_ms: parse_env("LF_PROVIDER_INITIAL_BACKOFF_MS")
            .unwrap_or(defaults.initial_backoff_ms)
    })
}

fn load_generation_from_env() -> Result<GenerationDefaults, Box<dyn std::error::Error>> {
    let defaults = GenerationDefaults::default();
    Ok(GenerationDefaults {
        default_model: env::var("LF_DEFAULT_MODEL").unwrap_or(defaults.default_model),
        fallback_model: env::var("LF_FALLBACK_MODEL").unwrap_or(defaults.fallback_model),
        validate_theme: parse_env("LF_VALIDATE_THEME").unwrap_or(defaults.validate_theme),
        theme_validation_model: env::var("LF_THEME_VALIDATION_MODEL")
            .unwrap_or(defaults.theme_validation_model)
    })
}

fn load_observability_from_env() -> Result<ObservabilityConfig, Box<dyn std::error::Error>> {
    let defaults = ObservabilityConfig::default();
    Ok(ObservabilityConfig {
        metrics_enabled: parse_env("LF_METRICS_ENABLED").unwrap_or(defaults.metrics_enabled),
        metrics_port: parse_env("LF_METRICS_PORT").unwrap_or(defaults.metrics_port),
        logging_level: env::var("LF_LOG_LEVEL").unwrap_or(defaults.logging_level)
    })
}

fn parse_env<T>(key: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static
{
    match env::var(key) {
        Ok(s) => s
            .parse::<T>()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "LF_REDIS_URL",
        "LF_CACHE_TTL_SECONDS",
        "LF_RATE_LIMIT_ALGORITHM",
        "LF_RATE_LIMIT_USER_LIMIT",
        "LF_RATE_LIMIT_USER_WINDOW_SECONDS",
        "LF_RATE_LIMIT_GLOBAL_ENABLED",
        "LF_PROVIDER_API_KEY",
        "LF_PROVIDER_MAX_RETRIES",
        "LF_FALLBACK_MODEL",
        "LF_LOG_LEVEL",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_load_from_env_defaults() {
        clear_vars();

        let config = load_from_env().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_load_from_env_overrides() {
        clear_vars();
        unsafe {
            env::set_var("LF_REDIS_URL", "redis://cache:6380");
            env::set_var("LF_CACHE_TTL_SECONDS", "120");
            env::set_var("LF_RATE_LIMIT_ALGORITHM", "sliding_window");
            env::set_var("LF_RATE_LIMIT_USER_LIMIT", "3");
            env::set_var("LF_RATE_LIMIT_USER_WINDOW_SECONDS", "60");
            env::set_var("LF_RATE_LIMIT_GLOBAL_ENABLED", "false");
            env::set_var("LF_PROVIDER_API_KEY", "sk-test");
            env::set_var("LF_FALLBACK_MODEL", "gpt-3.5-turbo");
        }

        let config = load_from_env().unwrap();
        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.cache.ttl_seconds, 120);
        assert_eq!(config.rate_limit.algorithm, RateLimitAlgorithm::SlidingWindow);
        assert_eq!(config.rate_limit.per_user.limit, 3);
        assert!(!config.rate_limit.global.enabled);
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.generation.fallback_model, "gpt-3.5-turbo");

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_unparseable_number_falls_back_to_default() {
        clear_vars();
        unsafe {
            env::set_var("LF_PROVIDER_MAX_RETRIES", "many");
        }

        let config = load_from_env().unwrap();
        assert_eq!(config.provider.max_retries, 2);

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_unknown_algorithm_is_an_error() {
        clear_vars();
        unsafe {
            env::set_var("LF_RATE_LIMIT_ALGORITHM", "token_bucket");
        }

        assert!(load_from_env().is_err());

        clear_vars();
    }
}
