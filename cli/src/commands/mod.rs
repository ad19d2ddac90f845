pub mod check_limit;
pub mod generate;
pub mod validate;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use config::{Config, Validate};
use gen_core::types::ThemeContext;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::RedisStore;

#[derive(Parser)]
#[command(
    name = "loreforge",
    author,
    version,
    about = "Loreforge - theme-aware generation broker",
    long_about = "Validates, rate-limits, caches and brokers theme-aware text generation.\n\n\
                  Configuration comes from --config (TOML/YAML) or LF_* environment variables."
)]
pub struct Cli {
    /// Configuration file (TOML or YAML); LF_* variables are used when absent
    #[arg(long, global = true, env = "LF_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Generate content for a theme")]
    Generate(generate::GenerateArgs),

    #[command(about = "Validate a theme and generation config without generating")]
    Validate(validate::ValidateArgs),

    #[command(about = "Consume one request from a rate-limit window")]
    CheckLimit(check_limit::CheckLimitArgs)
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => config::load_from_env().map_err(|e| anyhow!("Invalid LF_* environment: {e}"))?
    };
    config.validate().context("Invalid configuration")?;
    tracing::debug!(
        source = %path.map_or("env".to_string(), |p| p.display().to_string()),
        default_model = %config.generation.default_model,
        "Configuration loaded"
    );
    Ok(config)
}

/// Connects to Redis with the configured prefix and timeout.
pub async fn connect_redis(config: &Config) -> Result<RedisStore> {
    let redis = &config.redis;
    RedisStore::connect(
        &redis.url,
        &redis.key_prefix,
        Duration::from_secs(redis.timeout_seconds)
    )
    .await
    .with_context(|| format!("Failed to connect to Redis at {}", redis.url))
}

pub fn load_theme(path: &Path) -> Result<ThemeContext> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read theme file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid theme JSON in {}", path.display()))
}
