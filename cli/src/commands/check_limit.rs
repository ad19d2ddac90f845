use anyhow::{Result, bail};
use clap::Args;
use config::Config;
use gen_core::traits::CounterStore;
use gen_core::types::RateLimitInfo;
use generation::RateLimiter;
use std::sync::Arc;
use storage::InMemoryStore;

use crate::output;

#[derive(Args)]
pub struct CheckLimitArgs {
    /// Rate-limit key, e.g. `user:alice` or `model:gpt-4o`
    #[arg(value_name = "KEY")]
    pub key: String,

    /// Requests allowed per window (defaults to the per-user limit)
    #[arg(long)]
    pub limit: Option<u64>,

    /// Window length in seconds (defaults to the per-user window)
    #[arg(long)]
    pub window: Option<u64>,

    /// Use an in-memory store instead of Redis
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub json: bool
}

pub async fn run(args: CheckLimitArgs, config: &Config) -> Result<()> {
    let scope = &config.rate_limit.per_user;
    let limit = args.limit.unwrap_or(scope.limit);
    let window = args.window.unwrap_or(scope.window_seconds);

    let store: Arc<dyn CounterStore> = if args.dry_run {
        Arc::new(InMemoryStore::new())
    } else {
        let store = super::connect_redis(config).await?;
        Arc::new(store)
    };

    let limiter = RateLimiter::new(store, config.rate_limit.clone());
    let info = limiter.check(&args.key, limit, window).await?;
    report(&info, args.json)?;

    if !info.allowed {
        bail!("rate limit exceeded for {}", args.key);
    }
    Ok(())
}

fn report(info: &RateLimitInfo, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }

    let summary = format!(
        "{}: {}/{} remaining, resets at {} ({}s window left)",
        info.key, info.remaining, info.limit, info.reset_at, info.ttl_seconds
    );
    if info.allowed {
        output::success(&summary);
    } else {
        output::error(&summary);
    }
    Ok(())
}
