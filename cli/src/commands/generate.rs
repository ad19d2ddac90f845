//! Generate command - runs one request through the full pipeline.
//!
//! `--dry-run` swaps the HTTP provider for the mock provider and Redis for
//! the in-memory store, so the command works without any backend.

use anyhow::Result;
use clap::Args;
use config::Config;
use futures_util::StreamExt;
use gen_core::types::{ContentType, GenerationConfig, GenerationMetadata, GenerationResult};
use generation::{GenerateRequest, GenerationPipeline, HttpChatProvider, MockProvider};
use observability::MetricsTracker;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use storage::InMemoryStore;

use crate::output;

#[derive(Args)]
pub struct GenerateArgs {
    /// Content type (backstory, character_description, quest_hook, lore, ...)
    #[arg(value_name = "CONTENT_TYPE")]
    pub content_type: String,

    /// Theme context as a JSON file
    #[arg(long, value_name = "PATH")]
    pub theme: Option<PathBuf>,

    /// Primary model (defaults to generation.default_model)
    #[arg(long)]
    pub model: Option<String>,

    /// Fallback model; pass an empty string to disable fallback
    #[arg(long)]
    pub fallback: Option<String>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Caller identity for the per-user rate-limit scope
    #[arg(long, env = "LF_CALLER_ID")]
    pub caller: Option<String>,

    /// Print content as it arrives
    #[arg(long)]
    pub stream: bool,

    /// Check the result against the theme with a second model call
    #[arg(long)]
    pub validate_theme: bool,

    /// Use the mock provider and an in-memory store
    #[arg(long)]
    pub dry_run: bool,

    /// Output the full result as JSON
    #[arg(long)]
    pub json: bool
}

impl GenerateArgs {
    fn generation_config(&self, config: &Config) -> GenerationConfig {
        let defaults = &config.generation;
        let mut generation = GenerationConfig::new(
            self.model
                .clone()
                .unwrap_or_else(|| defaults.default_model.clone())
        )
        .with_fallback(
            self.fallback
                .clone()
                .unwrap_or_else(|| defaults.fallback_model.clone())
        );
        if let Some(temperature) = self.temperature {
            generation = generation.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            generation = generation.with_max_tokens(max_tokens);
        }
        generation.stream = self.stream;
        generation
    }

    fn request(&self, config: &Config) -> Result<GenerateRequest> {
        // Unknown names become ContentType::Custom.
        let Ok(content_type) = self.content_type.parse::<ContentType>();

        let mut request = GenerateRequest::new(content_type, self.generation_config(config));
        if let Some(path) = &self.theme {
            request = request.with_theme(super::load_theme(path)?);
        }
        if let Some(caller) = &self.caller {
            request = request.with_caller(caller.clone());
        }
        if self.validate_theme {
            request = request.with_theme_validation(true);
        }
        Ok(request)
    }
}

pub async fn run(args: GenerateArgs, config: &Config) -> Result<()> {
    let request = args.request(config)?;
    let metrics = Arc::new(MetricsTracker::default());

    if config.observability.metrics_enabled && !args.dry_run {
        observability::init_telemetry(config.observability.metrics_port)
            .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter: {e}"))?;
    }

    let pipeline = if args.dry_run {
        output::info("dry run: mock provider, in-memory store");
        GenerationPipeline::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(MockProvider::new()),
            metrics
        )
    } else {
        let store = super::connect_redis(config).await?;
        let provider = HttpChatProvider::from_config(&config.provider)?;
        GenerationPipeline::new(config, Arc::new(store), Arc::new(provider), metrics)
    };

    if args.stream {
        stream(&pipeline, &request, args.json).await
    } else {
        let result = pipeline.generate(&request).await?;
        print_result(&result, args.json)
    }
}

async fn stream(pipeline: &GenerationPipeline, request: &GenerateRequest, json: bool) -> Result<()> {
    let mut chunks = pipeline.generate_stream(request).await?;
    let mut stdout = std::io::stdout();
    let mut content = String::new();
    let mut metadata = None;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if json {
            content.push_str(&chunk.content);
        } else {
            write!(stdout, "{}", chunk.content)?;
            stdout.flush()?;
        }
        if chunk.metadata.is_some() {
            metadata = chunk.metadata;
        }
    }

    if json {
        let value = serde_json::json!({ "content": content, "metadata": metadata });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!();
        if let Some(metadata) = &metadata {
            print_metadata(metadata);
        }
    }
    Ok(())
}

fn print_result(result: &GenerationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.content);
    print_metadata(&result.metadata);
    if let Some(compatibility) = &result.theme_compatibility {
        if compatibility.valid {
            output::success("theme check passed");
        } else {
            output::warn(&format!(
                "theme check failed: {}",
                compatibility.reason.as_deref().unwrap_or("no reason given")
            ));
        }
    }
    Ok(())
}

fn print_metadata(metadata: &GenerationMetadata) {
    output::info(&format!(
        "model={} tokens={}/{} time={}ms cached={}",
        metadata.model_name,
        metadata.prompt_tokens,
        metadata.completion_tokens,
        metadata.generation_time_ms,
        metadata.cached
    ));
}
