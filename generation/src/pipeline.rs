//! Theme-aware generation pipeline.
//!
//! Per request: `Validating -> CacheLookup -> (CacheHit -> Done) |
//! (CacheMiss -> RateLimitCheck -> Providing -> ThemeValidating? -> Caching
//! -> Done)`. Any stage may end in `Failed` with a typed error.

use crate::cache::CacheStore;
use crate::parser::{Parsed, parse_structured};
use crate::prompt::{DefaultPromptBuilder, theme_validation_prompt};
use crate::provider::{ProviderClient, ProviderStream};
use crate::rate_limiter::RateLimiter;
use crate::validator::RequestValidator;
use config::Config;
use errors::{GenerationError, PipelineResult, ProviderError, StorageError};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use gen_core::traits::{CounterStore, KeyValueStore, PromptBuilder, TextGenerationProvider};
use gen_core::types::{
    Completion, ContentType, GenerationConfig, GenerationMetadata, GenerationResult, Prompt,
    ThemeCompatibility, ThemeContext, TokenUsage
};
use observability::{MetricsTracker, RequestHandle};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

const THEME_VALIDATION_TEMPERATURE: f32 = 0.1;
const THEME_VALIDATION_MAX_TOKENS: u32 = 100;
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    Validating,
    CacheLookup,
    CacheHit,
    CacheMiss,
    RateLimitCheck,
    Providing,
    ThemeValidating,
    Caching,
    Done,
    Failed
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub content_type: ContentType,
    pub theme: Option<ThemeContext>,
    pub config: GenerationConfig,
    /// Enables the per-user rate-limit scope.
    pub caller_id: Option<String>,
    /// Overrides the pipeline's theme-validation default.
    pub validate_theme: Option<bool>
}

impl GenerateRequest {
    pub fn new(content_type: ContentType, config: GenerationConfig) -> Self {
        Self {
            content_type,
            theme: None,
            config,
            caller_id: None,
            validate_theme: None
        }
    }

    pub fn with_theme(mut self, theme: ThemeContext) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_theme_validation(mut self, enabled: bool) -> Self {
        self.validate_theme = Some(enabled);
        self
    }

    fn theme_type(&self) -> &str {
        self.theme.as_ref().map_or("none", ThemeContext::theme_type)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub validate_theme: bool,
    /// Empty means the request's own model.
    pub theme_validation_model: String
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: Duration::from_secs(3600),
            validate_theme: false,
            theme_validation_model: String::new()
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_enabled: config.cache.enabled,
            cache_ttl: Duration::from_secs(config.cache.ttl_seconds),
            validate_theme: config.generation.validate_theme,
            theme_validation_model: config.generation.theme_validation_model.clone()
        }
    }
}

/// A streamed piece of output. Only the last chunk carries metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationChunk {
    pub content: String,
    pub metadata: Option<GenerationMetadata>
}

pub type GenerationStream = BoxStream<'static, PipelineResult<GenerationChunk>>;

/// A generation whose content was parsed into `T`.
#[derive(Debug, Clone)]
pub struct StructuredGeneration<T> {
    pub result: GenerationResult,
    pub parsed: Parsed<T>
}

/// Everything a request needs before the provider is called.
struct Prepared {
    prompt: Prompt,
    cache_key: String
}

enum StreamStart {
    Cached(GenerationResult),
    Live(Prepared, ProviderStream)
}

pub struct GenerationPipeline {
    validator: RequestValidator,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    client: Arc<ProviderClient>,
    prompt_builder: Arc<dyn PromptBuilder>,
    metrics: Arc<MetricsTracker>,
    options: PipelineOptions
}

impl GenerationPipeline {
    /// Wires every component from `config`, sharing one store for cached
    /// results and rate-limit counters.
    pub fn new<S>(
        config: &Config,
        store: Arc<S>,
        provider: Arc<dyn TextGenerationProvider>,
        metrics: Arc<MetricsTracker>
    ) -> Self
    where
        S: KeyValueStore + CounterStore + 'static
    {
        let kv: Arc<dyn KeyValueStore> = store.clone();
        let counters: Arc<dyn CounterStore> = store;
        Self::from_parts(
            RequestValidator::new(config.model_catalog()),
            CacheStore::from_config(kv, &config.cache),
            RateLimiter::new(counters, config.rate_limit.clone()),
            ProviderClient::from_config(provider, &config.provider),
            metrics,
            PipelineOptions::from_config(config)
        )
    }

    pub fn from_parts(
        validator: RequestValidator,
        cache: CacheStore,
        limiter: RateLimiter,
        client: ProviderClient,
        metrics: Arc<MetricsTracker>,
        options: PipelineOptions
    ) -> Self {
        let limiter = Arc::new(limiter);
        Self {
            validator,
            cache: Arc::new(cache),
            client: Arc::new(client.with_limiter(limiter.clone())),
            limiter,
            prompt_builder: Arc::new(DefaultPromptBuilder::new()),
            metrics,
            options
        }
    }

    pub fn with_prompt_builder(mut self, builder: Arc<dyn PromptBuilder>) -> Self {
        self.prompt_builder = builder;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    fn enter(stage: PipelineStage, content_type: &ContentType) {
        debug!(stage = stage.as_ref(), content_type = %content_type, "Pipeline stage");
    }

    /// Validates the request, renders its prompt and derives the cache key.
    fn prepare(&self, request: &GenerateRequest) -> PipelineResult<Prepared> {
        Self::enter(PipelineStage::Validating, &request.content_type);
        let warnings = self.validator.validate(
            &request.content_type,
            request.theme.as_ref(),
            Some(&request.config)
        )?;
        for warning in &warnings {
            warn!(
                content_type = %request.content_type,
                field = %warning.field,
                "Validation warning: {}",
                warning.message
            );
        }

        let prompt = self
            .prompt_builder
            .build(&request.content_type, request.theme.as_ref());
        let cache_key = cache_key(
            &request.content_type,
            request.theme.as_ref(),
            &prompt,
            &request.config.model
        )?;
        Ok(Prepared { prompt, cache_key })
    }

    async fn lookup(
        &self,
        request: &GenerateRequest,
        cache_key: &str
    ) -> PipelineResult<Option<GenerationResult>> {
        if !self.options.cache_enabled {
            return Ok(None);
        }

        Self::enter(PipelineStage::CacheLookup, &request.content_type);
        let content_type = request.content_type.as_str();
        match self.cache.get_json::<GenerationResult>(cache_key).await? {
            Some(mut cached) => {
                Self::enter(PipelineStage::CacheHit, &request.content_type);
                self.metrics
                    .record_cache_hit(content_type, request.theme_type(), &request.config.model);
                cached.metadata.cached = true;
                Ok(Some(cached))
            }
            None => {
                Self::enter(PipelineStage::CacheMiss, &request.content_type);
                self.metrics
                    .record_cache_miss(content_type, request.theme_type(), &request.config.model);
                Ok(None)
            }
        }
    }

    async fn acquire_permit(&self, request: &GenerateRequest) -> PipelineResult<()> {
        Self::enter(PipelineStage::RateLimitCheck, &request.content_type);
        let scopes = self.limiter.scopes_for(
            &request.config.model,
            request.caller_id.as_deref(),
            request.content_type.as_str()
        );
        self.limiter.check_scopes(&scopes).await?;
        Ok(())
    }

    /// Runs the provider call on its own task. A caller that abandons the
    /// request leaves the call running until it completes or times out.
    async fn call_provider(
        &self,
        prompt: &Prompt,
        config: &GenerationConfig
    ) -> PipelineResult<Completion> {
        let client = self.client.clone();
        let prompt = prompt.clone();
        let config = config.clone();
        let model = config.model.clone();
        tokio::spawn(async move { client.generate(&prompt, &config).await })
            .await
            .map_err(|e| {
                GenerationError::from_provider(
                    &model,
                    ProviderError::Transport {
                        reason: format!("provider task ended abnormally: {e}")
                    }
                )
            })?
    }

    /// Runs one request through every stage. With `config.stream` set the
    /// provider is streamed and the chunks are collected into one result.
    #[instrument(
        skip(self, request),
        fields(content_type = %request.content_type, model = %request.config.model)
    )]
    pub async fn generate(&self, request: &GenerateRequest) -> PipelineResult<GenerationResult> {
        if request.config.stream {
            return self.collect_stream(request).await;
        }

        let handle = self
            .metrics
            .start(request.content_type.as_str(), request.theme_type())
            .with_model(request.config.model.clone());

        match self.run(request).await {
            Ok(result) => {
                Self::enter(PipelineStage::Done, &request.content_type);
                info!(
                    content_type = %request.content_type,
                    model = %result.metadata.model_name,
                    cached = result.metadata.cached,
                    total_tokens = result.metadata.total_tokens,
                    "Generation completed"
                );
                self.metrics.complete(handle, &result.metadata);
                Ok(result)
            }
            Err(err) => {
                warn!(
                    stage = PipelineStage::Failed.as_ref(),
                    content_type = %request.content_type,
                    error_kind = err.kind(),
                    error = %err,
                    "Generation failed"
                );
                self.metrics.fail(handle, &err);
                Err(err)
            }
        }
    }

    async fn run(&self, request: &GenerateRequest) -> PipelineResult<GenerationResult> {
        let prepared = self.prepare(request)?;
        if let Some(cached) = self.lookup(request, &prepared.cache_key).await? {
            return Ok(cached);
        }

        self.acquire_permit(request).await?;

        Self::enter(PipelineStage::Providing, &request.content_type);
        let started = Instant::now();
        let completion = self
            .call_provider(&prepared.prompt, &request.config)
            .await?;
        let metadata = GenerationMetadata::from_usage(
            completion.usage,
            started.elapsed().as_millis() as u64,
            &completion.model
        );

        let theme_compatibility = match &request.theme {
            Some(theme) if request.validate_theme.unwrap_or(self.options.validate_theme) => {
                Self::enter(PipelineStage::ThemeValidating, &request.content_type);
                Some(
                    self.check_theme(&request.content_type, &completion.text, theme, &request.config)
                        .await
                )
            }
            _ => None
        };

        let result = GenerationResult {
            content: completion.text,
            metadata,
            theme_context: request.theme.clone(),
            content_type: request.content_type.clone(),
            theme_compatibility
        };

        if self.options.cache_enabled {
            Self::enter(PipelineStage::Caching, &request.content_type);
            self.cache
                .set_json(&prepared.cache_key, &result, self.options.cache_ttl)
                .await?;
        }
        Ok(result)
    }

    /// Asks the provider whether `content` fits `theme`. Never fails: a denied
    /// permit or a provider error marks the content not valid.
    async fn check_theme(
        &self,
        content_type: &ContentType,
        content: &str,
        theme: &ThemeContext,
        config: &GenerationConfig
    ) -> ThemeCompatibility {
        let model = if self.options.theme_validation_model.is_empty() {
            config.model.clone()
        } else {
            self.options.theme_validation_model.clone()
        };
        let check_config = GenerationConfig::new(model)
            .with_temperature(THEME_VALIDATION_TEMPERATURE)
            .with_max_tokens(THEME_VALIDATION_MAX_TOKENS);

        let reply = async {
            self.limiter.check_model(&check_config.model).await?;
            self.call_provider(&theme_validation_prompt(content, theme), &check_config)
                .await
        };
        let compatibility = match reply.await {
            Ok(reply) => {
                let answer = reply.text.trim();
                if answer.to_lowercase().starts_with("valid") {
                    ThemeCompatibility {
                        valid: true,
                        reason: None
                    }
                } else {
                    ThemeCompatibility::incompatible(answer)
                }
            }
            Err(err) => ThemeCompatibility::incompatible(format!("theme validation failed: {err}"))
        };

        if !compatibility.valid {
            warn!(
                content_type = %content_type,
                theme = %theme.name,
                reason = compatibility.reason.as_deref().unwrap_or_default(),
                "Generated content does not match theme"
            );
        }
        self.metrics
            .telemetry()
            .record_theme_validation(content_type.as_str(), compatibility.valid);
        compatibility
    }

    /// Streams the generation. Content chunks are forwarded as they arrive;
    /// the last chunk carries the metadata and the finished text is cached.
    /// Dropping the returned stream does not stop the provider stream, which
    /// is drained and cached anyway. Theme validation does not run on
    /// streamed output.
    #[instrument(
        skip(self, request),
        fields(content_type = %request.content_type, model = %request.config.model)
    )]
    pub async fn generate_stream(&self, request: &GenerateRequest) -> PipelineResult<GenerationStream> {
        let handle = self
            .metrics
            .start(request.content_type.as_str(), request.theme_type())
            .with_model(request.config.model.clone());

        let (prepared, provider_stream) = match self.open_stream(request).await {
            Ok(StreamStart::Live(prepared, provider_stream)) => (prepared, provider_stream),
            Ok(StreamStart::Cached(cached)) => {
                self.metrics.complete(handle, &cached.metadata);
                let chunk = GenerationChunk {
                    content: cached.content,
                    metadata: Some(cached.metadata)
                };
                return Ok(futures_util::stream::iter([Ok(chunk)]).boxed());
            }
            Err(err) => {
                warn!(error_kind = err.kind(), error = %err, "Streaming generation failed to start");
                self.metrics.fail(handle, &err);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let producer = StreamProducer {
            cache: self.options.cache_enabled.then(|| self.cache.clone()),
            cache_ttl: self.options.cache_ttl,
            cache_key: prepared.cache_key,
            metrics: self.metrics.clone(),
            handle: handle.with_model(provider_stream.model.clone()),
            model: provider_stream.model,
            idle_timeout: self.client.timeout(),
            request: request.clone()
        };
        tokio::spawn(producer.run(provider_stream.stream, tx));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn collect_stream(&self, request: &GenerateRequest) -> PipelineResult<GenerationResult> {
        let mut chunks = self.generate_stream(request).await?;
        let mut content = String::new();
        let mut metadata = None;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            content.push_str(&chunk.content);
            if chunk.metadata.is_some() {
                metadata = chunk.metadata;
            }
        }

        let metadata = metadata.ok_or_else(|| GenerationError::Parse {
            reason: "stream ended without metadata".to_string()
        })?;
        Ok(GenerationResult {
            content,
            metadata,
            theme_context: request.theme.clone(),
            content_type: request.content_type.clone(),
            theme_compatibility: None
        })
    }

    async fn open_stream(&self, request: &GenerateRequest) -> PipelineResult<StreamStart> {
        let prepared = self.prepare(request)?;
        if let Some(cached) = self.lookup(request, &prepared.cache_key).await? {
            return Ok(StreamStart::Cached(cached));
        }
        self.acquire_permit(request).await?;

        Self::enter(PipelineStage::Providing, &request.content_type);
        let stream = self
            .client
            .generate_stream(&prepared.prompt, &request.config)
            .await?;
        Ok(StreamStart::Live(prepared, stream))
    }

    /// Runs the pipeline and parses the content as `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        request: &GenerateRequest
    ) -> PipelineResult<StructuredGeneration<T>> {
        let result = self.generate(request).await?;
        let parsed = parse_structured::<T>(&result.content)?;
        Ok(StructuredGeneration { result, parsed })
    }
}

/// Cache key `gen:{content_type}:{theme_fp}:{prompt_fp}:{model}`.
pub fn cache_key(
    content_type: &ContentType,
    theme: Option<&ThemeContext>,
    prompt: &Prompt,
    model: &str
) -> PipelineResult<String> {
    let theme_fp = match theme {
        Some(theme) => utils::fingerprint_json(theme).map_err(StorageError::json)?,
        None => "none".to_string()
    };
    let prompt_fp = utils::fingerprint(&prompt.canonical_text());
    Ok(format!("gen:{content_type}:{theme_fp}:{prompt_fp}:{model}"))
}

/// Drains a provider stream into the caller's channel on a spawned task.
struct StreamProducer {
    cache: Option<Arc<CacheStore>>,
    cache_ttl: Duration,
    cache_key: String,
    metrics: Arc<MetricsTracker>,
    handle: RequestHandle,
    model: String,
    idle_timeout: Duration,
    request: GenerateRequest
}

impl StreamProducer {
    async fn run(
        self,
        mut stream: gen_core::traits::CompletionStream,
        tx: mpsc::Sender<PipelineResult<GenerationChunk>>
    ) {
        let started = Instant::now();
        let mut content = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut pending: Option<String> = None;
        let mut receiver_gone = false;

        loop {
            let next = match tokio::time::timeout(self.idle_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(errors::ProviderError::Timeout {
                    timeout_ms: self.idle_timeout.as_millis() as u64
                }))
            };

            match next {
                Some(Ok(delta)) => {
                    if delta.usage.is_some() {
                        usage = delta.usage;
                    }
                    if delta.content.is_empty() {
                        continue;
                    }
                    content.push_str(&delta.content);
                    if let Some(previous) = pending.replace(delta.content) {
                        if receiver_gone {
                            continue;
                        }
                        let chunk = GenerationChunk {
                            content: previous,
                            metadata: None
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            debug!("Stream receiver dropped, draining provider stream");
                            receiver_gone = true;
                        }
                    }
                }
                Some(Err(err)) => {
                    let err = GenerationError::from_provider(&self.model, err);
                    warn!(model = %self.model, error = %err, "Provider stream failed");
                    self.metrics.fail(self.handle, &err);
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                None => break
            }
        }

        let metadata = GenerationMetadata::from_usage(
            usage.unwrap_or_default(),
            started.elapsed().as_millis() as u64,
            &self.model
        );

        if let Some(cache) = &self.cache {
            let result = GenerationResult {
                content,
                metadata: metadata.clone(),
                theme_context: self.request.theme.clone(),
                content_type: self.request.content_type.clone(),
                theme_compatibility: None
            };
            if let Err(source) = cache
                .set_json(&self.cache_key, &result, self.cache_ttl)
                .await
            {
                let err = GenerationError::from(source);
                self.metrics.fail(self.handle, &err);
                let _ = tx.send(Err(err)).await;
                return;
            }
        }

        info!(
            content_type = %self.request.content_type,
            model = %self.model,
            total_tokens = metadata.total_tokens,
            "Streaming generation completed"
        );
        self.metrics.complete(self.handle, &metadata);
        let last = GenerationChunk {
            content: pending.unwrap_or_default(),
            metadata: Some(metadata)
        };
        let _ = tx.send(Ok(last)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockOutcome, MockProvider, RetryConfig};
    use crate::test_support::FailingStore;
    use config::{ModelSpec, RateLimitConfig, ScopeLimit};
    use errors::ProviderError;
    use gen_core::types::ThemeElements;
    use serde::Deserialize;
    use storage::InMemoryStore;

    fn theme() -> ThemeContext {
        ThemeContext {
            id: "th-1".to_string(),
            name: "Sunken Empire".to_string(),
            genre: "fantasy".to_string(),
            sub_genres: vec!["nautical".to_string()],
            tone: "melancholic".to_string(),
            elements: ThemeElements {
                key_words: vec!["tide".to_string()],
                excluded_words: vec!["laser".to_string()],
                style_guide: Some("Lyrical".to_string()),
                character_traits: vec!["proud".to_string(), "drowned".to_string()],
                world_elements: vec!["coral".to_string(), "bells".to_string()]
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.models.catalog = vec![
            ModelSpec::new("A", 8000),
            ModelSpec::new("B", 8000),
            ModelSpec::new("judge", 8000),
        ];
        config
    }

    fn pipeline_with(
        config: &Config,
        store: Arc<InMemoryStore>,
        mock: &Arc<MockProvider>
    ) -> GenerationPipeline {
        let client = ProviderClient::new(mock.clone(), Duration::from_secs(2)).with_retry(RetryConfig {
            initial_backoff: Duration::from_millis(1),
            ..RetryConfig::default()
        });
        GenerationPipeline::from_parts(
            RequestValidator::new(config.model_catalog()),
            CacheStore::from_config(store.clone(), &config.cache),
            RateLimiter::new(store, config.rate_limit.clone()),
            client,
            Arc::new(MetricsTracker::default()),
            PipelineOptions::from_config(config)
        )
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new(
            ContentType::Backstory,
            GenerationConfig::new("A").with_fallback("B")
        )
        .with_theme(theme())
    }

    #[tokio::test]
    async fn test_primary_rate_limited_returns_fallback_result() {
        let mock = Arc::new(MockProvider::new());
        mock.respond(
            "A",
            MockOutcome::Fail(ProviderError::RateLimited { retry_after: None })
        )
        .await;
        mock.respond("B", MockOutcome::reply("Beneath the tide")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let result = pipeline.generate(&request()).await.unwrap();

        assert_eq!(result.metadata.model_name, "B");
        assert_eq!(result.content, "Beneath the tide");
        assert!(!result.metadata.cached);
        assert_eq!(result.theme_context.as_ref().map(|t| t.id.as_str()), Some("th-1"));
        assert_eq!(mock.calls_for("A").await, 1);
        assert_eq!(mock.calls_for("B").await, 1);
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("A drowned king")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let first = pipeline.generate(&request()).await.unwrap();
        let second = pipeline.generate(&request()).await.unwrap();

        assert!(!first.metadata.cached);
        assert!(second.metadata.cached);
        assert_eq!(second.content, first.content);
        assert_eq!(mock.call_count().await, 1);
        assert!((pipeline.metrics().overall_cache_hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_validation_error_precedes_any_provider_call() {
        let mut config = test_config();
        config.models.catalog = vec![ModelSpec::new("A", 8000)];
        let mock = Arc::new(MockProvider::new());
        let pipeline = pipeline_with(&config, Arc::new(InMemoryStore::new()), &mock);

        let req = GenerateRequest::new(
            ContentType::Lore,
            GenerationConfig::new("A").with_max_tokens(9000)
        );
        let err = pipeline.generate(&req).await.unwrap_err();

        assert!(matches!(err, GenerationError::Validation { .. }));
        assert_eq!(mock.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_names_scope() {
        let mut config = test_config();
        config.rate_limit = RateLimitConfig {
            per_user: ScopeLimit::new(1, 60),
            ..RateLimitConfig::default()
        };
        config.cache.enabled = false;
        let mock = Arc::new(MockProvider::new());
        let pipeline = pipeline_with(&config, Arc::new(InMemoryStore::new()), &mock);
        let req = request().with_caller("player-7");

        pipeline.generate(&req).await.unwrap();
        let err = pipeline.generate(&req).await.unwrap_err();

        match err {
            GenerationError::RateLimitExceeded { scope, remaining, .. } => {
                assert_eq!(scope, "user:player-7");
                assert_eq!(remaining, 0);
            }
            other => panic!("expected rate limit error, got {other:?}")
        }
        assert_eq!(mock.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let config = test_config();
        let mock = Arc::new(MockProvider::new());
        let pipeline = GenerationPipeline::new(&config, Arc::new(FailingStore), mock.clone(), Arc::new(MetricsTracker::default()));

        let err = pipeline.generate(&request()).await.unwrap_err();

        assert_eq!(err.kind(), "cache_store");
        assert_eq!(mock.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_theme_validation_sets_compatibility() {
        let mut config = test_config();
        config.generation.theme_validation_model = "judge".to_string();
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("A laser-eyed knight")).await;
        mock.respond("judge", MockOutcome::reply("Invalid: uses excluded word 'laser'"))
            .await;
        let pipeline = pipeline_with(&config, Arc::new(InMemoryStore::new()), &mock);

        let result = pipeline
            .generate(&request().with_theme_validation(true))
            .await
            .unwrap();

        let compatibility = result.theme_compatibility.unwrap();
        assert!(!compatibility.valid);
        assert!(compatibility.reason.unwrap().contains("laser"));

        let judge_calls: Vec<_> = mock
            .calls()
            .await
            .into_iter()
            .filter(|c| c.model == "judge")
            .collect();
        assert_eq!(judge_calls.len(), 1);
        assert!((judge_calls[0].temperature - 0.1).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_theme_validation_accepts_valid_reply() {
        let mock = Arc::new(MockProvider::new());
        mock.enqueue("A", MockOutcome::reply("The bells toll under the tide."))
            .await;
        mock.enqueue("A", MockOutcome::reply("  VALID - fits the theme")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let result = pipeline
            .generate(&request().with_theme_validation(true))
            .await
            .unwrap();

        assert_eq!(
            result.theme_compatibility,
            Some(ThemeCompatibility {
                valid: true,
                reason: None
            })
        );
    }

    #[tokio::test]
    async fn test_theme_validation_error_never_fails_generation() {
        let mock = Arc::new(MockProvider::new());
        mock.enqueue("A", MockOutcome::reply("Coral thrones.")).await;
        mock.enqueue(
            "A",
            MockOutcome::Fail(ProviderError::QuotaExceeded {
                reason: "out of credit".to_string()
            })
        )
        .await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let result = pipeline
            .generate(&request().with_theme_validation(true))
            .await
            .unwrap();

        assert_eq!(result.content, "Coral thrones.");
        assert!(!result.theme_compatibility.unwrap().valid);
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_metadata_and_caches() {
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("Bells ring below")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let chunks: Vec<GenerationChunk> = pipeline
            .generate_stream(&request())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert!(chunks[..2].iter().all(|c| c.metadata.is_none()));
        let metadata = chunks[2].metadata.clone().unwrap();
        assert_eq!(metadata.model_name, "A");
        assert_eq!(metadata.completion_tokens, 3);
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Bells ring below");

        let cached = pipeline.generate(&request()).await.unwrap();
        assert!(cached.metadata.cached);
        assert_eq!(cached.content, "Bells ring below");
        assert_eq!(mock.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_stream_flag_routes_generate_through_stream() {
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("Bells ring below")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);
        let mut req = request();
        req.config.stream = true;

        let result = pipeline.generate(&req).await.unwrap();

        assert_eq!(result.content, "Bells ring below");
        assert_eq!(result.metadata.model_name, "A");
        assert!(!result.metadata.cached);
        let calls = mock.calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].streamed);

        let cached = pipeline.generate(&req).await.unwrap();
        assert!(cached.metadata.cached);
        assert_eq!(mock.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_stream_cache_hit_is_single_chunk() {
        let mock = Arc::new(MockProvider::new());
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);
        pipeline.generate(&request()).await.unwrap();

        let chunks: Vec<_> = pipeline
            .generate_stream(&request())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert!(chunk.metadata.as_ref().unwrap().cached);
    }

    #[tokio::test]
    async fn test_theme_check_is_charged_to_model_scope() {
        let mut config = test_config();
        config.rate_limit.per_model = ScopeLimit::new(1, 60);
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("VALID")).await;
        let pipeline = pipeline_with(&config, Arc::new(InMemoryStore::new()), &mock);

        let result = pipeline
            .generate(&request().with_theme_validation(true))
            .await
            .unwrap();

        let compatibility = result.theme_compatibility.unwrap();
        assert!(!compatibility.valid);
        assert!(compatibility.reason.unwrap().contains("model:A"));
        assert_eq!(mock.calls_for("A").await, 1);
    }

    #[tokio::test]
    async fn test_shared_fallback_model_respects_its_limit() {
        let mut config = test_config();
        config.rate_limit.per_model = ScopeLimit::new(1, 60);
        let mock = Arc::new(MockProvider::new());
        for model in ["A", "judge"] {
            mock.respond(
                model,
                MockOutcome::Fail(ProviderError::RateLimited { retry_after: None })
            )
            .await;
        }
        mock.respond("B", MockOutcome::reply("Beneath the tide")).await;
        let pipeline = pipeline_with(&config, Arc::new(InMemoryStore::new()), &mock);

        let first = pipeline.generate(&request()).await.unwrap();
        assert_eq!(first.metadata.model_name, "B");

        let second = GenerateRequest::new(
            ContentType::Backstory,
            GenerationConfig::new("judge").with_fallback("B")
        );
        let err = pipeline.generate(&second).await.unwrap_err();
        match err {
            GenerationError::RateLimitExceeded { scope, .. } => assert_eq!(scope, "model:B"),
            other => panic!("expected rate limit error, got {other:?}")
        }
        assert_eq!(mock.calls_for("B").await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_lets_provider_call_finish() {
        let mock = Arc::new(MockProvider::new().with_delay(Duration::from_millis(100)));
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pipeline.generate(&request())).await;
        assert!(abandoned.is_err());
        assert_eq!(mock.completed_count(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(mock.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_still_cached() {
        let mock = Arc::new(MockProvider::new());
        mock.respond("A", MockOutcome::reply("Bells ring below")).await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let stream = pipeline.generate_stream(&request()).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cached = pipeline.generate(&request()).await.unwrap();
        assert!(cached.metadata.cached);
        assert_eq!(cached.content, "Bells ring below");
        assert_eq!(mock.call_count().await, 1);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Hook {
        title: String,
        reward: u32
    }

    #[tokio::test]
    async fn test_generate_structured_parses_repaired_json() {
        let mock = Arc::new(MockProvider::new());
        mock.respond(
            "A",
            MockOutcome::reply("Here you go:\n```json\n{\"title\": \"The Bell\", \"reward\": 50,}\n```")
        )
        .await;
        let pipeline = pipeline_with(&test_config(), Arc::new(InMemoryStore::new()), &mock);

        let structured = pipeline
            .generate_structured::<Hook>(&request())
            .await
            .unwrap();

        assert_eq!(
            structured.parsed.value,
            Hook {
                title: "The Bell".to_string(),
                reward: 50
            }
        );
        assert_eq!(structured.parsed.quality, crate::parser::ParseQuality::Repaired);
    }

    #[test]
    fn test_cache_key_shape() {
        let prompt = Prompt::from("p");
        let key = cache_key(&ContentType::Lore, Some(&theme()), &prompt, "A").unwrap();
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[0], "gen");
        assert_eq!(parts[1], "lore");
        assert_eq!(parts[2].len(), utils::FINGERPRINT_LEN);
        assert_eq!(parts[3], utils::fingerprint("p"));
        assert_eq!(parts[4], "A");

        let untethered = cache_key(&ContentType::Lore, None, &prompt, "A").unwrap();
        assert!(untethered.starts_with("gen:lore:none:"));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(PipelineStage::RateLimitCheck.as_ref(), "rate_limit_check");
        assert_eq!(PipelineStage::ThemeValidating.to_string(), "theme_validating");
    }
}
