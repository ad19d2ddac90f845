use crate::rate_limiter::RateLimiter;
use config::ProviderConfig;
use errors::{GenerationError, ProviderError};
use gen_core::traits::{CompletionStream, TextGenerationProvider};
use gen_core::types::{Completion, GenerationConfig, Prompt, ProviderRequest};
use observability::GenerationTelemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry budget for transient failures against a single model.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0
        }
    }
}

impl RetryConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_millis((current.as_millis() as f32 * self.backoff_multiplier) as u64)
            .min(self.max_backoff)
    }
}

/// Decides whether a primary-model failure is handed to the fallback model.
#[derive(Debug, Clone, Copy)]
pub struct FallbackPolicy {
    enabled: bool
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl FallbackPolicy {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Quota exhaustion is surfaced directly; every other failure, API errors
    /// of any status included, gets one fallback attempt.
    pub fn should_fallback(&self, error: &ProviderError) -> bool {
        if !self.enabled {
            return false;
        }
        match error {
            ProviderError::QuotaExceeded { .. } => false,
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::Api { .. }
            | ProviderError::InvalidResponse { .. }
            | ProviderError::Transport { .. } => true
        }
    }
}

/// An open completion stream and the model that is producing it.
pub struct ProviderStream {
    pub model: String,
    pub stream: CompletionStream
}

/// Wraps a [`TextGenerationProvider`] with a per-call timeout, retries for
/// transient errors and a single fallback attempt.
pub struct ProviderClient {
    provider: Arc<dyn TextGenerationProvider>,
    timeout: Duration,
    retry: RetryConfig,
    policy: FallbackPolicy,
    limiter: Option<Arc<RateLimiter>>,
    telemetry: GenerationTelemetry
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn TextGenerationProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            retry: RetryConfig::default(),
            policy: FallbackPolicy::default(),
            limiter: None,
            telemetry: GenerationTelemetry::new()
        }
    }

    pub fn from_config(provider: Arc<dyn TextGenerationProvider>, config: &ProviderConfig) -> Self {
        Self::new(provider, Duration::from_millis(config.timeout_ms))
            .with_retry(RetryConfig::from_provider_config(config))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fallback calls are charged against the fallback model's scope.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn timeout_error(&self) -> ProviderError {
        ProviderError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64
        }
    }

    async fn call_once(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<Completion, ProviderError> {
        let mut completion =
            match tokio::time::timeout(self.timeout, self.provider.complete(prompt, request)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(self.timeout_error())
            };
        if completion.model.is_empty() {
            completion.model.clone_from(&request.model);
        }
        Ok(completion)
    }

    async fn charge_fallback(&self, model: &str) -> Result<(), GenerationError> {
        match &self.limiter {
            Some(limiter) => limiter.check_model(model).await,
            None => Ok(())
        }
    }

    async fn call_with_retry(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<Completion, ProviderError> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;

        loop {
            match self.call_once(prompt, request).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    debug!(
                        model = %request.model,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying transient provider error"
                    );
                    self.telemetry
                        .record_provider_retry(&request.model, err.kind());
                    tokio::time::sleep(backoff).await;
                    backoff = self.retry.next_backoff(backoff);
                }
                Err(err) => return Err(err)
            }
        }
    }

    /// Runs `prompt` against `config.model`, falling back to
    /// `config.fallback_model` exactly once when the policy allows it.
    pub async fn generate(
        &self,
        prompt: &Prompt,
        config: &GenerationConfig
    ) -> Result<Completion, GenerationError> {
        let primary = ProviderRequest::for_model(config, &config.model);
        let primary_err = match self.call_with_retry(prompt, &primary).await {
            Ok(completion) => return Ok(completion),
            Err(err) => err
        };

        if !config.has_fallback() || !self.policy.should_fallback(&primary_err) {
            return Err(GenerationError::from_provider(&config.model, primary_err));
        }

        warn!(
            primary_model = %config.model,
            fallback_model = %config.fallback_model,
            error = %primary_err,
            "Primary model failed, falling back"
        );
        self.telemetry
            .record_fallback(&config.model, &config.fallback_model, primary_err.kind());
        self.charge_fallback(&config.fallback_model).await?;

        let fallback = ProviderRequest::for_model(config, &config.fallback_model);
        match self.call_once(prompt, &fallback).await {
            Ok(completion) => Ok(completion),
            Err(fallback_err) => {
                error!(
                    primary_model = %config.model,
                    fallback_model = %config.fallback_model,
                    primary_error = %primary_err,
                    fallback_error = %fallback_err,
                    "Fallback model failed"
                );
                Err(GenerationError::GenerationFailed {
                    primary_model: config.model.clone(),
                    primary: primary_err,
                    fallback_model: config.fallback_model.clone(),
                    fallback: fallback_err
                })
            }
        }
    }

    async fn open_stream(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<CompletionStream, ProviderError> {
        match tokio::time::timeout(self.timeout, self.provider.complete_stream(prompt, request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error())
        }
    }

    /// Opens a completion stream. Fallback applies only to failures before the
    /// first chunk; errors mid-stream are yielded by the stream itself.
    pub async fn generate_stream(
        &self,
        prompt: &Prompt,
        config: &GenerationConfig
    ) -> Result<ProviderStream, GenerationError> {
        let primary = ProviderRequest::for_model(config, &config.model);
        let primary_err = match self.open_stream(prompt, &primary).await {
            Ok(stream) => {
                return Ok(ProviderStream {
                    model: config.model.clone(),
                    stream
                });
            }
            Err(err) => err
        };

        if !config.has_fallback() || !self.policy.should_fallback(&primary_err) {
            return Err(GenerationError::from_provider(&config.model, primary_err));
        }

        warn!(
            primary_model = %config.model,
            fallback_model = %config.fallback_model,
            error = %primary_err,
            "Primary model failed to stream, falling back"
        );
        self.telemetry
            .record_fallback(&config.model, &config.fallback_model, primary_err.kind());
        self.charge_fallback(&config.fallback_model).await?;

        let fallback = ProviderRequest::for_model(config, &config.fallback_model);
        match self.open_stream(prompt, &fallback).await {
            Ok(stream) => Ok(ProviderStream {
                model: config.fallback_model.clone(),
                stream
            }),
            Err(fallback_err) => {
                error!(
                    primary_model = %config.model,
                    fallback_model = %config.fallback_model,
                    fallback_error = %fallback_err,
                    "Fallback model failed to stream"
                );
                Err(GenerationError::GenerationFailed {
                    primary_model: config.model.clone(),
                    primary: primary_err,
                    fallback_model: config.fallback_model.clone(),
                    fallback: fallback_err
                })
            }
        }
    }
}
