use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Latency bucket upper bounds in milliseconds. Anything above the last
/// bound lands in the overflow (+inf) bucket.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [100, 250, 500, 1000, 2500, 5000, 10000, 30000];

pub const GENERATION_DURATION_METRIC: &str = "loreforge_generation_duration_seconds";

/// Thin wrapper over the `metrics` facade. Every method is a fire-and-forget
/// emission; with no recorder installed they are no-ops.
#[derive(Debug, Default, Clone)]
pub struct GenerationTelemetry;

impl GenerationTelemetry {
    pub fn new() -> Self {
        Self
    }

    pub fn record_request_started(&self, content_type: &str, theme_type: &str) {
        counter!("loreforge_generation_started_total",
            "content_type" => content_type.to_string(),
            "theme_type" => theme_type.to_string()
        )
        .increment(1);
    }

    pub fn record_request_success(
        &self,
        content_type: &str,
        theme_type: &str,
        model: &str,
        duration_ms: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
        cached: bool
    ) {
        let labels = [
            ("content_type", content_type.to_string()),
            ("theme_type", theme_type.to_string()),
            ("model", model.to_string())
        ];

        let counter_labels = [
            ("content_type", content_type.to_string()),
            ("theme_type", theme_type.to_string()),
            ("model", model.to_string()),
            ("status", "success".to_string()),
            ("cached", cached.to_string())
        ];
        counter!("loreforge_generation_requests_total", &counter_labels).increment(1);
        histogram!(GENERATION_DURATION_METRIC, &labels).record(duration_ms / 1000.0);

        if !cached {
            let prompt_labels = [
                ("content_type", content_type.to_string()),
                ("theme_type", theme_type.to_string()),
                ("model", model.to_string()),
                ("kind", "prompt".to_string())
            ];
            counter!("loreforge_generation_tokens_total", &prompt_labels).increment(prompt_tokens);

            let completion_labels = [
                ("content_type", content_type.to_string()),
                ("theme_type", theme_type.to_string()),
                ("model", model.to_string()),
                ("kind", "completion".to_string())
            ];
            counter!("loreforge_generation_tokens_total", &completion_labels)
                .increment(completion_tokens);
        }
    }

    pub fn record_request_failure(
        &self,
        content_type: &str,
        theme_type: &str,
        model: &str,
        error_kind: &str
    ) {
        let counter_labels = [
            ("content_type", content_type.to_string()),
            ("theme_type", theme_type.to_string()),
            ("model", model.to_string()),
            ("status", "failure".to_string()),
            ("cached", "false".to_string())
        ];
        counter!("loreforge_generation_requests_total", &counter_labels).increment(1);

        let error_labels = [
            ("content_type", content_type.to_string()),
            ("theme_type", theme_type.to_string()),
            ("model", model.to_string()),
            ("error_kind", error_kind.to_string())
        ];
        counter!("loreforge_generation_errors_total", &error_labels).increment(1);
    }

    pub fn record_cache_hit(&self, content_type: &str, theme_type: &str, model: &str) {
        counter!("loreforge_cache_hits_total",
            "content_type" => content_type.to_string(),
            "theme_type" => theme_type.to_string(),
            "model" => model.to_string()
        )
        .increment(1);
    }

    pub fn record_cache_miss(&self, content_type: &str, theme_type: &str, model: &str) {
        counter!("loreforge_cache_misses_total",
            "content_type" => content_type.to_string(),
            "theme_type" => theme_type.to_string(),
            "model" => model.to_string()
        )
        .increment(1);
    }

    pub fn record_cache_hit_rate(&self, hit_rate: f64) {
        gauge!("loreforge_cache_hit_rate").set(hit_rate);
    }

    pub fn record_rate_limit_denied(&self, scope: &str) {
        counter!("loreforge_rate_limit_denied_total",
            "scope" => scope.to_string()
        )
        .increment(1);
    }

    pub fn record_fallback(&self, primary_model: &str, fallback_model: &str, reason: &str) {
        counter!("loreforge_fallback_total",
            "primary_model" => primary_model.to_string(),
            "fallback_model" => fallback_model.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn record_provider_retry(&self, model: &str, error_kind: &str) {
        counter!("loreforge_provider_retries_total",
            "model" => model.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }

    pub fn record_theme_validation(&self, content_type: &str, valid: bool) {
        counter!("loreforge_theme_validation_total",
            "content_type" => content_type.to_string(),
            "valid" => valid.to_string()
        )
        .increment(1);
    }
}

/// Installs the Prometheus exporter on `0.0.0.0:port`.
pub fn init_telemetry(
    port: u16
) -> Result<GenerationTelemetry, Box<dyn std::error::Error + Send + Sync>> {
    init_telemetry_with_endpoint(std::net::SocketAddr::from(([0, 0, 0, 0], port)))
}

pub fn init_telemetry_with_endpoint(
    endpoint: std::net::SocketAddr
) -> Result<GenerationTelemetry, Box<dyn std::error::Error + Send + Sync>> {
    let buckets: Vec<f64> = LATENCY_BUCKETS_MS
        .iter()
        .map(|ms| *ms as f64 / 1000.0)
        .collect();

    PrometheusBuilder::new()
        .with_http_listener(endpoint)
        .set_buckets_for_metric(
            Matcher::Full(GENERATION_DURATION_METRIC.to_string()),
            &buckets
        )?
        .install()?;

    tracing::info!(%endpoint, "Prometheus exporter listening");
    Ok(GenerationTelemetry::new())
}
