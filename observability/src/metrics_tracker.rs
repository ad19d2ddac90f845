//! # Metrics Tracker
//!
//! Process-wide generation aggregates keyed by (content type, theme type,
//! model), with derived analytics and threshold-based recommendations.
//! Every record is also forwarded to [`GenerationTelemetry`].

use crate::telemetry::{GenerationTelemetry, LATENCY_BUCKETS_MS};
use dashmap::DashMap;
use errors::GenerationError;
use gen_core::types::GenerationMetadata;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

const BUCKET_COUNT: usize = LATENCY_BUCKETS_MS.len() + 1;

pub const RECOMMEND_REDUCE_PROMPT: &str = "reduce prompt size";
pub const RECOMMEND_FASTER_MODEL: &str = "consider a faster model";
pub const RECOMMEND_INVESTIGATE_ERRORS: &str = "investigate provider errors";
pub const RECOMMEND_INCREASE_TTL: &str = "increase cache TTL";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MetricsKey {
    pub content_type: String,
    pub theme_type: String,
    pub model: String
}

impl MetricsKey {
    pub fn new(content_type: &str, theme_type: &str, model: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            theme_type: theme_type.to_string(),
            model: model.to_string()
        }
    }
}

/// In-flight request started by [`MetricsTracker::start`].
#[derive(Debug, Clone)]
pub struct RequestHandle {
    content_type: String,
    theme_type: String,
    model: Option<String>,
    started: Instant
}

impl RequestHandle {
    /// Model the request targets, used to key failures.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Default)]
struct Aggregate {
    requests: u64,
    errors: u64,
    errors_by_kind: HashMap<String, u64>,
    latency_buckets: [u64; BUCKET_COUNT],
    total_latency_ms: u64,
    provider_latency_ms: u64,
    prompt_tokens: u64,
    completion_tokens: u64
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheCounts {
    hits: u64,
    misses: u64
}

/// Derived view over one [`MetricsKey`].
#[derive(Debug, Clone, Serialize)]
pub struct GenerationAnalytics {
    pub key: MetricsKey,
    pub requests: u64,
    pub errors: u64,
    pub errors_by_kind: HashMap<String, u64>,
    /// (upper bound label, count) pairs, `+inf` last.
    pub latency_histogram: Vec<(String, u64)>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub efficiency_ratio: f64,
    pub tokens_per_second: f64,
    pub prompt_token_ratio: f64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub recommendations: Vec<String>
}

pub struct MetricsTracker {
    aggregates: DashMap<MetricsKey, Aggregate>,
    cache: DashMap<MetricsKey, CacheCounts>,
    telemetry: GenerationTelemetry
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(GenerationTelemetry::new())
    }
}

impl MetricsTracker {
    pub fn new(telemetry: GenerationTelemetry) -> Self {
        Self {
            aggregates: DashMap::new(),
            cache: DashMap::new(),
            telemetry
        }
    }

    pub fn telemetry(&self) -> &GenerationTelemetry {
        &self.telemetry
    }

    pub fn start(&self, content_type: &str, theme_type: &str) -> RequestHandle {
        self.telemetry
            .record_request_started(content_type, theme_type);
        RequestHandle {
            content_type: content_type.to_string(),
            theme_type: theme_type.to_string(),
            model: None,
            started: Instant::now()
        }
    }

    pub fn complete(&self, handle: RequestHandle, metadata: &GenerationMetadata) {
        let latency_ms = if metadata.cached {
            handle.elapsed_ms()
        } else {
            metadata.generation_time_ms
        };
        let key = MetricsKey {
            content_type: handle.content_type,
            theme_type: handle.theme_type,
            model: metadata.model_name.clone()
        };

        self.telemetry.record_request_success(
            &key.content_type,
            &key.theme_type,
            &key.model,
            latency_ms as f64,
            u64::from(metadata.prompt_tokens),
            u64::from(metadata.completion_tokens),
            metadata.cached
        );

        let mut aggregate = self.aggregates.entry(key).or_default();
        aggregate.requests += 1;
        aggregate.total_latency_ms += latency_ms;
        aggregate.latency_buckets[bucket_index(latency_ms)] += 1;
        if !metadata.cached {
            aggregate.provider_latency_ms += latency_ms;
            aggregate.prompt_tokens += u64::from(metadata.prompt_tokens);
            aggregate.completion_tokens += u64::from(metadata.completion_tokens);
        }
    }

    pub fn fail(&self, handle: RequestHandle, error: &GenerationError) {
        let latency_ms = handle.elapsed_ms();
        let kind = error.kind();
        let key = MetricsKey {
            content_type: handle.content_type,
            theme_type: handle.theme_type,
            model: handle.model.unwrap_or_else(|| "unknown".to_string())
        };

        self.telemetry
            .record_request_failure(&key.content_type, &key.theme_type, &key.model, kind);

        let mut aggregate = self.aggregates.entry(key).or_default();
        aggregate.requests += 1;
        aggregate.errors += 1;
        aggregate.total_latency_ms += latency_ms;
        aggregate.latency_buckets[bucket_index(latency_ms)] += 1;
        *aggregate.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self, content_type: &str, theme_type: &str, model: &str) {
        self.telemetry.record_cache_hit(content_type, theme_type, model);
        self.cache
            .entry(MetricsKey::new(content_type, theme_type, model))
            .or_default()
            .hits += 1;
        self.telemetry.record_cache_hit_rate(self.overall_cache_hit_rate());
    }

    pub fn record_cache_miss(&self, content_type: &str, theme_type: &str, model: &str) {
        self.telemetry.record_cache_miss(content_type, theme_type, model);
        self.cache
            .entry(MetricsKey::new(content_type, theme_type, model))
            .or_default()
            .misses += 1;
        self.telemetry.record_cache_hit_rate(self.overall_cache_hit_rate());
    }

    pub fn overall_cache_hit_rate(&self) -> f64 {
        let (hits, total) = self.cache.iter().fold((0u64, 0u64), |(h, t), entry| {
            (h + entry.hits, t + entry.hits + entry.misses)
        });
        ratio(hits, total)
    }

    pub fn analytics(&self, key: &MetricsKey) -> Option<GenerationAnalytics> {
        let aggregate = self.aggregates.get(key)?.clone();
        let cache = self.cache.get(key).map(|c| *c).unwrap_or_default();
        Some(build_analytics(key.clone(), &aggregate, cache))
    }

    /// Analytics for every key, sorted by key for stable output.
    pub fn all_analytics(&self) -> Vec<GenerationAnalytics> {
        let mut keys: Vec<MetricsKey> = self.aggregates.iter().map(|e| e.key().clone()).collect();
        keys.sort_by(|a, b| {
            (&a.content_type, &a.theme_type, &a.model).cmp(&(
                &b.content_type,
                &b.theme_type,
                &b.model
            ))
        });
        keys.iter().filter_map(|key| self.analytics(key)).collect()
    }

    pub fn reset(&self) {
        self.aggregates.clear();
        self.cache.clear();
    }
}

fn bucket_index(latency_ms: u64) -> usize {
    LATENCY_BUCKETS_MS
        .iter()
        .position(|bound| latency_ms <= *bound)
        .unwrap_or(LATENCY_BUCKETS_MS.len())
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn build_analytics(key: MetricsKey, aggregate: &Aggregate, cache: CacheCounts) -> GenerationAnalytics {
    let total_tokens = aggregate.prompt_tokens + aggregate.completion_tokens;
    let efficiency_ratio = ratio(aggregate.completion_tokens, total_tokens);
    let prompt_token_ratio = ratio(aggregate.prompt_tokens, total_tokens);
    let tokens_per_second = if aggregate.provider_latency_ms == 0 {
        0.0
    } else {
        aggregate.completion_tokens as f64 / (aggregate.provider_latency_ms as f64 / 1000.0)
    };
    let average_latency_ms = ratio(aggregate.total_latency_ms, aggregate.requests);
    let error_rate = ratio(aggregate.errors, aggregate.requests);
    let cache_hit_rate = ratio(cache.hits, cache.hits + cache.misses);

    let mut recommendations = Vec::new();
    if total_tokens > 0 && efficiency_ratio < 0.5 {
        recommendations.push(RECOMMEND_REDUCE_PROMPT.to_string());
    }
    if aggregate.provider_latency_ms > 0 && tokens_per_second < 10.0 {
        recommendations.push(RECOMMEND_FASTER_MODEL.to_string());
    }
    if error_rate > 0.1 {
        recommendations.push(RECOMMEND_INVESTIGATE_ERRORS.to_string());
    }
    if aggregate.requests >= 10 && cache_hit_rate < 0.2 {
        recommendations.push(RECOMMEND_INCREASE_TTL.to_string());
    }

    let mut latency_histogram: Vec<(String, u64)> = LATENCY_BUCKETS_MS
        .iter()
        .zip(aggregate.latency_buckets.iter())
        .map(|(bound, count)| (format!("{bound}ms"), *count))
        .collect();
    latency_histogram.push((
        "+inf".to_string(),
        aggregate.latency_buckets[LATENCY_BUCKETS_MS.len()]
    ));

    GenerationAnalytics {
        key,
        requests: aggregate.requests,
        errors: aggregate.errors,
        errors_by_kind: aggregate.errors_by_kind.clone(),
        latency_histogram,
        prompt_tokens: aggregate.prompt_tokens,
        completion_tokens: aggregate.completion_tokens,
        efficiency_ratio,
        tokens_per_second,
        prompt_token_ratio,
        average_latency_ms,
        error_rate,
        cache_hit_rate,
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::ProviderError;
    use metrics_util::debugging::DebuggingRecorder;

    fn metadata(model: &str, prompt: u32, completion: u32, ms: u64) -> GenerationMetadata {
        GenerationMetadata {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            generation_time_ms: ms,
            model_name: model.to_string(),
            cached: false
        }
    }

    fn key(model: &str) -> MetricsKey {
        MetricsKey {
            content_type: "backstory".to_string(),
            theme_type: "fantasy".to_string(),
            model: model.to_string()
        }
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(30000), 7);
        assert_eq!(bucket_index(30001), 8);
    }

    #[test]
    fn test_complete_accumulates_tokens_and_latency() {
        let tracker = MetricsTracker::default();
        let handle = tracker.start("backstory", "fantasy");
        tracker.complete(handle, &metadata("gpt-4o", 100, 300, 2000));
        let handle = tracker.start("backstory", "fantasy");
        tracker.complete(handle, &metadata("gpt-4o", 100, 300, 2000));

        let analytics = tracker.analytics(&key("gpt-4o")).unwrap();
        assert_eq!(analytics.requests, 2);
        assert_eq!(analytics.prompt_tokens, 200);
        assert_eq!(analytics.completion_tokens, 600);
        assert!((analytics.efficiency_ratio - 0.75).abs() < 1e-9);
        assert!((analytics.prompt_token_ratio - 0.25).abs() < 1e-9);
        assert!((analytics.tokens_per_second - 150.0).abs() < 1e-9);
        assert!((analytics.average_latency_ms - 2000.0).abs() < 1e-9);
        assert_eq!(analytics.latency_histogram[4], ("2500ms".to_string(), 2));
        assert!(analytics.recommendations.is_empty());
    }

    #[test]
    fn test_recommendations_fire_on_thresholds() {
        let tracker = MetricsTracker::default();
        for _ in 0..9 {
            let handle = tracker.start("backstory", "fantasy");
            tracker.complete(handle, &metadata("slow", 900, 100, 20000));
            tracker.record_cache_miss("backstory", "fantasy", "slow");
        }
        let handle = tracker.start("backstory", "fantasy").with_model("slow");
        tracker.fail(
            handle,
            &GenerationError::from_provider("slow", ProviderError::Timeout { timeout_ms: 10 })
        );
        let handle = tracker.start("backstory", "fantasy").with_model("slow");
        tracker.fail(
            handle,
            &GenerationError::from_provider("slow", ProviderError::Timeout { timeout_ms: 10 })
        );

        let analytics = tracker.analytics(&key("slow")).unwrap();
        assert_eq!(analytics.requests, 11);
        assert_eq!(analytics.errors_by_kind.get("provider_timeout"), Some(&2));
        for expected in [
            RECOMMEND_REDUCE_PROMPT,
            RECOMMEND_FASTER_MODEL,
            RECOMMEND_INVESTIGATE_ERRORS,
            RECOMMEND_INCREASE_TTL
        ] {
            assert!(
                analytics.recommendations.iter().any(|r| r == expected),
                "missing recommendation {expected}"
            );
        }
    }

    #[test]
    fn test_cache_ttl_recommendation_needs_ten_requests() {
        let tracker = MetricsTracker::default();
        for _ in 0..3 {
            let handle = tracker.start("backstory", "fantasy");
            tracker.complete(handle, &metadata("gpt-4o", 10, 90, 100));
            tracker.record_cache_miss("backstory", "fantasy", "gpt-4o");
        }
        let analytics = tracker.analytics(&key("gpt-4o")).unwrap();
        assert_eq!(analytics.cache_hit_rate, 0.0);
        assert!(!analytics.recommendations.iter().any(|r| r == RECOMMEND_INCREASE_TTL));
    }

    #[test]
    fn test_cached_completion_does_not_count_tokens() {
        let tracker = MetricsTracker::default();
        let handle = tracker.start("lore", "scifi");
        let mut meta = metadata("gpt-4o", 50, 50, 900);
        meta.cached = true;
        tracker.complete(handle, &meta);
        tracker.record_cache_hit("lore", "scifi", "gpt-4o");

        let analytics = tracker
            .analytics(&MetricsKey {
                content_type: "lore".to_string(),
                theme_type: "scifi".to_string(),
                model: "gpt-4o".to_string()
            })
            .unwrap();
        assert_eq!(analytics.prompt_tokens, 0);
        assert_eq!(analytics.cache_hit_rate, 1.0);
        assert_eq!(tracker.overall_cache_hit_rate(), 1.0);
    }

    #[test]
    fn test_cache_counts_are_kept_per_model() {
        let tracker = MetricsTracker::default();
        for model in ["gpt-4o", "gpt-4o-mini"] {
            let handle = tracker.start("lore", "scifi");
            tracker.complete(handle, &metadata(model, 10, 10, 100));
        }
        tracker.record_cache_hit("lore", "scifi", "gpt-4o");
        tracker.record_cache_miss("lore", "scifi", "gpt-4o-mini");
        tracker.record_cache_miss("lore", "scifi", "gpt-4o-mini");

        let big = tracker
            .analytics(&MetricsKey::new("lore", "scifi", "gpt-4o"))
            .unwrap();
        let mini = tracker
            .analytics(&MetricsKey::new("lore", "scifi", "gpt-4o-mini"))
            .unwrap();
        assert_eq!(big.cache_hit_rate, 1.0);
        assert_eq!(mini.cache_hit_rate, 0.0);
        assert!((tracker.overall_cache_hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fail_without_model_uses_unknown() {
        let tracker = MetricsTracker::default();
        let handle = tracker.start("lore", "scifi");
        tracker.fail(handle, &GenerationError::validation("model", "empty"));
        let all = tracker.all_analytics();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key.model, "unknown");
        assert_eq!(all[0].error_rate, 1.0);

        tracker.reset();
        assert!(tracker.all_analytics().is_empty());
    }

    #[test]
    fn test_records_forward_to_metrics_facade() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let tracker = MetricsTracker::default();
            let handle = tracker.start("backstory", "fantasy");
            tracker.complete(handle, &metadata("gpt-4o", 10, 20, 300));
            tracker.record_cache_miss("backstory", "fantasy", "gpt-4o");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let names: Vec<&str> = snapshot
            .iter()
            .map(|(key, _, _, _)| key.key().name())
            .collect();
        assert!(names.contains(&"loreforge_generation_started_total"));
        assert!(names.contains(&"loreforge_generation_requests_total"));
        assert!(names.contains(&"loreforge_cache_misses_total"));
        assert!(names.contains(&"loreforge_cache_hit_rate"));
    }
}
