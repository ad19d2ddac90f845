//! Shared request rate limiting across independent scopes.
//!
//! Counting is delegated to a [`CounterStore`] so every broker process sees
//! the same counters. A store failure denies the request (fail-closed).

use config::{RateLimitAlgorithm, RateLimitConfig, ScopeLimit};
use errors::{GenerationError, StorageError};
use gen_core::traits::CounterStore;
use gen_core::types::{RateLimitInfo, now_millis};
use observability::GenerationTelemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Millisecond wall clock. Injectable so tests can pin window boundaries.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// An independent rate-limit dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Global,
    Model(String),
    User(String),
    Operation(String)
}

impl RateLimitScope {
    pub fn name(&self) -> &'static str {
        match self {
            RateLimitScope::Global => "global",
            RateLimitScope::Model(_) => "model",
            RateLimitScope::User(_) => "user",
            RateLimitScope::Operation(_) => "operation"
        }
    }

    /// Counter key for this scope, without the `rate:` namespace.
    pub fn key(&self) -> String {
        match self {
            RateLimitScope::Global => "global".to_string(),
            RateLimitScope::Model(model) => format!("model:{model}"),
            RateLimitScope::User(user) => format!("user:{user}"),
            RateLimitScope::Operation(operation) => format!("operation:{operation}")
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RateLimitScope::Global => 0,
            RateLimitScope::Model(_) => 1,
            RateLimitScope::User(_) => 2,
            RateLimitScope::Operation(_) => 3
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    clock: Clock,
    telemetry: GenerationTelemetry
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(now_millis),
            telemetry: GenerationTelemetry::new()
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.config.algorithm
    }

    /// Counts one request against `key` and reports the window state.
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64
    ) -> Result<RateLimitInfo, StorageError> {
        if window_seconds == 0 {
            return Err(StorageError::InvalidArgument {
                reason: format!("rate limit window for {key} must be positive")
            });
        }

        match self.config.algorithm {
            RateLimitAlgorithm::FixedWindow => self.check_fixed(key, limit, window_seconds).await,
            RateLimitAlgorithm::SlidingWindow => {
                self.check_sliding(key, limit, window_seconds).await
            }
        }
    }

    async fn check_fixed(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64
    ) -> Result<RateLimitInfo, StorageError> {
        let now_secs = (self.clock)().div_euclid(1000);
        let window = window_seconds as i64;
        let window_start = now_secs.div_euclid(window) * window;
        let counter_key = format!("rate:{key}:{window_start}");

        let count = self
            .store
            .increment_and_expire_on_first_write(&counter_key, Duration::from_secs(window_seconds))
            .await?;

        let reset_at = window_start + window;
        let info = RateLimitInfo::from_count(
            key,
            limit,
            count,
            reset_at,
            (reset_at - now_secs).max(0) as u64
        );
        debug!(key, count, limit, allowed = info.allowed, "Fixed window check");
        Ok(info)
    }

    async fn check_sliding(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64
    ) -> Result<RateLimitInfo, StorageError> {
        let now_ms = (self.clock)();
        let window_ms = window_seconds as i64 * 1000;
        let member = format!("{now_ms}-{}", utils::generate_uuid());

        let outcome = self
            .store
            .sliding_window_acquire(
                &format!("rate:sliding:{key}"),
                limit,
                Duration::from_secs(window_seconds),
                now_ms,
                &member
            )
            .await?;

        let reset_at_ms = outcome.oldest_ms.unwrap_or(now_ms) + window_ms;
        let reset_at = (reset_at_ms + 999).div_euclid(1000);
        let now_secs = now_ms.div_euclid(1000);
        let remaining = if outcome.allowed {
            limit.saturating_sub(outcome.count)
        } else {
            0
        };

        debug!(key, count = outcome.count, limit, allowed = outcome.allowed, "Sliding window check");
        Ok(RateLimitInfo {
            key: key.to_string(),
            limit,
            remaining,
            reset_at,
            ttl_seconds: (reset_at - now_secs).max(0) as u64,
            allowed: outcome.allowed
        })
    }

    /// Scopes that apply to a request, in checking order.
    pub fn scopes_for(
        &self,
        model: &str,
        caller_id: Option<&str>,
        operation: &str
    ) -> Vec<RateLimitScope> {
        let mut scopes = vec![
            RateLimitScope::Global,
            RateLimitScope::Model(model.to_string()),
        ];
        if let Some(caller) = caller_id {
            scopes.push(RateLimitScope::User(caller.to_string()));
        }
        scopes.push(RateLimitScope::Operation(operation.to_string()));
        scopes
    }

    fn limit_for(&self, scope: &RateLimitScope) -> &ScopeLimit {
        match scope {
            RateLimitScope::Global => &self.config.global,
            RateLimitScope::Model(_) => &self.config.per_model,
            RateLimitScope::User(_) => &self.config.per_user,
            RateLimitScope::Operation(_) => &self.config.per_operation
        }
    }

    /// Checks every enabled scope in order (global, model, user, operation).
    ///
    /// Stops at the first denial and reports that scope. Scopes checked
    /// before the denial keep their increment.
    pub async fn check_scopes(
        &self,
        scopes: &[RateLimitScope]
    ) -> Result<Vec<RateLimitInfo>, GenerationError> {
        let mut ordered: Vec<&RateLimitScope> = scopes.iter().collect();
        ordered.sort_by_key(|scope| scope.rank());

        let mut infos = Vec::with_capacity(ordered.len());
        for scope in ordered {
            let limit = self.limit_for(scope);
            if !limit.enabled {
                continue;
            }

            let info = self
                .check(&scope.key(), limit.limit, limit.window_seconds)
                .await?;

            if !info.allowed {
                let retry_after_secs = info.retry_after_secs((self.clock)().div_euclid(1000));
                warn!(
                    scope = %scope,
                    limit = info.limit,
                    reset_at = info.reset_at,
                    "Rate limit exceeded"
                );
                self.telemetry.record_rate_limit_denied(scope.name());
                return Err(GenerationError::RateLimitExceeded {
                    scope: scope.to_string(),
                    limit: info.limit,
                    remaining: info.remaining,
                    reset_at: info.reset_at,
                    retry_after_secs
                });
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// Charges only the per-model scope. Used for provider calls made on a
    /// model other than the one the request's permit was taken for.
    pub async fn check_model(&self, model: &str) -> Result<(), GenerationError> {
        self.check_scopes(&[RateLimitScope::Model(model.to_string())])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FailingStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use storage::InMemoryStore;

    fn fixed_clock(ms: i64) -> Clock {
        Arc::new(move || ms)
    }

    fn limiter(algorithm: RateLimitAlgorithm) -> RateLimiter {
        let config = RateLimitConfig {
            algorithm,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(Arc::new(InMemoryStore::new()), config)
            .with_clock(fixed_clock(1_700_000_010_000))
    }

    #[tokio::test]
    async fn test_three_allowed_then_denied() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.check("userX", 3, 60).await.unwrap());
        }

        let allowed: Vec<bool> = results.iter().map(|r| r.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(results[0].remaining, 2);
        assert_eq!(results[3].remaining, 0);
        assert_eq!(results[3].limit, 3);
    }

    #[tokio::test]
    async fn test_fixed_window_reset_at_is_window_end() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let info = limiter.check("k", 10, 60).await.unwrap();
        // 1_700_000_010 s falls in the window starting at 1_699_999_980.
        assert_eq!(info.reset_at, 1_700_000_040);
        assert_eq!(info.ttl_seconds, 30);
    }

    #[tokio::test]
    async fn test_new_window_starts_fresh() {
        let now = Arc::new(AtomicI64::new(1_700_000_000_000));
        let clock_now = now.clone();
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), RateLimitConfig::default())
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));

        assert!(limiter.check("k", 1, 60).await.unwrap().allowed);
        assert!(!limiter.check("k", 1, 60).await.unwrap().allowed);

        now.fetch_add(60_000, Ordering::SeqCst);
        assert!(limiter.check("k", 1, 60).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_denials_do_not_consume() {
        let now = Arc::new(AtomicI64::new(1_000_000));
        let clock_now = now.clone();
        let config = RateLimitConfig {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config)
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));

        assert!(limiter.check("k", 2, 10).await.unwrap().allowed);
        now.fetch_add(4_000, Ordering::SeqCst);
        let second = limiter.check("k", 2, 10).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        now.fetch_add(1_000, Ordering::SeqCst);
        let denied = limiter.check("k", 2, 10).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // Oldest entry at 1_000 s expires at 1_010 s.
        assert_eq!(denied.reset_at, 1_010);

        // First entry has left the window; the denial above was not recorded.
        now.fetch_add(5_500, Ordering::SeqCst);
        assert!(limiter.check("k", 2, 10).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_check_scopes_reports_first_failing_scope() {
        let mut config = RateLimitConfig::default();
        config.per_user = ScopeLimit::new(1, 60);
        config.per_operation = ScopeLimit::new(1, 60);
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config)
            .with_clock(fixed_clock(1_700_000_010_000));

        let scopes = limiter.scopes_for("gpt-4o", Some("alice"), "backstory");
        let infos = limiter.check_scopes(&scopes).await.unwrap();
        assert_eq!(infos.len(), 4);

        match limiter.check_scopes(&scopes).await {
            Err(GenerationError::RateLimitExceeded {
                scope,
                remaining,
                reset_at,
                ..
            }) => {
                assert_eq!(scope, "user:alice");
                assert_eq!(remaining, 0);
                assert_eq!(reset_at, 1_700_000_040);
            }
            other => panic!("expected user scope denial, got {other:?}")
        }
    }

    #[tokio::test]
    async fn test_scopes_are_checked_in_canonical_order() {
        let mut config = RateLimitConfig::default();
        config.global = ScopeLimit::new(1, 60);
        config.per_operation = ScopeLimit::new(1, 60);
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config)
            .with_clock(fixed_clock(1_700_000_010_000));

        let scopes = vec![
            RateLimitScope::Operation("lore".to_string()),
            RateLimitScope::Global,
        ];
        limiter.check_scopes(&scopes).await.unwrap();
        let err = limiter.check_scopes(&scopes).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::RateLimitExceeded { ref scope, .. } if scope == "global"
        ));
    }

    #[tokio::test]
    async fn test_disabled_scope_is_skipped() {
        let mut config = RateLimitConfig::default();
        config.global = ScopeLimit::new(1, 60).disabled();
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config);
        let scopes = vec![RateLimitScope::Global];
        for _ in 0..5 {
            assert!(limiter.check_scopes(&scopes).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_user_scope_only_with_caller_id() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let anonymous = limiter.scopes_for("m", None, "lore");
        assert!(!anonymous.iter().any(|s| matches!(s, RateLimitScope::User(_))));
        let named = limiter.scopes_for("m", Some("bob"), "lore");
        assert_eq!(named[2], RateLimitScope::User("bob".to_string()));
    }

    #[tokio::test]
    async fn test_check_model_charges_only_model_scope() {
        let mut config = RateLimitConfig::default();
        config.global = ScopeLimit::new(1, 60);
        config.per_model = ScopeLimit::new(1, 60);
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config);

        limiter.check_model("B").await.unwrap();
        let err = limiter.check_model("B").await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::RateLimitExceeded { ref scope, .. } if scope == "model:B"
        ));
        // The global scope was never charged.
        limiter.check_scopes(&[RateLimitScope::Global]).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), RateLimitConfig::default());
        assert!(limiter.check("k", 10, 60).await.is_err());

        let err = limiter
            .check_scopes(&[RateLimitScope::Global])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cache_store");
    }

    #[tokio::test]
    async fn test_zero_window_rejected() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        assert!(matches!(
            limiter.check("k", 1, 0).await,
            Err(StorageError::InvalidArgument { .. })
        ));
    }

    fn run_burst(algorithm: RateLimitAlgorithm, limit: u64, extra: u64) -> Vec<RateLimitInfo> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let limiter = limiter(algorithm);
            let mut results = Vec::new();
            for _ in 0..(limit + extra) {
                results.push(limiter.check("burst", limit, 60).await.unwrap());
            }
            results
        })
    }

    proptest! {
        #[test]
        fn prop_fixed_window_admits_exactly_limit(limit in 1u64..30, extra in 1u64..10) {
            let results = run_burst(RateLimitAlgorithm::FixedWindow, limit, extra);
            let allowed = results.iter().filter(|r| r.allowed).count() as u64;
            prop_assert_eq!(allowed, limit);
            for denied in results.iter().filter(|r| !r.allowed) {
                prop_assert_eq!(denied.remaining, 0);
            }
        }

        #[test]
        fn prop_sliding_window_admits_exactly_limit(limit in 1u64..30, extra in 1u64..10) {
            let results = run_burst(RateLimitAlgorithm::SlidingWindow, limit, extra);
            let allowed = results.iter().filter(|r| r.allowed).count() as u64;
            prop_assert_eq!(allowed, limit);
            prop_assert!(results.iter().all(|r| r.remaining <= limit));
            for denied in results.iter().filter(|r| !r.allowed) {
                prop_assert_eq!(denied.remaining, 0);
            }
        }
    }
}
