//! Core token-bucket limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::AdmissionBackend;
use super::bucket::{Decision, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use super::reclaim::Reclaim;
use super::rules::{Rule, RuleTable};
use crate::error::{Result, VigilError};

/// Buckets untouched for this long are dropped by the reclamation sweep.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

/// The core limiter that owns per-key token buckets.
///
/// Buckets live in a sharded map. Refill-then-consume on one key runs while
/// holding that key's map entry, so concurrent callers on the same key are
/// serialized and never see a half-updated balance, while callers on other
/// keys proceed independently. The reclamation sweep removes entries under
/// the same exclusion, re-checking idleness at removal time.
pub struct Limiter {
    /// Token buckets indexed by bucket key
    buckets: DashMap<BucketKey, TokenBucket>,
    /// Per-path rules
    rules: RuleTable,
    /// Per-caller ceiling checked in addition to the path rule
    global: Rule,
    /// Source of time for refill and idleness
    clock: Arc<dyn Clock>,
    /// How long a bucket may sit untouched before it is reclaimed
    idle_ttl: Duration,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("buckets", &self.buckets.len())
            .field("global", &self.global)
            .field("idle_ttl", &self.idle_ttl)
            .finish()
    }
}

impl Limiter {
    /// Create a limiter on the system clock.
    pub fn new(rules: RuleTable, global: Rule) -> Self {
        Self::with_clock(rules, global, Arc::new(SystemClock::new()))
    }

    /// Create a limiter on an explicit clock.
    pub fn with_clock(rules: RuleTable, global: Rule, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            rules,
            global,
            clock,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }

    /// Set the idle threshold used by the reclamation sweep.
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Take `cost` tokens from the bucket for `key`, creating it from `rule`
    /// on first use.
    ///
    /// The rule is only consulted when the bucket is created; an existing
    /// bucket keeps the capacity and rate it was created with until it is
    /// reclaimed.
    pub fn consume(&self, key: &BucketKey, rule: &Rule, cost: u32) -> Result<Decision> {
        rule.validate()
            .map_err(|e| VigilError::Admission(format!("bucket {}: {}", key, e)))?;

        let now = self.clock.now();
        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                limit = rule.limit,
                window_secs = rule.window_secs,
                "Creating new token bucket"
            );
            TokenBucket::new(rule, now)
        });

        let decision = bucket.consume(cost, now);

        trace!(
            key = %key,
            cost,
            allowed = decision.allowed,
            tokens = bucket.tokens(),
            "Consumed from token bucket"
        );

        Ok(decision)
    }

    /// Admit one operation by `identity` on `path`.
    ///
    /// The caller's global bucket is charged first; if it is empty the path
    /// bucket is left untouched. Both must admit for the operation to pass.
    pub fn check(&self, identity: &str, path: &str) -> Result<Decision> {
        let global_key = BucketKey::global(identity);
        let decision = self.consume(&global_key, &self.global, 1)?;
        if !decision.allowed {
            debug!(
                key = %global_key,
                retry_after_secs = decision.retry_after_secs,
                "Global rate limit exceeded"
            );
            return Ok(decision);
        }

        let path_key = BucketKey::path(identity, path);
        let rule = self.rules.resolve(path);
        let decision = self.consume(&path_key, rule, 1)?;
        if !decision.allowed {
            debug!(
                key = %path_key,
                retry_after_secs = decision.retry_after_secs,
                "Path rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Remove every bucket idle for at least the configured TTL.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.idle_ttl;
        let mut removed = 0;

        self.buckets.retain(|key, bucket| {
            let idle = bucket.is_idle(now, ttl);
            if idle {
                trace!(key = %key, "Reclaiming idle token bucket");
                removed += 1;
            }
            !idle
        });

        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Reclaimed idle token buckets");
        }
        removed
    }

    /// Current balance for a key, without refilling.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &BucketKey) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.tokens())
    }

    /// The rule table used for path lookups.
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// The per-caller global rule.
    pub fn global_rule(&self) -> &Rule {
        &self.global
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl AdmissionBackend for Limiter {
    async fn check(&self, identity: &str, path: &str) -> Result<Decision> {
        Limiter::check(self, identity, path)
    }
}

impl Reclaim for Limiter {
    fn name(&self) -> &'static str {
        "token_buckets"
    }

    fn reclaim(&self) -> usize {
        self.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::reclaim::spawn_reclaimer;
    use crate::ratelimit::rules::RuleConfig;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn test_limiter(clock: &ManualClock) -> Limiter {
        let rules = RuleTable::new(
            Rule::new(120, 60),
            &[RuleConfig::new("/api/v1/auth/login", 5, 60)],
        )
        .unwrap();
        Limiter::with_clock(rules, Rule::new(300, 60), Arc::new(clock.clone()))
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = test_limiter(&ManualClock::default());
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_check_creates_global_and_path_buckets() {
        let limiter = test_limiter(&ManualClock::default());

        let decision = limiter.check("10.0.0.1", "/api/v1/users").unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.bucket_count(), 2);
        assert_eq!(limiter.tokens(&BucketKey::global("10.0.0.1")), Some(299.0));
        assert_eq!(
            limiter.tokens(&BucketKey::path("10.0.0.1", "/api/v1/users")),
            Some(119.0)
        );
    }

    #[test]
    fn test_login_limit_and_retry_hint() {
        let clock = ManualClock::default();
        let limiter = test_limiter(&clock);

        for i in 1..=5 {
            let decision = limiter.check("10.0.0.1", "/api/v1/auth/login").unwrap();
            assert!(decision.allowed, "attempt {} should be admitted", i);
        }

        let decision = limiter.check("10.0.0.1", "/api/v1/auth/login").unwrap();
        assert!(!decision.allowed);
        assert!((decision.retry_after_secs - 12.0).abs() < 1e-6);

        clock.advance(decision.retry_after());
        assert!(limiter.check("10.0.0.1", "/api/v1/auth/login").unwrap().allowed);
    }

    #[test]
    fn test_global_ceiling_applies_across_paths() {
        let clock = ManualClock::default();
        let rules = RuleTable::new(Rule::new(100, 60), &[]).unwrap();
        let limiter = Limiter::with_clock(rules, Rule::new(3, 60), Arc::new(clock.clone()));

        assert!(limiter.check("a", "/one").unwrap().allowed);
        assert!(limiter.check("a", "/two").unwrap().allowed);
        assert!(limiter.check("a", "/three").unwrap().allowed);

        let decision = limiter.check("a", "/four").unwrap();
        assert!(!decision.allowed);
        assert!((decision.retry_after_secs - 20.0).abs() < 1e-6);
        // the denied global check never reached the path bucket
        assert_eq!(limiter.tokens(&BucketKey::path("a", "/four")), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = test_limiter(&ManualClock::default());

        for _ in 0..5 {
            limiter.check("attacker", "/api/v1/auth/login").unwrap();
        }
        assert!(!limiter.check("attacker", "/api/v1/auth/login").unwrap().allowed);

        assert!(limiter.check("someone-else", "/api/v1/auth/login").unwrap().allowed);
        assert_eq!(
            limiter.tokens(&BucketKey::path("someone-else", "/api/v1/auth/login")),
            Some(4.0)
        );
    }

    #[test]
    fn test_consume_rejects_invalid_rule() {
        let limiter = test_limiter(&ManualClock::default());
        let result = limiter.consume(&BucketKey::global("a"), &Rule::new(0, 60), 1);
        assert!(matches!(result, Err(VigilError::Admission(_))));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_sweep_removes_idle_buckets() {
        let clock = ManualClock::default();
        let limiter = test_limiter(&clock).with_idle_ttl(Duration::from_secs(600));

        limiter.check("stale", "/api/v1/users").unwrap();
        clock.advance(Duration::from_secs(300));
        limiter.check("fresh", "/api/v1/users").unwrap();
        clock.advance(Duration::from_secs(300));

        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.bucket_count(), 2);
        assert!(limiter.tokens(&BucketKey::global("stale")).is_none());
        assert!(limiter.tokens(&BucketKey::global("fresh")).is_some());
    }

    #[test]
    fn test_reclaimed_key_recreated_full() {
        let clock = ManualClock::default();
        let limiter = test_limiter(&clock).with_idle_ttl(Duration::from_secs(60));

        for _ in 0..5 {
            limiter.check("a", "/api/v1/auth/login").unwrap();
        }
        clock.advance(Duration::from_secs(61));
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 0);

        limiter.check("a", "/api/v1/auth/login").unwrap();
        assert_eq!(
            limiter.tokens(&BucketKey::path("a", "/api/v1/auth/login")),
            Some(4.0)
        );
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let clock = ManualClock::new(Instant::now());
        let limiter = Arc::new(test_limiter(&clock));
        let admitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if limiter.check("shared", "/api/v1/auth/login").unwrap().allowed {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 5);
        let tokens = limiter
            .tokens(&BucketKey::path("shared", "/api/v1/auth/login"))
            .unwrap();
        assert!(tokens >= 0.0);
    }

    #[tokio::test]
    async fn test_backend_trait_dispatches_to_check() {
        let limiter = test_limiter(&ManualClock::default());
        let backend: &dyn AdmissionBackend = &limiter;

        let decision = backend.check("a", "/x").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_background_sweep_reclaims_idle_buckets() {
        let rules = RuleTable::new(Rule::new(10, 1), &[]).unwrap();
        let limiter = Arc::new(
            Limiter::new(rules, Rule::new(10, 1)).with_idle_ttl(Duration::from_millis(50)),
        );
        limiter.check("a", "/x").unwrap();
        limiter.check("b", "/y").unwrap();
        assert_eq!(limiter.bucket_count(), 4);

        let shutdown = CancellationToken::new();
        let handle = spawn_reclaimer(
            vec![limiter.clone() as Arc<dyn Reclaim>],
            Duration::from_millis(20),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.bucket_count(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_clear_buckets() {
        let limiter = test_limiter(&ManualClock::default());
        limiter.check("a", "/x").unwrap();
        assert_eq!(limiter.bucket_count(), 2);

        limiter.clear();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
