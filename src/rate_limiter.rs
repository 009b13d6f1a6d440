//! # Rate Limiter Engine
//!
//! Evaluates a rule-set against a request context. Each enabled rule is
//! resolved to a bucket key and all of its bands are consumed through one
//! atomic store call, so a rule's bands commit or reject together.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  for rule in rule_set (deterministic order):                     │
//! │      key    = resolver.resolve(context, rule)                    │
//! │      states = store.try_consume_rule(bands-of-rule, permits)     │
//! │      fold: min(remaining), max(wait of rejecting bands),         │
//! │            first rejecting rule                                  │
//! │  result: allowed(first rule)  |  rejected(first rejecting rule)  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rules are additive: every enabled rule must admit. Bands of one rule are
//! atomic; across rules there is no rollback: a rule that admitted before a
//! later rule rejected keeps its decrement (best effort, documented).

use crate::context::RequestContext;
use crate::error::{FluxGateError, Result};
use crate::metrics::MetricsRecorder;
use crate::rule::RateLimitRule;
use crate::rule_set::RateLimitRuleSet;
use crate::store::{bucket_key, BandConsume, TokenBucketStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Aggregated outcome of evaluating one rule-set for one request.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Resolved key of the matched rule; absent when no rule was evaluable.
    pub matched_key: Option<String>,
    /// On rejection: the first rule that produced a rejecting band.
    /// On allow: the first enabled rule of the set.
    pub matched_rule: Option<RateLimitRule>,
    /// Minimum remaining tokens across every evaluated band; `-1` when no
    /// rule was evaluable (unknown).
    pub remaining_tokens: i64,
    /// Maximum wait across rejecting bands; zero when allowed.
    pub nanos_to_wait_for_refill: i64,
}

impl RateLimitResult {
    pub fn allowed(
        matched_key: Option<String>,
        matched_rule: Option<RateLimitRule>,
        remaining_tokens: i64,
    ) -> Self {
        Self {
            allowed: true,
            matched_key,
            matched_rule,
            remaining_tokens,
            nanos_to_wait_for_refill: 0,
        }
    }

    pub fn rejected(
        matched_key: String,
        matched_rule: RateLimitRule,
        remaining_tokens: i64,
        nanos_to_wait_for_refill: i64,
    ) -> Self {
        Self {
            allowed: false,
            matched_key: Some(matched_key),
            matched_rule: Some(matched_rule),
            remaining_tokens,
            nanos_to_wait_for_refill,
        }
    }

    /// Wait rounded up to whole seconds, for the `Retry-After` header.
    pub fn retry_after_seconds(&self) -> u64 {
        if self.nanos_to_wait_for_refill <= 0 {
            return 0;
        }
        ((self.nanos_to_wait_for_refill as u64) + 999_999_999) / 1_000_000_000
    }

    /// Wait rounded up to whole milliseconds, for WAIT_FOR_REFILL sleeps.
    pub fn wait_millis(&self) -> u64 {
        if self.nanos_to_wait_for_refill <= 0 {
            return 0;
        }
        ((self.nanos_to_wait_for_refill as u64) + 999_999) / 1_000_000
    }
}

/// The decision engine: iterates a rule-set, consumes buckets, folds the
/// per-band states into one [`RateLimitResult`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TokenBucketStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TokenBucketStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TokenBucketStore> {
        &self.store
    }

    /// Evaluates `rule_set` for `context`, consuming `permits` from every
    /// band of every enabled rule when all of them admit.
    pub async fn try_consume(
        &self,
        context: &RequestContext,
        rule_set: &RateLimitRuleSet,
        permits: i64,
    ) -> Result<RateLimitResult> {
        if permits <= 0 {
            return Err(FluxGateError::InvalidArgument(format!(
                "permits must be positive, got {permits}"
            )));
        }

        if !rule_set.has_evaluable_rules() {
            debug!(rule_set_id = %rule_set.id, "no enabled rules with bands, allowing");
            return Ok(self.finish(context, rule_set, RateLimitResult::allowed(None, None, -1)));
        }

        let mut first: Option<(String, RateLimitRule)> = None;
        let mut first_rejecting: Option<(String, RateLimitRule)> = None;
        let mut min_remaining = i64::MAX;
        let mut max_wait = 0i64;

        for rule in rule_set.evaluable_rules() {
            let key = rule_set.key_resolver.resolve(context, rule)?;

            let bands: Vec<BandConsume> = rule
                .bands
                .iter()
                .map(|band| BandConsume {
                    bucket_key: bucket_key(&rule_set.id, &rule.id, &key, band),
                    band: band.clone(),
                    permits,
                })
                .collect();

            let states = self.store.try_consume_rule(&bands).await?;

            if first.is_none() {
                first = Some((key.clone(), rule.clone()));
            }

            let mut rule_rejected = false;
            for state in &states {
                min_remaining = min_remaining.min(state.remaining_tokens);
                if !state.consumed {
                    rule_rejected = true;
                    max_wait = max_wait.max(state.nanos_to_wait_for_refill);
                }
            }
            if rule_rejected && first_rejecting.is_none() {
                first_rejecting = Some((key, rule.clone()));
            }
        }

        let result = match first_rejecting {
            Some((key, rule)) => {
                debug!(
                    rule_set_id = %rule_set.id,
                    rule_id = %rule.id,
                    key = %key,
                    wait_nanos = max_wait,
                    "rate limit exceeded"
                );
                RateLimitResult::rejected(key, rule, min_remaining, max_wait)
            }
            None => {
                let (key, rule) = first.expect("at least one evaluable rule was iterated");
                RateLimitResult::allowed(Some(key), Some(rule), min_remaining)
            }
        };

        Ok(self.finish(context, rule_set, result))
    }

    /// Runs the attached recorder; recorder failures never affect the
    /// decision.
    fn finish(
        &self,
        context: &RequestContext,
        rule_set: &RateLimitRuleSet,
        result: RateLimitResult,
    ) -> RateLimitResult {
        if let Some(recorder) = &rule_set.metrics_recorder {
            if let Err(err) = recorder.record(context, &result) {
                warn!(recorder = recorder.name(), error = %err, "metrics recorder failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_resolver::ScopeKeyResolver;
    use crate::memory_store::{ManualClock, MemoryBucketStore};
    use crate::rule::{RateLimitBand, RuleScope};
    use std::time::Duration;

    fn band(secs: u64, capacity: i64) -> RateLimitBand {
        RateLimitBand::new(Duration::from_secs(secs), capacity).unwrap()
    }

    fn rule_set(rules: Vec<RateLimitRule>) -> RateLimitRuleSet {
        RateLimitRuleSet {
            id: "s1".into(),
            description: None,
            rules,
            key_resolver: Arc::new(ScopeKeyResolver),
            metrics_recorder: None,
        }
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        clock.set(1_000_000_000);
        let store = Arc::new(MemoryBucketStore::with_clock(clock.clone()));
        (RateLimiter::new(store), clock)
    }

    #[tokio::test]
    async fn rejects_non_positive_permits() {
        let (limiter, _) = limiter();
        let set = rule_set(vec![RateLimitRule::new(
            "r1",
            "s1",
            RuleScope::PerIp,
            vec![band(1, 5)],
        )]);
        let ctx = RequestContext::new("/x", "GET").with_client_ip("1.2.3.4");
        assert!(matches!(
            limiter.try_consume(&ctx, &set, 0).await,
            Err(FluxGateError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn empty_rule_set_allows_with_unknown_remaining() {
        let (limiter, _) = limiter();
        let set = rule_set(vec![RateLimitRule::new(
            "r1",
            "s1",
            RuleScope::PerIp,
            vec![band(1, 5)],
        )
        .disabled()]);
        let ctx = RequestContext::new("/x", "GET");

        let result = limiter.try_consume(&ctx, &set, 1).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining_tokens, -1);
        assert!(result.matched_rule.is_none());
    }

    #[tokio::test]
    async fn allow_reports_first_enabled_rule_and_min_remaining() {
        let (limiter, _) = limiter();
        let set = rule_set(vec![
            RateLimitRule::new("a-wide", "s1", RuleScope::PerIp, vec![band(60, 100)]),
            RateLimitRule::new("b-narrow", "s1", RuleScope::PerIp, vec![band(1, 5)]),
        ]);
        let ctx = RequestContext::new("/x", "GET").with_client_ip("1.2.3.4");

        let result = limiter.try_consume(&ctx, &set, 1).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.matched_rule.unwrap().id, "a-wide");
        assert_eq!(result.remaining_tokens, 4);
        assert_eq!(result.nanos_to_wait_for_refill, 0);
    }

    #[tokio::test]
    async fn rejection_identifies_first_rejecting_rule() {
        let (limiter, _) = limiter();
        // R1 per-ip 5/s, R2 per-user 20/min.
        let set = rule_set(vec![
            RateLimitRule::new("r1", "s1", RuleScope::PerIp, vec![band(1, 5)]),
            RateLimitRule::new("r2", "s1", RuleScope::PerUser, vec![band(60, 20)]),
        ]);
        let ctx = RequestContext::new("/x", "GET")
            .with_client_ip("10.0.0.1")
            .with_user_id("u1");

        for _ in 0..5 {
            let result = limiter.try_consume(&ctx, &set, 1).await.unwrap();
            assert!(result.allowed);
        }

        let rejected = limiter.try_consume(&ctx, &set, 1).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.matched_rule.as_ref().unwrap().id, "r1");
        assert_eq!(rejected.matched_key.as_deref(), Some("10.0.0.1"));
        assert!(rejected.nanos_to_wait_for_refill > 0);
    }

    #[tokio::test]
    async fn multi_band_rule_rejects_without_draining_faster_band() {
        let (limiter, _) = limiter();
        let set = rule_set(vec![RateLimitRule::new(
            "burst",
            "s1",
            RuleScope::PerUser,
            vec![
                band(1, 10).with_label("second"),
                band(60, 3).with_label("minute"),
            ],
        )]);
        let ctx = RequestContext::new("/x", "GET")
            .with_client_ip("10.0.0.1")
            .with_user_id("u1");

        for _ in 0..3 {
            assert!(limiter.try_consume(&ctx, &set, 1).await.unwrap().allowed);
        }
        // Minute band exhausted: rejected, and the second band must still
        // hold its 7 tokens on the next evaluation.
        let rejected = limiter.try_consume(&ctx, &set, 1).await.unwrap();
        assert!(!rejected.allowed);
        let again = limiter.try_consume(&ctx, &set, 1).await.unwrap();
        assert_eq!(again.remaining_tokens, 0); // min across bands: minute band
        assert!(again.nanos_to_wait_for_refill > 0);
    }

    #[tokio::test]
    async fn retry_after_rounds_up_to_seconds() {
        let result = RateLimitResult::rejected(
            "k".into(),
            RateLimitRule::new("r", "s", RuleScope::Global, vec![band(1, 1)]),
            0,
            1_500_000_000,
        );
        assert_eq!(result.retry_after_seconds(), 2);
        assert_eq!(result.wait_millis(), 1_500);
    }
}
