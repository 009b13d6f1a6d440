//! Token bucket store abstraction.
//!
//! A [`TokenBucketStore`] executes the atomic refill+consume against shared
//! state. Two implementations ship with the crate:
//!
//! - [`crate::redis_store::RedisBucketStore`] for distributed deployments,
//!   where the refill+consume runs as a server-side script;
//! - [`crate::memory_store::MemoryBucketStore`] for single-process use and
//!   deterministic tests, mirroring the script semantics in-process.
//!
//! Both guarantee read-only-on-rejection: a call that returns
//! `consumed == false` leaves the stored tokens and refill anchor untouched.

use crate::error::Result;
use crate::rule::RateLimitBand;
use async_trait::async_trait;

/// Outcome of one store call for one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whether the permits were taken from this band.
    pub consumed: bool,
    /// Tokens left in the band after the call.
    pub remaining_tokens: i64,
    /// Nanoseconds until enough tokens exist for the requested permits;
    /// zero when `consumed`.
    pub nanos_to_wait_for_refill: i64,
    /// Nanoseconds until the band is back at full capacity.
    pub reset_nanos: i64,
}

/// One band's share of a consume call.
#[derive(Debug, Clone)]
pub struct BandConsume {
    /// Full bucket key, see [`bucket_key`].
    pub bucket_key: String,
    pub band: RateLimitBand,
    pub permits: i64,
}

/// Atomic multi-band token bucket operations against shared state.
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    /// Atomically refill and consume `permits` from a single band.
    ///
    /// On success the stored state is updated only when the returned
    /// `consumed` is true; rejection never mutates the bucket.
    async fn try_consume(
        &self,
        bucket_key: &str,
        band: &RateLimitBand,
        permits: i64,
    ) -> Result<BucketState> {
        let states = self
            .try_consume_rule(&[BandConsume {
                bucket_key: bucket_key.to_string(),
                band: band.clone(),
                permits,
            }])
            .await?;
        Ok(states[0])
    }

    /// Atomically evaluate all bands of one rule: either every band has
    /// sufficient tokens and all are decremented together, or none is
    /// mutated and each rejecting band reports its wait time.
    ///
    /// `bands` is non-empty; the returned vector is index-aligned with it.
    async fn try_consume_rule(&self, bands: &[BandConsume]) -> Result<Vec<BucketState>>;

    /// Store liveness probe for health endpoints.
    async fn ping(&self) -> Result<()>;
}

/// Prefix shared by every bucket key; the reset handler purges by it.
pub const BUCKET_KEY_PREFIX: &str = "fluxgate";

/// Canonical bucket key: `fluxgate:{ruleSetId}:{ruleId}:{keyValue}:{bandLabel}`.
///
/// `rule_set_id` and `rule_id` must not contain `:` (enforced at rule
/// validation); `key_value` is stored verbatim.
pub fn bucket_key(rule_set_id: &str, rule_id: &str, key_value: &str, band: &RateLimitBand) -> String {
    format!(
        "{BUCKET_KEY_PREFIX}:{rule_set_id}:{rule_id}:{key_value}:{}",
        band.key_label()
    )
}

/// Key prefix covering every bucket of one rule-set.
pub fn rule_set_key_prefix(rule_set_id: &str) -> String {
    format!("{BUCKET_KEY_PREFIX}:{rule_set_id}:")
}

/// TTL applied to bucket keys, in whole seconds: the band window plus a 20%
/// safety margin against clock skew, rounded up and capped at 24 hours so
/// long windows cannot pin keys forever.
pub fn bucket_ttl_seconds(band: &RateLimitBand) -> i64 {
    const TTL_MAX_SECS: i64 = 86_400;
    let window_nanos = band.window_nanos();
    let with_margin = window_nanos.saturating_add(window_nanos / 5);
    let secs = (with_margin + 999_999_999) / 1_000_000_000;
    secs.clamp(1, TTL_MAX_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_key_uses_default_band_label() {
        let band = RateLimitBand::new(Duration::from_secs(1), 10).unwrap();
        assert_eq!(
            bucket_key("set-a", "r1", "1.2.3.4", &band),
            "fluxgate:set-a:r1:1.2.3.4:default"
        );

        let labeled = band.with_label("minute");
        assert_eq!(
            bucket_key("set-a", "r1", "u1", &labeled),
            "fluxgate:set-a:r1:u1:minute"
        );
    }

    #[test]
    fn ttl_adds_margin_and_rounds_up() {
        let band = RateLimitBand::new(Duration::from_secs(60), 10).unwrap();
        // 60s + 12s margin
        assert_eq!(bucket_ttl_seconds(&band), 72);

        let sub_second = RateLimitBand::new(Duration::from_millis(100), 10).unwrap();
        assert_eq!(bucket_ttl_seconds(&sub_second), 1);
    }

    #[test]
    fn ttl_is_capped() {
        let band = RateLimitBand::new(Duration::from_secs(30 * 86_400), 10).unwrap();
        assert_eq!(bucket_ttl_seconds(&band), 86_400);
    }
}
