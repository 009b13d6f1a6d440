//! In-process token bucket store.
//!
//! Mirrors the server-side script semantics (integer-only refill math,
//! write-only-on-acceptance, per-key TTL) behind one mutex, so a single
//! instance can run without a shared store and so the engine's invariants
//! can be tested against a controllable clock.

use crate::error::Result;
use crate::store::{bucket_ttl_seconds, BandConsume, BucketState, TokenBucketStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-enough time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .min(i64::MAX as u128) as i64
    }
}

/// Manually advanced [`Clock`] for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: Mutex<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, nanos: i64) {
        *self.nanos.lock() += nanos;
    }

    pub fn set(&self, nanos: i64) {
        *self.nanos.lock() = nanos;
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        *self.nanos.lock()
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    tokens: i64,
    /// Refill anchor; advances only by the time the refill consumed so
    /// sub-interval fractions keep accumulating.
    last_refill_nanos: i64,
    expires_at_nanos: i64,
}

/// Single-process [`TokenBucketStore`], the local-mode counterpart of the
/// Redis store.
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Removes every bucket whose key starts with `prefix`; returns the
    /// number removed. Used by the reset handler.
    pub fn purge_prefix(&self, prefix: &str) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|key, _| !key.starts_with(prefix));
        before - buckets.len()
    }

    /// Number of live (non-expired) buckets; diagnostic only.
    pub fn len(&self) -> usize {
        let now = self.clock.now_nanos();
        self.buckets
            .lock()
            .values()
            .filter(|b| b.expires_at_nanos > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenBucketStore for MemoryBucketStore {
    async fn try_consume_rule(&self, bands: &[BandConsume]) -> Result<Vec<BucketState>> {
        let now = self.clock.now_nanos();
        let mut buckets = self.buckets.lock();

        // Phase 1: refill every band in memory, decide nothing yet.
        let mut refilled = Vec::with_capacity(bands.len());
        for req in bands {
            let capacity = req.band.capacity;
            let interval = req.band.window_nanos();
            let stored = buckets
                .get(&req.bucket_key)
                .filter(|b| b.expires_at_nanos > now)
                .copied();

            let (mut tokens, mut anchor) = match stored {
                Some(b) => (b.tokens, b.last_refill_nanos),
                None => (capacity, now),
            };

            let elapsed = (now - anchor).max(0);
            // Integer math identical to the store script: floor the refill,
            // advance the anchor only by the time that refill consumed.
            let refill = (elapsed as i128 * capacity as i128 / interval as i128) as i64;
            if refill > 0 {
                tokens = (tokens + refill).min(capacity);
                anchor += (refill as i128 * interval as i128 / capacity as i128) as i64;
            }
            refilled.push((tokens, anchor));
        }

        let all_admit = bands
            .iter()
            .zip(&refilled)
            .all(|(req, (tokens, _))| *tokens >= req.permits);

        // Phase 2: commit all bands or none.
        let mut states = Vec::with_capacity(bands.len());
        for (req, (tokens, anchor)) in bands.iter().zip(&refilled) {
            let capacity = req.band.capacity;
            let interval = req.band.window_nanos();
            if all_admit {
                let remaining = tokens - req.permits;
                let ttl_nanos = bucket_ttl_seconds(&req.band) * 1_000_000_000;
                buckets.insert(
                    req.bucket_key.clone(),
                    StoredBucket {
                        tokens: remaining,
                        last_refill_nanos: *anchor,
                        expires_at_nanos: now + ttl_nanos,
                    },
                );
                states.push(BucketState {
                    consumed: true,
                    remaining_tokens: remaining,
                    nanos_to_wait_for_refill: 0,
                    reset_nanos: ceil_div(
                        (capacity - remaining) as i128 * interval as i128,
                        capacity as i128,
                    ),
                });
            } else {
                let deficit = (req.permits - tokens).max(0);
                let wait = ceil_div(deficit as i128 * interval as i128, capacity as i128);
                states.push(BucketState {
                    consumed: false,
                    remaining_tokens: *tokens,
                    nanos_to_wait_for_refill: wait,
                    reset_nanos: wait,
                });
            }
        }
        Ok(states)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn ceil_div(numerator: i128, denominator: i128) -> i64 {
    if denominator <= 0 {
        return 0;
    }
    ((numerator + denominator - 1) / denominator).max(0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RateLimitBand;
    use std::time::Duration;

    fn store_and_clock() -> (MemoryBucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        clock.set(1_000_000_000);
        (MemoryBucketStore::with_clock(clock.clone()), clock)
    }

    fn band(window: Duration, capacity: i64) -> RateLimitBand {
        RateLimitBand::new(window, capacity).unwrap()
    }

    #[tokio::test]
    async fn drains_then_rejects() {
        let (store, _clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 10);

        for expected_remaining in (0..10).rev() {
            let state = store.try_consume("k", &band, 1).await.unwrap();
            assert!(state.consumed);
            assert_eq!(state.remaining_tokens, expected_remaining);
        }

        let rejected = store.try_consume("k", &band, 1).await.unwrap();
        assert!(!rejected.consumed);
        assert_eq!(rejected.remaining_tokens, 0);
        assert!(rejected.nanos_to_wait_for_refill > 0);
        assert!(rejected.nanos_to_wait_for_refill <= 1_000_000_000);
    }

    #[tokio::test]
    async fn rejection_does_not_mutate_state() {
        let (store, _clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 3);
        for _ in 0..3 {
            store.try_consume("k", &band, 1).await.unwrap();
        }

        let first = store.try_consume("k", &band, 1).await.unwrap();
        let second = store.try_consume("k", &band, 1).await.unwrap();
        assert!(!first.consumed && !second.consumed);
        assert_eq!(first.remaining_tokens, second.remaining_tokens);
        assert_eq!(first.nanos_to_wait_for_refill, second.nanos_to_wait_for_refill);
    }

    #[tokio::test]
    async fn refills_proportionally_to_elapsed_time() {
        let (store, clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 10);
        for _ in 0..10 {
            store.try_consume("k", &band, 1).await.unwrap();
        }

        // 200ms later two tokens have refilled; consuming one leaves one.
        clock.advance(200_000_000);
        let state = store.try_consume("k", &band, 1).await.unwrap();
        assert!(state.consumed);
        assert_eq!(state.remaining_tokens, 1);

        // Well past the window the bucket is full again, never beyond.
        clock.advance(5_000_000_000);
        let state = store.try_consume("k", &band, 1).await.unwrap();
        assert!(state.consumed);
        assert_eq!(state.remaining_tokens, 9);
    }

    #[tokio::test]
    async fn sub_interval_fractions_accumulate() {
        let (store, clock) = store_and_clock();
        // 2 tokens per second, so one token every 500ms.
        let band = band(Duration::from_secs(1), 2);
        for _ in 0..2 {
            store.try_consume("k", &band, 1).await.unwrap();
        }

        // Two consecutive 300ms waits: the first refills nothing, but the
        // anchor must not advance past the unconsumed 300ms, so the second
        // yields a token at 600ms total.
        clock.advance(300_000_000);
        assert!(!store.try_consume("k", &band, 1).await.unwrap().consumed);
        clock.advance(300_000_000);
        assert!(store.try_consume("k", &band, 1).await.unwrap().consumed);
    }

    #[tokio::test]
    async fn backward_clock_is_treated_as_no_elapsed_time() {
        let (store, clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 5);
        store.try_consume("k", &band, 1).await.unwrap();

        clock.advance(-500_000_000);
        let state = store.try_consume("k", &band, 1).await.unwrap();
        assert!(state.consumed);
        assert_eq!(state.remaining_tokens, 3);
    }

    #[tokio::test]
    async fn multi_band_rejection_leaves_all_bands_untouched() {
        let (store, _clock) = store_and_clock();
        let fast = band(Duration::from_secs(1), 10).with_label("second");
        let slow = band(Duration::from_secs(60), 2).with_label("minute");

        let request = |permits| {
            vec![
                BandConsume {
                    bucket_key: "k:second".into(),
                    band: fast.clone(),
                    permits,
                },
                BandConsume {
                    bucket_key: "k:minute".into(),
                    band: slow.clone(),
                    permits,
                },
            ]
        };

        // Two admissions drain the slow band.
        for _ in 0..2 {
            let states = store.try_consume_rule(&request(1)).await.unwrap();
            assert!(states.iter().all(|s| s.consumed));
        }

        // Third call: fast band has 8 tokens but the slow band rejects, so
        // neither may be decremented.
        let states = store.try_consume_rule(&request(1)).await.unwrap();
        assert!(states.iter().all(|s| !s.consumed));
        assert_eq!(states[0].remaining_tokens, 8);
        assert_eq!(states[1].remaining_tokens, 0);

        let again = store.try_consume_rule(&request(1)).await.unwrap();
        assert_eq!(again[0].remaining_tokens, 8);
    }

    #[tokio::test]
    async fn expired_buckets_restart_full() {
        let (store, clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 2);
        store.try_consume("k", &band, 2).await.unwrap();

        // Past the TTL the key is gone and the bucket starts full again.
        clock.advance(3 * 1_000_000_000);
        let state = store.try_consume("k", &band, 2).await.unwrap();
        assert!(state.consumed);
        assert_eq!(state.remaining_tokens, 0);
    }

    #[tokio::test]
    async fn purge_prefix_drops_matching_buckets() {
        let (store, _clock) = store_and_clock();
        let band = band(Duration::from_secs(1), 5);
        store.try_consume("fluxgate:a:r:k:default", &band, 1).await.unwrap();
        store.try_consume("fluxgate:b:r:k:default", &band, 1).await.unwrap();

        assert_eq!(store.purge_prefix("fluxgate:a:"), 1);
        assert_eq!(store.len(), 1);
    }
}
