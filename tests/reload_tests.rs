//! Hot-reload flows: polling change detection, cache invalidation, and
//! bucket resets wired together the way the server assembles them.

use fluxgate::bucket_reset::{MemoryBucketReset, ResetOnReloadListener};
use fluxgate::cache::RuleCache;
use fluxgate::context::RequestContext;
use fluxgate::key_resolver::ScopeKeyResolver;
use fluxgate::memory_store::MemoryBucketStore;
use fluxgate::provider::{CachingRuleSetProvider, RepositoryRuleSetProvider, RuleSetProvider};
use fluxgate::rate_limiter::RateLimiter;
use fluxgate::reload::{
    ListenerSet, PollingReloadStrategy, ReloadStrategy, RuleReloadEvent, ReloadSource,
};
use fluxgate::repository::{MemoryRuleRepository, RuleRepository};
use fluxgate::rule::{RateLimitBand, RateLimitRule, RuleScope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn per_user_rule(id: &str, set: &str, window_secs: u64, capacity: i64) -> RateLimitRule {
    RateLimitRule::new(
        id,
        set,
        RuleScope::PerUser,
        vec![RateLimitBand::new(Duration::from_secs(window_secs), capacity).unwrap()],
    )
}

struct Fixture {
    repo: Arc<MemoryRuleRepository>,
    cache: Arc<RuleCache>,
    backing: Arc<dyn RuleSetProvider>,
    provider: Arc<CachingRuleSetProvider>,
    store: Arc<MemoryBucketStore>,
    limiter: RateLimiter,
}

fn fixture() -> Fixture {
    let repo = Arc::new(MemoryRuleRepository::new());
    let cache = Arc::new(RuleCache::new(16, None));
    let backing: Arc<dyn RuleSetProvider> = Arc::new(RepositoryRuleSetProvider::new(
        repo.clone(),
        Arc::new(ScopeKeyResolver),
        None,
    ));
    let provider = Arc::new(CachingRuleSetProvider::new(backing.clone(), cache.clone()));
    let store = Arc::new(MemoryBucketStore::new());
    let limiter = RateLimiter::new(store.clone());
    Fixture {
        repo,
        cache,
        backing,
        provider,
        store,
        limiter,
    }
}

#[tokio::test]
async fn rule_update_takes_effect_after_reload_with_bucket_purge() {
    let f = fixture();
    f.repo
        .save(&per_user_rule("r1", "s", 60, 10))
        .await
        .unwrap();

    let ctx = RequestContext::new("/api", "GET")
        .with_client_ip("1.1.1.1")
        .with_user_id("u1");

    // Three requests under the 10/min rule, all admitted and cached.
    let set = f.provider.find_by_id("s").await.unwrap().unwrap();
    for _ in 0..3 {
        assert!(f.limiter.try_consume(&ctx, &set, 1).await.unwrap().allowed);
    }
    assert_eq!(f.cache.size(), 1);

    // Admin tightens the rule to 2/min and a reload event arrives; the
    // cache entry and the set's buckets are dropped.
    f.repo
        .save(&per_user_rule("r1", "s", 60, 2))
        .await
        .unwrap();
    let listeners = ListenerSet::new();
    listeners.add(f.provider.clone());
    listeners.add(Arc::new(ResetOnReloadListener::new(Arc::new(
        MemoryBucketReset::new(f.store.clone()),
    ))));
    listeners
        .dispatch(&RuleReloadEvent::for_rule_set("s", ReloadSource::PubSub))
        .await;
    assert_eq!(f.cache.size(), 0);
    assert!(f.store.is_empty());

    // The next evaluation sees the new limit: third request in the same
    // minute is rejected.
    let set = f.provider.find_by_id("s").await.unwrap().unwrap();
    assert_eq!(set.rules[0].bands[0].capacity, 2);
    assert!(f.limiter.try_consume(&ctx, &set, 1).await.unwrap().allowed);
    assert!(f.limiter.try_consume(&ctx, &set, 1).await.unwrap().allowed);
    assert!(!f.limiter.try_consume(&ctx, &set, 1).await.unwrap().allowed);
}

#[tokio::test]
async fn polling_detects_content_changes_of_cached_sets() {
    let f = fixture();
    f.repo
        .save(&per_user_rule("r1", "s", 60, 10))
        .await
        .unwrap();
    f.provider.find_by_id("s").await.unwrap().unwrap();

    let listeners = Arc::new(ListenerSet::new());
    listeners.add(f.provider.clone());
    let mut versions = HashMap::new();

    // First sweep records the baseline without emitting anything.
    PollingReloadStrategy::poll_once(&f.backing, &f.cache, &listeners, &mut versions).await;
    assert_eq!(f.cache.size(), 1);
    assert_eq!(versions.len(), 1);

    // Unchanged content: second sweep is quiet.
    PollingReloadStrategy::poll_once(&f.backing, &f.cache, &listeners, &mut versions).await;
    assert_eq!(f.cache.size(), 1);

    // Changed content: the sweep emits and the cache drops the entry.
    f.repo
        .save(&per_user_rule("r1", "s", 60, 2))
        .await
        .unwrap();
    PollingReloadStrategy::poll_once(&f.backing, &f.cache, &listeners, &mut versions).await;
    assert_eq!(f.cache.size(), 0);

    let reloaded = f.provider.find_by_id("s").await.unwrap().unwrap();
    assert_eq!(reloaded.rules[0].bands[0].capacity, 2);
}

#[tokio::test]
async fn polling_emits_when_a_seen_set_disappears() {
    let f = fixture();
    f.repo
        .save(&per_user_rule("r1", "s", 60, 10))
        .await
        .unwrap();
    f.provider.find_by_id("s").await.unwrap().unwrap();

    let listeners = Arc::new(ListenerSet::new());
    listeners.add(f.provider.clone());
    let mut versions = HashMap::new();
    PollingReloadStrategy::poll_once(&f.backing, &f.cache, &listeners, &mut versions).await;

    f.repo.delete_by_rule_set_id("s").await.unwrap();
    PollingReloadStrategy::poll_once(&f.backing, &f.cache, &listeners, &mut versions).await;

    assert_eq!(f.cache.size(), 0);
    assert!(versions.is_empty());
    assert!(f.provider.find_by_id("s").await.unwrap().is_none());
}

#[tokio::test]
async fn polling_strategy_runs_in_the_background() {
    let f = fixture();
    f.repo
        .save(&per_user_rule("r1", "s", 60, 10))
        .await
        .unwrap();
    f.provider.find_by_id("s").await.unwrap().unwrap();

    let strategy = PollingReloadStrategy::new(
        f.backing.clone(),
        f.cache.clone(),
        Duration::from_millis(20),
        Duration::ZERO,
    );
    strategy.add_listener(f.provider.clone());
    strategy.start().await.unwrap();
    assert!(strategy.is_running());

    // Let the loop record its baseline, then change the rule content.
    tokio::time::sleep(Duration::from_millis(60)).await;
    f.repo
        .save(&per_user_rule("r1", "s", 60, 3))
        .await
        .unwrap();

    // Within a few intervals the cache entry is gone.
    let mut invalidated = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if f.cache.size() == 0 {
            invalidated = true;
            break;
        }
    }
    assert!(invalidated, "polling loop never invalidated the cache");

    strategy.stop().await;
    assert!(!strategy.is_running());
    // Stopping again is a no-op.
    strategy.stop().await;
}

#[tokio::test]
async fn manual_triggers_reach_listeners_without_detection() {
    let f = fixture();
    f.repo
        .save(&per_user_rule("r1", "s", 60, 10))
        .await
        .unwrap();
    f.provider.find_by_id("s").await.unwrap().unwrap();

    let strategy = PollingReloadStrategy::new(
        f.backing.clone(),
        f.cache.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    );
    strategy.add_listener(f.provider.clone());

    strategy.trigger_reload("s").await;
    assert_eq!(f.cache.size(), 0);

    f.provider.find_by_id("s").await.unwrap().unwrap();
    strategy.trigger_reload_all().await;
    assert_eq!(f.cache.size(), 0);
}
