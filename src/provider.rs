//! Rule-set assembly and caching.
//!
//! [`RepositoryRuleSetProvider`] reads the rules of one `rule_set_id` from
//! the repository and assembles a [`RateLimitRuleSet`] with the configured
//! key resolver and metrics recorder attached.
//!
//! [`CachingRuleSetProvider`] decorates any provider with the bounded
//! [`RuleCache`]: misses resolve through the backing provider and populate
//! the cache on success; empty results are never cached. The decorator is
//! also the reload listener that invalidates cache entries, so the reload
//! strategy never needs a back-pointer to it.

use crate::cache::RuleCache;
use crate::error::Result;
use crate::key_resolver::KeyResolver;
use crate::metrics::MetricsRecorder;
use crate::reload::{ReloadListener, RuleReloadEvent};
use crate::repository::RuleRepository;
use crate::rule_set::RateLimitRuleSet;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to assembled rule-sets.
#[async_trait]
pub trait RuleSetProvider: Send + Sync {
    /// `None` when the rule-set has no rules at all.
    async fn find_by_id(&self, rule_set_id: &str) -> Result<Option<Arc<RateLimitRuleSet>>>;
}

/// Assembles rule-sets straight from the repository on every call.
pub struct RepositoryRuleSetProvider {
    repository: Arc<dyn RuleRepository>,
    key_resolver: Arc<dyn KeyResolver>,
    metrics_recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl RepositoryRuleSetProvider {
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        key_resolver: Arc<dyn KeyResolver>,
        metrics_recorder: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        Self {
            repository,
            key_resolver,
            metrics_recorder,
        }
    }
}

#[async_trait]
impl RuleSetProvider for RepositoryRuleSetProvider {
    async fn find_by_id(&self, rule_set_id: &str) -> Result<Option<Arc<RateLimitRuleSet>>> {
        // Repository order is unspecified but already id-sorted; keeping it
        // gives every node the same evaluation order.
        let rules = self.repository.find_by_rule_set_id(rule_set_id).await?;
        if rules.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(RateLimitRuleSet {
            id: rule_set_id.to_string(),
            description: None,
            rules,
            key_resolver: Arc::clone(&self.key_resolver),
            metrics_recorder: self.metrics_recorder.clone(),
        })))
    }
}

/// Caching decorator; also the cache-invalidation reload listener.
pub struct CachingRuleSetProvider {
    inner: Arc<dyn RuleSetProvider>,
    cache: Arc<RuleCache>,
}

impl CachingRuleSetProvider {
    pub fn new(inner: Arc<dyn RuleSetProvider>, cache: Arc<RuleCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.cache
    }
}

#[async_trait]
impl RuleSetProvider for CachingRuleSetProvider {
    async fn find_by_id(&self, rule_set_id: &str) -> Result<Option<Arc<RateLimitRuleSet>>> {
        if let Some(cached) = self.cache.get(rule_set_id) {
            return Ok(Some(cached));
        }
        match self.inner.find_by_id(rule_set_id).await? {
            Some(rule_set) => {
                debug!(rule_set_id, "caching assembled rule-set");
                self.cache.put(Arc::clone(&rule_set));
                Ok(Some(rule_set))
            }
            // Negative results are not cached: the set may appear at any
            // moment and the cache would mask it until invalidated.
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ReloadListener for CachingRuleSetProvider {
    fn name(&self) -> &str {
        "rule-set-cache"
    }

    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
        match event.rule_set_id.as_deref() {
            Some(id) => {
                let dropped = self.cache.invalidate(id);
                info!(rule_set_id = id, dropped, source = ?event.source, "rule-set cache invalidated");
            }
            None => {
                self.cache.invalidate_all();
                info!(source = ?event.source, "rule-set cache fully invalidated");
            }
        }
        Ok(())
    }
}
