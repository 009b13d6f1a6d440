//! Rule-sets: ordered rules plus the collaborators they are evaluated with.

use crate::key_resolver::KeyResolver;
use crate::metrics::MetricsRecorder;
use crate::rule::RateLimitRule;
use std::fmt;
use std::sync::Arc;

/// An assembled rule-set: the ordered rules of one `rule_set_id` together
/// with the key resolver and (optional) metrics recorder they run with.
///
/// Rule-sets are assembled on read by the provider and cached between
/// reload events; they are never written back to the rule store.
pub struct RateLimitRuleSet {
    pub id: String,
    pub description: Option<String>,
    /// Evaluated in order; all enabled rules must admit.
    pub rules: Vec<RateLimitRule>,
    pub key_resolver: Arc<dyn KeyResolver>,
    pub metrics_recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl RateLimitRuleSet {
    /// Enabled rules that carry at least one band, in evaluation order.
    pub fn evaluable_rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().filter(|r| r.enabled && !r.bands.is_empty())
    }

    pub fn has_evaluable_rules(&self) -> bool {
        self.evaluable_rules().next().is_some()
    }
}

impl fmt::Debug for RateLimitRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRuleSet")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("rules", &self.rules.len())
            .field("metrics_recorder", &self.metrics_recorder.is_some())
            .finish()
    }
}
