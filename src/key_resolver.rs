//! Bucket key resolution from request context and rule scope.
//!
//! The default resolver maps by `rule.scope` with deterministic fallbacks:
//!
//! | Scope       | Source                                | Fallback        |
//! |-------------|---------------------------------------|-----------------|
//! | GLOBAL      | literal `global`                      | none            |
//! | PER_IP      | `context.client_ip`                   | `unknown`       |
//! | PER_USER    | `context.user_id`                     | PER_IP          |
//! | PER_API_KEY | `context.api_key`                     | PER_IP          |
//! | CUSTOM      | `context.attributes[keyStrategyId]`   | PER_IP          |
//!
//! Fallbacks are logged at debug. A resolver returning an empty key is a
//! contract violation surfaced as `InvalidKey`.

use crate::context::RequestContext;
use crate::error::{FluxGateError, Result};
use crate::rule::{RateLimitRule, RuleScope};
use tracing::debug;

/// Key used as bucket identity inside the shared store. Never empty.
pub type RateLimitKey = String;

/// Maps `(request, rule)` to a bucket key.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, context: &RequestContext, rule: &RateLimitRule) -> Result<RateLimitKey>;
}

/// Key funneled to when the peer address is unknown. Deployments that need
/// stricter handling override the resolver instead.
pub const UNKNOWN_KEY: &str = "unknown";

/// Key for GLOBAL-scope rules; all requests share one bucket.
pub const GLOBAL_KEY: &str = "global";

/// The default scope-based resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeKeyResolver;

impl ScopeKeyResolver {
    fn ip_key(&self, context: &RequestContext, rule: &RateLimitRule) -> RateLimitKey {
        match non_empty(context.client_ip.as_deref()) {
            Some(ip) => ip.to_string(),
            None => {
                debug!(rule_id = %rule.id, "no client ip, falling back to '{UNKNOWN_KEY}'");
                UNKNOWN_KEY.to_string()
            }
        }
    }
}

impl KeyResolver for ScopeKeyResolver {
    fn resolve(&self, context: &RequestContext, rule: &RateLimitRule) -> Result<RateLimitKey> {
        let key = match rule.scope {
            RuleScope::Global => GLOBAL_KEY.to_string(),
            RuleScope::PerIp => self.ip_key(context, rule),
            RuleScope::PerUser => match non_empty(context.user_id.as_deref()) {
                Some(user) => user.to_string(),
                None => {
                    debug!(rule_id = %rule.id, "no user id, falling back to client ip");
                    self.ip_key(context, rule)
                }
            },
            RuleScope::PerApiKey => match non_empty(context.api_key.as_deref()) {
                Some(api_key) => api_key.to_string(),
                None => {
                    debug!(rule_id = %rule.id, "no api key, falling back to client ip");
                    self.ip_key(context, rule)
                }
            },
            RuleScope::Custom => {
                let strategy = rule.key_strategy_id.as_deref().ok_or_else(|| {
                    FluxGateError::InvalidKey(format!(
                        "rule '{}' has CUSTOM scope but no keyStrategyId",
                        rule.id
                    ))
                })?;
                match non_empty(context.attributes.get(strategy).map(String::as_str)) {
                    Some(value) => value.to_string(),
                    None => {
                        debug!(
                            rule_id = %rule.id,
                            strategy,
                            "custom attribute absent, falling back to client ip"
                        );
                        self.ip_key(context, rule)
                    }
                }
            }
        };

        if key.is_empty() {
            return Err(FluxGateError::InvalidKey(format!(
                "resolver produced an empty key for rule '{}'",
                rule.id
            )));
        }
        Ok(key)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RateLimitBand;
    use std::time::Duration;

    fn rule(scope: RuleScope) -> RateLimitRule {
        RateLimitRule::new(
            "r1",
            "s1",
            scope,
            vec![RateLimitBand::new(Duration::from_secs(1), 5).unwrap()],
        )
    }

    #[test]
    fn global_scope_shares_one_key() {
        let ctx = RequestContext::new("/x", "GET").with_client_ip("9.9.9.9");
        let key = ScopeKeyResolver.resolve(&ctx, &rule(RuleScope::Global)).unwrap();
        assert_eq!(key, GLOBAL_KEY);
    }

    #[test]
    fn per_ip_falls_back_to_unknown() {
        let ctx = RequestContext::new("/x", "GET");
        let key = ScopeKeyResolver.resolve(&ctx, &rule(RuleScope::PerIp)).unwrap();
        assert_eq!(key, UNKNOWN_KEY);
    }

    #[test]
    fn per_user_falls_back_to_ip_then_unknown() {
        let with_ip = RequestContext::new("/x", "GET").with_client_ip("1.2.3.4");
        let key = ScopeKeyResolver.resolve(&with_ip, &rule(RuleScope::PerUser)).unwrap();
        assert_eq!(key, "1.2.3.4");

        let bare = RequestContext::new("/x", "GET");
        let key = ScopeKeyResolver.resolve(&bare, &rule(RuleScope::PerUser)).unwrap();
        assert_eq!(key, UNKNOWN_KEY);
    }

    #[test]
    fn empty_user_id_is_treated_as_absent() {
        let ctx = RequestContext::new("/x", "GET")
            .with_user_id("")
            .with_client_ip("1.2.3.4");
        let key = ScopeKeyResolver.resolve(&ctx, &rule(RuleScope::PerUser)).unwrap();
        assert_eq!(key, "1.2.3.4");
    }

    #[test]
    fn custom_scope_reads_attribute() {
        let ctx = RequestContext::new("/x", "GET")
            .with_client_ip("1.2.3.4")
            .with_attribute("tenant", "acme");
        let rule = rule(RuleScope::Custom).with_key_strategy("tenant");
        assert_eq!(ScopeKeyResolver.resolve(&ctx, &rule).unwrap(), "acme");

        let without = RequestContext::new("/x", "GET").with_client_ip("1.2.3.4");
        assert_eq!(ScopeKeyResolver.resolve(&without, &rule).unwrap(), "1.2.3.4");
    }
}
