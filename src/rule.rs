//! Rate limit rule model: bands, scopes, policies.
//!
//! A *band* is a single `capacity / window` constraint. A *rule* is a
//! non-empty ordered sequence of bands sharing one scope and one
//! limit-exceeded policy. Rules are grouped into rule-sets by `rule_set_id`
//! and evaluated together (see [`crate::rate_limiter`]).
//!
//! Rule documents are created and mutated by the admin surface; the core
//! only reads them. The serde shape below is the subset of the JSON
//! document the core consumes.

use crate::error::{FluxGateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A single rate constraint: `capacity` permits per `window`.
///
/// Immutable after construction. `capacity >= 1` and `window >= 1ns` are
/// enforced by [`RateLimitBand::new`] and by [`RateLimitRule::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBand {
    /// Refill window for the full capacity.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum permits available within one window.
    pub capacity: i64,
    /// Optional label; distinguishes bucket keys of multi-band rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RateLimitBand {
    pub fn new(window: Duration, capacity: i64) -> Result<Self> {
        let band = Self {
            window,
            capacity,
            label: None,
        };
        band.validate()?;
        Ok(band)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label used in the bucket key; `"default"` when unlabeled.
    pub fn key_label(&self) -> &str {
        self.label.as_deref().unwrap_or("default")
    }

    /// Window length in whole nanoseconds.
    pub fn window_nanos(&self) -> i64 {
        self.window.as_nanos().min(i64::MAX as u128) as i64
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(FluxGateError::ConfigurationInvalid(format!(
                "band capacity must be >= 1, got {}",
                self.capacity
            )));
        }
        if self.window.is_zero() {
            return Err(FluxGateError::ConfigurationInvalid(
                "band window must be >= 1ns".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a rule keys its buckets by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleScope {
    Global,
    PerIp,
    PerUser,
    PerApiKey,
    Custom,
}

/// What happens to a request once a band rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnLimitExceedPolicy {
    /// Respond 429 immediately.
    RejectRequest,
    /// Sleep until the bucket refills (bounded) and retry once.
    WaitForRefill,
}

/// One rate-limiting rule: ordered bands under a single scope and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Unique rule id within the repository. Must not contain `:`.
    pub id: String,
    /// Human-readable name for logs and admin surfaces.
    pub name: String,
    /// Disabled rules are loaded but skipped during evaluation.
    pub enabled: bool,
    pub scope: RuleScope,
    /// Attribute key consulted by the resolver when `scope` is CUSTOM;
    /// informational otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_strategy_id: Option<String>,
    pub on_limit_exceed_policy: OnLimitExceedPolicy,
    /// Non-empty, evaluated in order.
    pub bands: Vec<RateLimitBand>,
    /// Groups rules into a rule-set. Must not contain `:`.
    pub rule_set_id: String,
    /// Opaque attributes carried through to resolvers and recorders.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl RateLimitRule {
    /// Minimal constructor used by tests and embedding code; the admin
    /// surface builds rules from documents instead.
    pub fn new(
        id: impl Into<String>,
        rule_set_id: impl Into<String>,
        scope: RuleScope,
        bands: Vec<RateLimitBand>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            scope,
            key_strategy_id: None,
            on_limit_exceed_policy: OnLimitExceedPolicy::RejectRequest,
            bands,
            rule_set_id: rule_set_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: OnLimitExceedPolicy) -> Self {
        self.on_limit_exceed_policy = policy;
        self
    }

    pub fn with_key_strategy(mut self, key_strategy_id: impl Into<String>) -> Self {
        self.key_strategy_id = Some(key_strategy_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enforces the rule invariants: at least one band, all bands valid,
    /// ids free of the key separator, custom scope carries a key strategy.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FluxGateError::ConfigurationInvalid(
                "rule id must not be empty".to_string(),
            ));
        }
        if self.id.contains(':') || self.rule_set_id.contains(':') {
            return Err(FluxGateError::ConfigurationInvalid(format!(
                "rule '{}': ids must not contain ':'",
                self.id
            )));
        }
        if self.rule_set_id.is_empty() {
            return Err(FluxGateError::ConfigurationInvalid(format!(
                "rule '{}': ruleSetId must not be empty",
                self.id
            )));
        }
        if self.bands.is_empty() {
            return Err(FluxGateError::ConfigurationInvalid(format!(
                "rule '{}': at least one band is required",
                self.id
            )));
        }
        for band in &self.bands {
            band.validate()?;
        }
        if self.scope == RuleScope::Custom
            && self
                .key_strategy_id
                .as_deref()
                .map_or(true, |s| s.is_empty())
        {
            return Err(FluxGateError::ConfigurationInvalid(format!(
                "rule '{}': CUSTOM scope requires keyStrategyId",
                self.id
            )));
        }
        Ok(())
    }
}
