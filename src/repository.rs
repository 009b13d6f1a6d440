//! Rule document persistence.
//!
//! The repository is the durable home of [`RateLimitRule`] documents. The
//! core only reads on the request path; writes come from the admin surface.
//! Reads are point-in-time consistent within one call; no cross-call or
//! multi-document ordering is promised.
//!
//! Documents are stored as JSON in a Redis hash keyed by rule id. The hash
//! key deliberately uses a dash (`fluxgate-rules`) instead of the bucket
//! key separator so a full bucket purge over `fluxgate:*` can never touch
//! rule documents.

use crate::error::{FluxGateError, Result};
use crate::rule::RateLimitRule;
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Redis hash holding one JSON document per rule id.
pub const RULES_HASH_KEY: &str = "fluxgate-rules";

/// CRUD over rule documents.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Every rule of one rule-set, disabled rules included, in unspecified
    /// stable order.
    async fn find_by_rule_set_id(&self, rule_set_id: &str) -> Result<Vec<RateLimitRule>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<RateLimitRule>>;

    /// Upsert by rule id. Rejects documents violating the rule invariants.
    async fn save(&self, rule: &RateLimitRule) -> Result<()>;

    async fn delete_by_id(&self, id: &str) -> Result<bool>;

    async fn find_all(&self) -> Result<Vec<RateLimitRule>>;

    /// Deletes every rule of a rule-set; returns the number deleted.
    async fn delete_by_rule_set_id(&self, rule_set_id: &str) -> Result<usize>;
}

/// Redis-hash backed repository.
pub struct RedisRuleRepository {
    conn: ConnectionManager,
}

impl RedisRuleRepository {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connects a dedicated handle to the rule store.
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = redis::Client::open(uri)
            .map_err(|e| FluxGateError::StoreConnection(format!("invalid store uri: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FluxGateError::from_store("connect", e))?;
        Ok(Self::new(conn))
    }

    async fn load_all(&self) -> Result<Vec<RateLimitRule>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(RULES_HASH_KEY)
            .await
            .map_err(|e| FluxGateError::from_store("hgetall rules", e))?;

        let mut rules = Vec::with_capacity(raw.len());
        for (_, doc) in raw {
            let rule: RateLimitRule = serde_json::from_str(&doc)?;
            rules.push(rule);
        }
        // Hash iteration order is arbitrary; sort for a stable result.
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }
}

#[async_trait]
impl RuleRepository for RedisRuleRepository {
    async fn find_by_rule_set_id(&self, rule_set_id: &str) -> Result<Vec<RateLimitRule>> {
        let mut rules = self.load_all().await?;
        rules.retain(|r| r.rule_set_id == rule_set_id);
        Ok(rules)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<RateLimitRule>> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn
            .hget(RULES_HASH_KEY, id)
            .await
            .map_err(|e| FluxGateError::from_store("hget rule", e))?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, rule: &RateLimitRule) -> Result<()> {
        rule.validate()?;
        let doc = serde_json::to_string(rule)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RULES_HASH_KEY, &rule.id, doc)
            .await
            .map_err(|e| FluxGateError::from_store("hset rule", e))?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(RULES_HASH_KEY, id)
            .await
            .map_err(|e| FluxGateError::from_store("hdel rule", e))?;
        Ok(removed > 0)
    }

    async fn find_all(&self) -> Result<Vec<RateLimitRule>> {
        self.load_all().await
    }

    async fn delete_by_rule_set_id(&self, rule_set_id: &str) -> Result<usize> {
        let doomed: Vec<String> = self
            .find_by_rule_set_id(rule_set_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(RULES_HASH_KEY, doomed)
            .await
            .map_err(|e| FluxGateError::from_store("hdel rules", e))?;
        Ok(removed as usize)
    }
}

/// In-process repository; local mode and test double.
#[derive(Default)]
pub struct MemoryRuleRepository {
    rules: RwLock<HashMap<String, RateLimitRule>>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for wiring: seeds the repository, panicking on invalid
    /// rules (construction-time misuse, not a runtime condition).
    pub fn seeded(rules: Vec<RateLimitRule>) -> Self {
        let repo = Self::new();
        let mut map = repo.rules.write();
        for rule in rules {
            assert!(rule.validate().is_ok(), "seed rule must be valid");
            map.insert(rule.id.clone(), rule);
        }
        drop(map);
        repo
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn find_by_rule_set_id(&self, rule_set_id: &str) -> Result<Vec<RateLimitRule>> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .values()
            .filter(|r| r.rule_set_id == rule_set_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<RateLimitRule>> {
        Ok(self.rules.read().get(id).cloned())
    }

    async fn save(&self, rule: &RateLimitRule) -> Result<()> {
        rule.validate()?;
        self.rules.write().insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.rules.write().remove(id).is_some())
    }

    async fn find_all(&self) -> Result<Vec<RateLimitRule>> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn delete_by_rule_set_id(&self, rule_set_id: &str) -> Result<usize> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|_, r| r.rule_set_id != rule_set_id);
        Ok(before - rules.len())
    }
}
