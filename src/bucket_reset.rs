//! Bucket state purges on rule changes.
//!
//! When rules change, stale bucket state would keep enforcing the old
//! limits until the TTL expires. The reset handler deletes the bucket keys
//! of the affected rule-set so new rules take effect immediately.
//!
//! Resets are best-effort: the reload path must survive a flaky store, so
//! failures are logged and swallowed. Key discovery uses cursor-based SCAN,
//! never `KEYS *`, and deletions go out in batches.

use crate::error::{FluxGateError, Result};
use crate::memory_store::MemoryBucketStore;
use crate::reload::{ReloadListener, RuleReloadEvent};
use crate::store::{rule_set_key_prefix, BUCKET_KEY_PREFIX};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Purges bucket state for one rule-set or for everything.
#[async_trait]
pub trait BucketResetHandler: Send + Sync {
    /// Deletes every bucket of `rule_set_id`; returns the number deleted.
    async fn reset_buckets(&self, rule_set_id: &str) -> usize;

    /// Deletes every FluxGate bucket; returns the number deleted.
    async fn reset_all_buckets(&self) -> usize;
}

/// DEL batch size for the Redis purge.
const DELETE_BATCH: usize = 128;

/// SCAN page hint.
const SCAN_COUNT: usize = 250;

/// Redis keyspace purge via SCAN + batched DEL.
pub struct RedisBucketReset {
    conn: ConnectionManager,
}

impl RedisBucketReset {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn purge_pattern(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();

        // Full cursor sweep first; deleting while scanning can skip keys.
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| FluxGateError::from_store("scan buckets", e))?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut deleted = 0usize;
        for batch in keys.chunks(DELETE_BATCH) {
            let removed: i64 = redis::cmd("DEL")
                .arg(batch)
                .query_async(&mut conn)
                .await
                .map_err(|e| FluxGateError::from_store("del buckets", e))?;
            deleted += removed as usize;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl BucketResetHandler for RedisBucketReset {
    async fn reset_buckets(&self, rule_set_id: &str) -> usize {
        let pattern = format!("{}*", rule_set_key_prefix(rule_set_id));
        match self.purge_pattern(&pattern).await {
            Ok(deleted) => {
                info!(rule_set_id, deleted, "bucket state reset");
                deleted
            }
            Err(err) => {
                warn!(rule_set_id, error = %err, "bucket reset failed");
                0
            }
        }
    }

    async fn reset_all_buckets(&self) -> usize {
        let pattern = format!("{BUCKET_KEY_PREFIX}:*");
        match self.purge_pattern(&pattern).await {
            Ok(deleted) => {
                info!(deleted, "all bucket state reset");
                deleted
            }
            Err(err) => {
                warn!(error = %err, "full bucket reset failed");
                0
            }
        }
    }
}

/// In-process counterpart for local mode.
pub struct MemoryBucketReset {
    store: Arc<MemoryBucketStore>,
}

impl MemoryBucketReset {
    pub fn new(store: Arc<MemoryBucketStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BucketResetHandler for MemoryBucketReset {
    async fn reset_buckets(&self, rule_set_id: &str) -> usize {
        let deleted = self.store.purge_prefix(&rule_set_key_prefix(rule_set_id));
        info!(rule_set_id, deleted, "bucket state reset");
        deleted
    }

    async fn reset_all_buckets(&self) -> usize {
        let deleted = self.store.purge_prefix(&format!("{BUCKET_KEY_PREFIX}:"));
        info!(deleted, "all bucket state reset");
        deleted
    }
}

/// Bridges reload events onto a reset handler.
pub struct ResetOnReloadListener {
    handler: Arc<dyn BucketResetHandler>,
}

impl ResetOnReloadListener {
    pub fn new(handler: Arc<dyn BucketResetHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ReloadListener for ResetOnReloadListener {
    fn name(&self) -> &str {
        "bucket-reset"
    }

    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
        match event.rule_set_id.as_deref() {
            Some(id) => self.handler.reset_buckets(id).await,
            None => self.handler.reset_all_buckets().await,
        };
        Ok(())
    }
}
