//! Redis-backed token bucket store.
//!
//! All refill/consume arithmetic runs inside a Lua script on the Redis
//! server, which makes every call atomic per key-set and lets the script
//! read the *server* clock (`TIME`), eliminating cross-node clock drift.
//!
//! ## Script contract
//!
//! ```text
//! KEYS[i]              = bucket key of band i
//! ARGV[(i-1)*5 + 1..5] = capacity, refillTokens, refillIntervalNanos,
//!                        permits, ttlSeconds      (decimal strings)
//! return               = flat array, 4 entries per band:
//!                        consumed (0|1), remainingTokens, waitNanos, resetNanos
//! ```
//!
//! The script evaluates every band first and writes only when *all* bands
//! admit, so a rule's bands commit or reject together and a rejected call
//! never mutates stored state.
//!
//! ## Script lifecycle
//!
//! The script body is uploaded once per store handle (`SCRIPT LOAD`) and
//! invoked by SHA. If the server lost the script (restart, failover), the
//! store re-uploads and retries exactly once; a second failure surfaces as
//! a retryable error.

use crate::error::{FluxGateError, Result};
use crate::store::{bucket_ttl_seconds, BandConsume, BucketState, TokenBucketStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::ErrorKind;
use std::time::Duration;
use tracing::{debug, warn};

/// Server-side refill+consume. Only writes on acceptance.
const CONSUME_SCRIPT: &str = r#"
local time = redis.call('TIME')
local now = time[1] * 1000000000 + time[2] * 1000

local n = #KEYS
local tokens = {}
local anchors = {}
local admit = true

for i = 1, n do
    local base = (i - 1) * 5
    local capacity = tonumber(ARGV[base + 1])
    local refill_tokens = tonumber(ARGV[base + 2])
    local interval = tonumber(ARGV[base + 3])
    local permits = tonumber(ARGV[base + 4])

    local stored = redis.call('HMGET', KEYS[i], 'tokens', 'last_refill')
    local t = tonumber(stored[1])
    local anchor = tonumber(stored[2])
    if t == nil then t = capacity end
    if anchor == nil then anchor = now end

    local elapsed = now - anchor
    if elapsed < 0 then elapsed = 0 end
    local refill = math.floor(elapsed * refill_tokens / interval)
    if refill > 0 then
        t = math.min(capacity, t + refill)
        anchor = anchor + math.floor(refill * interval / refill_tokens)
    end

    tokens[i] = t
    anchors[i] = anchor
    if t < permits then admit = false end
end

local reply = {}
for i = 1, n do
    local base = (i - 1) * 5
    local capacity = tonumber(ARGV[base + 1])
    local refill_tokens = tonumber(ARGV[base + 2])
    local interval = tonumber(ARGV[base + 3])
    local permits = tonumber(ARGV[base + 4])
    local ttl = tonumber(ARGV[base + 5])
    local off = (i - 1) * 4

    if admit then
        local remaining = tokens[i] - permits
        redis.call('HSET', KEYS[i], 'tokens', remaining, 'last_refill', anchors[i])
        redis.call('EXPIRE', KEYS[i], ttl)
        reply[off + 1] = 1
        reply[off + 2] = remaining
        reply[off + 3] = 0
        reply[off + 4] = math.ceil((capacity - remaining) * interval / refill_tokens)
    else
        local deficit = permits - tokens[i]
        local wait = 0
        if deficit > 0 then
            wait = math.ceil(deficit * interval / refill_tokens)
        end
        reply[off + 1] = 0
        reply[off + 2] = tokens[i]
        reply[off + 3] = wait
        reply[off + 4] = wait
    end
end

return reply
"#;

/// Owns one server-side script for one store handle: its text, its SHA, and
/// the reload-on-missing behavior.
pub struct ScriptRegistry {
    text: &'static str,
    sha: parking_lot::Mutex<Option<String>>,
}

impl ScriptRegistry {
    pub fn new(text: &'static str) -> Self {
        Self {
            text,
            sha: parking_lot::Mutex::new(None),
        }
    }

    /// Uploads the script and records its SHA.
    pub async fn load(&self, conn: &mut ConnectionManager) -> Result<String> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(self.text)
            .query_async(conn)
            .await
            .map_err(|e| FluxGateError::from_store("script load", e))?;
        debug!(sha = %sha, "bucket script loaded");
        *self.sha.lock() = Some(sha.clone());
        Ok(sha)
    }

    async fn sha(&self, conn: &mut ConnectionManager) -> Result<String> {
        if let Some(sha) = self.sha.lock().clone() {
            return Ok(sha);
        }
        self.load(conn).await
    }

    /// EVALSHA with the registered hash; on a missing-script response the
    /// script is re-uploaded and the call retried exactly once.
    pub async fn invoke(
        &self,
        conn: &mut ConnectionManager,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>> {
        let sha = self.sha(conn).await?;
        match eval_sha(conn, &sha, keys, args).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.kind() == ErrorKind::NoScriptError => {
                warn!("bucket script missing on server, reloading");
                let sha = self.load(conn).await?;
                eval_sha(conn, &sha, keys, args)
                    .await
                    .map_err(|e| FluxGateError::from_store("evalsha", e))
            }
            Err(err) => Err(FluxGateError::from_store("evalsha", err)),
        }
    }
}

async fn eval_sha(
    conn: &mut ConnectionManager,
    sha: &str,
    keys: &[String],
    args: &[String],
) -> std::result::Result<Vec<i64>, redis::RedisError> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(sha).arg(keys.len());
    for key in keys {
        cmd.arg(key);
    }
    for arg in args {
        cmd.arg(arg);
    }
    cmd.query_async(conn).await
}

/// Distributed [`TokenBucketStore`] over a shared Redis connection.
///
/// The connection is process-wide (`ConnectionManager` multiplexes and
/// reconnects); every call carries the configured operation timeout.
pub struct RedisBucketStore {
    conn: ConnectionManager,
    scripts: ScriptRegistry,
    timeout: Duration,
}

impl RedisBucketStore {
    /// Connects, uploads the consume script, and returns the store handle.
    pub async fn connect(uri: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(uri)
            .map_err(|e| FluxGateError::StoreConnection(format!("invalid store uri: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FluxGateError::from_store("connect", e))?;
        Self::with_connection(conn, timeout).await
    }

    /// Builds a store over an existing shared connection, uploading the
    /// consume script for this handle.
    pub async fn with_connection(mut conn: ConnectionManager, timeout: Duration) -> Result<Self> {
        let scripts = ScriptRegistry::new(CONSUME_SCRIPT);
        scripts.load(&mut conn).await?;
        Ok(Self {
            conn,
            scripts,
            timeout,
        })
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| FluxGateError::Timeout {
                operation: operation.to_string(),
            })?
    }
}

#[async_trait]
impl TokenBucketStore for RedisBucketStore {
    async fn try_consume_rule(&self, bands: &[BandConsume]) -> Result<Vec<BucketState>> {
        if bands.is_empty() {
            return Err(FluxGateError::InvalidArgument(
                "try_consume_rule requires at least one band".to_string(),
            ));
        }

        let keys: Vec<String> = bands.iter().map(|b| b.bucket_key.clone()).collect();
        let mut args = Vec::with_capacity(bands.len() * 5);
        for req in bands {
            args.push(req.band.capacity.to_string());
            args.push(req.band.capacity.to_string());
            args.push(req.band.window_nanos().to_string());
            args.push(req.permits.to_string());
            args.push(bucket_ttl_seconds(&req.band).to_string());
        }

        let mut conn = self.conn.clone();
        let reply = self
            .with_timeout("try_consume", self.scripts.invoke(&mut conn, &keys, &args))
            .await?;

        if reply.len() != bands.len() * 4 {
            return Err(FluxGateError::ScriptExecution(format!(
                "unexpected script reply length {} for {} bands",
                reply.len(),
                bands.len()
            )));
        }

        Ok(reply
            .chunks_exact(4)
            .map(|chunk| BucketState {
                consumed: chunk[0] == 1,
                remaining_tokens: chunk[1],
                nanos_to_wait_for_refill: chunk[2],
                reset_nanos: chunk[3],
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        self.with_timeout("ping", async {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(|e| FluxGateError::from_store("ping", e))?;
            Ok(())
        })
        .await
    }
}
