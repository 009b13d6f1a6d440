//! Rule-change notifications.
//!
//! The admin layer calls [`RuleChangePublisher::publish_rule_change`] at the
//! end of each rule write path; subscribed gates translate the payload into
//! reload events. Publishing is deliberately best-effort: a failed publish
//! is reported to the caller as a [`crate::error::FluxGateError::Notification`]
//! but must never be allowed to fail the admin operation itself.

use crate::error::{FluxGateError, Result};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default pub/sub channel for rule-change notifications.
pub const DEFAULT_RELOAD_CHANNEL: &str = "fluxgate:rule-reload";

/// Wire payload of one rule-change notification.
///
/// `rule_set_id == None` implies a full reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleChangeNotification {
    pub rule_set_id: Option<String>,
    pub full_reload: bool,
    /// Epoch milliseconds at publish time.
    pub timestamp: i64,
    /// Free-form origin tag, e.g. `"admin-api"`.
    pub source: String,
}

impl RuleChangeNotification {
    pub fn for_rule_set(rule_set_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            rule_set_id: Some(rule_set_id.into()),
            full_reload: false,
            timestamp: epoch_millis(),
            source: source.into(),
        }
    }

    pub fn full(source: impl Into<String>) -> Self {
        Self {
            rule_set_id: None,
            full_reload: true,
            timestamp: epoch_millis(),
            source: source.into(),
        }
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Publishes rule-change notifications. The publisher supplies the rule-set
/// id (or none, for a full reload) as a direct argument.
#[async_trait::async_trait]
pub trait RuleChangePublisher: Send + Sync {
    async fn publish_rule_change(&self, rule_set_id: Option<&str>, source: &str) -> Result<()>;
}

/// How long publishes are suppressed after a failure.
const CIRCUIT_WINDOW: Duration = Duration::from_secs(5);

struct NotifierConn {
    conn: Option<ConnectionManager>,
    last_failure: Option<Instant>,
}

/// Redis-backed publisher.
///
/// The connection is opened lazily and re-opened after failures, all under
/// one mutex guarding the connection fields. After a failed publish the
/// circuit stays open for a short window during which publishes fail fast
/// with `CircuitOpen`.
pub struct RedisNotifier {
    client: redis::Client,
    channel: String,
    state: Mutex<NotifierConn>,
    closed: AtomicBool,
}

impl RedisNotifier {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            state: Mutex::new(NotifierConn {
                conn: None,
                last_failure: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Closes the notifier. Idempotent; later publishes fail with
    /// `Notification`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        state.conn = None;
        debug!(channel = %self.channel, "notifier closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RuleChangePublisher for RedisNotifier {
    async fn publish_rule_change(&self, rule_set_id: Option<&str>, source: &str) -> Result<()> {
        if self.is_closed() {
            return Err(FluxGateError::Notification("notifier is closed".into()));
        }

        let notification = match rule_set_id {
            Some(id) => RuleChangeNotification::for_rule_set(id, source),
            None => RuleChangeNotification::full(source),
        };
        let payload = serde_json::to_string(&notification)?;

        let mut state = self.state.lock().await;

        if let Some(failed_at) = state.last_failure {
            let since = failed_at.elapsed();
            if since < CIRCUIT_WINDOW {
                return Err(FluxGateError::CircuitOpen {
                    retry_in: CIRCUIT_WINDOW - since,
                });
            }
        }

        if state.conn.is_none() {
            match ConnectionManager::new(self.client.clone()).await {
                Ok(conn) => state.conn = Some(conn),
                Err(err) => {
                    state.last_failure = Some(Instant::now());
                    return Err(FluxGateError::Notification(format!(
                        "connect for publish failed: {err}"
                    )));
                }
            }
        }

        let conn = state.conn.as_mut().expect("connection was just ensured");
        let published: std::result::Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&payload)
            .query_async(conn)
            .await;

        match published {
            Ok(receivers) => {
                state.last_failure = None;
                debug!(
                    channel = %self.channel,
                    receivers,
                    rule_set_id = ?rule_set_id,
                    "rule-change notification published"
                );
                Ok(())
            }
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "publish failed, opening circuit");
                state.conn = None;
                state.last_failure = Some(Instant::now());
                Err(FluxGateError::Notification(err.to_string()))
            }
        }
    }
}
