//! Hot-reload of rule-sets.
//!
//! A [`ReloadStrategy`] detects rule changes and emits [`RuleReloadEvent`]s
//! to its registered listeners. Two strategies ship:
//!
//! - **Polling**: periodically fingerprints every currently-cached rule-set
//!   through the (uncached) provider and emits an event when the content
//!   hash moves away from its recorded baseline.
//! - **PubSub**: holds a durable subscription to the rule-change channel and
//!   translates each JSON payload into an event, reconnecting with capped
//!   exponential backoff and suppressing back-to-back duplicates.
//!
//! Listeners are invoked sequentially from a single dispatch loop; a
//! listener that fails is logged and must not stop its peers. Listeners are
//! expected to be idempotent and fast (offload anything slow).

use crate::cache::RuleCache;
use crate::error::Result;
use crate::notifier::RuleChangeNotification;
use crate::provider::RuleSetProvider;
use crate::rule_set::RateLimitRuleSet;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a reload event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadSource {
    PubSub,
    Polling,
    Manual,
    Api,
    Startup,
    CacheExpiry,
}

/// A detected rule change. `rule_set_id == None` denotes a full reload.
#[derive(Debug, Clone)]
pub struct RuleReloadEvent {
    pub rule_set_id: Option<String>,
    pub source: ReloadSource,
    pub timestamp_ms: i64,
    pub metadata: HashMap<String, String>,
}

impl RuleReloadEvent {
    pub fn for_rule_set(rule_set_id: impl Into<String>, source: ReloadSource) -> Self {
        Self {
            rule_set_id: Some(rule_set_id.into()),
            source,
            timestamp_ms: epoch_millis(),
            metadata: HashMap::new(),
        }
    }

    pub fn full(source: ReloadSource) -> Self {
        Self {
            rule_set_id: None,
            source,
            timestamp_ms: epoch_millis(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_full_reload(&self) -> bool {
        self.rule_set_id.is_none()
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Receives reload events. Implementations must be idempotent.
#[async_trait]
pub trait ReloadListener: Send + Sync {
    /// Identifier for registration and logging.
    fn name(&self) -> &str;

    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()>;
}

/// Shared listener registry with sequential, failure-isolated dispatch.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ReloadListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ReloadListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes every listener registered under `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes listeners one by one; a failing listener is logged and the
    /// rest still run.
    pub async fn dispatch(&self, event: &RuleReloadEvent) {
        let snapshot: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in snapshot {
            if let Err(err) = listener.on_reload(event).await {
                error!(
                    listener = listener.name(),
                    error = %err,
                    source = ?event.source,
                    "reload listener failed"
                );
            }
        }
    }
}

/// Change detection with listener fan-out.
#[async_trait]
pub trait ReloadStrategy: Send + Sync {
    /// Starts the background detection loop. Starting twice is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stops the loop and waits for it to finish. Stopping twice is a no-op.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Dispatches a MANUAL reload for one rule-set, bypassing detection.
    async fn trigger_reload(&self, rule_set_id: &str);

    /// Dispatches a MANUAL full reload.
    async fn trigger_reload_all(&self);

    fn add_listener(&self, listener: Arc<dyn ReloadListener>);

    fn remove_listener(&self, name: &str);
}

/// Start/stop plumbing shared by both strategies.
struct StrategyCore {
    listeners: Arc<ListenerSet>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StrategyCore {
    fn new() -> Self {
        Self {
            listeners: Arc::new(ListenerSet::new()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Returns a shutdown receiver, or `None` when already running.
    fn begin_start(&self) -> Option<watch::Receiver<bool>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        Some(rx)
    }

    fn store_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("reload loop ended abnormally");
            }
        }
    }
}

/// Deterministic content hash of an assembled rule-set, covering id,
/// description, and the full rule documents.
pub fn rule_set_fingerprint(rule_set: &RateLimitRuleSet) -> String {
    let doc = serde_json::json!({
        "id": rule_set.id,
        "description": rule_set.description,
        "rules": rule_set.rules,
    });
    let mut hasher = Sha256::new();
    hasher.update(doc.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Polls the provider for content changes of every cached rule-set.
pub struct PollingReloadStrategy {
    core: StrategyCore,
    /// The *uncached* provider; polling must see current store content.
    provider: Arc<dyn RuleSetProvider>,
    cache: Arc<RuleCache>,
    interval: Duration,
    initial_delay: Duration,
}

impl PollingReloadStrategy {
    pub fn new(
        provider: Arc<dyn RuleSetProvider>,
        cache: Arc<RuleCache>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            core: StrategyCore::new(),
            provider,
            cache,
            interval,
            initial_delay,
        }
    }

    /// One polling sweep over the cached ids. Exposed for tests; the
    /// background loop calls exactly this.
    pub async fn poll_once(
        provider: &Arc<dyn RuleSetProvider>,
        cache: &Arc<RuleCache>,
        listeners: &Arc<ListenerSet>,
        versions: &mut HashMap<String, String>,
    ) {
        for id in cache.cached_rule_set_ids() {
            match provider.find_by_id(&id).await {
                Ok(Some(rule_set)) => {
                    let fingerprint = rule_set_fingerprint(&rule_set);
                    match versions.insert(id.clone(), fingerprint.clone()) {
                        None => {
                            debug!(rule_set_id = %id, "recorded polling baseline");
                        }
                        Some(seen) if seen != fingerprint => {
                            info!(rule_set_id = %id, "rule-set content changed");
                            listeners
                                .dispatch(&RuleReloadEvent::for_rule_set(id, ReloadSource::Polling))
                                .await;
                        }
                        Some(_) => {}
                    }
                }
                Ok(None) => {
                    // Disappeared from the store: invalidate so the next
                    // lookup observes the empty set.
                    versions.remove(&id);
                    info!(rule_set_id = %id, "rule-set removed from store");
                    listeners
                        .dispatch(&RuleReloadEvent::for_rule_set(id, ReloadSource::Polling))
                        .await;
                }
                Err(err) => {
                    warn!(rule_set_id = %id, error = %err, "polling fetch failed");
                }
            }
        }
    }
}

#[async_trait]
impl ReloadStrategy for PollingReloadStrategy {
    async fn start(&self) -> Result<()> {
        let Some(mut shutdown) = self.core.begin_start() else {
            return Ok(());
        };
        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let listeners = Arc::clone(&self.core.listeners);
        let initial_delay = self.initial_delay;
        let poll_interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut versions: HashMap<String, String> = HashMap::new();
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown.changed() => return,
            }
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::poll_once(&provider, &cache, &listeners, &mut versions).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.core.store_handle(handle);
        info!(interval = ?self.interval, "polling reload strategy started");
        Ok(())
    }

    async fn stop(&self) {
        self.core.stop().await;
    }

    fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    async fn trigger_reload(&self, rule_set_id: &str) {
        self.core
            .listeners
            .dispatch(&RuleReloadEvent::for_rule_set(rule_set_id, ReloadSource::Manual))
            .await;
    }

    async fn trigger_reload_all(&self) {
        self.core
            .listeners
            .dispatch(&RuleReloadEvent::full(ReloadSource::Manual))
            .await;
    }

    fn add_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.core.listeners.add(listener);
    }

    fn remove_listener(&self, name: &str) {
        self.core.listeners.remove(name);
    }
}

/// Back-to-back identical payloads inside this window are dropped.
const DEDUPE_WINDOW: Duration = Duration::from_millis(100);

/// Initial and maximum reconnect backoff for the subscriber.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Durable subscription to the rule-change channel.
pub struct PubSubReloadStrategy {
    core: StrategyCore,
    client: redis::Client,
    channel: String,
}

impl PubSubReloadStrategy {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            core: StrategyCore::new(),
            client,
            channel: channel.into(),
        }
    }

    /// Translates one raw payload into a dispatched event, honoring the
    /// dedupe window. Exposed for tests; the subscription loop calls this.
    pub async fn handle_payload(
        listeners: &Arc<ListenerSet>,
        last: &mut Option<(String, Instant)>,
        payload: &str,
    ) {
        if let Some((seen, at)) = last {
            if seen == payload && at.elapsed() < DEDUPE_WINDOW {
                debug!("duplicate rule-change notification suppressed");
                return;
            }
        }
        *last = Some((payload.to_string(), Instant::now()));

        let notification: RuleChangeNotification = match serde_json::from_str(payload) {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "discarding malformed rule-change notification");
                return;
            }
        };

        let event = match (&notification.rule_set_id, notification.full_reload) {
            (_, true) | (None, _) => RuleReloadEvent::full(ReloadSource::PubSub),
            (Some(id), false) => RuleReloadEvent::for_rule_set(id.clone(), ReloadSource::PubSub),
        };
        listeners.dispatch(&event).await;
    }
}

#[async_trait]
impl ReloadStrategy for PubSubReloadStrategy {
    async fn start(&self) -> Result<()> {
        let Some(mut shutdown) = self.core.begin_start() else {
            return Ok(());
        };
        let client = self.client.clone();
        let channel = self.channel.clone();
        let listeners = Arc::clone(&self.core.listeners);

        let handle = tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            let mut last: Option<(String, Instant)> = None;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut pubsub = match client.get_async_connection().await {
                    Ok(conn) => conn.into_pubsub(),
                    Err(err) => {
                        warn!(error = %err, backoff = ?backoff, "subscriber connect failed");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        continue;
                    }
                };
                if let Err(err) = pubsub.subscribe(&channel).await {
                    warn!(error = %err, "subscribe failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
                info!(channel = %channel, "subscribed to rule-change channel");
                backoff = BACKOFF_INITIAL;

                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        msg = messages.next() => {
                            match msg {
                                Some(msg) => {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(err) => {
                                            warn!(error = %err, "unreadable notification payload");
                                            continue;
                                        }
                                    };
                                    Self::handle_payload(&listeners, &mut last, &payload).await;
                                }
                                // Stream closed: fall back to reconnect.
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
                warn!(channel = %channel, "subscription lost, reconnecting");
            }
        });
        self.core.store_handle(handle);
        info!(channel = %self.channel, "pub/sub reload strategy started");
        Ok(())
    }

    async fn stop(&self) {
        self.core.stop().await;
    }

    fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    async fn trigger_reload(&self, rule_set_id: &str) {
        self.core
            .listeners
            .dispatch(&RuleReloadEvent::for_rule_set(rule_set_id, ReloadSource::Manual))
            .await;
    }

    async fn trigger_reload_all(&self) {
        self.core
            .listeners
            .dispatch(&RuleReloadEvent::full(ReloadSource::Manual))
            .await;
    }

    fn add_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.core.listeners.add(listener);
    }

    fn remove_listener(&self, name: &str) {
        self.core.listeners.remove(name);
    }
}
