//! Configuration loading and validation.
//!
//! Settings come from `FLUXGATE_*` environment variables (a `.env` file is
//! honored by the binary) with sensible defaults; embedding applications
//! can also deserialize the structs from JSON/TOML or build them directly.
//! Durations accept humantime strings (`"30s"`, `"250ms"`).

use crate::error::{FluxGateError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What to do when the configured rule-set cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingRuleBehavior {
    Allow,
    Deny,
}

impl FromStr for MissingRuleBehavior {
    type Err = FluxGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(Self::Allow),
            "DENY" => Ok(Self::Deny),
            other => Err(FluxGateError::ConfigurationInvalid(format!(
                "missing-rule-behavior must be ALLOW or DENY, got '{other}'"
            ))),
        }
    }
}

/// How rule changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadStrategyKind {
    Polling,
    PubSub,
}

impl FromStr for ReloadStrategyKind {
    type Err = FluxGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POLLING" => Ok(Self::Polling),
            "PUBSUB" => Ok(Self::PubSub),
            other => Err(FluxGateError::ConfigurationInvalid(format!(
                "reload strategy must be POLLING or PUBSUB, got '{other}'"
            ))),
        }
    }
}

/// Store topology. CLUSTER is accepted and validated; the shipped client
/// speaks to a single endpoint, so cluster deployments front the URI with a
/// cluster-aware proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreMode {
    Standalone,
    Cluster,
}

impl FromStr for StoreMode {
    type Err = FluxGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STANDALONE" => Ok(Self::Standalone),
            "CLUSTER" => Ok(Self::Cluster),
            other => Err(FluxGateError::ConfigurationInvalid(format!(
                "store mode must be STANDALONE or CLUSTER, got '{other}'"
            ))),
        }
    }
}

/// WAIT_FOR_REFILL arbitration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitForRefillConfig {
    pub enabled: bool,
    /// Upper bound for a single in-request sleep.
    pub max_wait_ms: u64,
    /// Bound on requests sleeping simultaneously; excess is rejected
    /// immediately.
    pub max_concurrent_waits: usize,
}

impl Default for WaitForRefillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_wait_ms: 5_000,
            max_concurrent_waits: 100,
        }
    }
}

/// Hot-reload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub strategy: ReloadStrategyKind,
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub reset_buckets_on_reload: bool,
    /// Pub/sub channel carrying rule-change notifications.
    pub channel: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            strategy: ReloadStrategyKind::PubSub,
            polling_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
            reset_buckets_on_reload: true,
            channel: crate::notifier::DEFAULT_RELOAD_CHANNEL.to_string(),
        }
    }
}

/// Rule-set cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    /// `None` disables entry expiry; reloads then carry all invalidation.
    #[serde(with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Shared KV store settings. An empty URI selects the in-process store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub uri: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub mode: StoreMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            timeout: Duration::from_millis(500),
            mode: StoreMode::Standalone,
        }
    }
}

/// Top-level FluxGate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxGateConfig {
    /// Master switch; a disabled gate passes every request through.
    pub filter_enabled: bool,
    /// Rule-set evaluated for every gated request.
    pub default_rule_set_id: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub missing_rule_behavior: MissingRuleBehavior,
    /// Header consulted for the client address when trusted.
    pub client_ip_header: String,
    pub trust_client_ip_header: bool,
    pub user_id_header: String,
    pub api_key_header: String,
    pub wait_for_refill: WaitForRefillConfig,
    pub reload: ReloadConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub bind_address: String,
}

impl Default for FluxGateConfig {
    fn default() -> Self {
        Self {
            filter_enabled: true,
            default_rule_set_id: "default".to_string(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            missing_rule_behavior: MissingRuleBehavior::Allow,
            client_ip_header: "X-Forwarded-For".to_string(),
            trust_client_ip_header: true,
            user_id_header: "X-User-Id".to_string(),
            api_key_header: "X-Api-Key".to_string(),
            wait_for_refill: WaitForRefillConfig::default(),
            reload: ReloadConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl FluxGateConfig {
    /// Loads configuration from `FLUXGATE_*` environment variables on top
    /// of the defaults, then validates.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = var("FLUXGATE_FILTER_ENABLED") {
            config.filter_enabled = parse_bool("FLUXGATE_FILTER_ENABLED", &v)?;
        }
        if let Some(v) = var("FLUXGATE_DEFAULT_RULE_SET_ID") {
            config.default_rule_set_id = v;
        }
        if let Some(v) = var("FLUXGATE_INCLUDE_PATTERNS") {
            config.include_patterns = parse_list(&v);
        }
        if let Some(v) = var("FLUXGATE_EXCLUDE_PATTERNS") {
            config.exclude_patterns = parse_list(&v);
        }
        if let Some(v) = var("FLUXGATE_MISSING_RULE_BEHAVIOR") {
            config.missing_rule_behavior = v.parse()?;
        }
        if let Some(v) = var("FLUXGATE_CLIENT_IP_HEADER") {
            config.client_ip_header = v;
        }
        if let Some(v) = var("FLUXGATE_TRUST_CLIENT_IP_HEADER") {
            config.trust_client_ip_header = parse_bool("FLUXGATE_TRUST_CLIENT_IP_HEADER", &v)?;
        }
        if let Some(v) = var("FLUXGATE_USER_ID_HEADER") {
            config.user_id_header = v;
        }
        if let Some(v) = var("FLUXGATE_API_KEY_HEADER") {
            config.api_key_header = v;
        }
        if let Some(v) = var("FLUXGATE_WAIT_FOR_REFILL_ENABLED") {
            config.wait_for_refill.enabled = parse_bool("FLUXGATE_WAIT_FOR_REFILL_ENABLED", &v)?;
        }
        if let Some(v) = var("FLUXGATE_WAIT_FOR_REFILL_MAX_WAIT_MS") {
            config.wait_for_refill.max_wait_ms =
                parse_number("FLUXGATE_WAIT_FOR_REFILL_MAX_WAIT_MS", &v)?;
        }
        if let Some(v) = var("FLUXGATE_WAIT_FOR_REFILL_MAX_CONCURRENT_WAITS") {
            config.wait_for_refill.max_concurrent_waits =
                parse_number("FLUXGATE_WAIT_FOR_REFILL_MAX_CONCURRENT_WAITS", &v)?;
        }
        if let Some(v) = var("FLUXGATE_RELOAD_STRATEGY") {
            config.reload.strategy = v.parse()?;
        }
        if let Some(v) = var("FLUXGATE_RELOAD_POLLING_INTERVAL") {
            config.reload.polling_interval = parse_duration("FLUXGATE_RELOAD_POLLING_INTERVAL", &v)?;
        }
        if let Some(v) = var("FLUXGATE_RELOAD_INITIAL_DELAY") {
            config.reload.initial_delay = parse_duration("FLUXGATE_RELOAD_INITIAL_DELAY", &v)?;
        }
        if let Some(v) = var("FLUXGATE_RELOAD_RESET_BUCKETS_ON_RELOAD") {
            config.reload.reset_buckets_on_reload =
                parse_bool("FLUXGATE_RELOAD_RESET_BUCKETS_ON_RELOAD", &v)?;
        }
        if let Some(v) = var("FLUXGATE_RELOAD_CHANNEL") {
            config.reload.channel = v;
        }
        if let Some(v) = var("FLUXGATE_CACHE_MAX_SIZE") {
            config.cache.max_size = parse_number("FLUXGATE_CACHE_MAX_SIZE", &v)?;
        }
        if let Some(v) = var("FLUXGATE_CACHE_TTL") {
            config.cache.ttl = if v.is_empty() || v.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_duration("FLUXGATE_CACHE_TTL", &v)?)
            };
        }
        if let Some(v) = var("FLUXGATE_STORE_URI") {
            config.store.uri = v;
        }
        if let Some(v) = var("FLUXGATE_STORE_TIMEOUT") {
            config.store.timeout = parse_duration("FLUXGATE_STORE_TIMEOUT", &v)?;
        }
        if let Some(v) = var("FLUXGATE_STORE_MODE") {
            config.store.mode = v.parse()?;
        }
        if let Some(v) = var("FLUXGATE_BIND_ADDRESS") {
            config.bind_address = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_rule_set_id.is_empty() {
            return Err(FluxGateError::ConfigurationMissing {
                key: "FLUXGATE_DEFAULT_RULE_SET_ID".to_string(),
            });
        }
        if self.default_rule_set_id.contains(':') {
            return Err(FluxGateError::ConfigurationInvalid(
                "default-rule-set-id must not contain ':'".to_string(),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(FluxGateError::ConfigurationInvalid(
                "cache.max-size must be >= 1".to_string(),
            ));
        }
        if self.store.timeout.is_zero() {
            return Err(FluxGateError::ConfigurationInvalid(
                "store.timeout must be positive".to_string(),
            ));
        }
        if self.reload.strategy == ReloadStrategyKind::Polling
            && self.reload.polling_interval.is_zero()
        {
            return Err(FluxGateError::ConfigurationInvalid(
                "reload.polling-interval must be positive".to_string(),
            ));
        }
        if self.reload.strategy == ReloadStrategyKind::PubSub && self.reload.channel.is_empty() {
            return Err(FluxGateError::ConfigurationInvalid(
                "reload.channel must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the shared store is configured; otherwise the in-process
    /// store serves a single instance.
    pub fn uses_shared_store(&self) -> bool {
        !self.store.uri.is_empty()
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(FluxGateError::ConfigurationInvalid(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        FluxGateError::ConfigurationInvalid(format!("{key} must be a number, got '{value}'"))
    })
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        FluxGateError::ConfigurationInvalid(format!("{key} is not a duration: {e}"))
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
