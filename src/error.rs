//! # Error Types and Classification
//!
//! FluxGate uses a closed set of error kinds rather than a deep hierarchy.
//! Callers pattern-match on the variant and consult [`FluxGateError::retryable`]
//! to decide whether an operation may be attempted again.
//!
//! ## Error Kinds
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Kind                   │  Meaning                      │  Retryable │
//! │  ───────────────────────┼───────────────────────────────┼─────────── │
//! │  ConfigurationMissing   │  required setting absent      │  no        │
//! │  ConfigurationInvalid   │  rule/band/setting violation  │  no        │
//! │  StoreConnection        │  transport error to a store   │  yes       │
//! │  Timeout                │  operation exceeded timeout   │  yes       │
//! │  ScriptExecution        │  store-side script failure    │  yes       │
//! │  RuleExecution          │  internal evaluation error    │  yes       │
//! │  Serialization          │  (de)serialization failure    │  no        │
//! │  InvalidKey             │  resolver produced no key     │  no        │
//! │  InvalidArgument        │  caller contract violation    │  no        │
//! │  Notification           │  rule-change publish failed   │  no        │
//! │  CircuitOpen            │  downstream suppressed        │  no        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Errors raised on the request path are never surfaced to clients: the
//! orchestrator logs them with the request trace id and admits the request
//! (fail-open). Errors in the notification path never fail the admin
//! operation that triggered them.

use std::time::Duration;
use thiserror::Error;

/// The closed error taxonomy for all FluxGate operations.
#[derive(Debug, Error)]
pub enum FluxGateError {
    /// A required configuration setting is absent.
    #[error("missing configuration: {key}")]
    ConfigurationMissing { key: String },

    /// A configuration value or rule document violates an invariant.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Transport failure talking to the bucket or rule store.
    #[error("store connection error: {0}")]
    StoreConnection(String),

    /// An operation exceeded its configured timeout.
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// The store-side script raised or went missing.
    #[error("script execution error: {0}")]
    ScriptExecution(String),

    /// Internal rate-limit evaluation error.
    #[error("rule execution error: {0}")]
    RuleExecution(String),

    /// JSON (de)serialization of a rule document or payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The key resolver produced a null or empty bucket key.
    #[error("invalid rate limit key: {0}")]
    InvalidKey(String),

    /// The caller violated an argument contract (e.g. non-positive permits).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Publishing a rule-change notification failed.
    #[error("notification error: {0}")]
    Notification(String),

    /// The publisher circuit is open; the downstream is suppressed.
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

impl FluxGateError {
    /// Whether the failed operation may be retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            FluxGateError::StoreConnection(_)
                | FluxGateError::Timeout { .. }
                | FluxGateError::ScriptExecution(_)
                | FluxGateError::RuleExecution(_)
        )
    }

    /// Classifies a Redis error into the FluxGate taxonomy.
    ///
    /// Timeouts map to [`FluxGateError::Timeout`], transport problems to
    /// [`FluxGateError::StoreConnection`], and everything the server itself
    /// reported (script errors included) to [`FluxGateError::ScriptExecution`].
    pub fn from_store(operation: &str, err: redis::RedisError) -> Self {
        if err.is_timeout() {
            FluxGateError::Timeout {
                operation: operation.to_string(),
            }
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            FluxGateError::StoreConnection(format!("{operation}: {err}"))
        } else if err.kind() == redis::ErrorKind::NoScriptError {
            FluxGateError::ScriptExecution(format!("{operation}: script not loaded"))
        } else {
            FluxGateError::ScriptExecution(format!("{operation}: {err}"))
        }
    }
}

impl From<serde_json::Error> for FluxGateError {
    fn from(err: serde_json::Error) -> Self {
        FluxGateError::Serialization(err.to_string())
    }
}

/// Result type alias for FluxGate operations.
pub type Result<T> = std::result::Result<T, FluxGateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_kinds_are_retryable() {
        assert!(FluxGateError::StoreConnection("refused".into()).retryable());
        assert!(FluxGateError::Timeout {
            operation: "try_consume".into()
        }
        .retryable());
        assert!(FluxGateError::ScriptExecution("boom".into()).retryable());
    }

    #[test]
    fn contract_violations_are_not_retryable() {
        assert!(!FluxGateError::InvalidArgument("permits".into()).retryable());
        assert!(!FluxGateError::Serialization("bad json".into()).retryable());
        assert!(!FluxGateError::ConfigurationInvalid("empty bands".into()).retryable());
        assert!(!FluxGateError::CircuitOpen {
            retry_in: Duration::from_secs(5)
        }
        .retryable());
    }
}
