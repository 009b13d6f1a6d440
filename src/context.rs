//! Per-request context handed to the rate limiter and key resolvers.

use std::collections::HashMap;

/// Snapshot of the request the gate is deciding on.
///
/// Built once per request by the orchestrator and treated as immutable from
/// then on. `client_ip` may be absent (unknown peer); the key resolver
/// applies deterministic fallbacks in that case.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    /// Request path as matched against include/exclude patterns.
    pub endpoint: String,
    pub method: String,
    /// Lower-cased header snapshot.
    pub headers: HashMap<String, String>,
    /// Free-form attributes, populated by a [`RequestContextCustomizer`];
    /// consulted by CUSTOM-scope rules.
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Hook for embedding applications to enrich the context before evaluation,
/// e.g. to derive a tenant id for CUSTOM-scope rules.
pub trait RequestContextCustomizer: Send + Sync {
    fn customize(&self, context: &mut RequestContext);
}

/// Default customizer; leaves the context untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCustomizer;

impl RequestContextCustomizer for NoopCustomizer {
    fn customize(&self, _context: &mut RequestContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut ctx = RequestContext::new("/api/orders", "GET");
        ctx.headers.insert("x-api-key".to_string(), "k-1".to_string());
        assert_eq!(ctx.header("X-Api-Key"), Some("k-1"));
        assert_eq!(ctx.header("missing"), None);
    }

    #[test]
    fn builder_populates_identity_fields() {
        let ctx = RequestContext::new("/api", "POST")
            .with_client_ip("1.2.3.4")
            .with_user_id("u1")
            .with_attribute("tenant", "acme");
        assert_eq!(ctx.client_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.attributes.get("tenant").map(String::as_str), Some("acme"));
    }
}
