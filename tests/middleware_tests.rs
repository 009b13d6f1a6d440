//! HTTP-level behavior of the gate middleware: filtering, headers, the 429
//! contract, wait-for-refill, and fail-open.

use axum::routing::get;
use axum::Router;
use fluxgate::cache::RuleCache;
use fluxgate::config::{FluxGateConfig, MissingRuleBehavior};
use fluxgate::context::NoopCustomizer;
use fluxgate::error::FluxGateError;
use fluxgate::key_resolver::ScopeKeyResolver;
use fluxgate::memory_store::MemoryBucketStore;
use fluxgate::middleware::{fluxgate_middleware, RequestOrchestrator};
use fluxgate::provider::{CachingRuleSetProvider, RepositoryRuleSetProvider, RuleSetProvider};
use fluxgate::rate_limiter::RateLimiter;
use fluxgate::repository::MemoryRuleRepository;
use fluxgate::rule::{OnLimitExceedPolicy, RateLimitBand, RateLimitRule, RuleScope};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn rule(capacity: i64, window: Duration, scope: RuleScope) -> RateLimitRule {
    RateLimitRule::new(
        "r1",
        "gate",
        scope,
        vec![RateLimitBand::new(window, capacity).unwrap()],
    )
}

fn orchestrator(mut config: FluxGateConfig, rules: Vec<RateLimitRule>) -> Arc<RequestOrchestrator> {
    config.default_rule_set_id = "gate".to_string();
    let provider = Arc::new(CachingRuleSetProvider::new(
        Arc::new(RepositoryRuleSetProvider::new(
            Arc::new(MemoryRuleRepository::seeded(rules)),
            Arc::new(ScopeKeyResolver),
            None,
        )),
        Arc::new(RuleCache::new(8, None)),
    ));
    let limiter = RateLimiter::new(Arc::new(MemoryBucketStore::new()));
    Arc::new(RequestOrchestrator::new(config, provider, limiter, Arc::new(NoopCustomizer)).unwrap())
}

async fn serve(gate: Arc<RequestOrchestrator>) -> String {
    let app = Router::new()
        .route("/api/orders", get(|| async { "ordered" }))
        .route("/api/health", get(|| async { "healthy" }))
        .route("/public/page", get(|| async { "public" }))
        .layer(axum::middleware::from_fn_with_state(gate, fluxgate_middleware));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn emits_remaining_header_and_429_contract() {
    let gate = orchestrator(
        FluxGateConfig::default(),
        vec![rule(2, Duration::from_secs(60), RuleScope::PerIp)],
    );
    let base = serve(gate).await;
    let client = Client::new();

    let first = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "10.0.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(
        first.headers().get("X-RateLimit-Remaining").unwrap(),
        "1"
    );
    assert!(first.headers().get("X-Trace-Id").is_some());

    client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "10.0.0.1")
        .send()
        .await
        .unwrap();

    let third = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "10.0.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 429);
    assert_eq!(third.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    let retry_after: u64 = third
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let body: serde_json::Value = third.json().await.unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retryAfter"].as_u64().unwrap(), retry_after);
}

#[tokio::test]
async fn distinct_clients_get_distinct_buckets() {
    let gate = orchestrator(
        FluxGateConfig::default(),
        vec![rule(1, Duration::from_secs(60), RuleScope::PerIp)],
    );
    let base = serve(gate).await;
    let client = Client::new();

    for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        let response = client
            .get(format!("{base}/api/orders"))
            .header("X-Forwarded-For", ip)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "first request from {ip}");
    }

    let repeat = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(repeat.status(), 429);
}

#[tokio::test]
async fn excluded_paths_bypass_the_gate_entirely() {
    let mut config = FluxGateConfig::default();
    config.include_patterns = vec!["/api/**".to_string()];
    config.exclude_patterns = vec!["/api/health".to_string()];
    let gate = orchestrator(
        config,
        vec![rule(1, Duration::from_secs(60), RuleScope::PerIp)],
    );
    let base = serve(gate).await;
    let client = Client::new();

    // Excluded and non-included paths never consume tokens.
    for _ in 0..5 {
        let health = client
            .get(format!("{base}/api/health"))
            .header("X-Forwarded-For", "9.9.9.9")
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
        assert!(health.headers().get("X-RateLimit-Remaining").is_none());

        let public = client
            .get(format!("{base}/public/page"))
            .header("X-Forwarded-For", "9.9.9.9")
            .send()
            .await
            .unwrap();
        assert_eq!(public.status(), 200);
        assert!(public.headers().get("X-RateLimit-Remaining").is_none());
    }

    // The included path still is gated.
    let gated = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "9.9.9.9")
        .send()
        .await
        .unwrap();
    assert_eq!(gated.status(), 200);
    assert_eq!(gated.headers().get("X-RateLimit-Remaining").unwrap(), "0");
}

#[tokio::test]
async fn disabled_filter_passes_everything_through() {
    let mut config = FluxGateConfig::default();
    config.filter_enabled = false;
    let gate = orchestrator(
        config,
        vec![rule(1, Duration::from_secs(60), RuleScope::PerIp)],
    );
    let base = serve(gate).await;
    let client = Client::new();

    for _ in 0..4 {
        let response = client
            .get(format!("{base}/api/orders"))
            .header("X-Forwarded-For", "1.1.1.1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("X-RateLimit-Remaining").is_none());
    }
}

#[tokio::test]
async fn wait_for_refill_delays_then_admits() {
    let mut config = FluxGateConfig::default();
    config.wait_for_refill.max_wait_ms = 2_000;
    let gate = orchestrator(
        config,
        vec![
            rule(1, Duration::from_millis(300), RuleScope::PerIp)
                .with_policy(OnLimitExceedPolicy::WaitForRefill),
        ],
    );
    let base = serve(gate).await;
    let client = Client::new();

    let first = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "5.5.5.5")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let start = Instant::now();
    let second = client
        .get(format!("{base}/api/orders"))
        .header("X-Forwarded-For", "5.5.5.5")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn deny_on_missing_rule_set_when_configured() {
    let mut config = FluxGateConfig::default();
    config.missing_rule_behavior = MissingRuleBehavior::Deny;
    let gate = orchestrator(config, vec![]);
    let base = serve(gate).await;

    let response = Client::new()
        .get(format!("{base}/api/orders"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(response.headers().get("Retry-After").unwrap(), "0");
}

struct OutageProvider;

#[async_trait::async_trait]
impl RuleSetProvider for OutageProvider {
    async fn find_by_id(
        &self,
        _: &str,
    ) -> fluxgate::error::Result<Option<Arc<fluxgate::rule_set::RateLimitRuleSet>>> {
        Err(FluxGateError::StoreConnection("connection refused".into()))
    }
}

#[tokio::test]
async fn store_outage_fails_open_at_the_http_boundary() {
    let gate = Arc::new(
        RequestOrchestrator::new(
            FluxGateConfig::default(),
            Arc::new(OutageProvider),
            RateLimiter::new(Arc::new(MemoryBucketStore::new())),
            Arc::new(NoopCustomizer),
        )
        .unwrap(),
    );
    let base = serve(gate.clone()).await;

    let response = Client::new()
        .get(format!("{base}/api/orders"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("X-RateLimit-Remaining").is_none());
    assert_eq!(gate.evaluation_errors(), 1);
}

#[tokio::test]
async fn inbound_trace_id_is_echoed() {
    let gate = orchestrator(
        FluxGateConfig::default(),
        vec![rule(5, Duration::from_secs(60), RuleScope::PerIp)],
    );
    let base = serve(gate).await;

    let response = Client::new()
        .get(format!("{base}/api/orders"))
        .header("X-Trace-Id", "trace-123")
        .header("X-Forwarded-For", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get("X-Trace-Id").unwrap(), "trace-123");
}
