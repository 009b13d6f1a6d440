//! # HTTP Server and Component Wiring
//!
//! Builds the full FluxGate stack from configuration and serves it behind
//! an Axum router:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Server                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware: TraceLayer ─▶ CorsLayer ─▶ fluxgate gate       │
//! │                                                             │
//! │  Routes:                                                    │
//! │  ├── GET /health    liveness + store reachability           │
//! │  ├── GET /metrics   decision counters + cache stats         │
//! │  └── fallback       demo upstream (200, admitted traffic)   │
//! │                                                             │
//! │  Background: reload strategy (polling or pub/sub)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! With `FLUXGATE_STORE_URI` set, bucket state, rule documents, and the
//! notification channel all live in the shared Redis; without it the gate
//! runs single-instance on the in-process store.
//!
//! Shutdown is graceful: SIGINT/SIGTERM stop the listener, then the reload
//! strategy is stopped before exit.

use crate::bucket_reset::{BucketResetHandler, MemoryBucketReset, RedisBucketReset, ResetOnReloadListener};
use crate::cache::RuleCache;
use crate::config::{FluxGateConfig, ReloadStrategyKind};
use crate::context::NoopCustomizer;
use crate::error::{FluxGateError, Result};
use crate::key_resolver::ScopeKeyResolver;
use crate::memory_store::MemoryBucketStore;
use crate::metrics::{CompositeMetricsRecorder, CountingMetricsRecorder, MetricsRecorder};
use crate::middleware::{fluxgate_middleware, RequestOrchestrator};
use crate::provider::{CachingRuleSetProvider, RepositoryRuleSetProvider, RuleSetProvider};
use crate::rate_limiter::RateLimiter;
use crate::redis_store::RedisBucketStore;
use crate::reload::{PollingReloadStrategy, PubSubReloadStrategy, ReloadStrategy};
use crate::repository::{MemoryRuleRepository, RedisRuleRepository, RuleRepository};
use crate::store::TokenBucketStore;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use redis::aio::ConnectionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Everything the gate runs on, assembled from one configuration.
pub struct GateRuntime {
    pub config: FluxGateConfig,
    pub store: Arc<dyn TokenBucketStore>,
    pub repository: Arc<dyn RuleRepository>,
    pub cache: Arc<RuleCache>,
    pub provider: Arc<CachingRuleSetProvider>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub reload_strategy: Arc<dyn ReloadStrategy>,
    pub counters: Arc<CountingMetricsRecorder>,
}

impl GateRuntime {
    /// Wires the whole stack. With a store URI this connects to Redis and
    /// uploads the consume script; otherwise everything is in-process.
    pub async fn build(config: FluxGateConfig) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(CountingMetricsRecorder::new());
        let recorder: Arc<dyn MetricsRecorder> = Arc::new(CompositeMetricsRecorder::new(vec![
            counters.clone() as Arc<dyn MetricsRecorder>,
        ]));

        let cache = Arc::new(RuleCache::new(config.cache.max_size, config.cache.ttl));

        let (store, repository, reset_handler, redis_client): (
            Arc<dyn TokenBucketStore>,
            Arc<dyn RuleRepository>,
            Arc<dyn BucketResetHandler>,
            Option<redis::Client>,
        ) = if config.uses_shared_store() {
            let client = redis::Client::open(config.store.uri.as_str()).map_err(|e| {
                FluxGateError::StoreConnection(format!("invalid store uri: {e}"))
            })?;
            let conn = ConnectionManager::new(client.clone())
                .await
                .map_err(|e| FluxGateError::from_store("connect", e))?;
            let store =
                Arc::new(RedisBucketStore::with_connection(conn.clone(), config.store.timeout).await?);
            let repository = Arc::new(RedisRuleRepository::new(conn.clone()));
            let reset = Arc::new(RedisBucketReset::new(conn));
            info!(uri = %config.store.uri, mode = ?config.store.mode, "connected to shared store");
            (store, repository, reset, Some(client))
        } else {
            info!("no store uri configured, running on the in-process store");
            let store = Arc::new(MemoryBucketStore::new());
            let repository = Arc::new(MemoryRuleRepository::new());
            let reset = Arc::new(MemoryBucketReset::new(store.clone()));
            (store, repository, reset, None)
        };

        let backing_provider: Arc<dyn RuleSetProvider> = Arc::new(RepositoryRuleSetProvider::new(
            repository.clone(),
            Arc::new(ScopeKeyResolver),
            Some(recorder),
        ));
        let provider = Arc::new(CachingRuleSetProvider::new(
            backing_provider.clone(),
            cache.clone(),
        ));

        let reload_strategy: Arc<dyn ReloadStrategy> = match (config.reload.strategy, &redis_client)
        {
            (ReloadStrategyKind::PubSub, Some(client)) => Arc::new(PubSubReloadStrategy::new(
                client.clone(),
                config.reload.channel.clone(),
            )),
            (ReloadStrategyKind::PubSub, None) => {
                warn!("pub/sub reload needs a shared store, falling back to polling");
                Arc::new(PollingReloadStrategy::new(
                    backing_provider.clone(),
                    cache.clone(),
                    config.reload.polling_interval,
                    config.reload.initial_delay,
                ))
            }
            (ReloadStrategyKind::Polling, _) => Arc::new(PollingReloadStrategy::new(
                backing_provider.clone(),
                cache.clone(),
                config.reload.polling_interval,
                config.reload.initial_delay,
            )),
        };

        // The provider registers itself; the strategy only ever sees the
        // listener list.
        reload_strategy.add_listener(provider.clone());
        if config.reload.reset_buckets_on_reload {
            reload_strategy.add_listener(Arc::new(ResetOnReloadListener::new(reset_handler)));
        }

        let limiter = RateLimiter::new(store.clone());
        let orchestrator = Arc::new(RequestOrchestrator::new(
            config.clone(),
            provider.clone(),
            limiter,
            Arc::new(NoopCustomizer),
        )?);

        Ok(Self {
            config,
            store,
            repository,
            cache,
            provider,
            orchestrator,
            reload_strategy,
            counters,
        })
    }
}

/// Shared state of the operational endpoints.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn TokenBucketStore>,
    cache: Arc<RuleCache>,
    counters: Arc<CountingMetricsRecorder>,
    orchestrator: Arc<RequestOrchestrator>,
    started_at: Instant,
}

/// HTTP server for the standalone gate.
pub struct Server {
    app: Router,
    bind_address: String,
    reload_strategy: Arc<dyn ReloadStrategy>,
}

/// Builds the router: operational endpoints plus the gate middleware in
/// front of the demo upstream.
pub fn create_app(runtime: &GateRuntime) -> Router {
    let state = AppState {
        store: runtime.store.clone(),
        cache: runtime.cache.clone(),
        counters: runtime.counters.clone(),
        orchestrator: runtime.orchestrator.clone(),
        started_at: Instant::now(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(demo_upstream)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            runtime.orchestrator.clone(),
            fluxgate_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

impl Server {
    pub async fn new(config: FluxGateConfig) -> Result<Self> {
        let bind_address = config.bind_address.clone();
        let runtime = GateRuntime::build(config).await?;
        runtime.reload_strategy.start().await?;
        let app = create_app(&runtime);
        Ok(Self {
            app,
            bind_address,
            reload_strategy: runtime.reload_strategy,
        })
    }

    /// Serves until SIGINT/SIGTERM, then stops the reload strategy.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| {
                FluxGateError::ConfigurationInvalid(format!(
                    "cannot bind {}: {e}",
                    self.bind_address
                ))
            })?;
        info!(bind = %self.bind_address, "fluxgate listening");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| FluxGateError::ConfigurationInvalid(format!("server error: {e}")))?;

        self.reload_strategy.stop().await;
        info!("fluxgate stopped");
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_reachable = state.store.ping().await.is_ok();
    let status = if store_reachable { "healthy" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "store_reachable": store_reachable,
        "version": crate::VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "decisions": state.counters.snapshot(),
        "cache": state.cache.stats(),
        "evaluation_errors": state.orchestrator.evaluation_errors(),
    }))
}

/// Stand-in upstream so the standalone binary has traffic to protect.
async fn demo_upstream() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Completes on Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received terminate signal, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_builds_in_local_mode() {
        let runtime = GateRuntime::build(FluxGateConfig::default()).await.unwrap();
        assert!(runtime.store.ping().await.is_ok());
        assert!(!runtime.reload_strategy.is_running());
    }

    #[tokio::test]
    async fn reload_strategy_start_and_stop_are_idempotent() {
        let runtime = GateRuntime::build(FluxGateConfig::default()).await.unwrap();
        runtime.reload_strategy.start().await.unwrap();
        runtime.reload_strategy.start().await.unwrap();
        assert!(runtime.reload_strategy.is_running());

        runtime.reload_strategy.stop().await;
        runtime.reload_strategy.stop().await;
        assert!(!runtime.reload_strategy.is_running());
    }
}
