//! # Request Orchestrator
//!
//! Axum middleware composing the whole request path:
//!
//! ```text
//! request ──▶ pattern filter ──▶ trace id ──▶ RequestContext
//!                 │ (bypass)                        │
//!                 ▼                                 ▼
//!            next.run(...)                rate limiter evaluation
//!                                                   │
//!                        ┌──────────────────────────┼─────────────────────┐
//!                        ▼                          ▼                     ▼
//!                    allowed                    rejected              error
//!                 headers + next        WAIT_FOR_REFILL? sleep,    fail-open:
//!                                       retry once; else 429      log + next
//! ```
//!
//! Every decided response carries `X-RateLimit-Remaining` (suppressed when
//! unknown); rejections add `Retry-After` and a JSON body. Evaluation
//! errors never reach the client: the request is admitted and the error is
//! logged under the request trace id.

use crate::config::{FluxGateConfig, MissingRuleBehavior};
use crate::context::{RequestContext, RequestContextCustomizer};
use crate::error::Result;
use crate::matcher::PathFilter;
use crate::provider::RuleSetProvider;
use crate::rate_limiter::{RateLimitResult, RateLimiter};
use crate::rule::OnLimitExceedPolicy;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Trace id header accepted inbound and echoed outbound.
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Outcome of the orchestrator for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Admit; `remaining < 0` means unknown (header suppressed).
    Allowed { remaining: i64 },
    /// Respond 429 with `Retry-After: retry_after_secs`.
    Rejected { retry_after_secs: u64, remaining: i64 },
    /// Evaluation failed; admit without rate-limit headers.
    FailOpen,
}

/// Per-request composition: filtering, context building, evaluation, and
/// WAIT_FOR_REFILL arbitration.
pub struct RequestOrchestrator {
    config: FluxGateConfig,
    filter: PathFilter,
    provider: Arc<dyn RuleSetProvider>,
    limiter: RateLimiter,
    customizer: Arc<dyn RequestContextCustomizer>,
    /// Bounds the number of requests sleeping in WAIT_FOR_REFILL.
    wait_permits: Arc<Semaphore>,
    evaluation_errors: AtomicU64,
}

impl RequestOrchestrator {
    pub fn new(
        config: FluxGateConfig,
        provider: Arc<dyn RuleSetProvider>,
        limiter: RateLimiter,
        customizer: Arc<dyn RequestContextCustomizer>,
    ) -> Result<Self> {
        let filter = PathFilter::new(&config.include_patterns, &config.exclude_patterns)?;
        let wait_permits = Arc::new(Semaphore::new(config.wait_for_refill.max_concurrent_waits));
        Ok(Self {
            config,
            filter,
            provider,
            limiter,
            customizer,
            wait_permits,
            evaluation_errors: AtomicU64::new(0),
        })
    }

    /// Whether this path is gated at all.
    pub fn should_process(&self, path: &str) -> bool {
        self.config.filter_enabled && self.filter.should_process(path)
    }

    /// Evaluation errors swallowed by fail-open so far.
    pub fn evaluation_errors(&self) -> u64 {
        self.evaluation_errors.load(Ordering::Relaxed)
    }

    /// Builds the immutable context from the request surface.
    pub fn build_context(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> RequestContext {
        let mut snapshot = std::collections::HashMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                snapshot.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }

        let client_ip = if self.config.trust_client_ip_header {
            snapshot
                .get(&self.config.client_ip_header.to_ascii_lowercase())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| peer.map(|p| p.ip().to_string()))
        } else {
            peer.map(|p| p.ip().to_string())
        };

        let user_id = snapshot
            .get(&self.config.user_id_header.to_ascii_lowercase())
            .cloned();
        let api_key = snapshot
            .get(&self.config.api_key_header.to_ascii_lowercase())
            .cloned();

        let mut context = RequestContext {
            client_ip,
            user_id,
            api_key,
            endpoint: path.to_string(),
            method: method.to_string(),
            headers: snapshot,
            attributes: Default::default(),
        };
        self.customizer.customize(&mut context);
        context
    }

    /// Full decision for one request; never errors (fail-open).
    pub async fn decide(&self, context: &RequestContext) -> GateDecision {
        match self.evaluate(context).await {
            Ok(decision) => decision,
            Err(err) => {
                self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    endpoint = %context.endpoint,
                    error = %err,
                    retryable = err.retryable(),
                    "rate limit evaluation failed, admitting request"
                );
                GateDecision::FailOpen
            }
        }
    }

    async fn evaluate(&self, context: &RequestContext) -> Result<GateDecision> {
        let rule_set = self
            .provider
            .find_by_id(&self.config.default_rule_set_id)
            .await?;

        let Some(rule_set) = rule_set else {
            return Ok(match self.config.missing_rule_behavior {
                MissingRuleBehavior::Allow => {
                    debug!(
                        rule_set_id = %self.config.default_rule_set_id,
                        "rule-set missing, admitting"
                    );
                    GateDecision::Allowed { remaining: -1 }
                }
                MissingRuleBehavior::Deny => GateDecision::Rejected {
                    retry_after_secs: 0,
                    remaining: 0,
                },
            });
        };

        let result = self.limiter.try_consume(context, &rule_set, 1).await?;
        if result.allowed {
            return Ok(GateDecision::Allowed {
                remaining: result.remaining_tokens,
            });
        }

        let wants_wait = result
            .matched_rule
            .as_ref()
            .map(|r| r.on_limit_exceed_policy == OnLimitExceedPolicy::WaitForRefill)
            .unwrap_or(false);

        if wants_wait && self.config.wait_for_refill.enabled {
            let wait_ms = result.wait_millis();
            if wait_ms > self.config.wait_for_refill.max_wait_ms {
                debug!(wait_ms, "refill wait exceeds bound, rejecting");
                return Ok(rejected(&result));
            }
            // Non-blocking: a full waiting room rejects immediately rather
            // than queueing.
            let Ok(permit) = Arc::clone(&self.wait_permits).try_acquire_owned() else {
                debug!("waiting room full, rejecting");
                return Ok(rejected(&result));
            };

            debug!(wait_ms, "sleeping for refill");
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
            let retry = self.limiter.try_consume(context, &rule_set, 1).await;
            drop(permit);

            let retry = retry?;
            if retry.allowed {
                return Ok(GateDecision::Allowed {
                    remaining: retry.remaining_tokens,
                });
            }
            return Ok(rejected(&retry));
        }

        Ok(rejected(&result))
    }
}

fn rejected(result: &RateLimitResult) -> GateDecision {
    GateDecision::Rejected {
        retry_after_secs: result.retry_after_seconds(),
        remaining: result.remaining_tokens,
    }
}

/// JSON body of a 429 response.
#[derive(Debug, serde::Serialize)]
struct RateLimitExceededBody {
    error: &'static str,
    #[serde(rename = "retryAfter")]
    retry_after: u64,
}

/// The axum middleware entry point; attach with
/// `axum::middleware::from_fn_with_state(orchestrator, fluxgate_middleware)`.
pub async fn fluxgate_middleware(
    State(gate): State<Arc<RequestOrchestrator>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !gate.should_process(&path) {
        return next.run(request).await;
    }

    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!("fluxgate", trace_id = %trace_id);

    async move {
        let start = Instant::now();
        let method = request.method().as_str().to_string();
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let context = gate.build_context(&method, &path, request.headers(), peer);

        let decision = gate.decide(&context).await;
        let mut response = match decision {
            GateDecision::Allowed { .. } | GateDecision::FailOpen => {
                let response = next.run(request).await;
                info!(
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "request admitted"
                );
                response
            }
            GateDecision::Rejected { retry_after_secs, .. } => {
                warn!(
                    method = %method,
                    path = %path,
                    retry_after_secs,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "request rejected"
                );
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(RateLimitExceededBody {
                        error: "Rate limit exceeded",
                        retry_after: retry_after_secs,
                    }),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
                response
            }
        };

        if let GateDecision::Allowed { remaining } | GateDecision::Rejected { remaining, .. } =
            decision
        {
            if remaining >= 0 {
                if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                    response.headers_mut().insert("X-RateLimit-Remaining", value);
                }
            }
        }
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert(TRACE_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}
