//! # FluxGate - Distributed HTTP Rate Limiting Middleware
//!
//! FluxGate sits in front of an application's request handling and decides,
//! per request, whether to admit, delay, or reject it. Decisions come from
//! configurable rules held in a rule store and from multi-band token-bucket
//! state held in a shared Redis, updated atomically by a server-side script.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐     ┌─────────────────────────────────┐     ┌─────────────┐
//! │  Client  │────▶│        FluxGate Middleware      │────▶│  Upstream   │
//! └──────────┘     │                                 │     │ Application │
//!                  │  filter ▶ context ▶ rate limit  │     └─────────────┘
//!                  └────────┬───────────────┬────────┘
//!                           ▼               ▼
//!                  ┌─────────────┐   ┌─────────────┐
//!                  │ Rule store  │   │   Redis     │
//!                  │ (documents) │   │ (buckets +  │
//!                  │  + cache    │   │  pub/sub)   │
//!                  └─────────────┘   └─────────────┘
//! ```
//!
//! ## Core Components
//!
//! - **[`middleware::RequestOrchestrator`]** - per-request composition:
//!   pattern filter, context build, decision, wait-for-refill, headers
//! - **[`rate_limiter::RateLimiter`]** - evaluates a rule-set, folding
//!   per-band bucket states into one decision
//! - **[`store::TokenBucketStore`]** - atomic multi-band consume against
//!   Redis ([`redis_store`]) or in-process state ([`memory_store`])
//! - **[`provider::CachingRuleSetProvider`]** - cached rule-set assembly
//!   from the rule repository
//! - **[`reload`]** - hot-reload of rules via polling or pub/sub, with
//!   cache invalidation and bucket resets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxgate::config::FluxGateConfig;
//! use fluxgate::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FluxGateConfig::from_env()?;
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Request Flow
//!
//! 1. The middleware filters the path against include/exclude patterns
//! 2. A trace id is established and a [`context::RequestContext`] built
//! 3. The rate limiter loads the configured rule-set (cached) and consumes
//!    one permit from every band of every enabled rule
//! 4. The response carries `X-RateLimit-Remaining`; rejections get a 429
//!    with `Retry-After`, or a bounded in-request wait when the rule's
//!    policy is WAIT_FOR_REFILL
//! 5. Any evaluation error fails open: the request is admitted and logged
//!
//! ## Storage Modes
//!
//! | Mode        | Use Case                        | State            |
//! |-------------|---------------------------------|------------------|
//! | In-process  | Development, single instance    | Process memory   |
//! | Shared      | Production, multiple instances  | Redis            |

pub mod bucket_reset;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod key_resolver;
pub mod matcher;
pub mod memory_store;
pub mod metrics;
pub mod middleware;
pub mod notifier;
pub mod provider;
pub mod rate_limiter;
pub mod redis_store;
pub mod reload;
pub mod repository;
pub mod rule;
pub mod rule_set;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use config::FluxGateConfig;
pub use context::RequestContext;
pub use error::{FluxGateError, Result};
pub use rate_limiter::{RateLimitResult, RateLimiter};
pub use rule::{OnLimitExceedPolicy, RateLimitBand, RateLimitRule, RuleScope};
pub use rule_set::RateLimitRuleSet;
pub use store::{BucketState, TokenBucketStore};

/// Version of the fluxgate library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
