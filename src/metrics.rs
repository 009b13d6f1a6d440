//! Post-decision metrics observers.
//!
//! Recorders run after every rate-limit decision. They are strictly
//! observational: a recorder that fails must not alter the decision nor
//! stop its peers from running, which the composite enforces.

use crate::context::RequestContext;
use crate::error::Result;
use crate::rate_limiter::RateLimitResult;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Observer invoked once per decided request.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, context: &RequestContext, result: &RateLimitResult) -> Result<()>;

    /// Identifier used when logging a failed recorder.
    fn name(&self) -> &str {
        "recorder"
    }
}

/// Fans one decision out to several recorders, isolating failures: a
/// recorder returning an error is logged and the remaining recorders still
/// run.
#[derive(Default)]
pub struct CompositeMetricsRecorder {
    recorders: Vec<Arc<dyn MetricsRecorder>>,
}

impl CompositeMetricsRecorder {
    pub fn new(recorders: Vec<Arc<dyn MetricsRecorder>>) -> Self {
        Self { recorders }
    }

    pub fn push(&mut self, recorder: Arc<dyn MetricsRecorder>) {
        self.recorders.push(recorder);
    }
}

impl MetricsRecorder for CompositeMetricsRecorder {
    fn record(&self, context: &RequestContext, result: &RateLimitResult) -> Result<()> {
        for recorder in &self.recorders {
            if let Err(err) = recorder.record(context, result) {
                warn!(recorder = recorder.name(), error = %err, "metrics recorder failed");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// Per-rule decision counts.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RuleCounters {
    pub allowed: u64,
    pub rejected: u64,
}

/// Totals plus a per-matched-rule breakdown, exposed by `/metrics`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub per_rule: HashMap<String, RuleCounters>,
}

/// In-process counting recorder.
#[derive(Default)]
pub struct CountingMetricsRecorder {
    snapshot: RwLock<MetricsSnapshot>,
}

impl CountingMetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().clone()
    }
}

impl MetricsRecorder for CountingMetricsRecorder {
    fn record(&self, _context: &RequestContext, result: &RateLimitResult) -> Result<()> {
        let mut snapshot = self.snapshot.write();
        snapshot.total_requests += 1;
        if result.allowed {
            snapshot.allowed_requests += 1;
        } else {
            snapshot.rejected_requests += 1;
        }
        if let Some(rule) = &result.matched_rule {
            let counters = snapshot.per_rule.entry(rule.id.clone()).or_default();
            if result.allowed {
                counters.allowed += 1;
            } else {
                counters.rejected += 1;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxGateError;
    use crate::rate_limiter::RateLimitResult;

    struct FailingRecorder;

    impl MetricsRecorder for FailingRecorder {
        fn record(&self, _: &RequestContext, _: &RateLimitResult) -> Result<()> {
            Err(FluxGateError::RuleExecution("intentional".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn composite_isolates_a_failing_recorder() {
        let counting = Arc::new(CountingMetricsRecorder::new());
        let composite = CompositeMetricsRecorder::new(vec![
            Arc::new(FailingRecorder),
            counting.clone(),
        ]);

        let ctx = RequestContext::new("/x", "GET");
        let result = RateLimitResult::allowed(None, None, 5);
        composite.record(&ctx, &result).unwrap();

        let snapshot = counting.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.allowed_requests, 1);
    }

    #[test]
    fn counting_recorder_tracks_per_rule_counts() {
        use crate::rule::{RateLimitBand, RateLimitRule, RuleScope};
        use std::time::Duration;

        let rule = RateLimitRule::new(
            "r1",
            "s",
            RuleScope::PerIp,
            vec![RateLimitBand::new(Duration::from_secs(1), 5).unwrap()],
        );
        let recorder = CountingMetricsRecorder::new();
        let ctx = RequestContext::new("/x", "GET");

        recorder
            .record(&ctx, &RateLimitResult::allowed(Some("k".into()), Some(rule.clone()), 4))
            .unwrap();
        recorder
            .record(&ctx, &RateLimitResult::rejected("k".into(), rule, 0, 1_000_000))
            .unwrap();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.rejected_requests, 1);
        let counters = snapshot.per_rule.get("r1").unwrap();
        assert_eq!(counters.allowed, 1);
        assert_eq!(counters.rejected, 1);
    }
}
