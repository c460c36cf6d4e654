use std::time::Duration;

use tracing::info;

use crate::params::SwapId;
use crate::state::SwapState;

pub trait SwapMetrics: Send + Sync {
    fn record_transition(&self, swap_id: &SwapId, from: SwapState, to: SwapState);
    fn record_latency(&self, stage: &'static str, elapsed: Duration);
    fn record_rejection(&self, swap_id: &SwapId, reason: &'static str);
}

#[derive(Default, Debug, Clone)]
pub struct NoopMetrics;

impl SwapMetrics for NoopMetrics {
    fn record_transition(&self, _swap_id: &SwapId, _from: SwapState, _to: SwapState) {}
    fn record_latency(&self, _stage: &'static str, _elapsed: Duration) {}
    fn record_rejection(&self, _swap_id: &SwapId, _reason: &'static str) {}
}

/// Emits every sample as a structured `metrics` log event.
#[derive(Default, Debug, Clone)]
pub struct TracingMetrics;

impl SwapMetrics for TracingMetrics {
    fn record_transition(&self, swap_id: &SwapId, from: SwapState, to: SwapState) {
        info!(target: "metrics", %swap_id, %from, %to, "transition");
    }

    fn record_latency(&self, stage: &'static str, elapsed: Duration) {
        info!(
            target: "metrics",
            stage,
            elapsed_ms = elapsed.as_millis() as u64,
            "latency"
        );
    }

    fn record_rejection(&self, swap_id: &SwapId, reason: &'static str) {
        info!(target: "metrics", %swap_id, reason, "rejection");
    }
}
