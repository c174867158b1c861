//! Aggregated health and metrics snapshots.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;
use syrinx_protocol::{ScalingAdvice, WorkerId, WorkerState};
use syrinx_worker::{BreakerStatus, WorkerStats};

use crate::balancer::WorkerLoadView;

/// One worker's place in a health snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    /// The worker.
    pub id: WorkerId,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Model currently loaded.
    pub model: String,
    /// Pending correlations.
    pub queue_depth: usize,
    /// Request statistics.
    pub stats: WorkerStats,
    /// Circuit breaker status, window included.
    pub breaker: BreakerStatus,
}

/// Aggregated per-worker health, ordered by worker id.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Every worker currently in the fleet.
    pub workers: Vec<WorkerHealth>,
}

/// Latency percentiles over the recent reservoir.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyPercentiles {
    /// Median.
    pub p50_ms: u64,
    /// 95th percentile.
    pub p95_ms: u64,
    /// 99th percentile.
    pub p99_ms: u64,
}

/// The most recent scaling decision.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct ScalingDecision {
    /// What the balancer advised.
    pub advice: ScalingAdvice,
    /// Whether the dispatcher acted on it (fleet bounds can veto).
    pub applied: bool,
    /// Milliseconds since the decision.
    pub ms_ago: u64,
}

/// The dispatcher's aggregated metrics snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Requests accepted for dispatch.
    pub total_requests: u64,
    /// Requests that surfaced a failure to the caller.
    pub total_failures: u64,
    /// Failures over requests, zero when idle.
    pub error_rate: f64,
    /// Latency percentiles over recent successes.
    pub latency: LatencyPercentiles,
    /// Current fleet size.
    pub fleet_size: usize,
    /// Per-worker state, stats, and breaker windows.
    pub workers: Vec<WorkerHealth>,
    /// The balancer's scoring view.
    pub balancer: Vec<WorkerLoadView>,
    /// The most recent scaling decision, when one was made.
    pub last_scaling: Option<ScalingDecision>,
}

impl MetricsSnapshot {
    /// Render the snapshot as flat line-oriented text, one datum per
    /// line, for log shipping or a plain-text endpoint.
    pub fn render_text(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "requests_total {}", self.total_requests);
        let _ = writeln!(out, "failures_total {}", self.total_failures);
        let _ = writeln!(out, "error_rate {:.4}", self.error_rate);
        let _ = writeln!(out, "latency_p50_ms {}", self.latency.p50_ms);
        let _ = writeln!(out, "latency_p95_ms {}", self.latency.p95_ms);
        let _ = writeln!(out, "latency_p99_ms {}", self.latency.p99_ms);
        let _ = writeln!(out, "fleet_size {}", self.fleet_size);
        for w in &self.workers {
            let _ = writeln!(
                out,
                "worker{{id={},state={},circuit={}}} processed={} avg_ms={} success={:.3} queue={}",
                w.id,
                w.state,
                w.breaker.state,
                w.stats.requests_processed,
                w.stats.average_latency_ms,
                w.stats.success_rate,
                w.queue_depth,
            );
        }
        for v in &self.balancer {
            let _ = writeln!(
                out,
                "balancer{{worker={}}} avg_ms={:.1} success={:.3} specialty={}",
                v.worker,
                v.avg_response_ms,
                v.success_rate,
                v.specialty.as_deref().unwrap_or("-"),
            );
        }
        if let Some(s) = &self.last_scaling {
            let _ = writeln!(
                out,
                "scaling_last {{advice={},applied={},ms_ago={}}}",
                s.advice, s.applied, s.ms_ago
            );
        }
        out
    }
}

/// Mutable metrics state behind the dispatcher's lock.
pub(crate) struct MetricsInner {
    pub(crate) total_requests: u64,
    pub(crate) total_failures: u64,
    latencies: VecDeque<u64>,
    reservoir_cap: usize,
    pub(crate) last_scaling: Option<(ScalingAdvice, bool, Instant)>,
}

impl MetricsInner {
    pub(crate) fn new(reservoir_cap: usize) -> Self {
        Self {
            total_requests: 0,
            total_failures: 0,
            latencies: VecDeque::new(),
            reservoir_cap,
            last_scaling: None,
        }
    }

    pub(crate) fn record_success(&mut self, latency_ms: u64) {
        self.total_requests += 1;
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > self.reservoir_cap {
            self.latencies.pop_front();
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_requests += 1;
        self.total_failures += 1;
    }

    pub(crate) fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        LatencyPercentiles {
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }

    pub(crate) fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }

    pub(crate) fn scaling_decision(&self) -> Option<ScalingDecision> {
        self.last_scaling
            .as_ref()
            .map(|(advice, applied, at)| ScalingDecision {
                advice: *advice,
                applied: *applied,
                ms_ago: at.elapsed().as_millis() as u64,
            })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.50), 50);
        assert_eq!(percentile(&sorted, 0.95), 95);
        assert_eq!(percentile(&sorted, 0.99), 99);
        assert_eq!(percentile(&[7], 0.99), 7);
    }

    #[test]
    fn reservoir_is_bounded_and_rates_track() {
        let mut m = MetricsInner::new(10);
        for i in 0..50 {
            m.record_success(i);
        }
        m.record_failure();
        assert_eq!(m.total_requests, 51);
        assert_eq!(m.total_failures, 1);
        assert!(m.latencies.len() <= 10);
        assert!((m.error_rate() - 1.0 / 51.0).abs() < 1e-9);
        // Only the freshest 10 samples remain: 40..=49.
        assert_eq!(m.percentiles().p50_ms, 44);
    }
}
