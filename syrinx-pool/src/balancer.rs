//! Worker selection policies and the autoscaling advisory.
//!
//! The balancer holds read-only, by-id knowledge about workers (EWMA
//! response times, success rates, specialties, recency) and never owns
//! them. Selection runs over a snapshot of admissible candidates the
//! dispatcher supplies, inside one short critical section.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use syrinx_protocol::{Priority, ScalingAdvice, SynthesisRequest, WorkerId};

/// Selection policy.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAlgorithm {
    /// Monotonic cursor modulo fleet size.
    RoundRobin,
    /// Fewest pending correlations wins.
    LeastConnections,
    /// Lowest EWMA response time wins.
    ResponseTime,
    /// Composite score; the default.
    #[default]
    Weighted,
}

/// The weighted policy's scoring constants.
///
/// Product-tuned; kept as plain fields so they stay replaceable knobs
/// without touching selection logic.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct WeightedKnobs {
    /// Starting score.
    pub base: f64,
    /// Penalty per pending correlation.
    pub queue_penalty: f64,
    /// Average response time is divided by this before penalizing.
    pub response_divisor: f64,
    /// Cap on the response-time penalty.
    pub response_penalty_cap: f64,
    /// Weight of the success-rate term.
    pub success_weight: f64,
    /// Bonus when the request's voice matches the worker's specialty.
    pub affinity_bonus: f64,
    /// Penalty when both are present and differ.
    pub affinity_penalty: f64,
    /// High-priority bonus on an empty queue.
    pub free_priority_boost: f64,
    /// High-priority bonus on a queue of one.
    pub short_priority_boost: f64,
    /// Penalty for a completion within the recency window; dampens
    /// hot-spotting.
    pub recency_penalty: f64,
    /// The recency window.
    pub recency_window: Duration,
}

impl Default for WeightedKnobs {
    fn default() -> Self {
        Self {
            base: 100.0,
            queue_penalty: 10.0,
            response_divisor: 10.0,
            response_penalty_cap: 50.0,
            success_weight: 20.0,
            affinity_bonus: 30.0,
            affinity_penalty: 10.0,
            free_priority_boost: 25.0,
            short_priority_boost: 10.0,
            recency_penalty: 5.0,
            recency_window: Duration::from_secs(1),
        }
    }
}

/// Balancer configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Which policy selects workers.
    pub algorithm: BalanceAlgorithm,

    /// Whether voice/specialty affinity participates in weighted
    /// scoring.
    pub model_affinity: bool,

    /// Average queue depth at or above which the advisory says scale up.
    pub scale_up_threshold: f64,

    /// Minimum fleet-wide idle time before the advisory says scale down.
    pub scale_down_threshold: Duration,

    /// Average recent response time above which the advisory says
    /// scale up.
    pub slow_response_threshold: Duration,

    /// How far back completions count toward the advisory.
    pub advisory_window: Duration,

    /// Completion history capacity.
    pub history_cap: usize,

    /// Weighted-policy constants.
    pub weighted: WeightedKnobs,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalanceAlgorithm::default(),
            model_affinity: true,
            scale_up_threshold: 2.0,
            scale_down_threshold: Duration::from_secs(30),
            slow_response_threshold: Duration::from_millis(300),
            advisory_window: Duration::from_secs(60),
            history_cap: 1000,
            weighted: WeightedKnobs::default(),
        }
    }
}

/// One admissible worker as the dispatcher snapshots it at selection
/// time.
#[derive(Debug, Clone)]
pub struct CandidateWorker {
    /// The worker's identity.
    pub id: WorkerId,
    /// Pending correlations at snapshot time.
    pub queue_depth: usize,
}

/// One worker as the autoscaling advisory observes it.
#[derive(Debug, Clone)]
pub struct FleetObservation {
    /// Pending correlations right now.
    pub queue_depth: usize,
    /// Time since the worker last completed a synthesis.
    pub idle: Duration,
}

/// Per-worker view for the metrics snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLoadView {
    /// The worker.
    pub worker: WorkerId,
    /// EWMA response time in milliseconds.
    pub avg_response_ms: f64,
    /// EWMA success rate.
    pub success_rate: f64,
    /// Registered model specialty, when set.
    pub specialty: Option<String>,
    /// Milliseconds since the last recorded completion.
    pub ms_since_completion: Option<u64>,
}

// Smoothing factor for the balancer's response-time and success EWMAs.
const EWMA_ALPHA: f64 = 0.2;

struct WorkerLoad {
    avg_response_ms: f64,
    seen_response: bool,
    success_rate: f64,
    last_completion: Option<Instant>,
    specialty: Option<String>,
}

impl Default for WorkerLoad {
    fn default() -> Self {
        Self {
            avg_response_ms: 0.0,
            seen_response: false,
            success_rate: 1.0,
            last_completion: None,
            specialty: None,
        }
    }
}

struct Completion {
    response: Duration,
    at: Instant,
}

struct BalancerInner {
    loads: HashMap<WorkerId, WorkerLoad>,
    cursor: usize,
    history: VecDeque<Completion>,
}

/// The load balancer.
pub struct LoadBalancer {
    config: BalancerConfig,
    inner: Mutex<BalancerInner>,
}

impl LoadBalancer {
    /// An empty balancer.
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BalancerInner {
                loads: HashMap::new(),
                cursor: 0,
                history: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BalancerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick one worker from the admissible candidates for `request`.
    ///
    /// Selection is deterministic given identical state: candidates are
    /// scanned in order and ties keep the earlier position.
    pub fn select(
        &self,
        candidates: &[CandidateWorker],
        request: &SynthesisRequest,
    ) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }
        let mut inner = self.lock();
        let chosen = match self.config.algorithm {
            BalanceAlgorithm::RoundRobin => {
                let idx = inner.cursor % candidates.len();
                inner.cursor = inner.cursor.wrapping_add(1);
                candidates[idx].id.clone()
            }
            BalanceAlgorithm::LeastConnections => {
                let mut best = &candidates[0];
                for c in &candidates[1..] {
                    if c.queue_depth < best.queue_depth {
                        best = c;
                    }
                }
                best.id.clone()
            }
            BalanceAlgorithm::ResponseTime => {
                let rt = |c: &CandidateWorker| {
                    inner
                        .loads
                        .get(&c.id)
                        .map(|l| l.avg_response_ms)
                        .unwrap_or(0.0)
                };
                let mut best = &candidates[0];
                let mut best_rt = rt(best);
                for c in &candidates[1..] {
                    let c_rt = rt(c);
                    if c_rt < best_rt {
                        best = c;
                        best_rt = c_rt;
                    }
                }
                best.id.clone()
            }
            BalanceAlgorithm::Weighted => {
                let mut best = &candidates[0];
                let mut best_score = self.weighted_score(&inner, best, request);
                for c in &candidates[1..] {
                    let score = self.weighted_score(&inner, c, request);
                    if score > best_score {
                        best = c;
                        best_score = score;
                    }
                }
                tracing::debug!(worker = %best.id, score = best_score, "weighted selection");
                best.id.clone()
            }
        };
        Some(chosen)
    }

    fn weighted_score(
        &self,
        inner: &BalancerInner,
        candidate: &CandidateWorker,
        request: &SynthesisRequest,
    ) -> f64 {
        let k = &self.config.weighted;
        let load = inner.loads.get(&candidate.id);
        let queue = candidate.queue_depth as f64;

        let mut score = k.base;
        score -= k.queue_penalty * queue;

        let avg_rt = load.map(|l| l.avg_response_ms).unwrap_or(0.0);
        score -= (avg_rt / k.response_divisor).min(k.response_penalty_cap);

        let success = load.map(|l| l.success_rate).unwrap_or(1.0);
        score += k.success_weight * success;

        if self.config.model_affinity {
            match (&request.voice, load.and_then(|l| l.specialty.as_deref())) {
                (Some(voice), Some(specialty)) if voice == specialty => score += k.affinity_bonus,
                (Some(_), Some(_)) => score -= k.affinity_penalty,
                _ => {}
            }
        }

        if request.priority == Priority::High {
            if candidate.queue_depth == 0 {
                score += k.free_priority_boost;
            } else if candidate.queue_depth <= 1 {
                score += k.short_priority_boost;
            }
        }

        if let Some(at) = load.and_then(|l| l.last_completion)
            && at.elapsed() < k.recency_window
        {
            score -= k.recency_penalty;
        }

        score.max(0.0)
    }

    /// Record a completed request against the chosen worker.
    pub fn record_outcome(&self, worker: &WorkerId, response: Duration, success: bool) {
        let cap = self.config.history_cap;
        let mut inner = self.lock();
        let load = inner.loads.entry(worker.clone()).or_default();

        let sample = response.as_millis() as f64;
        if load.seen_response {
            load.avg_response_ms += EWMA_ALPHA * (sample - load.avg_response_ms);
        } else {
            load.avg_response_ms = sample;
            load.seen_response = true;
        }
        let x = if success { 1.0 } else { 0.0 };
        load.success_rate += EWMA_ALPHA * (x - load.success_rate);
        load.last_completion = Some(Instant::now());

        inner.history.push_back(Completion {
            response,
            at: Instant::now(),
        });
        while inner.history.len() > cap {
            inner.history.pop_front();
        }
    }

    /// Register a worker's model specialty for affinity scoring.
    pub fn set_affinity(&self, worker: &WorkerId, voice: Option<String>) {
        let mut inner = self.lock();
        inner.loads.entry(worker.clone()).or_default().specialty = voice;
    }

    /// Drop everything known about a worker (it left the fleet).
    pub fn forget(&self, worker: &WorkerId) {
        self.lock().loads.remove(worker);
    }

    /// The non-binding scaling recommendation for the current fleet.
    pub fn advise(&self, fleet: &[FleetObservation]) -> ScalingAdvice {
        if fleet.is_empty() {
            return ScalingAdvice::NoChange;
        }

        let total_queue: usize = fleet.iter().map(|o| o.queue_depth).sum();
        let avg_queue = total_queue as f64 / fleet.len() as f64;
        if avg_queue >= self.config.scale_up_threshold {
            return ScalingAdvice::ScaleUp;
        }

        let inner = self.lock();
        let window = self.config.advisory_window;
        let recent: Vec<f64> = inner
            .history
            .iter()
            .filter(|c| c.at.elapsed() <= window)
            .map(|c| c.response.as_millis() as f64)
            .collect();
        drop(inner);
        if !recent.is_empty() {
            let avg_ms = recent.iter().sum::<f64>() / recent.len() as f64;
            if avg_ms > self.config.slow_response_threshold.as_millis() as f64 {
                return ScalingAdvice::ScaleUp;
            }
        }

        let min_idle = fleet
            .iter()
            .map(|o| o.idle)
            .min()
            .unwrap_or(Duration::ZERO);
        if total_queue == 0 && min_idle > self.config.scale_down_threshold {
            return ScalingAdvice::ScaleDown;
        }

        ScalingAdvice::NoChange
    }

    /// Per-worker load view for the metrics snapshot, ordered by id.
    pub fn view(&self) -> Vec<WorkerLoadView> {
        let inner = self.lock();
        let mut views: Vec<WorkerLoadView> = inner
            .loads
            .iter()
            .map(|(worker, load)| WorkerLoadView {
                worker: worker.clone(),
                avg_response_ms: load.avg_response_ms,
                success_rate: load.success_rate,
                specialty: load.specialty.clone(),
                ms_since_completion: load
                    .last_completion
                    .map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();
        views.sort_by(|a, b| a.worker.as_str().cmp(b.worker.as_str()));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(specs: &[(&str, usize)]) -> Vec<CandidateWorker> {
        specs
            .iter()
            .map(|(id, queue_depth)| CandidateWorker {
                id: WorkerId::new(*id),
                queue_depth: *queue_depth,
            })
            .collect()
    }

    fn balancer(algorithm: BalanceAlgorithm) -> LoadBalancer {
        let mut config = BalancerConfig::default();
        config.algorithm = algorithm;
        LoadBalancer::new(config)
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = balancer(BalanceAlgorithm::RoundRobin);
        let c = candidates(&[("a", 0), ("b", 0), ("c", 0)]);
        let req = SynthesisRequest::new("x");
        let picks: Vec<String> = (0..6)
            .map(|_| lb.select(&c, &req).unwrap().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn least_connections_prefers_the_shortest_queue() {
        let lb = balancer(BalanceAlgorithm::LeastConnections);
        let c = candidates(&[("a", 3), ("b", 1), ("c", 1)]);
        let req = SynthesisRequest::new("x");
        // Tie between b and c keeps the earlier position.
        assert_eq!(lb.select(&c, &req).unwrap().as_str(), "b");
    }

    #[test]
    fn response_time_prefers_the_fastest() {
        let lb = balancer(BalanceAlgorithm::ResponseTime);
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");
        lb.record_outcome(&a, Duration::from_millis(200), true);
        lb.record_outcome(&b, Duration::from_millis(40), true);
        let c = candidates(&[("a", 0), ("b", 0)]);
        assert_eq!(
            lb.select(&c, &SynthesisRequest::new("x")).unwrap().as_str(),
            "b"
        );
    }

    #[test]
    fn weighted_selection_is_deterministic_on_ties() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let c = candidates(&[("a", 0), ("b", 0), ("c", 0)]);
        let req = SynthesisRequest::new("x");
        for _ in 0..10 {
            assert_eq!(lb.select(&c, &req).unwrap().as_str(), "a");
        }
    }

    #[test]
    fn weighted_affinity_attracts_and_repels() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");
        lb.set_affinity(&a, Some("voice-a".into()));
        lb.set_affinity(&b, Some("voice-b".into()));
        let c = candidates(&[("a", 0), ("b", 0)]);

        let req = SynthesisRequest::new("x").with_voice("voice-b");
        assert_eq!(lb.select(&c, &req).unwrap().as_str(), "b");

        // No specialty beats a mismatched one: +0 vs -10.
        lb.set_affinity(&a, None);
        let req = SynthesisRequest::new("x").with_voice("voice-z");
        assert_eq!(lb.select(&c, &req).unwrap().as_str(), "a");
    }

    #[test]
    fn weighted_queue_penalty_beats_affinity_eventually() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let a = WorkerId::new("a");
        lb.set_affinity(&a, Some("voice-a".into()));
        // Specialist is 4 deep: 100-40+20+30 = 110; free generalist: 100+20 = 120.
        let c = candidates(&[("a", 4), ("b", 0)]);
        let req = SynthesisRequest::new("x").with_voice("voice-a");
        assert_eq!(lb.select(&c, &req).unwrap().as_str(), "b");
    }

    #[test]
    fn high_priority_boosts_free_workers() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let b = WorkerId::new("b");
        // b is slower by EWMA, but free; a busy worker loses the boost.
        lb.record_outcome(&b, Duration::from_millis(200), true);
        std::thread::sleep(Duration::from_millis(1100)); // leave the recency window
        let c = candidates(&[("a", 2), ("b", 0)]);

        let normal = SynthesisRequest::new("x");
        let high = SynthesisRequest::new("x").with_priority(Priority::High);
        // a: 100-20+20=100 ; b: 100-20+20=100 → tie keeps a.
        assert_eq!(lb.select(&c, &normal).unwrap().as_str(), "a");
        // High priority: b gains +25 on its empty queue.
        assert_eq!(lb.select(&c, &high).unwrap().as_str(), "b");
    }

    #[test]
    fn recent_completion_is_penalized() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let a = WorkerId::new("a");
        lb.record_outcome(&a, Duration::ZERO, true);
        let c = candidates(&[("a", 0), ("b", 0)]);
        // a just completed: -5 within the 1s window.
        assert_eq!(
            lb.select(&c, &SynthesisRequest::new("x")).unwrap().as_str(),
            "b"
        );
    }

    #[test]
    fn history_is_bounded() {
        let mut config = BalancerConfig::default();
        config.history_cap = 10;
        let lb = LoadBalancer::new(config);
        let a = WorkerId::new("a");
        for _ in 0..100 {
            lb.record_outcome(&a, Duration::from_millis(5), true);
        }
        assert!(lb.lock().history.len() <= 10);
    }

    #[test]
    fn advisory_scales_up_on_queue_depth() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let fleet = vec![
            FleetObservation {
                queue_depth: 3,
                idle: Duration::ZERO,
            },
            FleetObservation {
                queue_depth: 2,
                idle: Duration::ZERO,
            },
        ];
        assert_eq!(lb.advise(&fleet), ScalingAdvice::ScaleUp);
    }

    #[test]
    fn advisory_scales_up_on_slow_responses() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let a = WorkerId::new("a");
        for _ in 0..5 {
            lb.record_outcome(&a, Duration::from_millis(500), true);
        }
        let fleet = vec![FleetObservation {
            queue_depth: 0,
            idle: Duration::ZERO,
        }];
        assert_eq!(lb.advise(&fleet), ScalingAdvice::ScaleUp);
    }

    #[test]
    fn advisory_scales_down_when_everyone_is_idle() {
        let mut config = BalancerConfig::default();
        config.scale_down_threshold = Duration::from_millis(10);
        let lb = LoadBalancer::new(config);
        let fleet = vec![
            FleetObservation {
                queue_depth: 0,
                idle: Duration::from_secs(60),
            },
            FleetObservation {
                queue_depth: 0,
                idle: Duration::from_secs(90),
            },
        ];
        assert_eq!(lb.advise(&fleet), ScalingAdvice::ScaleDown);
    }

    #[test]
    fn advisory_holds_otherwise() {
        let lb = balancer(BalanceAlgorithm::Weighted);
        let fleet = vec![FleetObservation {
            queue_depth: 1,
            idle: Duration::ZERO,
        }];
        assert_eq!(lb.advise(&fleet), ScalingAdvice::NoChange);
    }
}
