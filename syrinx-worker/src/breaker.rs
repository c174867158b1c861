//! Per-worker circuit breaker.
//!
//! Wraps a worker's request path with a three-state failure isolator
//! driven by a sliding window of outcomes: fail fast while the child is
//! unreliable, probe cautiously before restoring full traffic.
//!
//! Local refusals (`worker_queue_full`, `worker_not_ready`) never touch
//! the window: they say nothing about the child's health, only about
//! momentary load, and counting them would open circuits on busy but
//! perfectly healthy workers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use syrinx_protocol::{CircuitState, WorkerError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Circuit breaker tuning.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure rate over the window that opens the circuit, in `[0, 1]`.
    pub failure_threshold: f64,

    /// Per-call deadline enforced inside the breaker. A timeout counts
    /// as a failure.
    pub timeout: Duration,

    /// Time spent OPEN before the next call probes in HALF_OPEN.
    pub reset_timeout: Duration,

    /// Consecutive HALF_OPEN successes required to close.
    pub success_threshold: u32,

    /// Capacity of the sliding outcome window.
    pub sliding_window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            timeout: Duration::from_secs(20),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
            sliding_window_size: 10,
        }
    }
}

/// What a breaker-wrapped call can fail with.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was rejected without running.
    #[error("circuit open")]
    Open,

    /// The breaker's own deadline elapsed. Counted as a failure.
    #[error("call exceeded breaker deadline of {0:?}")]
    Timeout(Duration),

    /// The wrapped call itself failed.
    #[error(transparent)]
    Inner(E),
}

/// Events the breaker emits to an attached sink.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// A committed state transition.
    StateChange {
        /// State before the transition.
        from: CircuitState,
        /// State after the transition.
        to: CircuitState,
    },
    /// A recorded failure.
    Failure {
        /// Description of the failing outcome.
        error: String,
        /// Failure rate over the window after recording.
        failure_rate: f64,
        /// How long the failing call ran.
        response_ms: u64,
        /// Breaker state after recording.
        state: CircuitState,
    },
}

/// Detailed status view for health snapshots.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Current state.
    pub state: CircuitState,
    /// The window's entries, oldest first (`true` = success).
    pub window: Vec<bool>,
    /// Failure rate over the current window.
    pub failure_rate: f64,
    /// Calls that ran (admitted and completed either way).
    pub total_calls: u64,
    /// Calls rejected while open.
    pub rejected_calls: u64,
    /// Current HALF_OPEN success streak.
    pub half_open_successes: u32,
    /// Milliseconds since the last recorded failure, when there was one.
    pub ms_since_last_failure: Option<u64>,
}

struct BreakerInner {
    state: CircuitState,
    window: VecDeque<bool>,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    total_calls: u64,
    rejected_calls: u64,
    events: Option<mpsc::UnboundedSender<BreakerEvent>>,
}

impl BreakerInner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let fails = self.window.iter().filter(|ok| !**ok).count();
        fails as f64 / self.window.len() as f64
    }

    fn emit(&self, event: BreakerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn transition(&mut self, to: CircuitState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        tracing::info!(%from, %to, "circuit state change");
        self.emit(BreakerEvent::StateChange { from, to });
    }
}

/// A three-state circuit breaker over a sliding outcome window.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// A closed breaker with an empty window.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                half_open_successes: 0,
                last_failure: None,
                total_calls: 0,
                rejected_calls: 0,
                events: None,
            }),
        }
    }

    /// Attach an event sink. Replaces any previous sink.
    pub fn set_event_sink(&self, tx: mpsc::UnboundedSender<BreakerEvent>) {
        self.lock().events = Some(tx);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Window updates are short critical sections; a poisoned lock
        // means a panic mid-update, which the scheduler must survive.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `fut` through the breaker.
    ///
    /// Rejects immediately with [`BreakerError::Open`] while the circuit
    /// is open; otherwise races `fut` against the breaker deadline and
    /// records the outcome in the sliding window. Errors that
    /// [`WorkerError::is_reselectable`] are passed through without
    /// recording an outcome.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T, BreakerError<WorkerError>>
    where
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        self.admit()?;
        let started = Instant::now();
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if !e.is_reselectable() {
                    self.record_failure(&e.to_string(), started.elapsed());
                }
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                let elapsed = started.elapsed();
                self.record_failure("breaker deadline exceeded", elapsed);
                Err(BreakerError::Timeout(self.config.timeout))
            }
        }
    }

    /// Whether a call made right now would be admitted.
    ///
    /// True in CLOSED and HALF_OPEN, and in OPEN once the reset timeout
    /// has elapsed (the next call transitions to HALF_OPEN and probes).
    pub fn admits(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner
                .last_failure
                .is_none_or(|at| at.elapsed() >= self.config.reset_timeout),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn admit(&self) -> Result<(), BreakerError<WorkerError>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.total_calls += 1;
                Ok(())
            }
            CircuitState::Open => {
                let reset_elapsed = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if reset_elapsed {
                    inner.transition(CircuitState::HalfOpen);
                    inner.half_open_successes = 0;
                    inner.total_calls += 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(BreakerError::Open)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                push_outcome(&mut inner.window, true, self.config.sliding_window_size);
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.window.clear();
                    inner.half_open_successes = 0;
                    inner.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, error: &str, elapsed: Duration) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                push_outcome(&mut inner.window, false, self.config.sliding_window_size);
                // The rate is meaningful only over a full window; a
                // single early failure must not open the circuit.
                if inner.window.len() >= self.config.sliding_window_size
                    && inner.failure_rate() >= self.config.failure_threshold
                {
                    inner.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        let event = BreakerEvent::Failure {
            error: error.to_owned(),
            failure_rate: inner.failure_rate(),
            response_ms: elapsed.as_millis() as u64,
            state: inner.state,
        };
        inner.emit(event);
    }

    /// Force the circuit open. Emergency/testing control.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.transition(CircuitState::Open);
    }

    /// Force the circuit closed and reset the window.
    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.window.clear();
        inner.half_open_successes = 0;
        inner.transition(CircuitState::Closed);
    }

    /// Detailed status for health snapshots.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            state: inner.state,
            window: inner.window.iter().copied().collect(),
            failure_rate: inner.failure_rate(),
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            half_open_successes: inner.half_open_successes,
            ms_since_last_failure: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

fn push_outcome(window: &mut VecDeque<bool>, outcome: bool, cap: usize) {
    window.push_back(outcome);
    while window.len() > cap {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syrinx_protocol::WorkerId;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 0.5,
            timeout: Duration::from_secs(1),
            reset_timeout: Duration::from_millis(100),
            success_threshold: 2,
            sliding_window_size: 4,
        }
    }

    fn child_error() -> WorkerError {
        WorkerError::Synthesis {
            worker: WorkerId::new("w"),
            code: "synthesis_failed".into(),
            message: "boom".into(),
        }
    }

    /// Opens on a single failure: window of one, threshold 1.0.
    fn trippy_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 1.0,
            timeout: Duration::from_secs(1),
            reset_timeout: Duration::from_millis(100),
            success_threshold: 2,
            sliding_window_size: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<WorkerError>> {
        breaker.call(async { Err::<(), _>(child_error()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<WorkerError>> {
        breaker.call(async { Ok::<_, WorkerError>(()) }).await
    }

    #[tokio::test]
    async fn opens_at_the_failure_threshold_over_a_full_window() {
        let breaker = CircuitBreaker::new(config());
        assert!(succeed(&breaker).await.is_ok());
        assert!(succeed(&breaker).await.is_ok());

        // Three outcomes, one bad: the window is not full yet.
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Fourth outcome fills the window at rate 0.5 and opens it.
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.admits());

        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
        assert_eq!(breaker.status().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_after_success_streak() {
        let breaker = CircuitBreaker::new(trippy_config());
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.admits());

        // First probe transitions open -> half_open and succeeds.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second success reaches the threshold and closes with a clean window.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.status().window.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(trippy_config());
        fail(&breaker).await.ok();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.admits());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_deadline_counts_as_failure() {
        let mut cfg = config();
        cfg.timeout = Duration::from_millis(50);
        cfg.failure_threshold = 1.0;
        cfg.sliding_window_size = 1;
        let breaker = CircuitBreaker::new(cfg);

        let result: Result<(), _> = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn local_refusals_do_not_touch_the_window() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..8 {
            let result: Result<(), _> = breaker
                .call(async {
                    Err(WorkerError::QueueFull {
                        worker: WorkerId::new("w"),
                        pending: 8,
                    })
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.status().window.is_empty());
    }

    #[tokio::test]
    async fn window_never_exceeds_capacity() {
        let mut cfg = config();
        cfg.failure_threshold = 1.1; // never opens
        let breaker = CircuitBreaker::new(cfg);
        for i in 0..50 {
            if i % 3 == 0 {
                fail(&breaker).await.ok();
            } else {
                succeed(&breaker).await.ok();
            }
            assert!(breaker.status().window.len() <= 4);
        }
    }

    #[tokio::test]
    async fn manual_controls_emit_state_changes() {
        let breaker = CircuitBreaker::new(config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        breaker.set_event_sink(tx);

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            BreakerEvent::StateChange {
                from: CircuitState::Closed,
                to: CircuitState::Open
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            BreakerEvent::StateChange {
                from: CircuitState::Open,
                to: CircuitState::Closed
            }
        ));
    }
}
