//! The caller-facing dispatcher.
//!
//! Owns the worker fleet, validates requests, consults the balancer,
//! calls the chosen worker through its circuit breaker, retries
//! transient refusals across the fleet, supervises worker health, and
//! drives autoscaling from the balancer's advisory.
//!
//! Retries are a state machine over error kinds, not cascading catches:
//! `circuit_open`, `worker_queue_full`, and `worker_not_ready` drop the
//! worker from the snapshot and re-select; `request_timeout` and
//! `worker_terminated` re-select while budget remains, then surface;
//! everything else surfaces immediately.

use std::collections::{HashMap, HashSet};
use std::path::Component;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use syrinx_protocol::{
    DispatchError, RequestId, ScalingAdvice, SynthesisRequest, SynthesisResult, WorkerError,
    WorkerEvent, WorkerEventKind, WorkerId,
};
use syrinx_worker::{Worker, WorkerConfig, WorkerLauncher};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::balancer::{BalancerConfig, CandidateWorker, FleetObservation, LoadBalancer};
use crate::metrics::{HealthSnapshot, MetricsInner, MetricsSnapshot, WorkerHealth};

/// Dispatcher configuration.
///
/// The `worker` template carries everything each spawned worker needs
/// (model, cache directory, queue cap, health cadence, breaker); the
/// fields here govern the fleet itself.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fleet floor; `initialize` fails unless this many reach READY.
    pub min_workers: usize,

    /// Fleet ceiling for autoscaling.
    pub max_workers: usize,

    /// Template for every spawned worker.
    pub worker: WorkerConfig,

    /// Balancer policy and advisory thresholds.
    pub balancer: BalancerConfig,

    /// Cadence of the autoscaling pass.
    pub autoscale_interval: Duration,

    /// Upper bound on request text length.
    pub max_text_len: usize,

    /// Whether `output_path` gets syntactic validation.
    pub validate_output_path: bool,

    /// Re-selections allowed after the first pick fails transiently.
    pub reselect_budget: usize,

    /// Latency reservoir size for the percentile metrics.
    pub latency_reservoir: usize,
}

impl PoolConfig {
    /// A config for `model`/`cache_dir` with every knob at its default.
    pub fn new(model: impl Into<String>, cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            worker: WorkerConfig::new(model, cache_dir),
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            worker: WorkerConfig::default(),
            balancer: BalancerConfig::default(),
            autoscale_interval: Duration::from_secs(5),
            max_text_len: 5000,
            validate_output_path: false,
            reselect_budget: 2,
            latency_reservoir: 1000,
        }
    }
}

struct DispatcherInner {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    fleet: RwLock<HashMap<WorkerId, Worker>>,
    balancer: LoadBalancer,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    /// Serializes scale and replacement operations.
    scale_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    metrics: StdMutex<MetricsInner>,
    worker_seq: AtomicU64,
}

impl DispatcherInner {
    fn metrics_lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_worker_id(&self) -> WorkerId {
        let n = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        WorkerId::new(format!("worker-{n}"))
    }

    /// Launch one worker and wait for READY before admitting it to the
    /// fleet.
    async fn spawn_worker(&self) -> Result<WorkerId, WorkerError> {
        let id = self.next_worker_id();
        let worker = self
            .launcher
            .launch(id.clone(), self.config.worker.clone(), self.events_tx.clone())
            .await?;
        if let Err(e) = worker.wait_ready().await {
            worker.shutdown().await;
            return Err(e);
        }
        self.fleet.write().await.insert(id.clone(), worker);
        tracing::info!(worker = %id, "worker joined the fleet");
        Ok(id)
    }

    /// Snapshot the admissible workers, excluding already-tried ones.
    /// Sorted by id so tie-breaking is deterministic.
    async fn admissible(&self, tried: &HashSet<WorkerId>) -> Vec<CandidateWorker> {
        let fleet = self.fleet.read().await;
        let mut candidates: Vec<CandidateWorker> = fleet
            .values()
            .filter(|w| {
                !tried.contains(w.id())
                    && w.state().is_serving()
                    && w.admits()
                    && w.queue_depth() < w.config().max_queue_size
            })
            .map(|w| CandidateWorker {
                id: w.id().clone(),
                queue_depth: w.queue_depth(),
            })
            .collect();
        drop(fleet);
        candidates.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        candidates
    }

    async fn synthesize(&self, mut request: SynthesisRequest) -> Result<SynthesisResult, DispatchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutdownInProgress);
        }
        if let Err(e) = self.validate(&request) {
            self.metrics_lock().record_failure();
            return Err(e);
        }

        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(RequestId::generate);
        request.request_id = Some(request_id.clone());

        let started = Instant::now();
        let mut tried: HashSet<WorkerId> = HashSet::new();
        let mut last_transient: Option<WorkerError> = None;
        let mut reselections = 0;

        loop {
            let candidates = self.admissible(&tried).await;
            let Some(chosen) = self.balancer.select(&candidates, &request) else {
                break;
            };
            let Some(worker) = self.fleet.read().await.get(&chosen).cloned() else {
                // Replaced between snapshot and lookup; spends no budget.
                tried.insert(chosen);
                continue;
            };

            match worker.synthesize(&request).await {
                Ok(resp) => {
                    let elapsed = started.elapsed();
                    self.balancer.record_outcome(&chosen, elapsed, true);
                    self.metrics_lock()
                        .record_success(elapsed.as_millis() as u64);
                    return Ok(SynthesisResult {
                        request_id,
                        output_path: resp.output_path,
                        latency_ms: elapsed.into(),
                        model_used: worker.model(),
                        worker_used: chosen,
                        cache_hit: resp.cache_hit.unwrap_or(false),
                    });
                }
                Err(e) if e.is_reselectable() => {
                    tracing::debug!(worker = %chosen, kind = e.kind(), "re-selecting");
                    tried.insert(chosen);
                    last_transient = Some(e);
                }
                Err(e) if matches!(e.kind(), "request_timeout" | "worker_terminated") => {
                    self.balancer
                        .record_outcome(&chosen, started.elapsed(), false);
                    if reselections >= self.config.reselect_budget {
                        self.metrics_lock().record_failure();
                        return Err(e.into());
                    }
                    tracing::debug!(worker = %chosen, kind = e.kind(), "retrying across the fleet");
                    tried.insert(chosen);
                    last_transient = Some(e);
                }
                Err(e) => {
                    self.balancer
                        .record_outcome(&chosen, started.elapsed(), false);
                    self.metrics_lock().record_failure();
                    tracing::warn!(worker = %chosen, kind = e.kind(), error = %e, "synthesis failed");
                    return Err(e.into());
                }
            }

            if reselections >= self.config.reselect_budget {
                break;
            }
            reselections += 1;
        }

        self.metrics_lock().record_failure();
        match last_transient {
            // Timeouts and terminations are caller-meaningful even when
            // the budget ran out mid-retry.
            Some(e) if matches!(e.kind(), "request_timeout" | "worker_terminated") => {
                Err(e.into())
            }
            // Re-selectable refusals collapse into the fleet-level error.
            _ => Err(DispatchError::NoWorkersAvailable {
                attempted: tried.len(),
            }),
        }
    }

    fn validate(&self, request: &SynthesisRequest) -> Result<(), DispatchError> {
        if request.text.is_empty() {
            return Err(DispatchError::InvalidRequest("text is empty".into()));
        }
        if request.text.len() > self.config.max_text_len {
            return Err(DispatchError::InvalidRequest(format!(
                "text length {} exceeds the {} byte bound",
                request.text.len(),
                self.config.max_text_len
            )));
        }
        if self.config.validate_output_path
            && let Some(path) = &request.output_path
        {
            let bad = path.is_empty()
                || path.contains('\0')
                || std::path::Path::new(path)
                    .components()
                    .any(|c| matches!(c, Component::ParentDir));
            if bad {
                return Err(DispatchError::InvalidRequest(format!(
                    "invalid output path `{path}`"
                )));
            }
        }
        Ok(())
    }

    /// Remove a failed worker and, policy permitting, spawn its
    /// replacement with the same configuration.
    async fn replace_worker(&self, id: &WorkerId, reason: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.scale_lock.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let Some(old) = self.fleet.write().await.remove(id) else {
            // Already replaced; an exit event often follows the
            // unhealthy event that triggered the first replacement.
            return;
        };
        self.balancer.forget(id);
        tracing::info!(worker = %id, reason, "removing failed worker");
        old.shutdown().await;

        if !self.config.worker.restart_on_failure {
            return;
        }
        match self.spawn_worker().await {
            Ok(new_id) => tracing::info!(old = %id, new = %new_id, "worker replaced"),
            Err(e) => {
                // The autoscaler's floor check will keep trying.
                tracing::warn!(old = %id, error = %e, "replacement spawn failed");
            }
        }
    }

    /// One autoscaling pass: enforce the floor, then act on the
    /// balancer's advisory within the fleet bounds.
    async fn autoscale_once(&self) {
        let _guard = self.scale_lock.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let (size, observations) = {
            let fleet = self.fleet.read().await;
            let obs: Vec<FleetObservation> = fleet
                .values()
                .map(|w| FleetObservation {
                    queue_depth: w.queue_depth(),
                    idle: w.idle_for(),
                })
                .collect();
            (fleet.len(), obs)
        };

        if size < self.config.min_workers && self.config.worker.restart_on_failure {
            if let Err(e) = self.spawn_worker().await {
                tracing::warn!(error = %e, "fleet floor replenishment failed");
            }
            return;
        }

        let advice = self.balancer.advise(&observations);
        let applied = match advice {
            ScalingAdvice::ScaleUp if size < self.config.max_workers => {
                match self.spawn_worker().await {
                    Ok(id) => {
                        tracing::info!(worker = %id, "scaled up");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "scale-up spawn failed");
                        false
                    }
                }
            }
            ScalingAdvice::ScaleDown if size > self.config.min_workers => {
                self.scale_down_one().await
            }
            _ => false,
        };

        if advice != ScalingAdvice::NoChange {
            self.metrics_lock().last_scaling = Some((advice, applied, Instant::now()));
        }
    }

    /// Retire the idle worker with zero queue depth and the oldest
    /// activity. Holds the scale lock via the caller.
    async fn scale_down_one(&self) -> bool {
        let victim = {
            let fleet = self.fleet.read().await;
            fleet
                .values()
                .filter(|w| w.queue_depth() == 0)
                .max_by_key(|w| w.idle_for())
                .map(|w| w.id().clone())
        };
        let Some(id) = victim else { return false };
        let Some(worker) = self.fleet.write().await.remove(&id) else {
            return false;
        };
        self.balancer.forget(&id);
        tracing::info!(worker = %id, "scaling down idle worker");
        worker.shutdown().await;
        true
    }
}

/// The top-level TTS coordinator.
///
/// Owns the fleet exclusively; cheap to clone. Every instance is
/// independent: there is no process-wide registry, and tests run as
/// many dispatchers side by side as they like.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    supervisor: Arc<StdMutex<Option<JoinHandle<()>>>>,
    autoscaler: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Bring up the initial fleet and start supervision and autoscaling.
    ///
    /// Spawns `min_workers` workers and fails unless every one of them
    /// reaches READY, shutting down any that did come up.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidRequest`] for a nonsensical fleet bound,
    /// or the first worker's [`WorkerError`] when the mandatory fleet
    /// cannot be assembled.
    pub async fn initialize(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, DispatchError> {
        if config.max_workers == 0 || config.min_workers > config.max_workers {
            return Err(DispatchError::InvalidRequest(format!(
                "fleet bounds {}..={} are invalid",
                config.min_workers, config.max_workers
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reservoir = config.latency_reservoir;
        let balancer = LoadBalancer::new(config.balancer.clone());
        let inner = Arc::new(DispatcherInner {
            config,
            launcher,
            fleet: RwLock::new(HashMap::new()),
            balancer,
            events_tx,
            scale_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            metrics: StdMutex::new(MetricsInner::new(reservoir)),
            worker_seq: AtomicU64::new(0),
        });

        for _ in 0..inner.config.min_workers {
            if let Err(e) = inner.spawn_worker().await {
                let workers: Vec<Worker> =
                    inner.fleet.write().await.drain().map(|(_, w)| w).collect();
                for w in workers {
                    w.shutdown().await;
                }
                return Err(e.into());
            }
        }

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), events_rx));
        let autoscaler = tokio::spawn(autoscale_loop(Arc::clone(&inner)));

        Ok(Self {
            inner,
            supervisor: Arc::new(StdMutex::new(Some(supervisor))),
            autoscaler: Arc::new(StdMutex::new(Some(autoscaler))),
        })
    }

    /// Synthesize speech; the hot path.
    ///
    /// Validates the request, picks an admissible worker, calls it
    /// through its circuit breaker, and retries transient failures
    /// across the fleet within the re-selection budget.
    ///
    /// # Errors
    ///
    /// Any kind from the dispatch taxonomy; `no_workers_available` is
    /// retryable at the caller's discretion.
    pub async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesisResult, DispatchError> {
        self.inner.synthesize(request).await
    }

    /// Register a worker's model specialty for affinity routing.
    pub fn set_model_affinity(&self, worker: &WorkerId, voice: Option<String>) {
        self.inner.balancer.set_affinity(worker, voice);
    }

    /// Aggregated per-worker health: state, stats, breaker windows.
    pub async fn health(&self) -> HealthSnapshot {
        let fleet = self.inner.fleet.read().await;
        let mut workers: Vec<WorkerHealth> = fleet.values().map(worker_health).collect();
        drop(fleet);
        workers.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        HealthSnapshot { workers }
    }

    /// Aggregated metrics: throughput, latency percentiles, error rate,
    /// per-worker and balancer views, last scaling decision.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let fleet = self.inner.fleet.read().await;
        let mut workers: Vec<WorkerHealth> = fleet.values().map(worker_health).collect();
        let fleet_size = fleet.len();
        drop(fleet);
        workers.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let metrics = self.inner.metrics_lock();
        MetricsSnapshot {
            total_requests: metrics.total_requests,
            total_failures: metrics.total_failures,
            error_rate: metrics.error_rate(),
            latency: metrics.percentiles(),
            fleet_size,
            workers,
            balancer: self.inner.balancer.view(),
            last_scaling: metrics.scaling_decision(),
        }
    }

    /// Current fleet size.
    pub async fn fleet_size(&self) -> usize {
        self.inner.fleet.read().await.len()
    }

    /// Shut down every worker in parallel and stop the timers.
    /// Idempotent; new requests fail with `shutdown_in_progress`.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Matched stop for every started timer task.
        for handle_slot in [&self.autoscaler, &self.supervisor] {
            let handle = handle_slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }

        let workers: Vec<Worker> = self
            .inner
            .fleet
            .write()
            .await
            .drain()
            .map(|(_, w)| w)
            .collect();
        tracing::info!(count = workers.len(), "shutting down the fleet");
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            handles.push(tokio::spawn(async move { worker.shutdown().await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn worker_health(worker: &Worker) -> WorkerHealth {
    WorkerHealth {
        id: worker.id().clone(),
        state: worker.state(),
        model: worker.model(),
        queue_depth: worker.queue_depth(),
        stats: worker.stats(),
        breaker: worker.breaker().status(),
    }
}

/// React to worker lifecycle events: replace unhealthy and exited
/// workers while the replacement policy allows.
async fn supervise(inner: Arc<DispatcherInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event.kind {
            WorkerEventKind::Ready => {
                tracing::debug!(worker = %event.worker, "worker reported ready");
            }
            WorkerEventKind::Error { message } => {
                tracing::debug!(worker = %event.worker, message, "worker error event");
            }
            WorkerEventKind::Unhealthy { reason } => {
                inner.replace_worker(&event.worker, &reason).await;
            }
            WorkerEventKind::Exited { status } => {
                let reason = match status {
                    Some(code) => format!("exited with status {code}"),
                    None => "exited".to_owned(),
                };
                inner.replace_worker(&event.worker, &reason).await;
            }
            _ => {}
        }
    }
}

/// The owned autoscaling timer; aborted on shutdown.
async fn autoscale_loop(inner: Arc<DispatcherInner>) {
    let mut ticker = tokio::time::interval(inner.config.autoscale_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would race initialize.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        inner.autoscale_once().await;
    }
}
