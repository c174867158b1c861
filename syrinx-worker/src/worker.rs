//! One supervised synthesizer child process.
//!
//! A [`Worker`] owns exactly one child, its stdin/stdout/stderr pipes,
//! and the table of pending correlations. Responses are matched purely
//! by correlation ID (completion order is not send order) and no
//! correlation outlives the child: on exit every pending entry is failed
//! with `worker_terminated`.
//!
//! The I/O seam is plain `AsyncRead`/`AsyncWrite`, so a worker can also
//! be connected to an in-memory peer (see `test_utils`); supervision
//! logic is identical either way.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use syrinx_protocol::{
    Codec, FrameDecoder, Message, MessageId, Payload, ProtocolVersion, RequestPayload,
    ResponsePayload, SynthesisRequest, WorkerError, WorkerEvent, WorkerEventKind, WorkerId,
    WorkerState,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::WorkerConfig;

/// A resolved correlation: the child's answer or the failure that
/// preempted it.
type WorkerReply = Result<ResponsePayload, WorkerError>;

/// Per-worker statistics snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    /// Completed syntheses (success or failure; refusals excluded).
    pub requests_processed: u64,
    /// Cumulative synthesis latency.
    pub total_latency_ms: u64,
    /// Mean synthesis latency.
    pub average_latency_ms: u64,
    /// Success rate, exponentially smoothed.
    pub success_rate: f64,
    /// Time since the last completed synthesis (or startup).
    pub idle_ms: u64,
}

struct StatsInner {
    requests_processed: u64,
    total_latency: Duration,
    success_rate: f64,
    last_activity: Instant,
}

// Smoothing factor for the per-worker success-rate EWMA.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

struct PendingMap {
    map: HashMap<MessageId, oneshot::Sender<WorkerReply>>,
    /// Insertion order, for the v1 dialect's correlation-less responses.
    order: VecDeque<MessageId>,
    /// Set at termination; no registration may follow.
    closed: bool,
}

impl PendingMap {
    fn take(&mut self, id: &MessageId) -> Option<oneshot::Sender<WorkerReply>> {
        self.map.remove(id)
    }

    fn take_oldest(&mut self) -> Option<oneshot::Sender<WorkerReply>> {
        while let Some(id) = self.order.pop_front() {
            if let Some(tx) = self.map.remove(&id) {
                return Some(tx);
            }
        }
        None
    }
}

struct WorkerInner {
    id: WorkerId,
    config: WorkerConfig,
    codec: Codec,
    state: watch::Sender<WorkerState>,
    pending: Mutex<PendingMap>,
    in_flight: AtomicUsize,
    stats: Mutex<StatsInner>,
    model: Mutex<String>,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    breaker: CircuitBreaker,
    exited: AtomicBool,
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

/// Removes the correlation entry when the request future is dropped:
/// a cancelled or timed-out caller must not hold a queue slot, and a
/// late response to a removed entry is dropped as orphaned.
struct PendingGuard<'a> {
    inner: &'a WorkerInner,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending_lock().map.remove(&self.id);
    }
}

/// Keeps BUSY observable while at least one synthesis is in flight.
struct BusyGuard {
    inner: Arc<WorkerInner>,
}

impl BusyGuard {
    fn enter(inner: &Arc<WorkerInner>) -> Self {
        if inner.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            inner.transition_if(WorkerState::Ready, WorkerState::Busy);
        }
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.transition_if(WorkerState::Busy, WorkerState::Ready);
        }
    }
}

impl WorkerInner {
    fn pending_lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats_lock(&self) -> MutexGuard<'_, StatsInner> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Whether `from → to` is a legal transition. Terminal states are
    /// sticky and SHUTTING_DOWN/UNHEALTHY only move forward.
    fn allowed(from: WorkerState, to: WorkerState) -> bool {
        match from {
            WorkerState::Terminated => false,
            WorkerState::ShuttingDown => matches!(to, WorkerState::Terminated),
            WorkerState::Unhealthy => {
                matches!(to, WorkerState::ShuttingDown | WorkerState::Terminated)
            }
            _ => true,
        }
    }

    fn set_state(&self, to: WorkerState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|s| {
            if *s == to || !Self::allowed(*s, to) {
                return false;
            }
            from = Some(*s);
            *s = to;
            true
        });
        if let Some(from) = from {
            tracing::info!(worker = %self.id, %from, %to, "worker state change");
            true
        } else {
            false
        }
    }

    fn transition_if(&self, from: WorkerState, to: WorkerState) {
        let mut moved = false;
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                moved = true;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(worker = %self.id, %from, %to, "worker state change");
        }
    }

    fn mark_ready(&self) {
        let mut moved = false;
        self.state.send_if_modified(|s| {
            if *s == WorkerState::Initializing {
                *s = WorkerState::Ready;
                moved = true;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!(worker = %self.id, "worker ready");
            let _ = self
                .events
                .send(WorkerEvent::new(self.id.clone(), WorkerEventKind::Ready));
        }
    }

    fn mark_unhealthy(&self, reason: &str) {
        if self.set_state(WorkerState::Unhealthy) {
            tracing::warn!(worker = %self.id, reason, "worker marked unhealthy");
            let _ = self.events.send(WorkerEvent::new(
                self.id.clone(),
                WorkerEventKind::Unhealthy {
                    reason: reason.to_owned(),
                },
            ));
        }
    }

    /// Close the book on this worker. Idempotent: the reader's EOF and
    /// the process reaper may both observe the exit.
    async fn handle_exit(&self, status: Option<i32>) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(WorkerState::Terminated);

        let drained: Vec<_> = {
            let mut pending = self.pending_lock();
            pending.closed = true;
            pending.order.clear();
            pending.map.drain().collect()
        };
        let orphaned = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(WorkerError::Terminated {
                worker: self.id.clone(),
            }));
        }

        // Dropping the writer lets an in-memory peer observe EOF.
        self.writer.lock().await.take();

        tracing::info!(worker = %self.id, ?status, orphaned, "worker terminated");
        let _ = self.events.send(WorkerEvent::new(
            self.id.clone(),
            WorkerEventKind::Exited { status },
        ));
    }

    fn on_protocol_error(&self, err: syrinx_protocol::ProtocolError) {
        tracing::warn!(worker = %self.id, error = %err, "protocol error on worker stream");
        let _ = self.events.send(WorkerEvent::new(
            self.id.clone(),
            WorkerEventKind::Error {
                message: err.to_string(),
            },
        ));
        self.mark_unhealthy(&format!("protocol error: {err}"));
    }

    fn resolve_reply(&self, correlation: Option<&MessageId>, reply: WorkerReply) {
        let tx = {
            let mut pending = self.pending_lock();
            match correlation {
                Some(id) => pending.take(id),
                // The v1 dialect carries no correlation IDs; responses
                // answer the oldest outstanding request.
                None if self.codec.peer_version() == ProtocolVersion::V1 => pending.take_oldest(),
                None => {
                    drop(pending);
                    self.on_protocol_error(syrinx_protocol::ProtocolError::MissingCorrelation);
                    return;
                }
            }
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            // Correlation already removed: the caller timed out or was
            // cancelled, and this late answer is an orphan.
            None => tracing::debug!(worker = %self.id, ?correlation, "dropping orphaned reply"),
        }
    }

    fn handle_message(&self, msg: Message) {
        let correlation = msg.metadata.correlation_id.clone();
        match msg.payload {
            Payload::Response(resp) => self.resolve_reply(correlation.as_ref(), Ok(resp)),
            Payload::Error(err) => {
                let reply = Err(WorkerError::Synthesis {
                    worker: self.id.clone(),
                    code: err.error,
                    message: err.message.unwrap_or_default(),
                });
                self.resolve_reply(correlation.as_ref(), reply);
            }
            Payload::Event(ev) if ev.is_ready() => self.mark_ready(),
            Payload::Event(ev) => {
                tracing::debug!(worker = %self.id, event = ?ev, "worker event")
            }
            Payload::Heartbeat(_) => {}
            Payload::Request(req) => {
                tracing::debug!(worker = %self.id, tag = req.tag(), "ignoring request from child")
            }
            _ => {}
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), WorkerError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(WorkerError::Terminated {
                worker: self.id.clone(),
            });
        };
        // A write failure means the child's stdin is gone, which means
        // the child is going or gone.
        if let Err(e) = w.write_all(line.as_bytes()).await {
            tracing::debug!(worker = %self.id, error = %e, "write to child failed");
            return Err(WorkerError::Terminated {
                worker: self.id.clone(),
            });
        }
        if let Err(e) = w.flush().await {
            tracing::debug!(worker = %self.id, error = %e, "flush to child failed");
            return Err(WorkerError::Terminated {
                worker: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Register a correlation, write the request, await the reply.
    ///
    /// `probe` requests bypass the queue cap so health pings cannot be
    /// starved by a saturated queue.
    async fn send_request(
        &self,
        payload: RequestPayload,
        deadline: Duration,
        probe: bool,
    ) -> Result<ResponsePayload, WorkerError> {
        let state = self.current_state();
        if !state.is_serving() {
            return Err(WorkerError::NotReady {
                worker: self.id.clone(),
                state,
            });
        }

        let msg = Message::request(payload).with_worker(self.id.clone());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_lock();
            if pending.closed {
                return Err(WorkerError::Terminated {
                    worker: self.id.clone(),
                });
            }
            if !probe && pending.map.len() >= self.config.max_queue_size {
                return Err(WorkerError::QueueFull {
                    worker: self.id.clone(),
                    pending: pending.map.len(),
                });
            }
            pending.map.insert(msg.message_id.clone(), tx);
            pending.order.push_back(msg.message_id.clone());
        }
        let _guard = PendingGuard {
            inner: self,
            id: msg.message_id.clone(),
        };

        let line = self.codec.encode(&msg).map_err(|e| WorkerError::Protocol {
            worker: self.id.clone(),
            source: e,
        })?;
        tracing::debug!(worker = %self.id, message = %msg.message_id, "sending request");
        self.write_line(&line).await?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            // The resolver was dropped without an answer; only
            // termination cleanup does that.
            Ok(Err(_)) => Err(WorkerError::Terminated {
                worker: self.id.clone(),
            }),
            Err(_) => Err(WorkerError::RequestTimeout {
                worker: self.id.clone(),
                timeout: deadline.into(),
            }),
        }
    }

    fn record_synthesis(&self, elapsed: Duration, success: bool) {
        let mut stats = self.stats_lock();
        stats.requests_processed += 1;
        stats.total_latency += elapsed;
        let x = if success { 1.0 } else { 0.0 };
        stats.success_rate += SUCCESS_RATE_ALPHA * (x - stats.success_rate);
        stats.last_activity = Instant::now();
    }

    fn send_terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            tracing::debug!(worker = %self.id, pid, "sending terminate signal");
            // SAFETY: plain kill(2) on a pid we spawned and still hold.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = self.pid;
    }

    async fn wait_terminated(&self, grace: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(grace, async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// A supervised synthesizer worker. Cheap to clone; all clones share
/// the same child, state, and breaker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Spawn a child synthesizer process and supervise it.
    ///
    /// The command gets piped stdio and the environment the synthesizer
    /// contract requires (`MODEL_NAME`, `CACHE_DIR`, unbuffered output).
    /// The worker starts INITIALIZING and becomes READY when the child
    /// announces readiness; use [`wait_ready`](Self::wait_ready) to
    /// observe that within the startup deadline.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InitializationFailed`] when the process cannot be
    /// spawned or its pipes are unavailable.
    pub fn spawn(
        id: WorkerId,
        config: WorkerConfig,
        mut command: Command,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, WorkerError> {
        command
            .env("MODEL_NAME", &config.model_name)
            .env("CACHE_DIR", &config.cache_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| WorkerError::InitializationFailed(format!("spawn failed: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::InitializationFailed("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::InitializationFailed("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::InitializationFailed("child stderr unavailable".into()))?;

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let worker = Self::build(id, config, Box::new(stdin), events, pid, Some(kill_tx));
        let inner = Arc::clone(&worker.inner);

        tokio::spawn(read_loop(Arc::clone(&inner), stdout));
        tokio::spawn(stderr_loop(Arc::clone(&inner), stderr));
        tokio::spawn(exit_loop(Arc::clone(&inner), child, kill_rx));
        tokio::spawn(health_loop(inner));

        Ok(worker)
    }

    /// Supervise a synthesizer reachable over arbitrary byte pipes
    /// instead of a child process. EOF on `reader` is treated as the
    /// peer's exit. Used by the in-memory test peers; also usable for
    /// embedding a synthesizer behind sockets.
    pub fn from_pipes<R, W>(
        id: WorkerId,
        config: WorkerConfig,
        reader: R,
        writer: W,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let worker = Self::build(id, config, Box::new(writer), events, None, None);
        let inner = Arc::clone(&worker.inner);
        tokio::spawn(read_loop(Arc::clone(&inner), reader));
        tokio::spawn(health_loop(inner));
        worker
    }

    fn build(
        id: WorkerId,
        config: WorkerConfig,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        pid: Option<u32>,
        kill: Option<oneshot::Sender<()>>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Initializing);
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let codec = Codec::new(config.protocol);
        let model = config.model_name.clone();
        Self {
            inner: Arc::new(WorkerInner {
                id,
                config,
                codec,
                state,
                pending: Mutex::new(PendingMap {
                    map: HashMap::new(),
                    order: VecDeque::new(),
                    closed: false,
                }),
                in_flight: AtomicUsize::new(0),
                stats: Mutex::new(StatsInner {
                    requests_processed: 0,
                    total_latency: Duration::ZERO,
                    success_rate: 1.0,
                    last_activity: Instant::now(),
                }),
                model: Mutex::new(model),
                writer: tokio::sync::Mutex::new(Some(writer)),
                events,
                breaker,
                exited: AtomicBool::new(false),
                pid,
                kill: Mutex::new(kill),
            }),
        }
    }

    /// This worker's identity.
    pub fn id(&self) -> &WorkerId {
        &self.inner.id
    }

    /// The configuration this worker was launched with.
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.inner.current_state()
    }

    /// Subscribe to lifecycle state changes.
    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    /// Pending correlations right now.
    pub fn queue_depth(&self) -> usize {
        self.inner.pending_lock().map.len()
    }

    /// Whether the circuit breaker would admit a call right now.
    pub fn admits(&self) -> bool {
        self.inner.breaker.admits()
    }

    /// The circuit breaker guarding this worker's request path.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// The model currently loaded.
    pub fn model(&self) -> String {
        self.inner
            .model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> WorkerStats {
        let stats = self.inner.stats_lock();
        let processed = stats.requests_processed;
        let total = stats.total_latency.as_millis() as u64;
        WorkerStats {
            requests_processed: processed,
            total_latency_ms: total,
            average_latency_ms: if processed == 0 { 0 } else { total / processed },
            success_rate: stats.success_rate,
            idle_ms: stats.last_activity.elapsed().as_millis() as u64,
        }
    }

    /// Time since the last completed synthesis (or startup).
    pub fn idle_for(&self) -> Duration {
        self.inner.stats_lock().last_activity.elapsed()
    }

    /// Wait for the child's readiness announcement, bounded by the
    /// configured startup timeout.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InitializationFailed`] when the deadline elapses
    /// or the worker dies first; the deadline also marks the worker
    /// unhealthy so the dispatcher can replace it.
    pub async fn wait_ready(&self) -> Result<(), WorkerError> {
        let inner = &self.inner;
        let mut rx = inner.state.subscribe();
        let settled = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    WorkerState::Ready | WorkerState::Busy => return Ok(()),
                    WorkerState::Unhealthy | WorkerState::Terminated => {
                        return Err(WorkerError::InitializationFailed(format!(
                            "worker {} became {state} before ready",
                            inner.id
                        )));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(WorkerError::InitializationFailed(
                        "worker state channel closed".into(),
                    ));
                }
            }
        };
        match tokio::time::timeout(inner.config.startup_timeout, settled).await {
            Ok(result) => result,
            Err(_) => {
                inner.mark_unhealthy("startup timeout");
                Err(WorkerError::InitializationFailed(format!(
                    "worker {} not ready within {:?}",
                    inner.id, inner.config.startup_timeout
                )))
            }
        }
    }

    /// Synthesize through this worker's circuit breaker.
    ///
    /// Refuses with `worker_not_ready` outside READY/BUSY and with
    /// `worker_queue_full` at the queue cap; those refusals do not feed
    /// the breaker window. A child-reported failure, a timeout on any
    /// of the racing deadlines, or termination mid-flight does.
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<ResponsePayload, WorkerError> {
        let inner = &self.inner;
        let state = inner.current_state();
        if !state.is_serving() {
            return Err(WorkerError::NotReady {
                worker: inner.id.clone(),
                state,
            });
        }

        let _busy = BusyGuard::enter(inner);
        let started = Instant::now();

        let attempt = async {
            let resp = inner
                .send_request(request.to_payload(), inner.config.request_timeout, false)
                .await?;
            if resp.is_success() {
                Ok(resp)
            } else {
                Err(WorkerError::Synthesis {
                    worker: inner.id.clone(),
                    code: resp.status.clone(),
                    message: failure_detail(&resp),
                })
            }
        };

        let result = match inner.breaker.call(attempt).await {
            Ok(resp) => Ok(resp),
            Err(BreakerError::Open) => Err(WorkerError::CircuitOpen {
                worker: inner.id.clone(),
            }),
            Err(BreakerError::Timeout(limit)) => Err(WorkerError::RequestTimeout {
                worker: inner.id.clone(),
                timeout: limit.into(),
            }),
            Err(BreakerError::Inner(e)) => Err(e),
        };

        match &result {
            Ok(_) => inner.record_synthesis(started.elapsed(), true),
            Err(e) if !e.is_reselectable() => inner.record_synthesis(started.elapsed(), false),
            Err(_) => {}
        }
        result
    }

    /// Ask the child to switch models.
    ///
    /// # Errors
    ///
    /// Any request-path error, or [`WorkerError::Synthesis`] with the
    /// child's status when the switch is refused.
    pub async fn load_model(&self, model: impl Into<String>) -> Result<(), WorkerError> {
        let inner = &self.inner;
        let model = model.into();
        let resp = inner
            .send_request(
                RequestPayload::SwitchModel {
                    model: model.clone(),
                },
                inner.config.request_timeout,
                true,
            )
            .await?;
        if !resp.is_success() {
            return Err(WorkerError::Synthesis {
                worker: inner.id.clone(),
                code: resp.status.clone(),
                message: failure_detail(&resp),
            });
        }
        *inner.model.lock().unwrap_or_else(|e| e.into_inner()) = model;
        Ok(())
    }

    /// Forward a `get_metrics` request to the child and return its
    /// answer verbatim.
    pub async fn remote_metrics(&self) -> Result<ResponsePayload, WorkerError> {
        self.inner
            .send_request(
                RequestPayload::GetMetrics,
                self.inner.config.request_timeout,
                true,
            )
            .await
    }

    /// One liveness probe; returns the round-trip time.
    pub async fn health_check(&self) -> Result<Duration, WorkerError> {
        let started = Instant::now();
        self.inner
            .send_request(
                RequestPayload::Ping,
                self.inner.config.health_check_interval,
                true,
            )
            .await?;
        Ok(started.elapsed())
    }

    /// Shut the worker down: cooperative command, then the terminate
    /// signal, then the kill signal, each after its grace period.
    /// Idempotent; returns once the worker is TERMINATED.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.current_state().is_terminal() {
            return;
        }
        inner.set_state(WorkerState::ShuttingDown);

        let msg = Message::request(RequestPayload::Shutdown).with_worker(inner.id.clone());
        if let Ok(line) = inner.codec.encode(&msg) {
            let _ = inner.write_line(&line).await;
        }
        if inner.wait_terminated(inner.config.shutdown_grace).await {
            return;
        }

        inner.send_terminate();
        if inner.wait_terminated(inner.config.kill_grace).await {
            return;
        }

        let kill = inner.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        match kill {
            Some(tx) => {
                let _ = tx.send(());
                if !inner.wait_terminated(inner.config.kill_grace).await {
                    // The reaper never reported; close the book locally.
                    inner.handle_exit(None).await;
                }
            }
            // No process behind this worker; force local termination.
            None => inner.handle_exit(None).await,
        }
    }
}

/// Extract a human-readable failure detail from a non-success response.
fn failure_detail(resp: &ResponsePayload) -> String {
    for key in ["error", "message", "detail"] {
        if let Some(s) = resp.extra.get(key).and_then(|v| v.as_str()) {
            return s.to_owned();
        }
    }
    String::new()
}

/// Pump the child's stdout through the frame decoder. EOF means the
/// peer is gone and triggers termination cleanup.
async fn read_loop<R>(inner: Arc<WorkerInner>, mut reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match frames.feed(&buf[..n]) {
                Ok(lines) => {
                    for line in lines {
                        match inner.codec.decode(&line) {
                            Ok(msg) => inner.handle_message(msg),
                            Err(e) => inner.on_protocol_error(e),
                        }
                    }
                }
                Err(e) => inner.on_protocol_error(e),
            },
            Err(e) => {
                tracing::warn!(worker = %inner.id, error = %e, "read from child failed");
                break;
            }
        }
    }
    inner.handle_exit(None).await;
}

/// Surface the child's stderr as opaque log output.
async fn stderr_loop<R>(inner: Arc<WorkerInner>, reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::warn!(worker = %inner.id, "child stderr: {line}");
        }
    }
}

/// Reap the child process; applies the kill signal when the shutdown
/// ladder requests it.
async fn exit_loop(inner: Arc<WorkerInner>, mut child: Child, mut kill_rx: oneshot::Receiver<()>) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        requested = &mut kill_rx => {
            if requested.is_ok() {
                tracing::debug!(worker = %inner.id, "sending kill signal");
                let _ = child.start_kill();
            }
            child.wait().await.ok()
        }
    };
    inner.handle_exit(status.and_then(|s| s.code())).await;
}

/// Periodic liveness probing while the worker serves.
async fn health_loop(inner: Arc<WorkerInner>) {
    let period = inner.config.health_check_interval;
    let mut rx = inner.state.subscribe();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = *rx.borrow_and_update();
                if probing_is_over(state) {
                    break;
                }
                if !state.is_serving() {
                    continue;
                }
                match inner.send_request(RequestPayload::Ping, period, true).await {
                    Ok(_) => {}
                    // The state moved under the probe; the next tick decides.
                    Err(WorkerError::NotReady { .. }) => {}
                    Err(e) => {
                        if probing_is_over(inner.current_state()) {
                            break;
                        }
                        inner.mark_unhealthy(&format!("health probe failed: {e}"));
                        break;
                    }
                }
            }
            changed = rx.changed() => {
                if changed.is_err() || probing_is_over(*rx.borrow_and_update()) {
                    break;
                }
            }
        }
    }
}

fn probing_is_over(state: WorkerState) -> bool {
    matches!(
        state,
        WorkerState::Unhealthy | WorkerState::ShuttingDown | WorkerState::Terminated
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::WorkerLauncher;
    use crate::test_utils::{ScriptedLauncher, ScriptedReply, ScriptedSynth};
    use syrinx_protocol::WorkerEventKind;

    fn quick_config() -> WorkerConfig {
        let mut config = WorkerConfig::new("test-model", "/tmp/syrinx-test-cache");
        config.startup_timeout = Duration::from_millis(500);
        config.request_timeout = Duration::from_millis(500);
        config.health_check_interval = Duration::from_millis(100);
        config.shutdown_grace = Duration::from_millis(100);
        config.kill_grace = Duration::from_millis(100);
        config.max_queue_size = 4;
        config
    }

    async fn launch(
        launcher: &ScriptedLauncher,
        config: WorkerConfig,
    ) -> (Worker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = launcher
            .launch(WorkerId::new("w-test"), config, tx)
            .await
            .unwrap();
        (worker, rx)
    }

    #[tokio::test]
    async fn becomes_ready_and_synthesizes() {
        let launcher = ScriptedLauncher::always(ScriptedReply::ok(42));
        let (worker, mut events) = launch(&launcher, quick_config()).await;

        worker.wait_ready().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Ready);
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Ready
        ));

        let resp = worker
            .synthesize(&SynthesisRequest::new("hello"))
            .await
            .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.latency_ms.map(|l| l.as_millis()), Some(42));

        let stats = worker.stats();
        assert_eq!(stats.requests_processed, 1);
        assert!(stats.success_rate > 0.99);
        assert_eq!(worker.queue_depth(), 0);
    }

    #[tokio::test]
    async fn busy_is_observable_while_in_flight() {
        let launcher =
            ScriptedLauncher::always(ScriptedReply::ok_after(Duration::from_millis(200), 5));
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        let in_flight = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.synthesize(&SynthesisRequest::new("x")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.state(), WorkerState::Busy);
        assert_eq!(worker.queue_depth(), 1);

        in_flight.await.unwrap().unwrap();
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn refuses_before_ready() {
        let launcher = ScriptedLauncher::new(|| {
            ScriptedSynth::always(ScriptedReply::ok(1)).ready_after(Duration::from_millis(200))
        });
        let (worker, _events) = launch(&launcher, quick_config()).await;

        let err = worker
            .synthesize(&SynthesisRequest::new("too early"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_not_ready");
    }

    #[tokio::test]
    async fn startup_timeout_marks_unhealthy() {
        let launcher =
            ScriptedLauncher::new(|| ScriptedSynth::always(ScriptedReply::ok(1)).never_ready());
        let mut config = quick_config();
        config.startup_timeout = Duration::from_millis(100);
        let (worker, mut events) = launch(&launcher, config).await;

        let err = worker.wait_ready().await.unwrap_err();
        assert_eq!(err.kind(), "initialization_failed");
        assert_eq!(worker.state(), WorkerState::Unhealthy);
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Unhealthy { .. }
        ));
    }

    #[tokio::test]
    async fn queue_cap_refuses_with_queue_full() {
        let launcher = ScriptedLauncher::always(ScriptedReply::Ignore);
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        let mut pending = Vec::new();
        for _ in 0..4 {
            let worker = worker.clone();
            pending.push(tokio::spawn(async move {
                worker.synthesize(&SynthesisRequest::new("stuck")).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.queue_depth(), 4);

        let err = worker
            .synthesize(&SynthesisRequest::new("overflow"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_queue_full");

        // Probes bypass the cap.
        worker.health_check().await.unwrap();

        // The stuck requests time out and free their slots.
        for handle in pending {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "request_timeout");
        }
        assert_eq!(worker.queue_depth(), 0);
    }

    #[tokio::test]
    async fn responses_demux_by_correlation_out_of_order() {
        // Later requests answer sooner: reply delay shrinks as the
        // count grows.
        let launcher = ScriptedLauncher::new(|| {
            ScriptedSynth::new(|nth, _req| {
                ScriptedReply::ok_after(Duration::from_millis(120 - 20 * nth.min(5)), nth)
            })
        });
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let resp = worker
                    .synthesize(&SynthesisRequest::new(format!("req-{i}")))
                    .await
                    .unwrap();
                resp.latency_ms.unwrap().as_millis()
            }));
        }

        let mut latencies = Vec::new();
        for handle in handles {
            latencies.push(handle.await.unwrap());
        }
        // Each call got its own answer: the child stamped the nth
        // counter into latency_ms, so all four values are distinct.
        latencies.sort_unstable();
        assert_eq!(latencies, vec![1, 2, 3, 4]);
        assert_eq!(worker.stats().requests_processed, 4);
    }

    #[tokio::test]
    async fn crash_fails_all_pending_and_emits_exit() {
        let launcher = ScriptedLauncher::new(|| {
            ScriptedSynth::new(|nth, _req| {
                if nth < 3 {
                    ScriptedReply::Ignore
                } else {
                    ScriptedReply::Exit
                }
            })
        });
        let (worker, mut events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Ready
        ));

        let mut handles = Vec::new();
        for i in 0..3 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                worker
                    .synthesize(&SynthesisRequest::new(format!("req-{i}")))
                    .await
            }));
        }

        let mut kinds = Vec::new();
        for handle in handles {
            kinds.push(handle.await.unwrap().unwrap_err().kind().to_owned());
        }
        assert!(kinds.iter().all(|k| k == "worker_terminated"));
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(worker.queue_depth(), 0);
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Exited { .. }
        ));
    }

    #[tokio::test]
    async fn cooperative_shutdown_terminates() {
        let launcher = ScriptedLauncher::always(ScriptedReply::ok(1));
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        worker.shutdown().await;
        assert_eq!(worker.state(), WorkerState::Terminated);

        let err = worker
            .synthesize(&SynthesisRequest::new("after"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_not_ready");
    }

    #[tokio::test]
    async fn failed_probe_marks_unhealthy() {
        let launcher =
            ScriptedLauncher::new(|| ScriptedSynth::always(ScriptedReply::ok(1)).mute_pings());
        let (worker, mut events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Ready
        ));

        // interval 100ms + probe deadline 100ms: unhealthy well within a second.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if worker.state() == WorkerState::Unhealthy {
                break;
            }
            assert!(Instant::now() < deadline, "probe failure never surfaced");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(
            events.recv().await.unwrap().kind,
            WorkerEventKind::Unhealthy { .. }
        ));
    }

    #[tokio::test]
    async fn v1_peer_correlates_fifo() {
        let launcher = ScriptedLauncher::new(|| {
            ScriptedSynth::always(ScriptedReply::ok(9)).speaking(ProtocolVersion::V1)
        });
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        let resp = worker
            .synthesize(&SynthesisRequest::new("legacy"))
            .await
            .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.latency_ms.map(|l| l.as_millis()), Some(9));
    }

    #[tokio::test]
    async fn load_model_updates_the_reported_model() {
        let launcher = ScriptedLauncher::always(ScriptedReply::ok(1));
        let (worker, _events) = launch(&launcher, quick_config()).await;
        worker.wait_ready().await.unwrap();

        assert_eq!(worker.model(), "test-model");
        worker.load_model("vits-large").await.unwrap();
        assert_eq!(worker.model(), "vits-large");
    }
}
