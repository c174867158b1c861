//! Lifecycle vocabulary shared across the dispatch stack.
//!
//! These are NOT a trait; they are a shared vocabulary. Workers emit
//! [`WorkerEvent`]s over a channel; the dispatcher listens, applies its
//! replacement policy, and takes action. There is no separate
//! "supervision service"; reacting to these events is the dispatcher's
//! job.

use crate::id::WorkerId;
use serde::{Deserialize, Serialize};

/// Where a worker is in its life.
///
/// INITIALIZING → READY ↔ BUSY → UNHEALTHY / SHUTTING_DOWN → TERMINATED.
/// BUSY is observable, not exclusive: it is set while at least one
/// synthesis is in flight, and a BUSY worker still accepts requests up to
/// its queue capacity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Child spawned, waiting for its ready event.
    Initializing,
    /// Accepting synthesis requests.
    Ready,
    /// At least one synthesis in flight; still accepting.
    Busy,
    /// Failed a health probe or reported a process error. The dispatcher,
    /// not the worker, decides whether to replace it.
    Unhealthy,
    /// Cooperative shutdown requested.
    ShuttingDown,
    /// Child exit observed. All pending correlations have been failed.
    Terminated,
}

impl WorkerState {
    /// Whether the worker accepts synthesis requests in this state.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Unhealthy => "unhealthy",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through; outcomes feed the sliding window.
    Closed,
    /// Requests are rejected immediately with `circuit_open`.
    Open,
    /// Limited probe regime after the reset timeout.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// An event a worker publishes to its supervisor.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// The worker this event concerns.
    pub worker: WorkerId,
    /// What happened.
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    /// Create an event for the given worker.
    pub fn new(worker: WorkerId, kind: WorkerEventKind) -> Self {
        Self { worker, kind }
    }
}

/// The worker event variants the dispatcher reacts to.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEventKind {
    /// The child announced readiness.
    Ready,
    /// A health probe failed or the child reported a fatal condition.
    Unhealthy {
        /// Why the worker was marked unhealthy.
        reason: String,
    },
    /// The child process exited.
    Exited {
        /// Exit status code, when the platform reported one.
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<i32>,
    },
    /// A non-fatal error worth surfacing (wire noise, stderr chatter).
    Error {
        /// Description of the error.
        message: String,
    },
}

/// A non-binding scaling recommendation from the load balancer.
///
/// The balancer advises; the dispatcher acts, bounded by its configured
/// fleet limits.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAdvice {
    /// Add one worker.
    ScaleUp,
    /// Remove one idle worker.
    ScaleDown,
    /// Leave the fleet as it is.
    NoChange,
}

impl std::fmt::Display for ScalingAdvice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::NoChange => "no_change",
        };
        f.write_str(s)
    }
}
