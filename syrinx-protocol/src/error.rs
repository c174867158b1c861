//! Error types for each layer of the dispatch stack.
//!
//! Every caller-visible error exposes a stable snake_case [`kind`] string.
//! The dispatcher's retry machine matches on kinds, not variants, so the
//! taxonomy is part of the wire contract: `circuit_open`,
//! `worker_queue_full`, and `worker_not_ready` are recovered by
//! re-selection; everything else surfaces to the caller.
//!
//! [`kind`]: WorkerError::kind

use crate::id::WorkerId;
use crate::lifecycle::WorkerState;
use crate::millis::WireMillis;
use thiserror::Error;

/// Codec and version-negotiation errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required envelope field was absent.
    #[error("message missing required field `{0}`")]
    MissingField(&'static str),

    /// The `type` field was outside the message-type enumeration.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// The declared version is not in the supported set.
    #[error("unsupported protocol version `{0}`")]
    UnsupportedVersion(String),

    /// A frame was not a well-formed single-line JSON object.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The payload did not match the shape its message type requires.
    #[error("malformed {kind} payload: {detail}")]
    MalformedPayload {
        /// The declared message type.
        kind: &'static str,
        /// What went wrong while parsing the payload.
        detail: String,
    },

    /// A response or error arrived without a correlation ID and no
    /// pending request could absorb it.
    #[error("response missing correlation id")]
    MissingCorrelation,

    /// Version negotiation found no mutually supported version.
    #[error("incompatible protocol: client supports {client_min}..={client_max}")]
    Incompatible {
        /// Lowest version the client declared.
        client_min: String,
        /// Highest version the client declared.
        client_max: String,
    },
}

impl ProtocolError {
    /// Stable snake_case kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Incompatible { .. } => "incompatible_protocol",
            _ => "protocol_error",
        }
    }
}

/// Errors from a single worker's request path.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker is in a non-serving state.
    #[error("worker {worker} is not ready (state: {state})")]
    NotReady {
        /// The refusing worker.
        worker: WorkerId,
        /// Its state at refusal time.
        state: WorkerState,
    },

    /// The worker's pending-correlation queue is at capacity.
    #[error("worker {worker} queue is full ({pending} pending)")]
    QueueFull {
        /// The refusing worker.
        worker: WorkerId,
        /// Pending correlations at refusal time.
        pending: usize,
    },

    /// The per-request deadline elapsed before a correlated response.
    #[error("request to worker {worker} timed out after {timeout}")]
    RequestTimeout {
        /// The worker that did not answer in time.
        worker: WorkerId,
        /// The deadline that elapsed.
        timeout: WireMillis,
    },

    /// The child process exited before resolving the correlation.
    #[error("worker {worker} terminated before responding")]
    Terminated {
        /// The terminated worker.
        worker: WorkerId,
    },

    /// The worker's circuit breaker rejected the call.
    #[error("circuit open for worker {worker}")]
    CircuitOpen {
        /// The worker whose circuit is open.
        worker: WorkerId,
    },

    /// The child reported a synthesis failure.
    #[error("synthesis failed on worker {worker}: {code}: {message}")]
    Synthesis {
        /// The worker that failed.
        worker: WorkerId,
        /// Machine-readable failure code from the child.
        code: String,
        /// Human-readable message from the child.
        message: String,
    },

    /// The worker never reached READY (spawn failure or startup timeout).
    #[error("worker initialization failed: {0}")]
    InitializationFailed(String),

    /// A wire-level error on this worker's stream.
    #[error("protocol error on worker {worker}")]
    Protocol {
        /// The worker whose stream misbehaved.
        worker: WorkerId,
        /// The underlying codec error.
        #[source]
        source: ProtocolError,
    },
}

impl WorkerError {
    /// Stable snake_case kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady { .. } => "worker_not_ready",
            Self::QueueFull { .. } => "worker_queue_full",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::Terminated { .. } => "worker_terminated",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Synthesis { .. } => "synthesis_failed",
            Self::InitializationFailed(_) => "initialization_failed",
            Self::Protocol { source, .. } => source.kind(),
        }
    }

    /// The worker this error is attributable to, when there is one.
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            Self::NotReady { worker, .. }
            | Self::QueueFull { worker, .. }
            | Self::RequestTimeout { worker, .. }
            | Self::Terminated { worker }
            | Self::CircuitOpen { worker }
            | Self::Synthesis { worker, .. }
            | Self::Protocol { worker, .. } => Some(worker),
            Self::InitializationFailed(_) => None,
        }
    }

    /// Whether the dispatcher may recover this error by re-selecting
    /// another worker without spending caller-visible failure budget.
    pub fn is_reselectable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::QueueFull { .. } | Self::NotReady { .. }
        )
    }
}

/// Errors surfaced by the dispatcher to callers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Input validation failed before any worker was involved.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No admissible worker remained after retrying across the fleet.
    #[error("no workers available ({attempted} attempted)")]
    NoWorkersAvailable {
        /// Distinct workers tried before giving up.
        attempted: usize,
    },

    /// The dispatcher is shutting down and accepts no new requests.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// A worker-level error that exhausted the retry budget.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// An uncaught internal failure, converted rather than propagated
    /// as a panic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable snake_case kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoWorkersAvailable { .. } => "no_workers_available",
            Self::ShutdownInProgress => "shutdown_in_progress",
            Self::Worker(e) => e.kind(),
            Self::Internal(_) => "internal_error",
        }
    }

    /// The offending worker, when the failure is attributable to one.
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            Self::Worker(e) => e.worker(),
            _ => None,
        }
    }
}
