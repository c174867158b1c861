//! Worker configuration.

use crate::breaker::BreakerConfig;
use std::path::PathBuf;
use std::time::Duration;
use syrinx_protocol::ProtocolVersion;

/// Configuration for one synthesizer worker.
///
/// Every duration knob has the default the synthesizer fleet was tuned
/// with; override per deployment, not per request.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Model the child loads at startup (exported as `MODEL_NAME`).
    pub model_name: String,

    /// Synthesis cache directory (exported as `CACHE_DIR`).
    pub cache_dir: PathBuf,

    /// Maximum pending correlations before new requests are refused
    /// with `worker_queue_full`. Health probes bypass this cap so a
    /// saturated worker is not misread as dead.
    pub max_queue_size: usize,

    /// Cadence of liveness pings while READY or BUSY. Also the probe's
    /// own deadline.
    pub health_check_interval: Duration,

    /// Whether the dispatcher should replace this worker when it turns
    /// unhealthy or exits.
    pub restart_on_failure: bool,

    /// How long the child gets to announce readiness after spawn.
    pub startup_timeout: Duration,

    /// Per-request correlation deadline.
    pub request_timeout: Duration,

    /// Grace period after the cooperative `shutdown` command before the
    /// terminate signal.
    pub shutdown_grace: Duration,

    /// Grace period after the terminate signal before the kill signal.
    pub kill_grace: Duration,

    /// The protocol dialect this worker's child speaks.
    pub protocol: ProtocolVersion,

    /// Circuit breaker settings for this worker's request path.
    pub breaker: BreakerConfig,
}

impl WorkerConfig {
    /// A configuration for `model` with every other knob at its default.
    pub fn new(model: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_name: model.into(),
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model_name: "default".to_owned(),
            cache_dir: PathBuf::from("/tmp/syrinx-cache"),
            max_queue_size: 8,
            health_check_interval: Duration::from_secs(5),
            restart_on_failure: true,
            startup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(5),
            protocol: ProtocolVersion::CURRENT,
            breaker: BreakerConfig::default(),
        }
    }
}
