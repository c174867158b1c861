//! # syrinx-pool: the worker fleet dispatcher
//!
//! The caller-facing surface of the synthesis stack. A [`Dispatcher`]
//! owns a fleet of [`syrinx_worker::Worker`]s, routes each request
//! through the [`LoadBalancer`]'s policy and the chosen worker's
//! circuit breaker, supervises worker health with automatic
//! replacement, and scales the fleet on the balancer's advisory.

#![deny(missing_docs)]

pub mod balancer;
pub mod dispatcher;
pub mod metrics;

// Re-exports for convenience
pub use balancer::{
    BalanceAlgorithm, BalancerConfig, CandidateWorker, FleetObservation, LoadBalancer,
    WeightedKnobs, WorkerLoadView,
};
pub use dispatcher::{Dispatcher, PoolConfig};
pub use metrics::{
    HealthSnapshot, LatencyPercentiles, MetricsSnapshot, ScalingDecision, WorkerHealth,
};
