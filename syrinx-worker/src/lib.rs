//! # syrinx-worker: supervised synthesizer workers
//!
//! One [`Worker`] per child synthesizer process: lifecycle state
//! machine, request/response correlation, health probing, statistics,
//! and a per-worker [`CircuitBreaker`] around the request path.
//!
//! Workers are launched through the [`WorkerLauncher`] seam
//! ([`ProcessLauncher`] for the real binary, the `test-utils` scripted
//! peers for everything else) and publish [`WorkerEvent`]s the
//! dispatcher supervises on.
//!
//! [`WorkerEvent`]: syrinx_protocol::WorkerEvent

#![deny(missing_docs)]

pub mod breaker;
pub mod config;
pub mod launcher;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerError, BreakerEvent, BreakerStatus, CircuitBreaker};
pub use config::WorkerConfig;
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use worker::{Worker, WorkerStats};
