//! # syrinx: a fault-tolerant TTS worker pool
//!
//! Routes synthesis requests across a pool of externally spawned
//! synthesizer processes over a versioned line-delimited IPC protocol,
//! with per-worker circuit breakers, weighted load balancing, health
//! supervision, and advisory-driven autoscaling.
//!
//! ## The crates
//!
//! | Feature | Crate | What it adds |
//! |---------|-------|--------------|
//! | `protocol` | [`protocol`] | Envelope, codec, version negotiation |
//! | `worker` | [`worker`] | Supervised workers, circuit breakers |
//! | `pool` (default) | [`pool`] | Dispatcher, balancer, autoscaling |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use syrinx::pool::{Dispatcher, PoolConfig};
//! use syrinx::worker::ProcessLauncher;
//! use syrinx::protocol::SynthesisRequest;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::new("vits-small", "/var/cache/syrinx");
//! let launcher = Arc::new(ProcessLauncher::new("syrinx-synthd"));
//! let pool = Dispatcher::initialize(config, launcher).await?;
//!
//! let result = pool.synthesize(SynthesisRequest::new("hello world")).await?;
//! println!("spoken by {} in {}", result.worker_used, result.latency_ms);
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Wire protocol: messages, codec, versions, errors.
#[cfg(feature = "protocol")]
pub use syrinx_protocol as protocol;

/// Supervised synthesizer workers and circuit breakers.
#[cfg(feature = "worker")]
pub use syrinx_worker as worker;

/// The dispatcher, load balancer, and autoscaler.
#[cfg(feature = "pool")]
pub use syrinx_pool as pool;

#[cfg(feature = "pool")]
pub use syrinx_pool::{Dispatcher, PoolConfig};

#[cfg(feature = "protocol")]
pub use syrinx_protocol::{DispatchError, SynthesisRequest, SynthesisResult};
