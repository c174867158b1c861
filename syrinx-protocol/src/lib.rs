//! # syrinx-protocol: wire protocol for synthesizer workers
//!
//! The IPC contract between the dispatch stack and its child synthesizer
//! processes: a newline-terminated stream of UTF-8 JSON objects on
//! stdin/stdout, versioned envelopes with correlation IDs, and a
//! backward-compatibility layer for envelope-less v1 peers.
//!
//! ## The pieces
//!
//! | Module | What it owns |
//! |--------|--------------|
//! | [`message`] | The envelope and its typed payloads |
//! | [`codec`] | Line framing and all wire adaptation |
//! | [`version`] | The supported set, negotiation, v1 upgrade/strip |
//! | [`request`] | Caller-facing request/result types |
//! | [`lifecycle`] | Worker/circuit state vocabulary shared up the stack |
//! | [`error`] | The kinded error taxonomy |
//!
//! ## Design principle
//!
//! The wire shape exists only inside the codec. Everything above it
//! (workers, breakers, the balancer, the dispatcher) handles canonical
//! typed messages, so a protocol revision is a codec change, not a
//! system change.

#![deny(missing_docs)]

pub mod codec;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod message;
pub mod millis;
pub mod request;
pub mod version;

// Re-exports for convenience
pub use codec::{Codec, FrameDecoder};
pub use error::{DispatchError, ProtocolError, WorkerError};
pub use id::{MessageId, RequestId, WorkerId};
pub use lifecycle::{
    CircuitState, ScalingAdvice, WorkerEvent, WorkerEventKind, WorkerState,
};
pub use message::{
    ErrorPayload, EventNotice, EventPayload, HeartbeatPayload, Message, MessageKind, MessageMeta,
    OutputFormat, Payload, Priority, RequestPayload, ResponsePayload,
};
pub use millis::WireMillis;
pub use request::{SynthesisRequest, SynthesisResult};
pub use version::{ProtocolVersion, VersionRange, negotiate};
