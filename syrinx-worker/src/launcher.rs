//! The worker spawning seam.
//!
//! Launching is operation-defined: "produce a connected, supervised
//! [`Worker`]", not "fork a process". The production implementation
//! spawns the synthesizer binary; tests launch in-memory peers through
//! the same trait, so the dispatcher never knows the difference.

use async_trait::async_trait;
use std::path::PathBuf;
use syrinx_protocol::{WorkerError, WorkerEvent, WorkerId};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::worker::Worker;

/// Produces connected workers for the dispatcher.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker with the given identity and configuration.
    ///
    /// The worker publishes its lifecycle events on `events`. Returning
    /// `Ok` means the worker exists and is INITIALIZING; readiness is
    /// observed separately via [`Worker::wait_ready`].
    ///
    /// # Errors
    ///
    /// [`WorkerError::InitializationFailed`] when the worker cannot be
    /// brought up at all.
    async fn launch(
        &self,
        id: WorkerId,
        config: WorkerConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Worker, WorkerError>;
}

/// Launches the synthesizer binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// A launcher for `program` with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments passed to every spawned child.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        config: WorkerConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Worker, WorkerError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        Worker::spawn(id, config, command, events)
    }
}
