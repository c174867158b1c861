//! In-memory scripted synthesizer peers.
//!
//! [`ScriptedSynth`] speaks the synthesizer wire protocol over a duplex
//! pipe with programmable per-request behavior, and
//! [`ScriptedLauncher`] plugs it into the launcher seam. Everything the
//! worker and dispatcher do (correlation, timeouts, breaker windows,
//! replacement) runs against the same code paths as with a real child
//! process, minus the process.

use std::sync::Arc;
use std::time::Duration;

use syrinx_protocol::{
    Codec, ErrorPayload, EventPayload, FrameDecoder, Message, Payload, ProtocolVersion,
    RequestPayload, ResponsePayload, WireMillis, WorkerError, WorkerEvent, WorkerId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::launcher::WorkerLauncher;
use crate::worker::Worker;

use async_trait::async_trait;

/// What the scripted peer does with one synthesize request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Respond success after `delay`.
    Success {
        /// Artificial processing time before the response is sent.
        delay: Duration,
        /// Child-reported `latency_ms`.
        latency_ms: u64,
        /// Child-reported cache flag.
        cache_hit: bool,
        /// Child-reported output path.
        output_path: Option<String>,
    },
    /// Respond with an error message after `delay`.
    Failure {
        /// Artificial processing time before the error is sent.
        delay: Duration,
        /// Machine-readable failure code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Never answer; the caller's deadline decides.
    Ignore,
    /// Drop the connection, simulating a crash mid-request.
    Exit,
}

impl ScriptedReply {
    /// Immediate success with the given child-side latency.
    pub fn ok(latency_ms: u64) -> Self {
        Self::ok_after(Duration::ZERO, latency_ms)
    }

    /// Success after `delay` with the given child-side latency.
    pub fn ok_after(delay: Duration, latency_ms: u64) -> Self {
        Self::Success {
            delay,
            latency_ms,
            cache_hit: false,
            output_path: None,
        }
    }

    /// Immediate failure with the given code.
    pub fn fail(code: impl Into<String>) -> Self {
        Self::Failure {
            delay: Duration::ZERO,
            code: code.into(),
            message: "scripted failure".to_owned(),
        }
    }
}

/// Behavior function: called with the 1-based synthesize count and the
/// request payload, returns what to do.
pub type SynthScript = Arc<dyn Fn(u64, &RequestPayload) -> ScriptedReply + Send + Sync>;

/// A scripted synthesizer peer.
pub struct ScriptedSynth {
    /// Dialect this peer speaks.
    pub protocol: ProtocolVersion,
    /// Delay before the readiness announcement; `None` never announces.
    pub ready_delay: Option<Duration>,
    /// Whether liveness pings are answered (health-failure tests mute them).
    pub answer_pings: bool,
    /// Per-request behavior.
    pub script: SynthScript,
}

impl ScriptedSynth {
    /// A peer driven by `script`.
    pub fn new(script: impl Fn(u64, &RequestPayload) -> ScriptedReply + Send + Sync + 'static) -> Self {
        Self {
            protocol: ProtocolVersion::CURRENT,
            ready_delay: Some(Duration::from_millis(10)),
            answer_pings: true,
            script: Arc::new(script),
        }
    }

    /// A peer answering every synthesize request the same way.
    pub fn always(reply: ScriptedReply) -> Self {
        Self::new(move |_, _| reply.clone())
    }

    /// Announce readiness after `delay`.
    #[must_use]
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_delay = Some(delay);
        self
    }

    /// Never announce readiness (startup-timeout tests).
    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.ready_delay = None;
        self
    }

    /// Speak the given protocol dialect.
    #[must_use]
    pub fn speaking(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// Stop answering liveness pings.
    #[must_use]
    pub fn mute_pings(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    /// Drive the protocol over `io` until shutdown, crash, or EOF.
    pub async fn run(self, io: DuplexStream) {
        let codec = Codec::new(self.protocol);
        let (mut read_half, write_half) = tokio::io::split(io);
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        if let Some(delay) = self.ready_delay {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            send(codec, &writer, &Message::event(EventPayload::ready())).await;
        }

        let mut frames = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        let mut synth_count: u64 = 0;

        'serve: loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let lines = match frames.feed(&buf[..n]) {
                Ok(lines) => lines,
                Err(_) => break,
            };
            for line in lines {
                let Ok(msg) = codec.decode(&line) else {
                    continue;
                };
                let Payload::Request(req) = msg.payload.clone() else {
                    continue;
                };
                match req {
                    RequestPayload::Ping => {
                        if self.answer_pings {
                            send(
                                codec,
                                &writer,
                                &Message::response_to(&msg, ResponsePayload::success()),
                            )
                            .await;
                        }
                    }
                    RequestPayload::GetMetrics => {
                        send(codec, &writer, &Message::response_to(&msg, ResponsePayload::success()))
                            .await;
                    }
                    RequestPayload::SwitchModel { .. } => {
                        send(codec, &writer, &Message::response_to(&msg, ResponsePayload::success()))
                            .await;
                    }
                    RequestPayload::Shutdown => break 'serve,
                    RequestPayload::Synthesize { .. } => {
                        synth_count += 1;
                        match (self.script)(synth_count, &req) {
                            ScriptedReply::Success {
                                delay,
                                latency_ms,
                                cache_hit,
                                output_path,
                            } => {
                                let mut payload = ResponsePayload::success();
                                payload.latency_ms = Some(WireMillis::from_millis(latency_ms));
                                payload.cache_hit = Some(cache_hit);
                                payload.output_path = output_path;
                                let reply = Message::response_to(&msg, payload);
                                defer_send(codec, &writer, reply, delay);
                            }
                            ScriptedReply::Failure {
                                delay,
                                code,
                                message,
                            } => {
                                let reply =
                                    Message::error_to(&msg, ErrorPayload::new(code, message));
                                defer_send(codec, &writer, reply, delay);
                            }
                            ScriptedReply::Ignore => {}
                            ScriptedReply::Exit => break 'serve,
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

fn defer_send(
    codec: Codec,
    writer: &Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    reply: Message,
    delay: Duration,
) {
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        send(codec, &writer, &reply).await;
    });
}

async fn send(
    codec: Codec,
    writer: &Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    msg: &Message,
) {
    let Ok(line) = codec.encode(msg) else { return };
    let mut w = writer.lock().await;
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.flush().await;
}

/// Launches a fresh [`ScriptedSynth`] peer per worker.
pub struct ScriptedLauncher {
    factory: Arc<dyn Fn() -> ScriptedSynth + Send + Sync>,
}

impl ScriptedLauncher {
    /// A launcher producing one peer per launch via `factory`.
    pub fn new(factory: impl Fn() -> ScriptedSynth + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// A launcher whose peers answer every request the same way.
    pub fn always(reply: ScriptedReply) -> Self {
        Self::new(move || ScriptedSynth::always(reply.clone()))
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        config: WorkerConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Worker, WorkerError> {
        let synth = (self.factory)();
        let mut config = config;
        config.protocol = synth.protocol;

        let (worker_io, peer_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(synth.run(peer_io));

        let (reader, writer) = tokio::io::split(worker_io);
        Ok(Worker::from_pipes(id, config, reader, writer, events))
    }
}
