//! The IPC message envelope and its typed payloads.
//!
//! The wire carries `payload` as a free-form JSON object; internally every
//! payload is a tagged variant keyed by message type, and all adaptation
//! between the two happens in the codec. Code above the codec never touches
//! untyped JSON.

use crate::id::{MessageId, WorkerId};
use crate::millis::WireMillis;
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The message-type enumeration of the wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Outbound command awaiting a correlated response.
    Request,
    /// Correlated answer to a request.
    Response,
    /// Unsolicited notification from the child.
    Event,
    /// Correlated failure answer to a request.
    Error,
    /// Liveness chatter; accepted and ignored.
    Heartbeat,
}

impl MessageKind {
    /// The wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire string into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "event" => Some(Self::Event),
            "error" => Some(Self::Error),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Request priority. Affects balancer scoring, never queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Interactive speech; earns a scoring boost on lightly loaded workers.
    High,
}

/// Optional envelope metadata.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    /// The `message_id` of the originating request, echoed on its
    /// response or error. Higher layers demultiplex on this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,

    /// The worker this message is addressed to or originated from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Request priority, carried for the child's own scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Provenance marker set when a lower-version message was upgraded
    /// on ingress. Holds the original version string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgraded_from: Option<String>,
}

impl MessageMeta {
    /// True when every field is unset (the envelope omits empty metadata).
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.worker_id.is_none()
            && self.priority.is_none()
            && self.upgraded_from.is_none()
    }
}

/// Commands sent to the child synthesizer.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    /// Synthesize speech from text.
    Synthesize {
        /// The text to speak. Validated non-empty and bounded upstream.
        text: String,
        /// Voice/model affinity hint, opaque to the dispatcher.
        #[serde(skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
        /// Speech rate multiplier, clamped at the worker boundary.
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        /// Pitch multiplier, clamped at the worker boundary.
        #[serde(skip_serializing_if = "Option::is_none")]
        pitch: Option<f64>,
        /// Requested container format.
        #[serde(skip_serializing_if = "Option::is_none")]
        output_format: Option<OutputFormat>,
        /// Opaque sink identifier, passed verbatim to the child.
        #[serde(skip_serializing_if = "Option::is_none")]
        output_path: Option<String>,
    },
    /// Swap the loaded model.
    SwitchModel {
        /// Model identifier the child should load.
        model: String,
    },
    /// Ask the child for its internal metrics.
    GetMetrics,
    /// Liveness probe.
    Ping,
    /// Cooperative shutdown command.
    Shutdown,
}

impl RequestPayload {
    /// The wire tag of this request, used in error reporting.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Synthesize { .. } => "synthesize",
            Self::SwitchModel { .. } => "switch_model",
            Self::GetMetrics => "get_metrics",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Audio container formats the request surface recognizes. The dispatcher
/// never inspects audio; the enum only closes the wire enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// RIFF WAVE.
    Wav,
    /// MPEG layer III.
    Mp3,
    /// Ogg container.
    Ogg,
}

/// A correlated answer from the child.
///
/// `extra` keeps unmodeled fields (model metrics, debug counters) intact
/// across a decode/encode round trip; response payloads are open by
/// design, the envelope is not.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Child-reported status; `"success"` is the happy path.
    pub status: String,
    /// Where the audio landed, when the child wrote a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Child-measured synthesis latency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<WireMillis>,
    /// Whether the child served this from its cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    /// Unmodeled response fields, carried through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsePayload {
    /// A bare success response.
    pub fn success() -> Self {
        Self {
            status: "success".to_owned(),
            ..Self::default()
        }
    }

    /// Whether the child reported success.
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Unsolicited notifications from the child.
///
/// The wire has two event shapes: a status announcement
/// (`{"status":"ready"}`) and typed notices keyed by `type`. The untagged
/// enum tries the status shape first; anything carrying a `type` key falls
/// through to [`EventNotice`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Lifecycle status announcement, e.g. `{"status":"ready"}`.
    Status {
        /// The announced status.
        status: String,
    },
    /// Typed notification, e.g. `{"type":"synthesis_complete",...}`.
    Notice(EventNotice),
}

impl EventPayload {
    /// The readiness announcement.
    pub fn ready() -> Self {
        Self::Status {
            status: "ready".to_owned(),
        }
    }

    /// Whether this event announces readiness.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Status { status } if status == "ready")
    }
}

/// Typed event notices keyed by `type`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventNotice {
    /// A model finished loading.
    ModelLoaded {
        /// The model now active.
        model: String,
    },
    /// A synthesis completed; informational, the response is authoritative.
    SynthesisComplete {
        /// Child-measured latency.
        latency_ms: WireMillis,
    },
    /// A synthesis failed; informational, the error message is authoritative.
    SynthesisFailed {
        /// Child-measured latency, when the child got far enough to time it.
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<WireMillis>,
        /// Failure description.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A correlated failure answer from the child.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable failure code.
    pub error: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorPayload {
    /// Build an error payload from a code and message.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: Some(message.into()),
        }
    }
}

/// Heartbeat payload. Nothing in it is load-bearing.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Child-side send time, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireMillis>,
}

/// The canonical payload variant, keyed by message type.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A command to the child.
    Request(RequestPayload),
    /// A correlated answer.
    Response(ResponsePayload),
    /// An unsolicited notification.
    Event(EventPayload),
    /// A correlated failure.
    Error(ErrorPayload),
    /// Liveness chatter.
    Heartbeat(HeartbeatPayload),
}

impl Payload {
    /// The message kind this payload belongs under.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::Event(_) => MessageKind::Event,
            Self::Error(_) => MessageKind::Error,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }
}

/// The canonical in-memory message.
///
/// The envelope is *not* serde-derived: the wire shape (camelCase keys,
/// version strings, free-form payload object) is produced and consumed
/// only by the codec, so wire adaptation cannot leak into business logic.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Protocol version this message is stamped with.
    pub version: ProtocolVersion,
    /// Unique message identity; the correlation key for its answer.
    pub message_id: MessageId,
    /// Wall-clock send time.
    pub timestamp: WireMillis,
    /// The typed payload.
    pub payload: Payload,
    /// Optional envelope metadata.
    pub metadata: MessageMeta,
}

impl Message {
    fn fresh(payload: Payload) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            message_id: MessageId::generate(),
            timestamp: WireMillis::now(),
            payload,
            metadata: MessageMeta::default(),
        }
    }

    /// A new request message with a generated identity.
    pub fn request(payload: RequestPayload) -> Self {
        Self::fresh(Payload::Request(payload))
    }

    /// A new event message with a generated identity.
    pub fn event(payload: EventPayload) -> Self {
        Self::fresh(Payload::Event(payload))
    }

    /// A new heartbeat message.
    pub fn heartbeat() -> Self {
        Self::fresh(Payload::Heartbeat(HeartbeatPayload::default()))
    }

    /// A response correlated to `request`.
    pub fn response_to(request: &Message, payload: ResponsePayload) -> Self {
        let mut msg = Self::fresh(Payload::Response(payload));
        msg.metadata.correlation_id = Some(request.message_id.clone());
        msg
    }

    /// An error correlated to `request`.
    pub fn error_to(request: &Message, payload: ErrorPayload) -> Self {
        let mut msg = Self::fresh(Payload::Error(payload));
        msg.metadata.correlation_id = Some(request.message_id.clone());
        msg
    }

    /// Stamp the worker this message concerns.
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.metadata.worker_id = Some(worker);
        self
    }

    /// Stamp a priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = Some(priority);
        self
    }

    /// The message kind, derived from the payload so the two can never
    /// disagree.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// The correlation ID, when this message answers a request.
    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.metadata.correlation_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_payload_tags_are_wire_strings() {
        let ping = serde_json::to_value(RequestPayload::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));

        let switch = serde_json::to_value(RequestPayload::SwitchModel {
            model: "vits-large".into(),
        })
        .unwrap();
        assert_eq!(switch, json!({"type": "switch_model", "model": "vits-large"}));
    }

    #[test]
    fn synthesize_payload_omits_unset_fields() {
        let req = RequestPayload::Synthesize {
            text: "hello".into(),
            voice: None,
            speed: None,
            pitch: None,
            output_format: None,
            output_path: None,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "synthesize", "text": "hello"})
        );
    }

    #[test]
    fn event_payload_distinguishes_status_from_notice() {
        let ready: EventPayload = serde_json::from_value(json!({"status": "ready"})).unwrap();
        assert!(ready.is_ready());

        let notice: EventPayload =
            serde_json::from_value(json!({"type": "model_loaded", "model": "m"})).unwrap();
        assert_eq!(
            notice,
            EventPayload::Notice(EventNotice::ModelLoaded { model: "m".into() })
        );
    }

    #[test]
    fn response_payload_keeps_unmodeled_fields() {
        let value = json!({"status": "success", "latency_ms": 42, "queue_len": 3});
        let parsed: ResponsePayload = serde_json::from_value(value.clone()).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.latency_ms, Some(WireMillis::from_millis(42)));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), value);
    }

    #[test]
    fn correlation_is_copied_from_request() {
        let req = Message::request(RequestPayload::Ping);
        let resp = Message::response_to(&req, ResponsePayload::success());
        assert_eq!(resp.correlation_id(), Some(&req.message_id));
        assert_eq!(resp.kind(), MessageKind::Response);
    }
}
