//! Line framing and wire adaptation.
//!
//! One frame is one UTF-8 JSON object terminated by `\n`. Outbound,
//! [`Codec::encode`] produces the full line for whichever version the
//! peer negotiated; inbound, [`FrameDecoder`] accumulates raw bytes and
//! yields complete lines, and [`Codec::decode`] turns each line into a
//! canonical [`Message`]. All version adaptation happens here and only
//! here.

use crate::error::ProtocolError;
use crate::id::MessageId;
use crate::message::{
    ErrorPayload, EventPayload, HeartbeatPayload, Message, MessageKind, MessageMeta, Payload,
    RequestPayload, ResponsePayload,
};
use crate::millis::WireMillis;
use crate::version::{self, ProtocolVersion};
use serde_json::{Map, Value, json};

/// Encoder/decoder bound to a negotiated peer version.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    peer: ProtocolVersion,
}

impl Codec {
    /// A codec speaking `peer`'s dialect.
    pub fn new(peer: ProtocolVersion) -> Self {
        Self { peer }
    }

    /// The version this codec speaks.
    pub fn peer_version(&self) -> ProtocolVersion {
        self.peer
    }

    /// Encode a message as a single newline-terminated line.
    ///
    /// For a v1 peer the envelope is stripped and the bare payload goes
    /// out verbatim. Compact JSON never contains a raw newline, but the
    /// frame invariant is checked rather than assumed.
    pub fn encode(&self, message: &Message) -> Result<String, ProtocolError> {
        let value = match self.peer {
            ProtocolVersion::V1 => version::downgrade_v1(message)?,
            ProtocolVersion::V2 => to_wire_value(message)?,
        };
        let mut line = serde_json::to_string(&value)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        if line.contains('\n') {
            return Err(ProtocolError::MalformedFrame(
                "encoded frame contains an embedded newline".to_owned(),
            ));
        }
        line.push('\n');
        Ok(line)
    }

    /// Decode one complete line into a canonical message.
    ///
    /// v1 lines are upgraded through the compatibility layer; v2 lines
    /// are validated strictly against the envelope contract.
    pub fn decode(&self, line: &str) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        match self.peer {
            ProtocolVersion::V1 => version::upgrade_v1(value),
            ProtocolVersion::V2 => from_wire_value(value),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(ProtocolVersion::CURRENT)
    }
}

/// Serialize the canonical envelope into its v2 wire shape.
fn to_wire_value(message: &Message) -> Result<Value, ProtocolError> {
    let payload = match &message.payload {
        Payload::Request(p) => serde_json::to_value(p),
        Payload::Response(p) => serde_json::to_value(p),
        Payload::Event(p) => serde_json::to_value(p),
        Payload::Error(p) => serde_json::to_value(p),
        Payload::Heartbeat(p) => serde_json::to_value(p),
    }
    .map_err(|e| ProtocolError::MalformedPayload {
        kind: message.kind().as_str(),
        detail: e.to_string(),
    })?;

    let mut obj = json!({
        "version": message.version.as_str(),
        "messageId": message.message_id.as_str(),
        "timestamp": message.timestamp.as_millis(),
        "type": message.kind().as_str(),
        "payload": payload,
    });

    if !message.metadata.is_empty() {
        let meta = serde_json::to_value(&message.metadata)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        obj["metadata"] = meta;
    }

    Ok(obj)
}

/// Parse and validate a v2 wire object into the canonical envelope.
fn from_wire_value(value: Value) -> Result<Message, ProtocolError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::MalformedFrame("frame is not a JSON object".to_owned()))?;

    let version_str = required_str(obj, "version")?;
    let version = ProtocolVersion::parse(version_str)
        .ok_or_else(|| ProtocolError::UnsupportedVersion(version_str.to_owned()))?;

    let message_id = MessageId::new(required_str(obj, "messageId")?);

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_u64)
        .map(WireMillis::from_millis)
        .unwrap_or_default();

    let kind_str = required_str(obj, "type")?;
    let kind = MessageKind::parse(kind_str)
        .ok_or_else(|| ProtocolError::UnknownType(kind_str.to_owned()))?;

    let payload_value = obj
        .get("payload")
        .cloned()
        .ok_or(ProtocolError::MissingField("payload"))?;
    let payload = parse_payload(kind, payload_value)?;

    let metadata = match obj.get("metadata") {
        Some(meta) => serde_json::from_value::<MessageMeta>(meta.clone())
            .map_err(|e| ProtocolError::MalformedFrame(format!("bad metadata: {e}")))?,
        None => MessageMeta::default(),
    };

    Ok(Message {
        version,
        message_id,
        timestamp,
        payload,
        metadata,
    })
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(field))
}

fn parse_payload(kind: MessageKind, value: Value) -> Result<Payload, ProtocolError> {
    let malformed = |e: serde_json::Error| ProtocolError::MalformedPayload {
        kind: kind.as_str(),
        detail: e.to_string(),
    };
    Ok(match kind {
        MessageKind::Request => {
            Payload::Request(serde_json::from_value::<RequestPayload>(value).map_err(malformed)?)
        }
        MessageKind::Response => {
            Payload::Response(serde_json::from_value::<ResponsePayload>(value).map_err(malformed)?)
        }
        MessageKind::Event => {
            Payload::Event(serde_json::from_value::<EventPayload>(value).map_err(malformed)?)
        }
        MessageKind::Error => {
            Payload::Error(serde_json::from_value::<ErrorPayload>(value).map_err(malformed)?)
        }
        MessageKind::Heartbeat => Payload::Heartbeat(
            serde_json::from_value::<HeartbeatPayload>(value).map_err(malformed)?,
        ),
    })
}

/// Incremental inbound framer.
///
/// Feed it raw reads; it splits on `\n`, retains the partial trailing
/// fragment for the next read, and skips blank lines. The buffer is
/// capped so a child that never sends a newline cannot grow memory
/// without bound.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameDecoder {
    /// Default cap on a single frame's size, in bytes.
    pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

    /// A decoder with the default frame cap.
    pub fn new() -> Self {
        Self::with_max_frame(Self::DEFAULT_MAX_FRAME)
    }

    /// A decoder with a custom frame cap.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Append raw bytes and return every complete line they finish.
    ///
    /// # Errors
    ///
    /// A completed line that is not valid UTF-8, or a partial frame
    /// exceeding the cap, is a [`ProtocolError::MalformedFrame`]. The
    /// internal buffer is reset either way so one bad frame does not
    /// poison the stream.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw[..raw.len() - 1]).map_err(|e| {
                ProtocolError::MalformedFrame(format!("frame is not UTF-8: {e}"))
            })?;
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }

        if self.buf.len() > self.max_frame {
            self.buf.clear();
            return Err(ProtocolError::MalformedFrame(format!(
                "frame exceeds {} bytes without a newline",
                self.max_frame
            )));
        }

        Ok(lines)
    }

    /// Bytes currently held for the next read.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::WorkerId;
    use crate::message::{EventNotice, Priority};

    fn codec() -> Codec {
        Codec::new(ProtocolVersion::V2)
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::request(RequestPayload::Synthesize {
                text: "hello world".into(),
                voice: Some("voice-a".into()),
                speed: Some(1.25),
                pitch: None,
                output_format: Some(crate::message::OutputFormat::Wav),
                output_path: Some("/tmp/out.wav".into()),
            })
            .with_worker(WorkerId::new("w-1"))
            .with_priority(Priority::High),
            Message::request(RequestPayload::Ping),
            {
                let req = Message::request(RequestPayload::GetMetrics);
                let mut resp = ResponsePayload::success();
                resp.latency_ms = Some(WireMillis::from_millis(42));
                resp.cache_hit = Some(true);
                Message::response_to(&req, resp)
            },
            Message::event(EventPayload::ready()),
            Message::event(EventPayload::Notice(EventNotice::SynthesisComplete {
                latency_ms: WireMillis::from_millis(17),
            })),
            {
                let req = Message::request(RequestPayload::Ping);
                Message::error_to(&req, ErrorPayload::new("oom", "model too large"))
            },
            Message::heartbeat(),
        ]
    }

    #[test]
    fn round_trip_law_holds_for_every_kind() {
        let codec = codec();
        for msg in sample_messages() {
            let line = codec.encode(&msg).unwrap();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1);
            let back = codec.decode(line.trim_end()).unwrap();
            assert_eq!(back, msg, "round trip broke for {:?}", msg.kind());
        }
    }

    #[test]
    fn decode_rejects_missing_envelope_fields() {
        let codec = codec();
        for (line, field) in [
            (r#"{"messageId":"m","type":"request","payload":{"type":"ping"}}"#, "version"),
            (r#"{"version":"2.0.0","type":"request","payload":{"type":"ping"}}"#, "messageId"),
            (r#"{"version":"2.0.0","messageId":"m","payload":{"type":"ping"}}"#, "type"),
            (r#"{"version":"2.0.0","messageId":"m","type":"request"}"#, "payload"),
        ] {
            match codec.decode(line) {
                Err(ProtocolError::MissingField(f)) => assert_eq!(f, field),
                other => panic!("expected missing `{field}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn decode_rejects_unknown_type_and_version() {
        let codec = codec();
        let line = r#"{"version":"2.0.0","messageId":"m","type":"gossip","payload":{}}"#;
        assert!(matches!(
            codec.decode(line),
            Err(ProtocolError::UnknownType(t)) if t == "gossip"
        ));

        let line = r#"{"version":"9.0.0","messageId":"m","type":"request","payload":{"type":"ping"}}"#;
        assert!(matches!(
            codec.decode(line),
            Err(ProtocolError::UnsupportedVersion(v)) if v == "9.0.0"
        ));
    }

    #[test]
    fn correlation_id_survives_the_wire() {
        let codec = codec();
        let req = Message::request(RequestPayload::Ping);
        let resp = Message::response_to(&req, ResponsePayload::success());
        let back = codec.decode(codec.encode(&resp).unwrap().trim_end()).unwrap();
        assert_eq!(back.correlation_id(), Some(&req.message_id));
    }

    #[test]
    fn v1_codec_strips_and_upgrades() {
        let codec = Codec::new(ProtocolVersion::V1);

        let req = Message::request(RequestPayload::Synthesize {
            text: "x".into(),
            voice: None,
            speed: None,
            pitch: None,
            output_format: None,
            output_path: None,
        });
        let line = codec.encode(&req).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap(),
            json!({"type": "synthesize", "text": "x"})
        );

        let upgraded = codec.decode(r#"{"status":"success","latency_ms":3}"#).unwrap();
        assert_eq!(upgraded.version, ProtocolVersion::CURRENT);
        assert_eq!(upgraded.metadata.upgraded_from.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn frame_decoder_retains_partial_trailing_data() {
        let mut fd = FrameDecoder::new();
        assert_eq!(fd.feed(b"{\"a\":1}\n{\"b\"").unwrap(), vec!["{\"a\":1}"]);
        assert_eq!(fd.pending_bytes(), 5);
        assert_eq!(fd.feed(b":2}\n").unwrap(), vec!["{\"b\":2}"]);
        assert_eq!(fd.pending_bytes(), 0);
    }

    #[test]
    fn frame_decoder_skips_blank_lines_and_caps_frames() {
        let mut fd = FrameDecoder::with_max_frame(8);
        assert!(fd.feed(b"\n  \n").unwrap().is_empty());
        assert!(fd.feed(b"0123456789").is_err());
        // Buffer was reset; the decoder keeps working.
        assert_eq!(fd.feed(b"{}\n").unwrap(), vec!["{}"]);
    }
}
