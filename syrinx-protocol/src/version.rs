//! Protocol versions, negotiation, and the v1 compatibility layer.
//!
//! The supported set is a closed enumeration known at build time. v1 is
//! the envelope-less dialect older synthesizers speak: bare payload
//! objects, no `version`, no `messageId`, no metadata. The compatibility
//! layer upgrades v1 on ingress and strips the envelope on egress, so
//! everything above the codec sees canonical messages only.

use crate::error::ProtocolError;
use crate::id::MessageId;
use crate::message::{
    ErrorPayload, EventPayload, Message, MessageMeta, Payload, RequestPayload, ResponsePayload,
};
use crate::millis::WireMillis;
use serde_json::Value;

/// A protocol version from the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Envelope-less bare payloads.
    V1,
    /// The current enveloped dialect.
    V2,
}

impl ProtocolVersion {
    /// The version new messages are stamped with.
    pub const CURRENT: Self = Self::V2;

    /// Every version this build understands, ascending.
    pub const SUPPORTED: &'static [Self] = &[Self::V1, Self::V2];

    /// The full semver string for this version.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1.0.0",
            Self::V2 => "2.0.0",
        }
    }

    /// Parse a semver string. Minor and patch are accepted loosely;
    /// compatibility is decided by major version alone.
    pub fn parse(s: &str) -> Option<Self> {
        let major = s.split('.').next()?;
        match major {
            "1" => Some(Self::V1),
            "2" => Some(Self::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The version range a peer declares when connecting.
#[derive(Debug, Clone)]
pub struct VersionRange {
    /// Lowest version the peer speaks.
    pub min: String,
    /// Highest version the peer speaks.
    pub max: String,
    /// The version the peer would rather use, when it has an opinion.
    pub preferred: Option<String>,
}

impl VersionRange {
    /// A range spanning a single version.
    pub fn exactly(version: ProtocolVersion) -> Self {
        Self {
            min: version.as_str().to_owned(),
            max: version.as_str().to_owned(),
            preferred: Some(version.as_str().to_owned()),
        }
    }
}

/// Choose the version to speak with a peer declaring `range`.
///
/// The peer's `preferred` wins when it is mutually supported; otherwise
/// the highest mutually supported version wins; an empty intersection
/// fails with `incompatible_protocol`.
pub fn negotiate(range: &VersionRange) -> Result<ProtocolVersion, ProtocolError> {
    let incompatible = || ProtocolError::Incompatible {
        client_min: range.min.clone(),
        client_max: range.max.clone(),
    };

    fn major(s: &str) -> Option<u64> {
        s.split('.').next()?.parse().ok()
    }

    let client_min = major(&range.min).ok_or_else(incompatible)?;
    let client_max = major(&range.max).ok_or_else(incompatible)?;
    if client_min > client_max {
        return Err(incompatible());
    }

    let in_client_range = |v: ProtocolVersion| {
        let m = match v {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        };
        m >= client_min && m <= client_max
    };

    if let Some(preferred) = range.preferred.as_deref().and_then(ProtocolVersion::parse)
        && in_client_range(preferred)
    {
        return Ok(preferred);
    }

    ProtocolVersion::SUPPORTED
        .iter()
        .rev()
        .find(|v| in_client_range(**v))
        .copied()
        .ok_or_else(incompatible)
}

/// Upgrade a bare v1 payload into a canonical message.
///
/// v1 frames carry no envelope, so the type is inferred from payload
/// fields: a known request tag means request, a `ready` status is the
/// readiness event, any other `status` is a response, and a present
/// `error` field is an error. The result gets a synthesized `messageId`
/// and an `upgradedFrom` provenance marker.
pub fn upgrade_v1(value: Value) -> Result<Message, ProtocolError> {
    let obj = value.as_object().ok_or_else(|| {
        ProtocolError::MalformedFrame("v1 frame is not a JSON object".to_owned())
    })?;

    let payload = if let Some(tag) = obj.get("type").and_then(Value::as_str) {
        match tag {
            "synthesize" | "switch_model" | "get_metrics" | "ping" | "shutdown" => {
                let req: RequestPayload = serde_json::from_value(value.clone()).map_err(|e| {
                    ProtocolError::MalformedPayload {
                        kind: "request",
                        detail: e.to_string(),
                    }
                })?;
                Payload::Request(req)
            }
            _ => {
                let ev: EventPayload = serde_json::from_value(value.clone()).map_err(|e| {
                    ProtocolError::MalformedPayload {
                        kind: "event",
                        detail: e.to_string(),
                    }
                })?;
                Payload::Event(ev)
            }
        }
    } else if obj.get("error").is_some() {
        let err: ErrorPayload = serde_json::from_value(value.clone()).map_err(|e| {
            ProtocolError::MalformedPayload {
                kind: "error",
                detail: e.to_string(),
            }
        })?;
        Payload::Error(err)
    } else if obj.get("status").is_some_and(|s| s == "ready") {
        Payload::Event(EventPayload::ready())
    } else if obj.get("status").is_some() {
        let resp: ResponsePayload = serde_json::from_value(value.clone()).map_err(|e| {
            ProtocolError::MalformedPayload {
                kind: "response",
                detail: e.to_string(),
            }
        })?;
        Payload::Response(resp)
    } else {
        return Err(ProtocolError::MalformedFrame(
            "v1 frame has neither `type`, `status`, nor `error`".to_owned(),
        ));
    };

    Ok(Message {
        version: ProtocolVersion::CURRENT,
        message_id: MessageId::generate(),
        timestamp: WireMillis::now(),
        payload,
        metadata: MessageMeta {
            upgraded_from: Some(ProtocolVersion::V1.as_str().to_owned()),
            ..MessageMeta::default()
        },
    })
}

/// Strip a canonical message down to the bare payload a v1 peer expects.
pub fn downgrade_v1(message: &Message) -> Result<Value, ProtocolError> {
    let value = match &message.payload {
        Payload::Request(p) => serde_json::to_value(p),
        Payload::Response(p) => serde_json::to_value(p),
        Payload::Event(p) => serde_json::to_value(p),
        Payload::Error(p) => serde_json::to_value(p),
        Payload::Heartbeat(p) => serde_json::to_value(p),
    };
    value.map_err(|e| ProtocolError::MalformedPayload {
        kind: message.kind().as_str(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: &str, max: &str, preferred: Option<&str>) -> VersionRange {
        VersionRange {
            min: min.to_owned(),
            max: max.to_owned(),
            preferred: preferred.map(str::to_owned),
        }
    }

    #[test]
    fn negotiation_prefers_the_preferred_version() {
        let v = negotiate(&range("1.0.0", "2.0.0", Some("1.0.0"))).unwrap();
        assert_eq!(v, ProtocolVersion::V1);
    }

    #[test]
    fn negotiation_falls_back_to_highest_mutual() {
        let v = negotiate(&range("1.0.0", "2.0.0", None)).unwrap();
        assert_eq!(v, ProtocolVersion::V2);

        // Preferred outside the client's own range is ignored.
        let v = negotiate(&range("2.0.0", "2.0.0", Some("1.0.0"))).unwrap();
        assert_eq!(v, ProtocolVersion::V2);
    }

    #[test]
    fn negotiation_clamps_future_client_ranges() {
        let v = negotiate(&range("1.0.0", "9.0.0", None)).unwrap();
        assert_eq!(v, ProtocolVersion::V2);
    }

    #[test]
    fn negotiation_fails_on_empty_intersection() {
        let err = negotiate(&range("0.1.0", "0.9.0", None)).unwrap_err();
        assert_eq!(err.kind(), "incompatible_protocol");

        let err = negotiate(&range("3.0.0", "4.0.0", None)).unwrap_err();
        assert_eq!(err.kind(), "incompatible_protocol");
    }

    #[test]
    fn v1_synthesize_upgrades_to_a_request() {
        let msg = upgrade_v1(serde_json::json!({"type": "synthesize", "text": "x"})).unwrap();
        assert!(matches!(
            msg.payload,
            Payload::Request(RequestPayload::Synthesize { ref text, .. }) if text == "x"
        ));
        assert_eq!(msg.metadata.upgraded_from.as_deref(), Some("1.0.0"));
        assert!(!msg.message_id.as_str().is_empty());
    }

    #[test]
    fn v1_status_upgrades_to_event_or_response() {
        let ready = upgrade_v1(serde_json::json!({"status": "ready"})).unwrap();
        assert!(matches!(
            ready.payload,
            Payload::Event(ref e) if e.is_ready()
        ));

        let done = upgrade_v1(serde_json::json!({"status": "success", "latency_ms": 7})).unwrap();
        assert!(matches!(
            done.payload,
            Payload::Response(ref r) if r.is_success()
        ));
    }

    #[test]
    fn v1_error_field_upgrades_to_error() {
        let msg = upgrade_v1(serde_json::json!({"error": "oom", "message": "model too big"}))
            .unwrap();
        assert!(matches!(
            msg.payload,
            Payload::Error(ref e) if e.error == "oom"
        ));
    }

    #[test]
    fn downgrade_strips_the_envelope() {
        let msg = Message::request(RequestPayload::Ping);
        let bare = downgrade_v1(&msg).unwrap();
        assert_eq!(bare, serde_json::json!({"type": "ping"}));
    }
}
