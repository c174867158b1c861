//! Caller-facing synthesis request and result types.

use crate::id::{RequestId, WorkerId};
use crate::message::{OutputFormat, Priority, RequestPayload};
use crate::millis::WireMillis;
use serde::{Deserialize, Serialize};

/// A synthesis request as callers hand it to the dispatcher.
///
/// The dispatcher validates `text`, assigns a `request_id` when the
/// caller did not, and passes everything else through to the selected
/// worker untouched. `speed` and `pitch` are clamped at the worker
/// boundary, not here.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Caller-chosen identity; generated at dispatch when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// The text to speak. Must be non-empty and within the configured
    /// length bound.
    pub text: String,

    /// Voice/model affinity hint. Opaque to the dispatcher except for
    /// specialty matching in the balancer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Speech rate multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    /// Pitch multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,

    /// Requested container format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,

    /// Opaque sink identifier, passed verbatim to the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,

    /// Opaque caller metadata, carried through unchanged.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl SynthesisRequest {
    /// A request speaking `text` with every knob at its default.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: None,
            text: text.into(),
            voice: None,
            speed: None,
            pitch: None,
            output_format: None,
            output_path: None,
            priority: Priority::default(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the voice affinity hint.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the output path.
    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// Lower this request onto the wire, clamping `speed` and `pitch`
    /// into the range the synthesizer accepts.
    pub fn to_payload(&self) -> RequestPayload {
        const RATE_MIN: f64 = 0.5;
        const RATE_MAX: f64 = 2.0;
        let clamp = |v: f64| v.clamp(RATE_MIN, RATE_MAX);

        RequestPayload::Synthesize {
            text: self.text.clone(),
            voice: self.voice.clone(),
            speed: self.speed.map(clamp),
            pitch: self.pitch.map(clamp),
            output_format: self.output_format,
            output_path: self.output_path.clone(),
        }
    }
}

/// A successful synthesis outcome.
///
/// Failures travel as [`DispatchError`](crate::error::DispatchError), so
/// this type has no success flag: holding one means the synthesis
/// happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    /// The request this result answers.
    pub request_id: RequestId,

    /// Where the audio landed, when the worker wrote a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// Wall-clock latency from dispatcher entry to resolution.
    pub latency_ms: WireMillis,

    /// The model that produced the audio.
    pub model_used: String,

    /// The worker that produced the audio.
    pub worker_used: WorkerId,

    /// Whether the worker served this from its cache.
    #[serde(default)]
    pub cache_hit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_and_pitch_are_clamped_on_lowering() {
        let mut req = SynthesisRequest::new("hi");
        req.speed = Some(9.0);
        req.pitch = Some(0.01);
        match req.to_payload() {
            RequestPayload::Synthesize { speed, pitch, .. } => {
                assert_eq!(speed, Some(2.0));
                assert_eq!(pitch, Some(0.5));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unset_knobs_stay_unset() {
        let req = SynthesisRequest::new("hi").with_voice("voice-a");
        match req.to_payload() {
            RequestPayload::Synthesize {
                text,
                voice,
                speed,
                pitch,
                ..
            } => {
                assert_eq!(text, "hi");
                assert_eq!(voice.as_deref(), Some("voice-a"));
                assert_eq!(speed, None);
                assert_eq!(pitch, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
