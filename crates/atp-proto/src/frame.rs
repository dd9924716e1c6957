//! # ATP Frame Model
//!
//! The atomic protocol message exchanged between clients, the router, and
//! model-serving adapters. The canonical wire format is JSON with stable key
//! names; `decode(encode(frame))` round-trips exactly for every valid frame.
//!
//! Payload content is a tagged variant: a structured object carrying a
//! `"text"` string, or an opaque binary blob (serialized as a hex-keyed
//! object). Anything else collapses into the binary arm at the frame
//! boundary.

use bytes::Bytes;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version. Frames carrying any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

// ─── Flags ──────────────────────────────────────────────────────────────────

/// Well-known frame flags.
pub mod flags {
    pub const SYN: &str = "SYN";
    pub const ACK: &str = "ACK";
    pub const FIN: &str = "FIN";
    /// This frame is one fragment of a larger message.
    pub const FRAG: &str = "FRAG";
    /// Terminal fragment under LAST semantics.
    pub const LAST: &str = "LAST";
    /// Non-terminal fragment under MORE semantics.
    pub const MORE: &str = "MORE";
    /// Frame produced by the reassembler from a fragment set.
    pub const REASSEMBLED: &str = "REASSEMBLED";
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("empty flag")]
    EmptyFlag,
    #[error("{field} exceeds bound {bound}")]
    WindowBound { field: &'static str, bound: u64 },
    #[error("confidence out of range: {0}")]
    ConfidenceRange(f64),
    #[error("frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

// ─── QoS ────────────────────────────────────────────────────────────────────

/// Service tier of a frame. Affects fragmentation sizing and scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qos {
    Gold,
    Silver,
    Bronze,
}

impl Qos {
    pub fn as_str(self) -> &'static str {
        match self {
            Qos::Gold => "gold",
            Qos::Silver => "silver",
            Qos::Bronze => "bronze",
        }
    }
}

// ─── Window & Cost ──────────────────────────────────────────────────────────

/// Per-frame admission window: concurrency, token, and spend ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub max_parallel: u32,
    pub max_tokens: u64,
    pub max_usd_micros: u64,
}

impl Window {
    pub const MAX_PARALLEL: u32 = 1_000;
    pub const MAX_TOKENS: u64 = 10_000_000;
    pub const MAX_USD_MICROS: u64 = 10_000_000_000;

    fn validate(&self) -> Result<(), FrameError> {
        if self.max_parallel > Self::MAX_PARALLEL {
            return Err(FrameError::WindowBound {
                field: "window.max_parallel",
                bound: Self::MAX_PARALLEL as u64,
            });
        }
        if self.max_tokens > Self::MAX_TOKENS {
            return Err(FrameError::WindowBound {
                field: "window.max_tokens",
                bound: Self::MAX_TOKENS,
            });
        }
        if self.max_usd_micros > Self::MAX_USD_MICROS {
            return Err(FrameError::WindowBound {
                field: "window.max_usd_micros",
                bound: Self::MAX_USD_MICROS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEst {
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub usd_micros: u64,
}

// ─── Meta ───────────────────────────────────────────────────────────────────

/// Optional routing metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
}

// ─── Payload Content ────────────────────────────────────────────────────────

/// Payload content variant. Text is a structured object carrying a `"text"`
/// string (extra keys preserved in `rest`); everything else is binary.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text {
        text: String,
        rest: serde_json::Map<String, serde_json::Value>,
    },
    Binary(Bytes),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text {
            text: text.into(),
            rest: serde_json::Map::new(),
        }
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Content::Binary(bytes.into())
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Content::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text, .. } => Some(text),
            Content::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Binary(bytes) => Some(bytes),
            Content::Text { .. } => None,
        }
    }

    /// Payload size in code units (text) or bytes (binary). Drives the
    /// fragmentation decision.
    pub fn len(&self) -> usize {
        match self {
            Content::Text { text, .. } => text.chars().count(),
            Content::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collapse an arbitrary JSON value into a content variant. Objects with
    /// a `"text"` string become text; a `{"bin": "<hex>"}` object becomes
    /// binary; anything else is coerced to binary via its canonical encoding.
    pub fn from_value(value: serde_json::Value) -> Content {
        match value {
            serde_json::Value::Object(mut map) => {
                if matches!(map.get("text"), Some(serde_json::Value::String(_))) {
                    if let Some(serde_json::Value::String(text)) = map.remove("text") {
                        return Content::Text { text, rest: map };
                    }
                }
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(h)) = map.get("bin") {
                        if let Ok(bytes) = hex::decode(h) {
                            return Content::Binary(Bytes::from(bytes));
                        }
                    }
                }
                let raw = serde_json::to_vec(&serde_json::Value::Object(map)).unwrap_or_default();
                Content::Binary(Bytes::from(raw))
            }
            other => {
                let raw = serde_json::to_vec(&other).unwrap_or_default();
                Content::Binary(Bytes::from(raw))
            }
        }
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Content::Text { text, rest } => {
                let mut map = serializer.serialize_map(Some(1 + rest.len()))?;
                map.serialize_entry("text", text)?;
                for (k, v) in rest {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Content::Binary(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("bin", &hex::encode(bytes))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Content::from_value(value))
    }
}

// ─── Payload ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_est: Option<CostEst>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_ms: Option<u64>,
}

impl Payload {
    pub fn text(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Payload {
            kind: kind.into(),
            content: Content::text(text),
            confidence: None,
            cost_est: None,
            checksum: None,
            expiry_ms: None,
        }
    }

    pub fn binary(kind: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Payload {
            kind: kind.into(),
            content: Content::binary(bytes),
            confidence: None,
            cost_est: None,
            checksum: None,
            expiry_ms: None,
        }
    }
}

// ─── Frame ──────────────────────────────────────────────────────────────────

/// The unit of protocol exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version (must be 1).
    pub v: u8,
    pub session_id: String,
    pub stream_id: String,
    /// Message sequence, monotonic per lane.
    pub msg_seq: u64,
    /// 0-based index of this fragment within the message.
    pub frag_seq: u32,
    pub flags: Vec<String>,
    pub qos: Qos,
    pub ttl: u8,
    pub window: Window,
    pub meta: Meta,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Frame {
    /// A version-1 frame with default window and empty meta.
    pub fn message(
        session_id: impl Into<String>,
        stream_id: impl Into<String>,
        msg_seq: u64,
        qos: Qos,
        payload: Payload,
    ) -> Frame {
        Frame {
            v: PROTOCOL_VERSION,
            session_id: session_id.into(),
            stream_id: stream_id.into(),
            msg_seq,
            frag_seq: 0,
            flags: Vec::new(),
            qos,
            ttl: 16,
            window: Window {
                max_parallel: 4,
                max_tokens: 50_000,
                max_usd_micros: 5_000_000,
            },
            meta: Meta::default(),
            payload,
            sig: None,
        }
    }

    /// Structural and semantic validation, applied on decode and before
    /// encode.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.v != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(self.v));
        }
        if self.flags.iter().any(|f| f.trim().is_empty()) {
            return Err(FrameError::EmptyFlag);
        }
        self.window.validate()?;
        if let Some(confidence) = self.payload.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(FrameError::ConfidenceRange(confidence));
            }
        }
        Ok(())
    }

    /// Encode to the canonical JSON wire form.
    pub fn encode(&self) -> Result<String, FrameError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a frame from its wire form.
    pub fn decode(raw: &str) -> Result<Frame, FrameError> {
        let frame: Frame = serde_json::from_str(raw)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Add a flag if not already present.
    pub fn push_flag(&mut self, flag: &str) {
        if !self.has_flag(flag) {
            self.flags.push(flag.to_string());
        }
    }

    pub fn remove_flag(&mut self, flag: &str) {
        self.flags.retain(|f| f != flag);
    }
}

// ─── Parallel-Session Payload Bodies ────────────────────────────────────────

/// Target persona/clone for a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTarget {
    pub persona_id: String,
    pub clone_id: u32,
}

/// `agent.dispatch` — fan a session out to persona clones under a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub session_id: String,
    pub targets: Vec<DispatchTarget>,
    pub budget: serde_json::Value,
}

/// `agent.stream` — one streamed chunk from a persona clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub session_id: String,
    pub persona_id: String,
    pub clone_id: u32,
    pub seq: u64,
    pub data: String,
}

/// `agent.end` — terminal stats for a persona clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndPayload {
    pub session_id: String,
    pub persona_id: String,
    pub clone_id: u32,
    pub stats: serde_json::Value,
}

/// `adapter.capability` — adapter registration and capability advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityPayload {
    pub adapter_id: String,
    pub adapter_type: String,
    pub capabilities: Vec<String>,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_languages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_token_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `adapter.health` — adapter health status and telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub adapter_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::message(
            "sess1",
            "streamA",
            42,
            Qos::Gold,
            Payload::text("ask", "hello"),
        );
        frame.payload.confidence = Some(0.9);
        frame.meta.task_type = Some("ask".into());
        frame.flags = vec![flags::SYN.into()];
        frame
    }

    // ─── Validation ─────────────────────────────────────────────────────

    #[test]
    fn valid_frame_passes() {
        assert!(sample_frame().validate().is_ok());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut frame = sample_frame();
        frame.v = 2;
        assert!(matches!(
            frame.validate(),
            Err(FrameError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn empty_flag_rejected() {
        let mut frame = sample_frame();
        frame.flags.push("  ".into());
        assert!(matches!(frame.validate(), Err(FrameError::EmptyFlag)));
    }

    #[test]
    fn window_bound_rejected() {
        let mut frame = sample_frame();
        frame.window.max_parallel = 10_000;
        assert!(matches!(
            frame.validate(),
            Err(FrameError::WindowBound { .. })
        ));
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let mut frame = sample_frame();
        frame.payload.confidence = Some(1.5);
        assert!(matches!(
            frame.validate(),
            Err(FrameError::ConfidenceRange(_))
        ));
    }

    #[test]
    fn invalid_qos_string_fails_decode() {
        let mut value = serde_json::to_value(sample_frame()).unwrap();
        value["qos"] = serde_json::json!("platinum");
        assert!(Frame::decode(&value.to_string()).is_err());
    }

    #[test]
    fn missing_required_field_fails_decode() {
        let mut value = serde_json::to_value(sample_frame()).unwrap();
        value.as_object_mut().unwrap().remove("session_id");
        assert!(Frame::decode(&value.to_string()).is_err());
    }

    // ─── Round Trip ─────────────────────────────────────────────────────

    #[test]
    fn text_frame_round_trips() {
        let frame = sample_frame();
        let raw = frame.encode().unwrap();
        let back = Frame::decode(&raw).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn binary_frame_round_trips() {
        let mut frame = sample_frame();
        frame.payload = Payload::binary("blob", vec![0u8, 1, 2, 255, 254]);
        let raw = frame.encode().unwrap();
        let back = Frame::decode(&raw).unwrap();
        assert_eq!(back, frame);
        assert!(back.payload.content.is_binary());
    }

    #[test]
    fn text_with_extra_keys_round_trips() {
        let mut frame = sample_frame();
        if let Content::Text { rest, .. } = &mut frame.payload.content {
            rest.insert("lang".into(), serde_json::json!("en"));
        }
        let back = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    proptest! {
        #[test]
        fn proptest_frame_round_trip(
            msg_seq in 0u64..1_000_000,
            frag_seq in 0u32..1000,
            ttl in 0u8..=255,
            qos in prop_oneof![Just(Qos::Gold), Just(Qos::Silver), Just(Qos::Bronze)],
            text in "[a-zA-Z0-9 ]{0,64}",
        ) {
            let mut frame = Frame::message("sessX", "streamY", msg_seq, qos, Payload::text("ask", text));
            frame.frag_seq = frag_seq;
            frame.ttl = ttl;
            frame.flags = vec![flags::MORE.into()];
            let raw = frame.encode().unwrap();
            let back = Frame::decode(&raw).unwrap();
            prop_assert_eq!(back, frame);
        }

        #[test]
        fn proptest_binary_round_trip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let frame = Frame::message("s", "t", 1, Qos::Bronze, Payload::binary("blob", data));
            let back = Frame::decode(&frame.encode().unwrap()).unwrap();
            prop_assert_eq!(back, frame);
        }
    }

    // ─── Content Coercion ───────────────────────────────────────────────

    #[test]
    fn object_without_text_collapses_to_binary() {
        let content = Content::from_value(serde_json::json!({"blob": [1, 2, 3]}));
        assert!(content.is_binary());
    }

    #[test]
    fn scalar_collapses_to_binary() {
        let content = Content::from_value(serde_json::json!(42));
        assert!(content.is_binary());
    }

    #[test]
    fn text_object_stays_text() {
        let content = Content::from_value(serde_json::json!({"text": "hi", "lang": "en"}));
        match content {
            Content::Text { text, rest } => {
                assert_eq!(text, "hi");
                assert_eq!(rest.get("lang"), Some(&serde_json::json!("en")));
            }
            Content::Binary(_) => panic!("expected text content"),
        }
    }

    // ─── Flags ──────────────────────────────────────────────────────────

    #[test]
    fn flag_helpers() {
        let mut frame = sample_frame();
        frame.push_flag(flags::FRAG);
        frame.push_flag(flags::FRAG); // dedup
        assert_eq!(frame.flags.iter().filter(|f| *f == flags::FRAG).count(), 1);
        frame.remove_flag(flags::FRAG);
        assert!(!frame.has_flag(flags::FRAG));
    }

    // ─── Typed Payload Bodies ───────────────────────────────────────────

    #[test]
    fn dispatch_payload_round_trips() {
        let payload = DispatchPayload {
            session_id: "s1".into(),
            targets: vec![DispatchTarget {
                persona_id: "p1".into(),
                clone_id: 0,
            }],
            budget: serde_json::json!({"tokens": 1000}),
        };
        let raw = serde_json::to_string(&payload).unwrap();
        let back: DispatchPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, payload);
    }
}
